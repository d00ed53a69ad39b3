//! 소켓 I/O 드라이버
//!
//! - 수신 분배기: 소켓당 태스크 하나. 데이터그램 앞 8바이트 연결 ID 로
//!   연결별 큐에 분배 (큐가 가득 차면 버림 = 손실). 리스너에서는 모르는 ID 의 OPEN 으로 새 연결 생성
//! - 코디네이터: 연결당 태스크 하나가 `Connection` 을 단독 소유.
//!   수신 데이터그램 / 애플리케이션 명령 / 타이머를 한 루프에서 처리

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionState};
use crate::endpoint::ConnectionHandle;
use crate::frame::{peek_connection_id, ConnectionId};
use crate::stats::ConnectionStats;
use crate::stream::{Direction, ReadOutcome, StreamId};
use crate::{Config, Error, Result, MAX_DATAGRAM_SIZE};

/// 코디네이터 명령 채널 깊이
const COMMAND_QUEUE_DEPTH: usize = 1024;

/// 리스너 accept 대기열 깊이
pub(crate) const ACCEPT_QUEUE_DEPTH: usize = 128;

/// 애플리케이션 → 코디네이터 명령
pub(crate) enum Command {
    OpenStream {
        direction: Direction,
        reply: oneshot::Sender<Result<StreamId>>,
    },
    AcceptStream {
        reply: oneshot::Sender<Result<StreamId>>,
    },
    Write {
        stream_id: StreamId,
        data: Bytes,
        reply: oneshot::Sender<Result<usize>>,
    },
    Finish {
        stream_id: StreamId,
        reply: oneshot::Sender<Result<()>>,
    },
    Reset {
        stream_id: StreamId,
        reply: oneshot::Sender<Result<()>>,
    },
    /// None = 스트림 끝
    Read {
        stream_id: StreamId,
        reply: oneshot::Sender<Result<Option<Bytes>>>,
    },
    Close {
        reply: oneshot::Sender<Result<()>>,
    },
    Abort,
    Stats {
        reply: oneshot::Sender<ConnectionStats>,
    },
}

/// 분배기 → 코디네이터 경로
struct Route {
    tx: mpsc::Sender<Bytes>,
    /// 큐 포화 / 인위적 손실로 버린 수
    dropped: Arc<AtomicU64>,
}

/// 분배기 전체 카운터
#[derive(Debug, Clone, Copy, Default)]
pub struct DispatchStats {
    pub received: u64,
    pub simulated_drops: u64,
    pub queue_drops: u64,
    /// 연결 ID 를 읽을 수 없거나 알 수 없는 연결
    pub unroutable: u64,
}

/// 소켓 하나를 공유하는 분배기/코디네이터 공용 상태
pub(crate) struct Shared {
    pub(crate) socket: Arc<UdpSocket>,
    routes: Arc<DashMap<ConnectionId, Route>>,
    pub(crate) config: Config,
    stats: Arc<Mutex<DispatchStats>>,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    /// 소켓 바인딩 후 분배기 시작
    ///
    /// `accept_tx` 가 있으면 리스너로 동작
    pub(crate) async fn bind(
        addr: SocketAddr,
        config: Config,
        accept_tx: Option<mpsc::Sender<ConnectionHandle>>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let shared = Arc::new(Self {
            socket: socket.clone(),
            routes: Arc::new(DashMap::new()),
            config: config.clone(),
            stats: Arc::new(Mutex::new(DispatchStats::default())),
            dispatch_task: Mutex::new(None),
        });

        let dispatcher = Dispatcher {
            socket,
            routes: shared.routes.clone(),
            config,
            stats: shared.stats.clone(),
            accept_tx,
            owner: Arc::downgrade(&shared),
        };
        let task = tokio::spawn(dispatcher.run());
        *shared.dispatch_task.lock() = Some(task);

        Ok(shared)
    }

    pub(crate) fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub(crate) fn dispatch_stats(&self) -> DispatchStats {
        *self.stats.lock()
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(task) = self.dispatch_task.lock().take() {
            task.abort();
        }
    }
}

/// 수신 분배기
struct Dispatcher {
    socket: Arc<UdpSocket>,
    routes: Arc<DashMap<ConnectionId, Route>>,
    config: Config,
    stats: Arc<Mutex<DispatchStats>>,
    accept_tx: Option<mpsc::Sender<ConnectionHandle>>,
    /// 새 코디네이터에 넘겨줄 공용 상태 (순환 참조 방지용 약한 참조)
    owner: Weak<Shared>,
}

impl Dispatcher {
    async fn run(self) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut rng = StdRng::from_entropy();
        let loss_rate = self.config.simulated_loss_rate;

        loop {
            let (len, from) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    // ICMP port unreachable 등, 소켓은 계속 사용 가능
                    debug!("수신 에러: {}", e);
                    continue;
                }
            };
            let datagram = &buf[..len];
            self.stats.lock().received += 1;

            let Some(connection_id) = peek_connection_id(datagram) else {
                self.stats.lock().unroutable += 1;
                continue;
            };

            if loss_rate > 0.0 && rng.gen::<f64>() < loss_rate {
                self.stats.lock().simulated_drops += 1;
                if let Some(route) = self.routes.get(&connection_id) {
                    route.dropped.fetch_add(1, Ordering::Relaxed);
                }
                continue;
            }

            if self.route(connection_id, datagram) {
                continue;
            }

            match &self.accept_tx {
                Some(accept_tx) => self.accept(accept_tx, from, datagram),
                None => {
                    self.stats.lock().unroutable += 1;
                }
            }
        }
    }

    /// 알려진 연결이면 큐에 넣고 true
    fn route(&self, connection_id: ConnectionId, datagram: &[u8]) -> bool {
        let closed = {
            let Some(route) = self.routes.get(&connection_id) else {
                return false;
            };
            match route.tx.try_send(Bytes::copy_from_slice(datagram)) {
                Ok(()) => false,
                Err(TrySendError::Full(_)) => {
                    route.dropped.fetch_add(1, Ordering::Relaxed);
                    self.stats.lock().queue_drops += 1;
                    false
                }
                Err(TrySendError::Closed(_)) => true,
            }
        };
        if closed {
            self.routes.remove(&connection_id);
        }
        true
    }

    fn accept(
        &self,
        accept_tx: &mpsc::Sender<ConnectionHandle>,
        from: SocketAddr,
        datagram: &[u8],
    ) {
        let conn = match Connection::accept_datagram(
            self.config.clone(),
            from,
            datagram,
            Instant::now(),
        ) {
            Ok(conn) => conn,
            Err(e) => {
                self.stats.lock().unroutable += 1;
                debug!("알 수 없는 데이터그램 폐기 ({}): {}", from, e);
                return;
            }
        };
        let Some(shared) = self.owner.upgrade() else {
            return;
        };

        let handle = spawn_coordinator(conn, shared, None);
        if let Err(e) = accept_tx.try_send(handle) {
            warn!("accept 대기열 포화 또는 리스너 종료, 연결 거부: {}", e);
        }
    }
}

/// 코디네이터 태스크 시작, 애플리케이션용 핸들 반환
///
/// `established` 는 핸드쉐이크 완료(또는 실패) 시 한 번 알림
pub(crate) fn spawn_coordinator(
    conn: Connection,
    shared: Arc<Shared>,
    established: Option<oneshot::Sender<Result<()>>>,
) -> ConnectionHandle {
    let (inbound_tx, inbound_rx) = mpsc::channel(shared.config.inbound_queue_depth);
    let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
    let dropped = Arc::new(AtomicU64::new(0));

    let connection_id = conn.connection_id();
    let peer = conn.peer();
    shared.routes.insert(
        connection_id,
        Route {
            tx: inbound_tx,
            dropped: dropped.clone(),
        },
    );

    let coordinator = Coordinator {
        conn,
        shared,
        inbound: inbound_rx,
        commands: command_rx,
        dropped,
        deferred: VecDeque::new(),
        waiters: Waiters::default(),
        established,
    };
    tokio::spawn(coordinator.run());

    ConnectionHandle::new(command_tx, connection_id, peer)
}

/// 조건이 충족될 때까지 보류된 요청들
#[derive(Default)]
struct Waiters {
    reads: Vec<(StreamId, oneshot::Sender<Result<Option<Bytes>>>)>,
    writes: Vec<(StreamId, Bytes, oneshot::Sender<Result<usize>>)>,
    accepts: VecDeque<oneshot::Sender<Result<StreamId>>>,
    closes: Vec<oneshot::Sender<Result<()>>>,
}

/// 연결 코디네이터 (연결 상태의 단독 소유자)
struct Coordinator {
    conn: Connection,
    shared: Arc<Shared>,
    inbound: mpsc::Receiver<Bytes>,
    commands: mpsc::Receiver<Command>,
    dropped: Arc<AtomicU64>,
    /// WouldBlock 으로 미뤄진 송신
    deferred: VecDeque<Bytes>,
    waiters: Waiters,
    established: Option<oneshot::Sender<Result<()>>>,
}

impl Coordinator {
    async fn run(mut self) {
        let mut tick = tokio::time::interval(self.shared.config.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut commands_open = true;

        loop {
            let wants_tick = self.wants_tick();
            tokio::select! {
                Some(datagram) = self.inbound.recv() => {
                    let now = Instant::now();
                    self.conn.handle_datagram(&datagram, now);
                    // 쌓여 있는 것까지 한 번에 처리한 뒤 ACK
                    while let Ok(datagram) = self.inbound.try_recv() {
                        self.conn.handle_datagram(&datagram, now);
                    }
                }
                command = self.commands.recv(), if commands_open => {
                    match command {
                        Some(command) => self.handle_command(command),
                        None => {
                            // 핸들이 모두 사라짐 → 정상 종료 시도
                            commands_open = false;
                            let _ = self.conn.close(Instant::now());
                        }
                    }
                }
                _ = tick.tick(), if wants_tick => {
                    if !self.conn.is_terminal() {
                        self.conn.on_timer(Instant::now());
                    }
                }
                else => break,
            }

            self.service_waiters();
            self.conn.flush(Instant::now());
            self.send_outbound();
            self.notify_established();

            if self.conn.is_terminal() && !commands_open {
                break;
            }
        }

        self.shared.routes.remove(&self.conn.connection_id());
        info!(
            "코디네이터 종료: id={:016x}, {}",
            self.conn.connection_id(),
            self.conn.stats().summary()
        );
    }

    /// 종료된 연결은 미뤄진 송신이 남았을 때만 틱이 필요
    fn wants_tick(&self) -> bool {
        !self.conn.is_terminal() || !self.deferred.is_empty()
    }

    fn handle_command(&mut self, command: Command) {
        let now = Instant::now();
        match command {
            Command::OpenStream { direction, reply } => {
                let _ = reply.send(self.conn.open_stream(direction));
            }
            Command::AcceptStream { reply } => self.waiters.accepts.push_back(reply),
            Command::Write {
                stream_id,
                data,
                reply,
            } => self.waiters.writes.push((stream_id, data, reply)),
            Command::Finish { stream_id, reply } => {
                let _ = reply.send(self.conn.finish_stream(stream_id));
            }
            Command::Reset { stream_id, reply } => {
                let _ = reply.send(self.conn.reset_stream(stream_id));
            }
            Command::Read { stream_id, reply } => self.waiters.reads.push((stream_id, reply)),
            Command::Close { reply } => match self.conn.close(now) {
                Ok(()) => self.waiters.closes.push(reply),
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Command::Abort => self.conn.abort(now),
            Command::Stats { reply } => {
                self.sync_dropped();
                let _ = reply.send(self.conn.stats());
            }
        }
    }

    /// 보류된 요청 재시도
    fn service_waiters(&mut self) {
        for (stream_id, data, reply) in std::mem::take(&mut self.waiters.writes) {
            if reply.is_closed() {
                continue;
            }
            match self.conn.write(stream_id, &data) {
                // 송신 버퍼 가득 참
                Ok(0) if !data.is_empty() => self.waiters.writes.push((stream_id, data, reply)),
                result => {
                    let _ = reply.send(result);
                }
            }
        }

        for (stream_id, reply) in std::mem::take(&mut self.waiters.reads) {
            if reply.is_closed() {
                continue;
            }
            let result = match self.conn.read(stream_id) {
                Ok(ReadOutcome::WouldBlock) => {
                    self.waiters.reads.push((stream_id, reply));
                    continue;
                }
                Ok(ReadOutcome::Data(bytes)) => Ok(Some(bytes)),
                Ok(ReadOutcome::Finished) => Ok(None),
                Err(e) => Err(e),
            };
            let _ = reply.send(result);
        }

        while let Some(reply) = self.waiters.accepts.pop_front() {
            if reply.is_closed() {
                continue;
            }
            match self.conn.accept_stream() {
                Ok(Some(stream_id)) => {
                    let _ = reply.send(Ok(stream_id));
                }
                Ok(None) => {
                    self.waiters.accepts.push_front(reply);
                    break;
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            }
        }

        if self.conn.is_terminal() {
            for reply in std::mem::take(&mut self.waiters.closes) {
                let result = match self.conn.state() {
                    ConnectionState::Closed => Ok(()),
                    _ => Err(self.conn.take_error()),
                };
                let _ = reply.send(result);
            }
        }
    }

    /// 송신 큐 비우기. WouldBlock 이면 다음 주기로 미룸
    fn send_outbound(&mut self) {
        let peer = self.conn.peer();
        while let Some(datagram) = self
            .deferred
            .pop_front()
            .or_else(|| self.conn.poll_datagram())
        {
            match self.shared.socket.try_send_to(&datagram, peer) {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    self.deferred.push_front(datagram);
                    break;
                }
                Err(e) => {
                    // 손실로 취급, 재전송 타이머가 처리
                    debug!("송신 실패 ({}): {}", peer, e);
                }
            }
        }
    }

    fn notify_established(&mut self) {
        if self.established.is_none() {
            return;
        }
        let result = match self.conn.state() {
            ConnectionState::Idle | ConnectionState::Handshaking => return,
            ConnectionState::Failed => Err(self.conn.take_error()),
            ConnectionState::Closed => Err(Error::ConnectionClosed),
            ConnectionState::Established | ConnectionState::Draining => Ok(()),
        };
        if let Some(tx) = self.established.take() {
            let _ = tx.send(result);
        }
    }

    fn sync_dropped(&mut self) {
        let dropped = self.dropped.swap(0, Ordering::Relaxed);
        if dropped > 0 {
            self.conn.record_dropped(dropped);
        }
    }
}
