//! 애플리케이션 API
//!
//! ```no_run
//! # async fn run() -> mfp::Result<()> {
//! let conn = mfp::connect("127.0.0.1:9000".parse().unwrap(), mfp::Config::default()).await?;
//! let mut stream = conn.open_stream().await?;
//! stream.write_all(b"hello").await?;
//! stream.finish().await?;
//! conn.close().await?;
//! # Ok(())
//! # }
//! ```

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot};
use tracing::info;

use crate::connection::Connection;
use crate::driver::{self, Command, DispatchStats, Shared, ACCEPT_QUEUE_DEPTH};
use crate::frame::ConnectionId;
use crate::stats::ConnectionStats;
use crate::stream::{Direction, StreamId};
use crate::{Config, Error, Result};

/// 클라이언트 엔드포인트 (UDP 소켓 하나, 연결 여러 개)
pub struct Endpoint {
    shared: Arc<Shared>,
}

impl Endpoint {
    /// 소켓 바인딩
    pub async fn bind(addr: SocketAddr, config: Config) -> Result<Self> {
        let shared = Shared::bind(addr, config, None).await?;
        Ok(Self { shared })
    }

    /// 서버에 연결, 핸드쉐이크 완료까지 대기
    pub async fn connect(&self, server: SocketAddr) -> Result<ConnectionHandle> {
        let mut conn = Connection::client(self.shared.config.clone(), server, Instant::now());
        conn.connect(Instant::now())?;
        let connection_id = conn.connection_id();

        let (established_tx, established_rx) = oneshot::channel();
        let handle = driver::spawn_coordinator(conn, self.shared.clone(), Some(established_tx));

        established_rx.await.map_err(|_| Error::ChannelError)??;
        info!("연결 수립: id={:016x}, peer={}", connection_id, server);
        Ok(handle)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.shared.local_addr()
    }

    pub fn dispatch_stats(&self) -> DispatchStats {
        self.shared.dispatch_stats()
    }
}

/// 임시 포트로 바인딩 후 연결
pub async fn connect(server: SocketAddr, config: Config) -> Result<ConnectionHandle> {
    let bind_addr = if server.is_ipv4() {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
    } else {
        SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
    };
    let endpoint = Endpoint::bind(bind_addr, config).await?;
    // 코디네이터가 소켓을 들고 있으므로 엔드포인트는 여기서 놓아도 됨
    endpoint.connect(server).await
}

/// 서버 리스너 바인딩
pub async fn listen(addr: SocketAddr, config: Config) -> Result<Listener> {
    let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_QUEUE_DEPTH);
    let shared = Shared::bind(addr, config, Some(accept_tx)).await?;
    info!("리스너 시작: {}", shared.local_addr()?);
    Ok(Listener {
        shared,
        incoming: accept_rx,
    })
}

/// 수신 연결 대기열
pub struct Listener {
    shared: Arc<Shared>,
    incoming: mpsc::Receiver<ConnectionHandle>,
}

impl Listener {
    /// 다음 수신 연결 (핸드쉐이크는 ACCEPT 송신 시점에 완료된 것으로 봄)
    pub async fn accept(&mut self) -> Result<ConnectionHandle> {
        self.incoming.recv().await.ok_or(Error::ConnectionClosed)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.shared.local_addr()
    }

    pub fn dispatch_stats(&self) -> DispatchStats {
        self.shared.dispatch_stats()
    }
}

/// 연결 핸들
///
/// 복제 가능. 모든 핸들이 사라지면 코디네이터가 정상 종료를 시작함
#[derive(Clone)]
pub struct ConnectionHandle {
    commands: mpsc::Sender<Command>,
    connection_id: ConnectionId,
    peer: SocketAddr,
}

impl ConnectionHandle {
    pub(crate) fn new(
        commands: mpsc::Sender<Command>,
        connection_id: ConnectionId,
        peer: SocketAddr,
    ) -> Self {
        Self {
            commands,
            connection_id,
            peer,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// 양방향 스트림 열기
    pub async fn open_stream(&self) -> Result<StreamHandle> {
        self.open(Direction::Bidirectional).await
    }

    /// 송신 전용 스트림 열기
    pub async fn open_uni_stream(&self) -> Result<StreamHandle> {
        self.open(Direction::Send).await
    }

    async fn open(&self, direction: Direction) -> Result<StreamHandle> {
        let id = self
            .request(|reply| Command::OpenStream { direction, reply })
            .await??;
        Ok(StreamHandle {
            id,
            conn: self.clone(),
        })
    }

    /// 상대가 연 스트림 대기
    pub async fn accept_stream(&self) -> Result<StreamHandle> {
        let id = self
            .request(|reply| Command::AcceptStream { reply })
            .await??;
        Ok(StreamHandle {
            id,
            conn: self.clone(),
        })
    }

    /// 정상 종료. 모든 데이터가 확인되고 CLOSE 교환이 끝날 때까지 대기
    pub async fn close(&self) -> Result<()> {
        self.request(|reply| Command::Close { reply }).await?
    }

    /// 즉시 종료
    pub async fn abort(&self) -> Result<()> {
        self.commands
            .send(Command::Abort)
            .await
            .map_err(|_| Error::ChannelError)
    }

    pub async fn stats(&self) -> Result<ConnectionStats> {
        self.request(|reply| Command::Stats { reply }).await
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| Error::ChannelError)?;
        rx.await.map_err(|_| Error::ChannelError)
    }
}

/// 스트림 핸들
pub struct StreamHandle {
    id: StreamId,
    conn: ConnectionHandle,
}

impl StreamHandle {
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// 송신 버퍼에 여유가 생길 때까지 대기 후 일부 또는 전부 기록
    pub async fn write(&mut self, data: &[u8]) -> Result<usize> {
        let stream_id = self.id;
        let data = Bytes::copy_from_slice(data);
        self.conn
            .request(|reply| Command::Write {
                stream_id,
                data,
                reply,
            })
            .await?
    }

    pub async fn write_all(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let written = self.write(data).await?;
            data = &data[written..];
        }
        Ok(())
    }

    /// 송신 방향 종료 (FIN)
    pub async fn finish(&mut self) -> Result<()> {
        let stream_id = self.id;
        self.conn
            .request(|reply| Command::Finish { stream_id, reply })
            .await?
    }

    /// 송신 방향 리셋
    pub async fn reset(&mut self) -> Result<()> {
        let stream_id = self.id;
        self.conn
            .request(|reply| Command::Reset { stream_id, reply })
            .await?
    }

    /// 다음 연속 데이터. 스트림 끝이면 None
    pub async fn read(&mut self) -> Result<Option<Bytes>> {
        let stream_id = self.id;
        self.conn
            .request(|reply| Command::Read { stream_id, reply })
            .await?
    }

    /// FIN 까지 모두 읽기
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.read().await? {
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.to_vec())
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("id", &self.id)
            .field("connection_id", &format_args!("{:016x}", self.conn.connection_id))
            .finish()
    }
}
