//! 연결 상태 머신
//!
//! 소켓을 직접 다루지 않음 (sans-IO). 코디네이터가 현재 시각과 함께
//! 수신 데이터그램 / 타이머 / 애플리케이션 명령을 넣고, `poll_datagram` 으로 송신할 것을 꺼냄.
//!
//! ```text
//! Idle → Handshaking → Established → Draining → Closed
//!              │             │            │
//!              └─────────────┴────────────┴──→ Failed
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::ack::AckTracker;
use crate::congestion::CongestionController;
use crate::crypto::{ChaChaProtection, EphemeralKeyPair, PacketProtection, Plaintext};
use crate::frame::{AckRange, ConnectionId, Frame, FrameFlags};
use crate::message::{AcceptMessage, OpenMessage};
use crate::mux::{FrameDisposition, Multiplexer};
use crate::retransmit::RetransmitTracker;
use crate::rtt::RttEstimator;
use crate::stats::ConnectionStats;
use crate::stream::{Direction, ReadOutcome, StreamId};
use crate::{Config, Error, Result, PROTOCOL_VERSION};

pub use crate::stream::Role;

/// 연결 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Handshaking,
    Established,
    /// close 요청 후 남은 데이터 확인 대기
    Draining,
    Closed,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "IDLE",
            ConnectionState::Handshaking => "HANDSHAKING",
            ConnectionState::Established => "ESTABLISHED",
            ConnectionState::Draining => "DRAINING",
            ConnectionState::Closed => "CLOSED",
            ConnectionState::Failed => "FAILED",
        };
        write!(f, "{}", name)
    }
}

/// 연결 하나의 전체 프로토콜 상태
pub struct Connection {
    config: Config,
    role: Role,
    state: ConnectionState,
    connection_id: ConnectionId,
    peer: SocketAddr,

    /// 협상된 MTU 페이로드 크기
    mtu: usize,
    /// 협상된 유휴 타임아웃
    idle_timeout: Duration,

    mux: Multiplexer,
    retransmit: RetransmitTracker,
    acks: AckTracker,
    rtt: RttEstimator,
    cc: CongestionController,
    protection: Box<dyn PacketProtection>,

    /// 클라이언트 임시 키 (ACCEPT 수신 전까지)
    keypair: Option<EphemeralKeyPair>,
    /// 재전송용 OPEN / ACCEPT 페이로드
    handshake_payload: Option<Bytes>,
    handshake_started: Instant,
    handshake_retries: u32,
    handshake_deadline: Option<Instant>,

    outbound: VecDeque<Bytes>,
    last_received: Instant,
    last_sent: Instant,
    drain_started: Option<Instant>,
    close_sent_at: Option<Instant>,

    /// 한 번만 노출되는 종료 원인
    terminal_error: Option<Error>,
    stats: ConnectionStats,
}

impl Connection {
    fn new(
        config: Config,
        role: Role,
        connection_id: ConnectionId,
        peer: SocketAddr,
        now: Instant,
    ) -> Self {
        Self {
            role,
            state: ConnectionState::Idle,
            connection_id,
            peer,
            mtu: config.mtu_payload_size,
            idle_timeout: config.idle_timeout,
            mux: Multiplexer::new(role, config.max_streams, config.send_buffer_size),
            retransmit: RetransmitTracker::new(
                config.max_retransmit_backoff,
                config.duplicate_ack_threshold,
            ),
            acks: AckTracker::new(),
            rtt: RttEstimator::new(
                config.initial_rtt,
                config.min_rto,
                config.max_retransmit_backoff,
            ),
            cc: CongestionController::new(&config),
            protection: Box::new(Plaintext),
            keypair: None,
            handshake_payload: None,
            handshake_started: now,
            handshake_retries: 0,
            handshake_deadline: None,
            outbound: VecDeque::new(),
            last_received: now,
            last_sent: now,
            drain_started: None,
            close_sent_at: None,
            terminal_error: None,
            stats: ConnectionStats::default(),
            config,
        }
    }

    /// 클라이언트 연결 생성 (무작위 연결 ID)
    pub fn client(config: Config, peer: SocketAddr, now: Instant) -> Self {
        let connection_id = loop {
            let id: u64 = rand::random();
            if id != 0 {
                break id;
            }
        };
        let mut conn = Self::new(config, Role::Client, connection_id, peer, now);
        if conn.config.encryption_enabled {
            conn.keypair = Some(EphemeralKeyPair::generate());
        }
        conn
    }

    /// OPEN 전송 후 Handshaking 진입
    pub fn connect(&mut self, now: Instant) -> Result<()> {
        if self.state != ConnectionState::Idle {
            return Err(Error::ProtocolViolation(format!(
                "{} 상태에서 connect 호출",
                self.state
            )));
        }
        let open = OpenMessage::new(
            &self.config,
            self.keypair.as_ref().map(EphemeralKeyPair::public_key_bytes),
        );
        let payload = Bytes::from(open.to_bytes()?);
        self.handshake_payload = Some(payload.clone());
        self.handshake_started = now;
        self.set_state(ConnectionState::Handshaking);

        self.send_handshake(FrameFlags::OPEN, payload, now);
        self.handshake_deadline = Some(now + self.config.handshake_retry_interval);
        Ok(())
    }

    /// 첫 OPEN 데이터그램으로 서버측 연결 생성, ACCEPT 를 송신 큐에 넣음
    pub fn accept_datagram(
        config: Config,
        peer: SocketAddr,
        datagram: &[u8],
        now: Instant,
    ) -> Result<Self> {
        let frame = Frame::decode(datagram)?;
        if !frame.stream_id.is_control() || !frame.flags.contains(FrameFlags::OPEN) {
            return Err(Error::ProtocolViolation("첫 프레임이 OPEN 이 아님".into()));
        }
        let open = OpenMessage::from_bytes(&frame.payload)?;
        if open.protocol_version != PROTOCOL_VERSION {
            return Err(Error::ProtocolViolation(format!(
                "지원하지 않는 프로토콜 버전: {}",
                open.protocol_version
            )));
        }

        let mut conn = Self::new(config, Role::Server, frame.connection_id, peer, now);
        let keypair = (conn.config.encryption_enabled && open.encryption_enabled)
            .then(EphemeralKeyPair::generate);
        let accept = AcceptMessage::negotiate(
            &open,
            &conn.config,
            keypair.as_ref().map(EphemeralKeyPair::public_key_bytes),
        );
        conn.apply_negotiated(accept.mtu_payload_size as usize, accept.idle_timeout());
        if let Some(keypair) = keypair {
            let secret = keypair.compute_shared_secret(&open.public_key);
            conn.protection = Box::new(ChaChaProtection::new(&secret, Role::Server));
        }

        let payload = Bytes::from(accept.to_bytes()?);
        conn.handshake_payload = Some(payload.clone());
        conn.stats.frames_received += 1;
        conn.stats.bytes_received += datagram.len() as u64;
        conn.set_state(ConnectionState::Established);
        conn.send_handshake(FrameFlags::ACCEPT, payload, now);

        info!(
            "연결 수락: id={:016x}, peer={}, mtu={}, 암호화={}",
            conn.connection_id,
            peer,
            conn.mtu,
            conn.protection.is_active()
        );
        Ok(conn)
    }

    fn apply_negotiated(&mut self, mtu: usize, idle_timeout: Duration) {
        self.mtu = mtu.clamp(1, self.config.mtu_payload_size);
        self.idle_timeout = idle_timeout.min(self.config.idle_timeout);
        self.cc = CongestionController::with_mtu(&self.config, self.mtu);
    }

    // ------------------------------------------------------------------
    // 입력
    // ------------------------------------------------------------------

    /// 수신 데이터그램 처리
    ///
    /// 깨졌거나 복호화되지 않거나 다른 연결의 데이터그램은 세고 버림
    pub fn handle_datagram(&mut self, datagram: &[u8], now: Instant) {
        let Some(frame) = self.unprotect(datagram) else {
            return;
        };
        if frame.connection_id != self.connection_id {
            self.stats.stray_frames += 1;
            debug!(
                "다른 연결 ID 프레임 폐기: {:016x} (현재 {:016x})",
                frame.connection_id, self.connection_id
            );
            return;
        }
        if self.state == ConnectionState::Failed {
            return;
        }

        self.stats.frames_received += 1;
        self.stats.bytes_received += datagram.len() as u64;
        self.last_received = now;

        if frame.stream_id.is_control() {
            self.on_control(frame, now);
        } else {
            self.on_stream_frame(frame, now);
        }
    }

    fn unprotect(&mut self, datagram: &[u8]) -> Option<Frame> {
        if !self.protection.is_active() {
            return self.decode(datagram);
        }
        match self.protection.open(datagram) {
            Ok(plain) => self.decode(&plain),
            Err(e) => {
                // 핸드쉐이크 프레임은 항상 평문
                if let Ok(frame) = Frame::decode(datagram) {
                    if frame.flags.contains(FrameFlags::OPEN)
                        || frame.flags.contains(FrameFlags::ACCEPT)
                    {
                        return Some(frame);
                    }
                }
                self.stats.decrypt_failures += 1;
                debug!("데이터그램 폐기: {}", e);
                None
            }
        }
    }

    fn decode(&mut self, bytes: &[u8]) -> Option<Frame> {
        match Frame::decode(bytes) {
            Ok(frame) => Some(frame),
            Err(e) => {
                self.stats.decode_errors += 1;
                debug!("데이터그램 폐기: {}", e);
                None
            }
        }
    }

    fn on_control(&mut self, frame: Frame, now: Instant) {
        let flags = frame.flags;

        if flags.contains(FrameFlags::OPEN) {
            // 중복 OPEN (ACCEPT 유실) → ACCEPT 재전송
            if self.role == Role::Server && !self.is_terminal() {
                if let Some(payload) = self.handshake_payload.clone() {
                    debug!("중복 OPEN, ACCEPT 재전송");
                    self.send_handshake(FrameFlags::ACCEPT, payload, now);
                }
            }
            return;
        }

        if flags.contains(FrameFlags::ACCEPT) {
            self.on_accept(&frame, now);
            return;
        }

        if flags.contains(FrameFlags::CLOSE) {
            match self.state {
                ConnectionState::Established | ConnectionState::Draining => {
                    info!("상대방 종료 요청: id={:016x}", self.connection_id);
                    self.send_control(FrameFlags::CLOSE_ACK, now);
                    self.enter_closed();
                }
                ConnectionState::Closed => self.send_control(FrameFlags::CLOSE_ACK, now),
                _ => {}
            }
            return;
        }

        if flags.contains(FrameFlags::CLOSE_ACK) {
            if self.state == ConnectionState::Draining {
                info!("종료 확인 수신: id={:016x}", self.connection_id);
                self.enter_closed();
            }
            return;
        }

        // PING: last_received 갱신으로 충분
    }

    fn on_accept(&mut self, frame: &Frame, now: Instant) {
        if self.role != Role::Client || self.state != ConnectionState::Handshaking {
            return;
        }
        let accept = match AcceptMessage::from_bytes(&frame.payload) {
            Ok(accept) => accept,
            Err(e) => {
                self.fail(e);
                return;
            }
        };
        if accept.protocol_version != PROTOCOL_VERSION {
            self.fail(Error::ProtocolViolation(format!(
                "지원하지 않는 프로토콜 버전: {}",
                accept.protocol_version
            )));
            return;
        }

        self.apply_negotiated(accept.mtu_payload_size as usize, accept.idle_timeout());
        let keypair = self.keypair.take();
        if accept.encryption_enabled {
            let Some(keypair) = keypair else {
                self.fail(Error::ProtocolViolation("요청하지 않은 암호화 협상".into()));
                return;
            };
            let secret = keypair.compute_shared_secret(&accept.public_key);
            self.protection = Box::new(ChaChaProtection::new(&secret, Role::Client));
        }

        // 재시도가 없었을 때만 핸드쉐이크 RTT 를 샘플로 사용
        if self.handshake_retries == 0 {
            self.rtt
                .on_sample(now.saturating_duration_since(self.handshake_started));
        }
        self.handshake_deadline = None;
        self.set_state(ConnectionState::Established);

        info!(
            "연결 수립: id={:016x}, peer={}, mtu={}, 암호화={}, rtt={:?}",
            self.connection_id,
            self.peer,
            self.mtu,
            self.protection.is_active(),
            self.rtt.srtt()
        );
    }

    fn on_stream_frame(&mut self, frame: Frame, now: Instant) {
        if !matches!(
            self.state,
            ConnectionState::Established | ConnectionState::Draining
        ) {
            self.stats.stray_frames += 1;
            return;
        }

        let stream_id = frame.stream_id;
        if frame.has_acks() {
            self.on_ack_ranges(stream_id, &frame.ack_ranges, now);
            if self.is_terminal() {
                return;
            }
        }
        if frame.seq_len() == 0 {
            return;
        }

        let first_seen = !self.acks.knows(stream_id);
        let end = frame.offset + frame.seq_len();
        match self.mux.on_frame(&frame) {
            Ok(FrameDisposition::Retired) if first_seen => {
                // 기록이 지워진 스트림: 이미 전부 받았으므로 0 부터 ACK 하고 다시 지움
                self.acks.on_received(stream_id, 0, end);
                self.acks.forget(stream_id);
                self.stats.duplicate_frames += 1;
            }
            Ok(FrameDisposition::Delivered) | Ok(FrameDisposition::Retired) => {
                if self.acks.on_received(stream_id, frame.offset, end) == 0 {
                    self.stats.duplicate_frames += 1;
                }
                if first_seen && stream_id.initiator() != self.role {
                    self.stats.streams_accepted += 1;
                }
            }
            Ok(FrameDisposition::Stray) => {
                self.stats.stray_frames += 1;
                debug!("알 수 없는 스트림 프레임 폐기: {}", stream_id);
            }
            Err(e) => self.fail(e),
        }
        self.forget_pruned();
    }

    /// 멀티플렉서가 지운 스트림의 ACK 기록도 지움
    fn forget_pruned(&mut self) {
        for stream_id in self.mux.take_pruned() {
            self.acks.forget(stream_id);
        }
    }

    fn on_ack_ranges(&mut self, stream_id: StreamId, ranges: &[AckRange], now: Instant) {
        let outcome = self.retransmit.on_ack(stream_id, ranges, now);
        if let Some(sample) = outcome.rtt_sample {
            self.rtt.on_sample(sample);
        }
        self.cc.on_ack(outcome.newly_acked as usize);
        self.mux.on_acked(stream_id, ranges);
        self.forget_pruned();

        if let Some(resend) = outcome.fast_retransmit {
            self.stats.fast_retransmits += 1;
            debug!(
                "fast retransmit: stream={}, offset={}",
                resend.frame.stream_id, resend.frame.offset
            );
            if self.cc.on_loss(resend.lost_sent_at, now) {
                self.stats.congestion_events += 1;
            }
            self.transmit_stream_frame(resend.frame, now);
        }
    }

    /// 타이머 처리: 핸드쉐이크 재시도, 유휴 타임아웃, 재전송, drain
    pub fn on_timer(&mut self, now: Instant) {
        match self.state {
            ConnectionState::Handshaking => self.on_handshake_timer(now),
            ConnectionState::Established | ConnectionState::Draining => {
                if now.saturating_duration_since(self.last_received) >= self.idle_timeout {
                    self.fail(Error::IdleTimeout);
                    return;
                }

                for resend in self.retransmit.on_timer_tick(now) {
                    self.stats.retransmits += 1;
                    debug!(
                        "재전송: stream={}, offset={}, len={}",
                        resend.frame.stream_id,
                        resend.frame.offset,
                        resend.frame.seq_len()
                    );
                    if self.cc.on_loss(resend.lost_sent_at, now) {
                        self.stats.congestion_events += 1;
                    }
                    self.transmit_stream_frame(resend.frame, now);
                }

                if self.state == ConnectionState::Draining {
                    self.on_drain_timer(now);
                }
            }
            _ => {}
        }
    }

    fn on_handshake_timer(&mut self, now: Instant) {
        let Some(deadline) = self.handshake_deadline else {
            return;
        };
        if now < deadline {
            return;
        }
        if self.handshake_retries >= self.config.handshake_retry_limit {
            self.fail(Error::HandshakeTimeout);
            return;
        }

        self.handshake_retries += 1;
        debug!(
            "OPEN 재전송 ({}/{})",
            self.handshake_retries, self.config.handshake_retry_limit
        );
        if let Some(payload) = self.handshake_payload.clone() {
            self.send_handshake(FrameFlags::OPEN, payload, now);
        }
        self.handshake_deadline = Some(now + self.config.handshake_retry_interval);
    }

    fn on_drain_timer(&mut self, now: Instant) {
        let started = self.drain_started.unwrap_or(now);
        if now.saturating_duration_since(started) >= self.config.drain_timeout {
            warn!(
                "drain 타임아웃: id={:016x}, 확인되지 않은 데이터 {} bytes",
                self.connection_id,
                self.retransmit.bytes_in_flight()
            );
            self.enter_closed();
            return;
        }
        if let Some(sent) = self.close_sent_at {
            if now.saturating_duration_since(sent) >= self.rtt.rto() {
                self.send_control(FrameFlags::CLOSE, now);
                self.close_sent_at = Some(now);
            }
        }
    }

    // ------------------------------------------------------------------
    // 출력
    // ------------------------------------------------------------------

    /// 보낼 수 있는 것을 모두 송신 큐에 넣음
    ///
    /// 1. 혼잡 윈도우 안에서 스트림 데이터 (같은 스트림 ACK 동봉)
    /// 2. 남은 ACK 는 ACK 전용 프레임
    /// 3. Draining 이고 모두 확인되면 CLOSE
    /// 4. keepalive PING
    pub fn flush(&mut self, now: Instant) {
        if !matches!(
            self.state,
            ConnectionState::Established | ConnectionState::Draining
        ) {
            return;
        }

        let connection_id = self.connection_id;
        let rto = self.rtt.rto();
        while let Some(frame) = self
            .mux
            .poll_transmit(connection_id, self.cc.available(), self.mtu)
        {
            self.cc.on_packet_sent(frame.seq_len() as usize);
            self.retransmit.on_sent(frame.clone(), now, rto);
            self.transmit_stream_frame(frame, now);
            if self.is_terminal() {
                return;
            }
        }

        for (stream_id, ranges) in self.acks.take_all() {
            if !ranges.is_empty() {
                self.transmit(Frame::ack(connection_id, stream_id, ranges), now);
            }
        }

        if self.state == ConnectionState::Draining
            && self.close_sent_at.is_none()
            && self.mux.all_acked()
        {
            debug!("모든 송신 데이터 확인됨, CLOSE 전송");
            self.send_control(FrameFlags::CLOSE, now);
            self.close_sent_at = Some(now);
        }

        if now.saturating_duration_since(self.last_sent) >= self.config.keepalive_interval {
            debug!("keepalive PING");
            self.send_control(FrameFlags::PING, now);
        }
    }

    /// 송신할 데이터그램 하나 꺼내기
    pub fn poll_datagram(&mut self) -> Option<Bytes> {
        self.outbound.pop_front()
    }

    fn send_handshake(&mut self, flags: FrameFlags, payload: Bytes, now: Instant) {
        self.transmit(Frame::control(self.connection_id, flags, payload), now);
    }

    fn send_control(&mut self, flags: FrameFlags, now: Instant) {
        self.transmit(Frame::control(self.connection_id, flags, Bytes::new()), now);
    }

    fn transmit_stream_frame(&mut self, frame: Frame, now: Instant) {
        let acks = self.acks.take_for(frame.stream_id);
        self.transmit(frame.with_acks(acks), now);
    }

    fn transmit(&mut self, frame: Frame, now: Instant) {
        let encoded = frame.encode();
        let handshake =
            frame.flags.contains(FrameFlags::OPEN) || frame.flags.contains(FrameFlags::ACCEPT);

        let datagram = if handshake || !self.protection.is_active() {
            encoded
        } else {
            match self.protection.seal(self.connection_id, &encoded) {
                Ok(sealed) => Bytes::from(sealed),
                Err(e) => {
                    self.fail(e.into());
                    return;
                }
            }
        };

        self.stats.frames_sent += 1;
        self.stats.bytes_sent += datagram.len() as u64;
        self.last_sent = now;
        self.outbound.push_back(datagram);
    }

    // ------------------------------------------------------------------
    // 애플리케이션 API
    // ------------------------------------------------------------------

    pub fn open_stream(&mut self, direction: Direction) -> Result<StreamId> {
        self.check_writable()?;
        let stream_id = self.mux.open_stream(direction)?;
        self.stats.streams_opened += 1;
        Ok(stream_id)
    }

    /// 송신 버퍼에 들어간 바이트 수 반환 (가득 차면 0)
    pub fn write(&mut self, stream_id: StreamId, data: &[u8]) -> Result<usize> {
        self.check_writable()?;
        self.mux.write(stream_id, data)
    }

    /// 스트림 송신 방향 종료 (FIN)
    pub fn finish_stream(&mut self, stream_id: StreamId) -> Result<()> {
        match self.state {
            ConnectionState::Failed => Err(self.take_error()),
            ConnectionState::Closed => Err(Error::ConnectionClosed),
            _ => self.mux.close(stream_id),
        }
    }

    /// 스트림 송신 방향 리셋: 미전송/미확인 데이터를 버리고 RESET 전송
    pub fn reset_stream(&mut self, stream_id: StreamId) -> Result<()> {
        match self.state {
            ConnectionState::Failed => return Err(self.take_error()),
            ConnectionState::Closed => return Err(Error::ConnectionClosed),
            _ => {}
        }
        if self.mux.reset(stream_id)?.is_some() {
            let abandoned = self.retransmit.abandon_stream(stream_id);
            self.cc.on_abandoned(abandoned as usize);
        }
        Ok(())
    }

    /// 연속 수신 데이터 읽기
    ///
    /// Closed 이후에도 이미 받은 데이터는 읽을 수 있음
    pub fn read(&mut self, stream_id: StreamId) -> Result<ReadOutcome> {
        if self.state == ConnectionState::Failed {
            return Err(self.take_error());
        }
        let outcome = self.mux.read(stream_id);
        self.forget_pruned();
        let outcome = outcome?;
        if self.state == ConnectionState::Closed && outcome == ReadOutcome::WouldBlock {
            return Err(Error::ConnectionClosed);
        }
        Ok(outcome)
    }

    /// 상대가 연 스트림 꺼내기 (없으면 None)
    pub fn accept_stream(&mut self) -> Result<Option<StreamId>> {
        if let Some(stream_id) = self.mux.accept_stream() {
            return Ok(Some(stream_id));
        }
        match self.state {
            ConnectionState::Failed => Err(self.take_error()),
            ConnectionState::Closed => Err(Error::ConnectionClosed),
            _ => Ok(None),
        }
    }

    /// 정상 종료 시작: 모든 스트림 FIN 후 Draining
    pub fn close(&mut self, now: Instant) -> Result<()> {
        match self.state {
            ConnectionState::Idle | ConnectionState::Handshaking => {
                self.enter_closed();
                Ok(())
            }
            ConnectionState::Established => {
                self.mux.finish_all();
                self.drain_started = Some(now);
                self.set_state(ConnectionState::Draining);
                Ok(())
            }
            ConnectionState::Draining | ConnectionState::Closed => Ok(()),
            ConnectionState::Failed => Err(self.take_error()),
        }
    }

    /// 즉시 종료. 상대에게 CLOSE 를 한 번 보냄
    pub fn abort(&mut self, now: Instant) {
        if self.is_terminal() {
            return;
        }
        if matches!(
            self.state,
            ConnectionState::Established | ConnectionState::Draining
        ) {
            self.send_control(FrameFlags::CLOSE, now);
        }
        warn!("연결 강제 종료: id={:016x}", self.connection_id);
        self.set_state(ConnectionState::Failed);
        self.release();
    }

    fn check_writable(&mut self) -> Result<()> {
        match self.state {
            ConnectionState::Idle
            | ConnectionState::Handshaking
            | ConnectionState::Established => Ok(()),
            ConnectionState::Draining | ConnectionState::Closed => Err(Error::ConnectionClosed),
            ConnectionState::Failed => Err(self.take_error()),
        }
    }

    // ------------------------------------------------------------------
    // 상태 전이
    // ------------------------------------------------------------------

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            info!(
                "연결 상태: id={:016x}, {} → {}",
                self.connection_id, self.state, state
            );
            self.state = state;
        }
    }

    fn fail(&mut self, error: Error) {
        if self.is_terminal() {
            return;
        }
        warn!("연결 실패: id={:016x}, {}", self.connection_id, error);
        self.terminal_error = Some(error);
        self.set_state(ConnectionState::Failed);
        self.release();
    }

    fn enter_closed(&mut self) {
        self.set_state(ConnectionState::Closed);
        self.release();
    }

    /// 송신측 상태, 타이머, 전송 중 바이트 해제
    fn release(&mut self) {
        let abandoned = self.retransmit.clear();
        self.cc.on_abandoned(abandoned as usize);
        self.mux.release_on_close();
        self.forget_pruned();
        self.acks.clear_dirty();
        self.handshake_deadline = None;
        self.keypair = None;
    }

    /// 종료 원인 (한 번만), 이후에는 ConnectionClosed
    pub fn take_error(&mut self) -> Error {
        self.terminal_error.take().unwrap_or(Error::ConnectionClosed)
    }

    // ------------------------------------------------------------------
    // 조회
    // ------------------------------------------------------------------

    /// 다음으로 on_timer 를 불러야 하는 시각
    pub fn next_timeout(&self) -> Option<Instant> {
        match self.state {
            ConnectionState::Handshaking => self.handshake_deadline,
            ConnectionState::Established | ConnectionState::Draining => {
                let mut next = self.last_received + self.idle_timeout;
                next = next.min(self.last_sent + self.config.keepalive_interval);
                if let Some(deadline) = self.retransmit.next_deadline() {
                    next = next.min(deadline);
                }
                if let Some(started) = self.drain_started {
                    next = next.min(started + self.config.drain_timeout);
                }
                if let Some(sent) = self.close_sent_at {
                    next = next.min(sent + self.rtt.rto());
                }
                Some(next)
            }
            _ => None,
        }
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            srtt: self.rtt.srtt(),
            congestion_window: self.cc.window(),
            bytes_in_flight: self.cc.bytes_in_flight(),
            ..self.stats.clone()
        }
    }

    /// 수신측에서 버린 데이터그램 기록 (드라이버)
    pub fn record_dropped(&mut self, count: u64) {
        self.stats.dropped_datagrams += count;
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    pub fn is_encrypted(&self) -> bool {
        self.protection.is_active()
    }

    pub fn is_established(&self) -> bool {
        self.state == ConnectionState::Established
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, ConnectionState::Closed | ConnectionState::Failed)
    }

    /// 아직 보내지 못한 스트림 데이터가 있는지
    pub fn has_pending_data(&self) -> bool {
        self.mux.has_ready()
    }

    /// 송신 큐에 데이터그램이 남아 있는지
    pub fn has_outbound(&self) -> bool {
        !self.outbound.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    /// 두 연결 사이에서 더 보낼 것이 없을 때까지 데이터그램 교환
    fn pump(a: &mut Connection, b: &mut Connection, now: Instant) {
        loop {
            let mut moved = false;
            a.flush(now);
            while let Some(d) = a.poll_datagram() {
                b.handle_datagram(&d, now);
                moved = true;
            }
            b.flush(now);
            while let Some(d) = b.poll_datagram() {
                a.handle_datagram(&d, now);
                moved = true;
            }
            if !moved {
                break;
            }
        }
    }

    fn established(config: Config) -> (Connection, Connection, Instant) {
        let now = Instant::now();
        let mut client = Connection::client(config.clone(), addr(), now);
        client.connect(now).unwrap();
        let open = client.poll_datagram().unwrap();

        let mut server = Connection::accept_datagram(config, addr(), &open, now).unwrap();
        assert_eq!(server.state(), ConnectionState::Established);
        let accept = server.poll_datagram().unwrap();
        client.handle_datagram(&accept, now);
        assert_eq!(client.state(), ConnectionState::Established);
        (client, server, now)
    }

    fn read_all(conn: &mut Connection, stream_id: StreamId) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            match conn.read(stream_id).unwrap() {
                ReadOutcome::Data(bytes) => out.extend_from_slice(&bytes),
                ReadOutcome::Finished => return out,
                ReadOutcome::WouldBlock => panic!("데이터가 끝나기 전에 막힘"),
            }
        }
    }

    #[test]
    fn test_handshake_negotiates_minimum_mtu() {
        let now = Instant::now();
        let client_config = Config {
            mtu_payload_size: 1000,
            ..Config::default()
        };
        let mut client = Connection::client(client_config, addr(), now);
        client.connect(now).unwrap();
        let open = client.poll_datagram().unwrap();

        let mut server = Connection::accept_datagram(Config::default(), addr(), &open, now).unwrap();
        client.handle_datagram(&server.poll_datagram().unwrap(), now);

        assert_eq!(server.mtu(), 1000);
        assert_eq!(client.mtu(), 1000);
        assert_eq!(server.connection_id(), client.connection_id());
        assert!(!client.is_encrypted());
    }

    #[test]
    fn test_stream_data_delivered_and_acked() {
        let (mut client, mut server, now) = established(Config::default());
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();

        let id = client.open_stream(Direction::Send).unwrap();
        assert_eq!(client.write(id, &data).unwrap(), data.len());
        client.finish_stream(id).unwrap();
        pump(&mut client, &mut server, now);

        let sid = server.accept_stream().unwrap().unwrap();
        assert_eq!(sid, id);
        assert_eq!(read_all(&mut server, sid), data);

        let stats = client.stats();
        assert_eq!(stats.bytes_in_flight, 0);
        assert_eq!(stats.retransmits, 0);
        assert_eq!(server.stats().streams_accepted, 1);
    }

    #[test]
    fn test_lost_frame_is_retransmitted_after_rto() {
        let (mut client, mut server, now) = established(Config::default());
        let id = client.open_stream(Direction::Send).unwrap();
        client.write(id, b"important").unwrap();
        client.finish_stream(id).unwrap();

        client.flush(now);
        // 첫 송신 유실
        assert!(client.poll_datagram().is_some());
        assert!(client.poll_datagram().is_none());

        let later = now + Duration::from_secs(1);
        client.on_timer(later);
        assert_eq!(client.stats().retransmits, 1);
        while let Some(d) = client.poll_datagram() {
            server.handle_datagram(&d, later);
        }
        pump(&mut client, &mut server, later);

        let sid = server.accept_stream().unwrap().unwrap();
        assert_eq!(read_all(&mut server, sid), b"important".to_vec());
        assert_eq!(client.stats().bytes_in_flight, 0);
    }

    #[test]
    fn test_handshake_timeout_after_retry_limit() {
        let config = Config {
            handshake_retry_limit: 3,
            handshake_retry_interval: Duration::from_millis(100),
            ..Config::default()
        };
        let now = Instant::now();
        let mut client = Connection::client(config, addr(), now);
        client.connect(now).unwrap();

        let mut opens = 0;
        for step in 1..=10u64 {
            while client.poll_datagram().is_some() {
                opens += 1;
            }
            client.on_timer(now + Duration::from_millis(100 * step));
        }
        assert_eq!(opens, 4);
        assert_eq!(client.state(), ConnectionState::Failed);

        // 종료 원인은 한 번만
        assert!(matches!(
            client.open_stream(Direction::Send),
            Err(Error::HandshakeTimeout)
        ));
        assert!(matches!(
            client.open_stream(Direction::Send),
            Err(Error::ConnectionClosed)
        ));
    }

    #[test]
    fn test_idle_timeout() {
        let config = Config {
            idle_timeout: Duration::from_secs(2),
            ..Config::default()
        };
        let (mut client, _server, now) = established(config);
        client.on_timer(now + Duration::from_millis(1999));
        assert!(client.is_established());

        client.on_timer(now + Duration::from_secs(2));
        assert_eq!(client.state(), ConnectionState::Failed);
        assert!(matches!(
            client.read(StreamId::new(1, Role::Server, true)),
            Err(Error::IdleTimeout)
        ));
    }

    #[test]
    fn test_keepalive_ping_refreshes_peer() {
        let config = Config {
            keepalive_interval: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(3),
            ..Config::default()
        };
        let (mut client, mut server, now) = established(config);

        let t1 = now + Duration::from_secs(1);
        client.flush(t1);
        let ping = client.poll_datagram().expect("keepalive PING");
        server.handle_datagram(&ping, t1);

        server.on_timer(now + Duration::from_millis(3500));
        assert!(server.is_established());
    }

    #[test]
    fn test_graceful_close() {
        let (mut client, mut server, now) = established(Config::default());
        let id = client.open_stream(Direction::Bidirectional).unwrap();
        client.write(id, b"bye").unwrap();

        client.close(now).unwrap();
        assert_eq!(client.state(), ConnectionState::Draining);
        assert!(matches!(client.write(id, b"more"), Err(Error::ConnectionClosed)));

        pump(&mut client, &mut server, now);
        // 서버는 FIN 을 받았지만 자신의 송신 방향은 열려 있음 → CLOSE 로 종료
        assert_eq!(client.state(), ConnectionState::Closed);
        assert_eq!(server.state(), ConnectionState::Closed);

        // 받은 데이터는 종료 후에도 읽을 수 있음
        let sid = server.accept_stream().unwrap().unwrap();
        assert_eq!(read_all(&mut server, sid), b"bye".to_vec());
        assert!(matches!(server.write(sid, b"x"), Err(Error::ConnectionClosed)));
    }

    #[test]
    fn test_closed_connection_answers_close() {
        let (mut client, mut server, now) = established(Config::default());
        client.close(now).unwrap();
        client.flush(now);
        let close = client.poll_datagram().unwrap();

        server.handle_datagram(&close, now);
        assert_eq!(server.state(), ConnectionState::Closed);
        assert!(server.poll_datagram().is_some());

        // CLOSE_ACK 유실 후 재전송된 CLOSE
        server.handle_datagram(&close, now);
        let close_ack = server.poll_datagram().unwrap();
        client.handle_datagram(&close_ack, now);
        assert_eq!(client.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_drain_timeout_closes() {
        let config = Config {
            drain_timeout: Duration::from_millis(500),
            ..Config::default()
        };
        let (mut client, _server, now) = established(config);
        let id = client.open_stream(Direction::Send).unwrap();
        client.write(id, b"never acked").unwrap();
        client.close(now).unwrap();
        client.flush(now);

        client.on_timer(now + Duration::from_millis(500));
        assert_eq!(client.state(), ConnectionState::Closed);
        assert_eq!(client.stats().bytes_in_flight, 0);
    }

    #[test]
    fn test_corrupted_and_stray_datagrams_are_counted() {
        let (mut client, mut server, now) = established(Config::default());
        let id = client.open_stream(Direction::Send).unwrap();
        client.write(id, b"payload").unwrap();
        client.flush(now);
        let mut datagram = client.poll_datagram().unwrap().to_vec();
        datagram[30] ^= 0xFF;
        server.handle_datagram(&datagram, now);
        assert_eq!(server.stats().decode_errors, 1);

        let stray = Frame::control(server.connection_id() ^ 1, FrameFlags::PING, Bytes::new());
        server.handle_datagram(&stray.encode(), now);
        assert_eq!(server.stats().stray_frames, 1);
        assert!(server.is_established());
    }

    #[test]
    fn test_encrypted_connection() {
        let config = Config {
            encryption_enabled: true,
            ..Config::default()
        };
        let (mut client, mut server, now) = established(config);
        assert!(client.is_encrypted());
        assert!(server.is_encrypted());

        let secret = b"top secret payload";
        let id = client.open_stream(Direction::Send).unwrap();
        client.write(id, secret).unwrap();
        client.finish_stream(id).unwrap();
        client.flush(now);

        let datagram = client.poll_datagram().unwrap();
        assert!(!datagram
            .windows(secret.len())
            .any(|w| w == secret.as_slice()));
        server.handle_datagram(&datagram, now);
        pump(&mut client, &mut server, now);

        let sid = server.accept_stream().unwrap().unwrap();
        assert_eq!(read_all(&mut server, sid), secret.to_vec());
    }

    #[test]
    fn test_encryption_requires_both_sides() {
        let now = Instant::now();
        let client_config = Config {
            encryption_enabled: true,
            ..Config::default()
        };
        let mut client = Connection::client(client_config, addr(), now);
        client.connect(now).unwrap();
        let open = client.poll_datagram().unwrap();
        let mut server = Connection::accept_datagram(Config::default(), addr(), &open, now).unwrap();
        client.handle_datagram(&server.poll_datagram().unwrap(), now);

        assert!(client.is_established());
        assert!(!client.is_encrypted());
        assert!(!server.is_encrypted());
    }

    #[test]
    fn test_duplicate_open_resends_accept() {
        let now = Instant::now();
        let mut client = Connection::client(Config::default(), addr(), now);
        client.connect(now).unwrap();
        let open = client.poll_datagram().unwrap();

        let mut server = Connection::accept_datagram(Config::default(), addr(), &open, now).unwrap();
        // 첫 ACCEPT 유실
        assert!(server.poll_datagram().is_some());
        server.handle_datagram(&open, now);
        let accept = server.poll_datagram().unwrap();
        client.handle_datagram(&accept, now);
        assert!(client.is_established());
    }

    #[test]
    fn test_stream_reset_reaches_peer() {
        let (mut client, mut server, now) = established(Config::default());
        let id = client.open_stream(Direction::Send).unwrap();
        client.write(id, &[7u8; 3000]).unwrap();
        client.reset_stream(id).unwrap();
        pump(&mut client, &mut server, now);

        let sid = server.accept_stream().unwrap().unwrap();
        assert!(matches!(
            server.read(sid),
            Err(Error::StreamResetByPeer { .. })
        ));
        assert_eq!(client.stats().bytes_in_flight, 0);
    }

    #[test]
    fn test_abort_sends_close_and_fails() {
        let (mut client, mut server, now) = established(Config::default());
        client.abort(now);
        assert_eq!(client.state(), ConnectionState::Failed);
        let close = client.poll_datagram().unwrap();
        server.handle_datagram(&close, now);
        assert_eq!(server.state(), ConnectionState::Closed);
        assert!(matches!(
            client.open_stream(Direction::Send),
            Err(Error::ConnectionClosed)
        ));
    }

    #[test]
    fn test_overflowing_offset_is_dropped() {
        let (_client, mut server, now) = established(Config::default());
        let sid = StreamId::new(1, Role::Client, true);
        let frame = Frame::data(
            server.connection_id(),
            sid,
            u64::MAX - 1,
            Bytes::from_static(b"abcde"),
            false,
        );
        server.handle_datagram(&frame.encode(), now);

        assert_eq!(server.stats().decode_errors, 1);
        assert!(server.is_established());
        assert_eq!(server.accept_stream().unwrap(), None);
    }

    #[test]
    fn test_finished_streams_leave_no_bookkeeping() {
        let (mut client, mut server, now) = established(Config::default());
        let mut first_datagram = None;
        for i in 0..600u32 {
            let id = client.open_stream(Direction::Send).unwrap();
            client.write(id, &i.to_be_bytes()).unwrap();
            client.finish_stream(id).unwrap();
            client.flush(now);
            while let Some(d) = client.poll_datagram() {
                first_datagram.get_or_insert_with(|| d.clone());
                server.handle_datagram(&d, now);
            }
            pump(&mut client, &mut server, now);

            let sid = server.accept_stream().unwrap().unwrap();
            assert_eq!(read_all(&mut server, sid), i.to_be_bytes().to_vec());
        }
        pump(&mut client, &mut server, now);

        assert_eq!(server.stats().streams_accepted, 600);
        assert_eq!(server.mux.retired_count(), 0);
        assert_eq!(server.acks.tracked(), 0);
        assert_eq!(client.mux.stream_count(), 0);
        assert_eq!(client.mux.retired_count(), 0);
        assert!(client.retransmit.is_empty());

        // 오래된 스트림의 재전송에도 ACK 는 다시 나가고 기록은 남지 않음
        let replay = first_datagram.unwrap();
        server.handle_datagram(&replay, now);
        assert_eq!(server.stats().duplicate_frames, 1);
        assert_eq!(server.stats().streams_accepted, 600);
        server.flush(now);
        let ack = server.poll_datagram().unwrap();
        assert_eq!(server.acks.tracked(), 0);

        let before = client.stats();
        client.handle_datagram(&ack, now);
        assert_eq!(client.stats().congestion_window, before.congestion_window);
        assert!(client.is_established());
    }

    #[test]
    fn test_replayed_ack_does_not_release_window_twice() {
        let (mut client, mut server, now) = established(Config::default());
        let id = client.open_stream(Direction::Send).unwrap();
        client.write(id, &[9u8; 3000]).unwrap();
        client.flush(now);

        let mut sent = Vec::new();
        while let Some(d) = client.poll_datagram() {
            sent.push(d);
        }
        assert!(sent.len() >= 2);
        // 첫 프레임만 도착, 나머지는 아직 전송 중
        server.handle_datagram(&sent[0], now);
        server.flush(now);
        let mut acks = Vec::new();
        while let Some(d) = server.poll_datagram() {
            acks.push(d);
        }
        assert!(!acks.is_empty());

        let later = now + Duration::from_millis(10);
        for d in &acks {
            client.handle_datagram(d, later);
        }
        let after_first = client.stats();
        assert!(after_first.bytes_in_flight > 0);

        for d in &acks {
            client.handle_datagram(d, later);
        }
        let after_replay = client.stats();
        assert_eq!(after_replay.congestion_window, after_first.congestion_window);
        assert_eq!(after_replay.bytes_in_flight, after_first.bytes_in_flight);
        assert_eq!(after_replay.srtt, after_first.srtt);
        assert_eq!(after_replay.fast_retransmits, 0);
    }
}
