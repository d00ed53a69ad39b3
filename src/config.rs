//! 프로토콜 설정

use std::time::Duration;

use crate::frame::FRAME_OVERHEAD;
use crate::{Error, Result, DEFAULT_MTU_PAYLOAD_SIZE, MAX_DATAGRAM_SIZE};

/// MFP 프로토콜 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// 프레임당 최대 페이로드 크기 (바이트)
    pub mtu_payload_size: usize,

    /// 초기 혼잡 윈도우 (바이트)
    pub initial_congestion_window: usize,

    /// 최대 혼잡 윈도우 (바이트)
    pub max_congestion_window: usize,

    /// RTT 샘플이 없을 때 사용할 초기 RTT
    pub initial_rtt: Duration,

    /// 재전송 타임아웃 하한
    pub min_rto: Duration,

    /// 지수 백오프된 재전송 타임아웃 상한
    pub max_retransmit_backoff: Duration,

    /// fast retransmit을 발동시키는 중복 ACK 수
    pub duplicate_ack_threshold: u32,

    /// OPEN 재전송 횟수 한도
    pub handshake_retry_limit: u32,

    /// OPEN 재전송 간격
    pub handshake_retry_interval: Duration,

    /// 아무 프레임도 받지 못한 채 이 시간이 지나면 연결 실패
    pub idle_timeout: Duration,

    /// 송신이 없을 때 PING 전송 간격
    pub keepalive_interval: Duration,

    /// Draining 상태 유지 한도 (close 유예 시간)
    pub drain_timeout: Duration,

    /// 코디네이터 타이머 주기
    pub tick_interval: Duration,

    /// 스트림별 송신 버퍼 크기 (ACK 전까지 보관되는 바이트)
    pub send_buffer_size: usize,

    /// 동시에 열 수 있는 최대 스트림 수
    pub max_streams: usize,

    /// 연결별 수신 큐 깊이 (데이터그램 수)
    pub inbound_queue_depth: usize,

    /// 암호화 활성화 (선택)
    /// X25519 키 교환 + ChaCha20-Poly1305 사용
    pub encryption_enabled: bool,

    /// 수신 데이터그램 인위적 드롭 비율 (0.0 ~ 1.0, 테스트/데모용)
    pub simulated_loss_rate: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mtu_payload_size: DEFAULT_MTU_PAYLOAD_SIZE,
            initial_congestion_window: 10 * DEFAULT_MTU_PAYLOAD_SIZE,
            max_congestion_window: 16 * 1024 * 1024,        // 16MB
            initial_rtt: Duration::from_millis(100),
            min_rto: Duration::from_millis(50),
            max_retransmit_backoff: Duration::from_secs(2),
            duplicate_ack_threshold: 3,
            handshake_retry_limit: 5,
            handshake_retry_interval: Duration::from_millis(500),
            idle_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(5),
            tick_interval: Duration::from_millis(10),
            send_buffer_size: 2 * 1024 * 1024,              // 2MB
            max_streams: 256,
            inbound_queue_depth: 4096,
            encryption_enabled: false,                      // 암호화 비활성화 (기본)
            simulated_loss_rate: 0.0,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 최소 혼잡 윈도우 (MTU 2개)
    pub fn min_congestion_window(&self) -> usize {
        2 * self.mtu_payload_size
    }

    /// 설정 값 검증
    pub fn validate(&self) -> Result<()> {
        if self.mtu_payload_size == 0 || self.mtu_payload_size > u16::MAX as usize {
            return Err(Error::InvalidConfig(format!(
                "mtu_payload_size {} 는 1..={} 범위여야 함",
                self.mtu_payload_size,
                u16::MAX
            )));
        }
        if self.mtu_payload_size + FRAME_OVERHEAD > MAX_DATAGRAM_SIZE {
            return Err(Error::InvalidConfig(format!(
                "mtu_payload_size {} 가 데이터그램 크기를 초과함",
                self.mtu_payload_size
            )));
        }
        if self.initial_congestion_window < self.min_congestion_window() {
            return Err(Error::InvalidConfig(format!(
                "initial_congestion_window {} < 최소 윈도우 {}",
                self.initial_congestion_window,
                self.min_congestion_window()
            )));
        }
        if self.max_congestion_window < self.initial_congestion_window {
            return Err(Error::InvalidConfig(
                "max_congestion_window 가 initial_congestion_window 보다 작음".into(),
            ));
        }
        if self.min_rto > self.max_retransmit_backoff {
            return Err(Error::InvalidConfig(
                "min_rto 가 max_retransmit_backoff 보다 큼".into(),
            ));
        }
        if self.duplicate_ack_threshold == 0 {
            return Err(Error::InvalidConfig("duplicate_ack_threshold 는 1 이상".into()));
        }
        if self.idle_timeout.is_zero() || self.tick_interval.is_zero() {
            return Err(Error::InvalidConfig(
                "idle_timeout / tick_interval 은 0 일 수 없음".into(),
            ));
        }
        if self.send_buffer_size == 0 || self.max_streams == 0 || self.inbound_queue_depth == 0 {
            return Err(Error::InvalidConfig(
                "send_buffer_size / max_streams / inbound_queue_depth 는 1 이상".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.simulated_loss_rate) {
            return Err(Error::InvalidConfig(format!(
                "simulated_loss_rate {} 는 [0.0, 1.0) 범위여야 함",
                self.simulated_loss_rate
            )));
        }
        Ok(())
    }

    /// 고성능 기기/네트워크용 설정
    pub fn high_performance() -> Self {
        Self {
            mtu_payload_size: 1400,
            initial_congestion_window: 32 * 1400,
            max_congestion_window: 64 * 1024 * 1024,       // 64MB
            initial_rtt: Duration::from_millis(50),
            min_rto: Duration::from_millis(20),
            max_retransmit_backoff: Duration::from_secs(1),
            tick_interval: Duration::from_millis(5),
            send_buffer_size: 8 * 1024 * 1024,              // 8MB
            max_streams: 1024,
            inbound_queue_depth: 16384,
            ..Self::default()
        }
    }

    /// 불안정한 네트워크용 설정
    pub fn unstable_network() -> Self {
        Self {
            mtu_payload_size: 1000,                         // 작은 프레임
            initial_congestion_window: 4 * 1000,
            max_congestion_window: 4 * 1024 * 1024,
            initial_rtt: Duration::from_millis(300),
            min_rto: Duration::from_millis(200),
            max_retransmit_backoff: Duration::from_secs(4),
            handshake_retry_limit: 10,
            handshake_retry_interval: Duration::from_millis(1000),
            idle_timeout: Duration::from_secs(60),
            keepalive_interval: Duration::from_secs(15),
            drain_timeout: Duration::from_secs(15),
            send_buffer_size: 1024 * 1024,
            ..Self::default()
        }
    }
}
