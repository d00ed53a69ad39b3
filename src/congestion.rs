//! AIMD 혼잡 제어
//!
//! - Slow start: ACK 된 바이트마다 윈도우 +MTU
//! - Congestion avoidance: +MTU²/window
//! - 손실: 윈도우 절반 (최소 2*MTU), ssthresh = 새 윈도우
//!
//! 한 번의 감소 이전에 보낸 패킷들의 손실은 같은 손실 에피소드로 보고 다시 줄이지 않음

use std::time::Instant;

use tracing::debug;

use crate::Config;

#[derive(Debug, Clone)]
pub struct CongestionController {
    /// 혼잡 윈도우 (바이트)
    window: usize,
    /// slow start 임계값
    ssthresh: usize,
    min_window: usize,
    max_window: usize,
    mtu: usize,
    /// 전송 중(미확인) 바이트
    bytes_in_flight: usize,
    /// 마지막 윈도우 감소 시각
    recovery_start: Option<Instant>,
}

impl CongestionController {
    pub fn new(config: &Config) -> Self {
        Self::with_mtu(config, config.mtu_payload_size)
    }

    /// 협상된 MTU 로 생성
    pub fn with_mtu(config: &Config, mtu: usize) -> Self {
        let min_window = 2 * mtu;
        Self {
            window: config.initial_congestion_window.max(min_window),
            ssthresh: config.max_congestion_window,
            min_window,
            max_window: config.max_congestion_window.max(min_window),
            mtu,
            bytes_in_flight: 0,
            recovery_start: None,
        }
    }

    /// `len` 바이트를 새로 보낼 수 있는지
    pub fn can_send(&self, len: usize) -> bool {
        self.bytes_in_flight + len <= self.window
    }

    /// 새 데이터에 쓸 수 있는 여유
    pub fn available(&self) -> usize {
        self.window.saturating_sub(self.bytes_in_flight)
    }

    pub fn on_packet_sent(&mut self, len: usize) {
        self.bytes_in_flight += len;
    }

    /// 새로 ACK 된 바이트 반영
    pub fn on_ack(&mut self, newly_acked: usize) {
        if newly_acked == 0 {
            return;
        }
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(newly_acked);

        if self.in_slow_start() {
            self.window += self.mtu;
        } else {
            let growth = (self.mtu * self.mtu / self.window).max(1);
            self.window += growth;
        }
        self.window = self.window.min(self.max_window);
    }

    /// 손실 신호. 윈도우를 줄였으면 true
    ///
    /// `sent_at` 은 손실된 패킷의 최초 송신 시각
    pub fn on_loss(&mut self, sent_at: Instant, now: Instant) -> bool {
        if let Some(start) = self.recovery_start {
            if sent_at <= start {
                return false;
            }
        }

        let before = self.window;
        self.window = (self.window / 2).max(self.min_window);
        self.ssthresh = self.window;
        self.recovery_start = Some(now);

        debug!("혼잡 윈도우 감소: {} → {}", before, self.window);
        true
    }

    /// 더 이상 추적하지 않는 전송 중 바이트 제거 (스트림 리셋, 연결 종료)
    pub fn on_abandoned(&mut self, len: usize) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(len);
    }

    pub fn in_slow_start(&self) -> bool {
        self.window < self.ssthresh
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn ssthresh(&self) -> usize {
        self.ssthresh
    }

    pub fn bytes_in_flight(&self) -> usize {
        self.bytes_in_flight
    }
}
