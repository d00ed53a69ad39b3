//! 전송 통계
//!
//! - ConnectionStats: 연결 하나의 프로토콜 카운터 스냅샷
//! - FlowStats: 멀티 플로우 전송에서 플로우(스트림) 하나의 처리량
//! - TransferReport: 플로우 통계 + 전체 합계

use std::time::Duration;

/// 연결 통계
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionStats {
    /// 송신 프레임 수 (재전송 포함)
    pub frames_sent: u64,

    /// 수신 프레임 수 (유효한 것만)
    pub frames_received: u64,

    /// 송신 바이트 (데이터그램 기준)
    pub bytes_sent: u64,

    /// 수신 바이트 (데이터그램 기준)
    pub bytes_received: u64,

    /// 타이머 만료 재전송 수
    pub retransmits: u64,

    /// 중복 ACK 기반 재전송 수
    pub fast_retransmits: u64,

    /// 체크섬 불일치 / 잘못된 프레임
    pub decode_errors: u64,

    /// 복호화 실패
    pub decrypt_failures: u64,

    /// 다른 연결 ID 또는 알 수 없는 스트림
    pub stray_frames: u64,

    /// 이미 받은 데이터의 재수신
    pub duplicate_frames: u64,

    /// 수신 측에서 버린 데이터그램 (인위적 손실, 큐 포화)
    pub dropped_datagrams: u64,

    /// 혼잡 윈도우 감소 횟수
    pub congestion_events: u64,

    /// 현재 평활 RTT
    pub srtt: Duration,

    /// 현재 혼잡 윈도우
    pub congestion_window: usize,

    /// 전송 중(미확인) 바이트
    pub bytes_in_flight: usize,

    /// 로컬에서 연 스트림 수
    pub streams_opened: u64,

    /// 상대가 연 스트림 수
    pub streams_accepted: u64,
}

impl ConnectionStats {
    /// 재전송 비율 (재전송 / 전체 송신 프레임)
    pub fn retransmit_ratio(&self) -> f64 {
        if self.frames_sent == 0 {
            return 0.0;
        }
        (self.retransmits + self.fast_retransmits) as f64 / self.frames_sent as f64
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Frames: {}/{} (tx/rx) | Bytes: {}/{} | Retransmits: {} (+{} fast) | Dropped: {} | Errors: {} | RTT: {:.2}ms | cwnd: {}",
            self.frames_sent,
            self.frames_received,
            self.bytes_sent,
            self.bytes_received,
            self.retransmits,
            self.fast_retransmits,
            self.dropped_datagrams,
            self.decode_errors + self.decrypt_failures,
            self.srtt.as_secs_f64() * 1000.0,
            self.congestion_window,
        )
    }
}

/// 플로우 하나의 전송 통계
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlowStats {
    /// 플로우 번호 (0부터)
    pub flow_id: usize,

    /// 전송/수신한 데이터 바이트 (헤더 제외)
    pub bytes: u64,

    /// 블록 수
    pub blocks: u64,

    /// 첫 바이트부터 마지막 바이트까지 걸린 시간
    pub duration: Duration,
}

impl FlowStats {
    pub fn new(flow_id: usize) -> Self {
        Self {
            flow_id,
            ..Self::default()
        }
    }

    /// 평균 데이터 속도 (bytes/sec)
    pub fn avg_data_rate(&self) -> f64 {
        rate(self.bytes as f64, self.duration)
    }

    /// 평균 블록 속도 (blocks/sec)
    pub fn avg_block_rate(&self) -> f64 {
        rate(self.blocks as f64, self.duration)
    }

    pub fn summary(&self) -> String {
        format!(
            "Flow {} | Bytes: {} | Blocks: {} | Duration: {:.3}s | Rate: {:.2} MB/s | {:.1} blocks/s",
            self.flow_id,
            self.bytes,
            self.blocks,
            self.duration.as_secs_f64(),
            self.avg_data_rate() / 1_000_000.0,
            self.avg_block_rate(),
        )
    }
}

/// 멀티 플로우 전송 결과
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransferReport {
    /// 플로우별 통계 (flow_id 순)
    pub flows: Vec<FlowStats>,

    /// 전체 경과 시간
    pub duration: Duration,
}

impl TransferReport {
    pub fn total_bytes(&self) -> u64 {
        self.flows.iter().map(|f| f.bytes).sum()
    }

    pub fn total_blocks(&self) -> u64 {
        self.flows.iter().map(|f| f.blocks).sum()
    }

    /// 전체 평균 데이터 속도 (bytes/sec)
    pub fn avg_data_rate(&self) -> f64 {
        rate(self.total_bytes() as f64, self.duration)
    }

    /// 전체 평균 블록 속도 (blocks/sec)
    pub fn avg_block_rate(&self) -> f64 {
        rate(self.total_blocks() as f64, self.duration)
    }

    /// 플로우별 + 전체 요약 (한 줄씩)
    pub fn summary(&self) -> String {
        let mut lines: Vec<String> = self.flows.iter().map(FlowStats::summary).collect();
        lines.push(format!(
            "Total | Flows: {} | Bytes: {} | Blocks: {} | Duration: {:.3}s | Rate: {:.2} MB/s | {:.1} blocks/s",
            self.flows.len(),
            self.total_bytes(),
            self.total_blocks(),
            self.duration.as_secs_f64(),
            self.avg_data_rate() / 1_000_000.0,
            self.avg_block_rate(),
        ));
        lines.join("\n")
    }
}

fn rate(amount: f64, duration: Duration) -> f64 {
    let secs = duration.as_secs_f64();
    if secs == 0.0 {
        return 0.0;
    }
    amount / secs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_rates() {
        let flow = FlowStats {
            flow_id: 0,
            bytes: 2_000_000,
            blocks: 100,
            duration: Duration::from_secs(2),
        };
        assert_eq!(flow.avg_data_rate(), 1_000_000.0);
        assert_eq!(flow.avg_block_rate(), 50.0);
    }

    #[test]
    fn test_zero_duration_rate_is_zero() {
        let flow = FlowStats::new(3);
        assert_eq!(flow.avg_data_rate(), 0.0);
        assert_eq!(flow.flow_id, 3);
    }

    #[test]
    fn test_report_totals() {
        let report = TransferReport {
            flows: vec![
                FlowStats {
                    flow_id: 0,
                    bytes: 300,
                    blocks: 3,
                    duration: Duration::from_millis(500),
                },
                FlowStats {
                    flow_id: 1,
                    bytes: 200,
                    blocks: 2,
                    duration: Duration::from_millis(400),
                },
            ],
            duration: Duration::from_secs(1),
        };
        assert_eq!(report.total_bytes(), 500);
        assert_eq!(report.total_blocks(), 5);
        assert_eq!(report.avg_data_rate(), 500.0);
        assert_eq!(report.summary().lines().count(), 3);
    }

    #[test]
    fn test_retransmit_ratio() {
        let stats = ConnectionStats {
            frames_sent: 100,
            retransmits: 5,
            fast_retransmits: 5,
            ..ConnectionStats::default()
        };
        assert!((stats.retransmit_ratio() - 0.1).abs() < f64::EPSILON);
        assert!(stats.summary().contains("Retransmits: 5"));
    }
}
