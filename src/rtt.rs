//! RTT 추정 (RFC 6298)
//!
//! srtt / rttvar 지수 평활 + 최소 RTT 추적.
//! RTO = srtt + 4 * rttvar, [min_rto, max_rto] 로 제한

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RttEstimator {
    /// 평활 RTT (첫 샘플 전에는 None)
    srtt: Option<Duration>,
    /// RTT 변동
    rttvar: Duration,
    /// 관측된 최소 RTT
    min_rtt: Option<Duration>,
    /// 가장 최근 샘플
    latest: Option<Duration>,

    initial: Duration,
    min_rto: Duration,
    max_rto: Duration,
}

impl RttEstimator {
    pub fn new(initial: Duration, min_rto: Duration, max_rto: Duration) -> Self {
        Self {
            srtt: None,
            rttvar: initial / 2,
            min_rtt: None,
            latest: None,
            initial,
            min_rto,
            max_rto,
        }
    }

    /// RTT 샘플 반영
    pub fn on_sample(&mut self, sample: Duration) {
        self.latest = Some(sample);
        self.min_rtt = Some(self.min_rtt.map_or(sample, |m| m.min(sample)));

        match self.srtt {
            None => {
                self.srtt = Some(sample);
                self.rttvar = sample / 2;
            }
            Some(srtt) => {
                // rttvar = 3/4 rttvar + 1/4 |srtt - sample|
                let delta = if srtt > sample { srtt - sample } else { sample - srtt };
                self.rttvar = (self.rttvar * 3 + delta) / 4;
                // srtt = 7/8 srtt + 1/8 sample
                self.srtt = Some((srtt * 7 + sample) / 8);
            }
        }
    }

    pub fn srtt(&self) -> Duration {
        self.srtt.unwrap_or(self.initial)
    }

    pub fn rttvar(&self) -> Duration {
        self.rttvar
    }

    pub fn min_rtt(&self) -> Option<Duration> {
        self.min_rtt
    }

    pub fn latest(&self) -> Option<Duration> {
        self.latest
    }

    /// 현재 재전송 타임아웃
    pub fn rto(&self) -> Duration {
        (self.srtt() + self.rttvar * 4).clamp(self.min_rto, self.max_rto)
    }
}
