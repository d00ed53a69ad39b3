//! 재전송 추적기
//!
//! 송신했지만 아직 ACK 되지 않은 프레임을 (stream_id, offset) 으로 보관.
//! 만료 타이머는 최소 힙에 넣고, 꺼낼 때 현재 deadline 과 일치하는 것만 유효 (lazy deletion)
//!
//! - RTO 만료: 프레임을 그대로 다시 보내고 RTO 두 배 (상한 max_backoff)
//! - 중복 ACK: 같은 연속 ACK 지점이 threshold 번 반복되면 그 지점 프레임을 즉시 재전송
//! - RTT 샘플: 한 번도 재전송되지 않은 프레임에서만 (Karn)

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::time::{Duration, Instant};

use crate::frame::{AckRange, Frame};
use crate::range_set::RangeSet;
use crate::stream::StreamId;

/// ACK 대기 중인 송신 구간
#[derive(Debug, Clone)]
pub struct PendingRange {
    pub stream_id: StreamId,
    pub offset: u64,
    /// 시퀀스 길이 (FIN/RESET 포함)
    pub len: u64,
    /// 재전송 시 그대로 다시 보낼 프레임 (ACK 범위 제외)
    pub frame: Frame,
    /// 마지막 송신 시각
    pub sent_at: Instant,
    pub deadline: Instant,
    pub rto: Duration,
    pub retransmits: u32,
}

/// 재전송 지시
#[derive(Debug, Clone)]
pub struct Retransmit {
    pub frame: Frame,
    /// 손실로 판정된 송신의 시각 (혼잡 제어 에피소드 판단용)
    pub lost_sent_at: Instant,
}

/// ACK 처리 결과
#[derive(Debug, Default)]
pub struct AckOutcome {
    /// 새로 확인된 시퀀스 길이
    pub newly_acked: u64,
    /// Karn 규칙을 만족하는 RTT 샘플
    pub rtt_sample: Option<Duration>,
    pub fast_retransmit: Option<Retransmit>,
}

#[derive(Debug, Clone, Copy)]
struct DupAckState {
    ack_point: u64,
    count: u32,
    fired: bool,
}

#[derive(Debug)]
pub struct RetransmitTracker {
    pending: BTreeMap<(StreamId, u64), PendingRange>,
    timers: BinaryHeap<Reverse<(Instant, StreamId, u64)>>,
    dup_acks: HashMap<StreamId, DupAckState>,
    max_backoff: Duration,
    dup_threshold: u32,
    in_flight: u64,
}

impl RetransmitTracker {
    pub fn new(max_backoff: Duration, dup_threshold: u32) -> Self {
        Self {
            pending: BTreeMap::new(),
            timers: BinaryHeap::new(),
            dup_acks: HashMap::new(),
            max_backoff,
            dup_threshold,
            in_flight: 0,
        }
    }

    /// 송신 기록
    pub fn on_sent(&mut self, frame: Frame, now: Instant, rto: Duration) {
        let len = frame.seq_len();
        if len == 0 {
            return;
        }
        let key = (frame.stream_id, frame.offset);
        let deadline = now + rto;
        let entry = PendingRange {
            stream_id: frame.stream_id,
            offset: frame.offset,
            len,
            frame: frame.with_acks(Vec::new()),
            sent_at: now,
            deadline,
            rto,
            retransmits: 0,
        };
        if let Some(old) = self.pending.insert(key, entry) {
            self.in_flight -= old.len;
        }
        self.in_flight += len;
        self.timers.push(Reverse((deadline, key.0, key.1)));
    }

    /// ACK 범위 반영 (같은 ACK 를 여러 번 받아도 결과 동일)
    pub fn on_ack(&mut self, stream_id: StreamId, ranges: &[AckRange], now: Instant) -> AckOutcome {
        let mut outcome = AckOutcome::default();

        let mut acked = RangeSet::new();
        for range in ranges {
            acked.insert(range.start, range.end);
        }

        let covered: Vec<u64> = self
            .pending
            .range((stream_id, 0)..=(stream_id, u64::MAX))
            .filter(|(_, p)| acked.contains(p.offset, p.offset + p.len))
            .map(|(&(_, offset), _)| offset)
            .collect();

        let mut newest_clean: Option<Instant> = None;
        for offset in covered {
            if let Some(p) = self.pending.remove(&(stream_id, offset)) {
                self.in_flight -= p.len;
                outcome.newly_acked += p.len;
                if p.retransmits == 0 {
                    newest_clean = Some(newest_clean.map_or(p.sent_at, |t| t.max(p.sent_at)));
                }
            }
        }
        outcome.rtt_sample = newest_clean.map(|sent| now.saturating_duration_since(sent));

        outcome.fast_retransmit = self.check_duplicate_ack(stream_id, &acked, now);
        outcome
    }

    fn check_duplicate_ack(
        &mut self,
        stream_id: StreamId,
        acked: &RangeSet,
        now: Instant,
    ) -> Option<Retransmit> {
        let outstanding = self
            .pending
            .range((stream_id, 0)..=(stream_id, u64::MAX))
            .next()
            .is_some();
        if !outstanding {
            self.dup_acks.remove(&stream_id);
            return None;
        }

        let ack_point = acked.contiguous_end(0);
        // 연속 지점 위에 빈틈이 있어야 중복 ACK
        let has_gap = acked.max_end().map_or(false, |max| max > ack_point);

        let state = self.dup_acks.entry(stream_id).or_insert(DupAckState {
            ack_point,
            count: 0,
            fired: false,
        });
        if state.ack_point != ack_point {
            *state = DupAckState {
                ack_point,
                count: 0,
                fired: false,
            };
            return None;
        }
        if !has_gap || state.fired {
            return None;
        }
        state.count += 1;
        if state.count < self.dup_threshold {
            return None;
        }
        state.fired = true;

        let entry = self.pending.get_mut(&(stream_id, ack_point))?;
        let lost_sent_at = entry.sent_at;
        entry.retransmits += 1;
        entry.sent_at = now;
        entry.deadline = now + entry.rto;
        let timer = (entry.deadline, stream_id, ack_point);
        let frame = entry.frame.clone();
        self.timers.push(Reverse(timer));

        Some(Retransmit { frame, lost_sent_at })
    }

    /// 만료된 구간을 한 번씩 재전송 대상으로 반환
    pub fn on_timer_tick(&mut self, now: Instant) -> Vec<Retransmit> {
        let mut out = Vec::new();

        while let Some(Reverse((deadline, stream_id, offset))) = self.timers.peek().copied() {
            if deadline > now {
                break;
            }
            self.timers.pop();

            let Some(entry) = self.pending.get_mut(&(stream_id, offset)) else {
                continue;
            };
            if entry.deadline != deadline {
                continue;
            }

            let lost_sent_at = entry.sent_at;
            entry.rto = (entry.rto * 2).min(self.max_backoff);
            entry.retransmits += 1;
            entry.sent_at = now;
            entry.deadline = now + entry.rto;
            out.push(Retransmit {
                frame: entry.frame.clone(),
                lost_sent_at,
            });
            self.timers.push(Reverse((entry.deadline, stream_id, offset)));
        }
        out
    }

    /// 스트림의 모든 대기 구간 폐기, 제거된 시퀀스 길이 반환
    pub fn abandon_stream(&mut self, stream_id: StreamId) -> u64 {
        let keys: Vec<(StreamId, u64)> = self
            .pending
            .range((stream_id, 0)..=(stream_id, u64::MAX))
            .map(|(&k, _)| k)
            .collect();

        let mut removed = 0;
        for key in keys {
            if let Some(p) = self.pending.remove(&key) {
                removed += p.len;
            }
        }
        self.in_flight -= removed;
        self.dup_acks.remove(&stream_id);
        removed
    }

    /// 전부 폐기, 제거된 시퀀스 길이 반환
    pub fn clear(&mut self) -> u64 {
        let removed = self.in_flight;
        self.pending.clear();
        self.timers.clear();
        self.dup_acks.clear();
        self.in_flight = 0;
        removed
    }

    /// 가장 이른 만료 시각 (이미 무효화된 타이머일 수 있음)
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.peek().map(|Reverse((deadline, _, _))| *deadline)
    }

    pub fn get(&self, stream_id: StreamId, offset: u64) -> Option<&PendingRange> {
        self.pending.get(&(stream_id, offset))
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn bytes_in_flight(&self) -> u64 {
        self.in_flight
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    const SID: StreamId = StreamId(4);
    const RTO: Duration = Duration::from_millis(100);

    fn tracker() -> RetransmitTracker {
        RetransmitTracker::new(Duration::from_millis(350), 3)
    }

    fn data(offset: u64, len: usize, fin: bool) -> Frame {
        Frame::data(1, SID, offset, Bytes::from(vec![0u8; len]), fin)
    }

    #[test]
    fn test_ack_removes_fully_covered_ranges() {
        let mut rt = tracker();
        let t0 = Instant::now();
        rt.on_sent(data(0, 100, false), t0, RTO);
        rt.on_sent(data(100, 100, false), t0, RTO);
        rt.on_sent(data(200, 50, true), t0, RTO);
        assert_eq!(rt.bytes_in_flight(), 251);

        let out = rt.on_ack(SID, &[AckRange::new(0, 150)], t0 + Duration::from_millis(30));
        assert_eq!(out.newly_acked, 100);
        assert_eq!(out.rtt_sample, Some(Duration::from_millis(30)));
        assert_eq!(rt.len(), 2);

        let out = rt.on_ack(SID, &[AckRange::new(0, 251)], t0 + Duration::from_millis(40));
        assert_eq!(out.newly_acked, 151);
        assert!(rt.is_empty());
        assert_eq!(rt.bytes_in_flight(), 0);
    }

    #[test]
    fn test_ack_is_idempotent() {
        let mut rt = tracker();
        let t0 = Instant::now();
        rt.on_sent(data(0, 100, false), t0, RTO);

        let ranges = [AckRange::new(0, 100)];
        let first = rt.on_ack(SID, &ranges, t0);
        let second = rt.on_ack(SID, &ranges, t0);
        assert_eq!(first.newly_acked, 100);
        assert_eq!(second.newly_acked, 0);
        assert!(second.rtt_sample.is_none());
    }

    #[test]
    fn test_timer_expiry_doubles_rto_with_cap() {
        let mut rt = tracker();
        let t0 = Instant::now();
        rt.on_sent(data(0, 10, false), t0, RTO);

        assert!(rt.on_timer_tick(t0 + Duration::from_millis(99)).is_empty());

        let t1 = t0 + Duration::from_millis(100);
        let resent = rt.on_timer_tick(t1);
        assert_eq!(resent.len(), 1);
        assert_eq!(resent[0].lost_sent_at, t0);
        assert_eq!(rt.get(SID, 0).map(|p| p.rto), Some(Duration::from_millis(200)));

        // 같은 만료로 두 번 재전송하지 않음
        assert!(rt.on_timer_tick(t1).is_empty());

        let t2 = t1 + Duration::from_millis(200);
        assert_eq!(rt.on_timer_tick(t2).len(), 1);
        // 400ms 가 아니라 상한 350ms
        assert_eq!(rt.get(SID, 0).map(|p| p.rto), Some(Duration::from_millis(350)));
        assert_eq!(rt.get(SID, 0).map(|p| p.retransmits), Some(2));
    }

    #[test]
    fn test_karn_skips_retransmitted_samples() {
        let mut rt = tracker();
        let t0 = Instant::now();
        rt.on_sent(data(0, 10, false), t0, RTO);
        rt.on_timer_tick(t0 + RTO);

        let out = rt.on_ack(SID, &[AckRange::new(0, 10)], t0 + Duration::from_millis(150));
        assert_eq!(out.newly_acked, 10);
        assert!(out.rtt_sample.is_none());
    }

    #[test]
    fn test_fast_retransmit_after_three_duplicate_acks() {
        let mut rt = tracker();
        let t0 = Instant::now();
        for i in 0..5 {
            rt.on_sent(data(i * 100, 100, false), t0, RTO);
        }

        // 첫 프레임 [0,100) 손실, 이후 프레임 도착에 따른 ACK
        let t = t0 + Duration::from_millis(20);
        let out = rt.on_ack(SID, &[AckRange::new(100, 200)], t);
        assert!(out.fast_retransmit.is_none());
        let out = rt.on_ack(SID, &[AckRange::new(100, 300)], t);
        assert!(out.fast_retransmit.is_none());
        let out = rt.on_ack(SID, &[AckRange::new(100, 400)], t);
        let resent = out.fast_retransmit.expect("세 번째 중복 ACK 에서 재전송");
        assert_eq!(resent.frame.offset, 0);
        assert_eq!(resent.lost_sent_at, t0);

        // 같은 ACK 지점에서는 다시 발동하지 않음
        let out = rt.on_ack(SID, &[AckRange::new(100, 500)], t);
        assert!(out.fast_retransmit.is_none());

        let out = rt.on_ack(SID, &[AckRange::new(0, 500)], t);
        assert_eq!(out.newly_acked, 100);
        assert!(rt.is_empty());
    }

    #[test]
    fn test_duplicate_ack_state_dropped_when_stream_settles() {
        let mut rt = tracker();
        let t0 = Instant::now();
        for seq in 1..=200u32 {
            let sid = StreamId(seq << 2);
            rt.on_sent(Frame::data(1, sid, 0, Bytes::from_static(b"abc"), false), t0, RTO);
            rt.on_ack(sid, &[AckRange::new(0, 3)], t0);
        }
        assert!(rt.is_empty());
        assert!(rt.dup_acks.is_empty());
    }

    #[test]
    fn test_abandon_and_clear() {
        let mut rt = tracker();
        let t0 = Instant::now();
        rt.on_sent(data(0, 10, false), t0, RTO);
        rt.on_sent(Frame::data(1, StreamId(8), 0, Bytes::from_static(b"abc"), false), t0, RTO);

        assert_eq!(rt.abandon_stream(SID), 10);
        assert_eq!(rt.bytes_in_flight(), 3);
        // 폐기된 구간의 타이머는 무시됨
        assert_eq!(rt.on_timer_tick(t0 + RTO).len(), 1);

        assert_eq!(rt.clear(), 3);
        assert!(rt.next_deadline().is_none());
    }

    #[test]
    fn test_retransmitted_frame_is_unchanged() {
        let mut rt = tracker();
        let t0 = Instant::now();
        let frame = data(0, 10, true).with_acks(vec![AckRange::new(0, 5)]);
        rt.on_sent(frame.clone(), t0, RTO);

        let resent = rt.on_timer_tick(t0 + RTO);
        assert_eq!(resent[0].frame, frame.with_acks(Vec::new()));
    }
}
