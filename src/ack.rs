//! 수신 ACK 추적
//!
//! 스트림별로 받은 시퀀스 구간을 보관하고, 아직 상대에게 알리지 않은 스트림을 표시.
//! 정리된 스트림의 구간은 멀티플렉서 바닥값 아래로 내려갈 때까지 유지함
//! (ACK 가 유실되면 상대가 재전송하므로 다시 ACK 해야 함)

use std::collections::{BTreeMap, BTreeSet};

use crate::frame::{AckRange, MAX_ACK_RANGES};
use crate::range_set::RangeSet;
use crate::stream::StreamId;

#[derive(Debug, Default)]
pub struct AckTracker {
    received: BTreeMap<StreamId, RangeSet>,
    /// ACK 를 보내야 하는 스트림
    dirty: BTreeSet<StreamId>,
    /// 마지막 ACK 를 보낸 뒤 지울 스트림
    forgotten: BTreeSet<StreamId>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 수신 구간 기록, 새로 받은 길이 반환
    ///
    /// 중복 수신이어도 ACK 는 다시 보냄
    pub fn on_received(&mut self, stream_id: StreamId, start: u64, end: u64) -> u64 {
        self.dirty.insert(stream_id);
        self.received.entry(stream_id).or_default().insert(start, end)
    }

    /// 프레임에 실을 ACK 범위
    ///
    /// 범위가 많으면 가장 앞 구간(연속 ACK 지점)과 최근 구간들을 남김
    pub fn ranges_for(&self, stream_id: StreamId) -> Vec<AckRange> {
        let Some(set) = self.received.get(&stream_id) else {
            return Vec::new();
        };
        let all: Vec<AckRange> = set.iter().map(|(s, e)| AckRange::new(s, e)).collect();
        if all.len() <= MAX_ACK_RANGES {
            return all;
        }
        let mut ranges = Vec::with_capacity(MAX_ACK_RANGES);
        ranges.push(all[0]);
        ranges.extend_from_slice(&all[all.len() - (MAX_ACK_RANGES - 1)..]);
        ranges
    }

    pub fn is_dirty(&self, stream_id: StreamId) -> bool {
        self.dirty.contains(&stream_id)
    }

    /// 보낼 ACK 가 있으면 범위를 꺼내고 표시 해제
    pub fn take_for(&mut self, stream_id: StreamId) -> Vec<AckRange> {
        if !self.dirty.remove(&stream_id) {
            return Vec::new();
        }
        let ranges = self.ranges_for(stream_id);
        if self.forgotten.remove(&stream_id) {
            self.received.remove(&stream_id);
        }
        ranges
    }

    /// 보낼 ACK 전부 꺼내기 (표시 해제)
    pub fn take_all(&mut self) -> Vec<(StreamId, Vec<AckRange>)> {
        let dirty = std::mem::take(&mut self.dirty);
        let acks = dirty
            .into_iter()
            .map(|id| (id, self.ranges_for(id)))
            .collect();
        self.purge_forgotten();
        acks
    }

    pub fn clear_dirty(&mut self) {
        self.dirty.clear();
        self.purge_forgotten();
    }

    /// 스트림 기록 삭제. 보낼 ACK 가 남아 있으면 꺼낸 뒤 삭제
    pub fn forget(&mut self, stream_id: StreamId) {
        if self.dirty.contains(&stream_id) {
            self.forgotten.insert(stream_id);
        } else {
            self.received.remove(&stream_id);
        }
    }

    fn purge_forgotten(&mut self) {
        for id in std::mem::take(&mut self.forgotten) {
            self.received.remove(&id);
        }
    }

    /// 구간을 보관 중인 스트림 수
    pub fn tracked(&self) -> usize {
        self.received.len()
    }

    /// 한 번이라도 데이터를 받은 스트림인지
    pub fn knows(&self, stream_id: StreamId) -> bool {
        self.received.contains_key(&stream_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ranges_coalesce_and_dirty_tracking() {
        let mut acks = AckTracker::new();
        let sid = StreamId(4);
        assert_eq!(acks.on_received(sid, 0, 100), 100);
        assert_eq!(acks.on_received(sid, 200, 300), 100);
        assert_eq!(acks.on_received(sid, 100, 200), 100);

        assert!(acks.is_dirty(sid));
        assert_eq!(acks.take_for(sid), vec![AckRange::new(0, 300)]);
        assert!(!acks.is_dirty(sid));
        assert!(acks.take_for(sid).is_empty());

        // 중복 수신도 다시 ACK
        assert_eq!(acks.on_received(sid, 0, 100), 0);
        assert_eq!(acks.take_all(), vec![(sid, vec![AckRange::new(0, 300)])]);
        assert!(acks.knows(sid));
    }

    #[test]
    fn test_forget_waits_for_pending_ack() {
        let mut acks = AckTracker::new();
        let quiet = StreamId(4);
        let pending = StreamId(8);
        acks.on_received(quiet, 0, 10);
        acks.take_for(quiet);
        acks.on_received(pending, 0, 20);

        acks.forget(quiet);
        acks.forget(pending);
        assert!(!acks.knows(quiet));
        assert!(acks.knows(pending));
        assert_eq!(acks.tracked(), 1);

        // 마지막 누적 ACK 는 한 번 나감
        assert_eq!(acks.take_for(pending), vec![AckRange::new(0, 20)]);
        assert!(!acks.knows(pending));
        assert_eq!(acks.tracked(), 0);
    }

    #[test]
    fn test_ranges_capped_keep_front_and_newest() {
        let mut acks = AckTracker::new();
        let sid = StreamId(4);
        for i in 0..40u64 {
            acks.on_received(sid, i * 10, i * 10 + 5);
        }
        let ranges = acks.ranges_for(sid);
        assert_eq!(ranges.len(), MAX_ACK_RANGES);
        assert_eq!(ranges[0], AckRange::new(0, 5));
        assert_eq!(ranges[MAX_ACK_RANGES - 1], AckRange::new(390, 395));
    }
}
