//! 구간 집합
//!
//! 서로 겹치지도 인접하지도 않는 `[start, end)` 구간들을 정렬 상태로 보관.
//! 삽입 시 겹치거나 맞닿은 구간은 즉시 병합됨.

use std::collections::BTreeMap;

/// 병합되는 바이트 구간 집합
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeSet {
    /// start -> end (exclusive)
    ranges: BTreeMap<u64, u64>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// 구간 삽입, 새로 덮인 길이 반환
    pub fn insert(&mut self, start: u64, end: u64) -> u64 {
        if start >= end {
            return 0;
        }

        let already = self.covered_within(start, end);

        // end 이하에서 시작하면서 start 이상에서 끝나는 구간 = 겹치거나 맞닿은 구간
        let touching: Vec<(u64, u64)> = self
            .ranges
            .range(..=end)
            .rev()
            .take_while(|(_, &e)| e >= start)
            .map(|(&s, &e)| (s, e))
            .collect();

        let mut lo = start;
        let mut hi = end;
        for (s, e) in touching {
            lo = lo.min(s);
            hi = hi.max(e);
            self.ranges.remove(&s);
        }
        self.ranges.insert(lo, hi);

        (end - start) - already
    }

    /// `[start, end)` 안에서 이미 덮인 길이
    pub fn covered_within(&self, start: u64, end: u64) -> u64 {
        if start >= end {
            return 0;
        }
        self.ranges
            .range(..end)
            .rev()
            .take_while(|(_, &e)| e > start)
            .map(|(&s, &e)| e.min(end) - s.max(start))
            .sum()
    }

    /// `[start, end)` 전체가 덮여 있는지
    pub fn contains(&self, start: u64, end: u64) -> bool {
        if start >= end {
            return true;
        }
        match self.ranges.range(..=start).next_back() {
            Some((_, &e)) => e >= end,
            None => false,
        }
    }

    /// `[start, end)` 안에서 덮이지 않은 구간들 (오름차순)
    pub fn gaps(&self, start: u64, end: u64) -> Vec<(u64, u64)> {
        let mut gaps = Vec::new();
        if start >= end {
            return gaps;
        }

        let mut cursor = start;
        // start 이전에 시작했지만 start 를 덮는 구간 처리
        if let Some((_, &e)) = self.ranges.range(..=start).next_back() {
            cursor = cursor.max(e);
        }
        for (&s, &e) in self.ranges.range(start..end) {
            if s > cursor {
                gaps.push((cursor, s));
            }
            cursor = cursor.max(e);
        }
        if cursor < end {
            gaps.push((cursor, end));
        }
        gaps
    }

    /// `from` 부터 끊김 없이 이어지는 구간의 끝
    pub fn contiguous_end(&self, from: u64) -> u64 {
        match self.ranges.range(..=from).next_back() {
            Some((_, &e)) if e >= from => e,
            _ => from,
        }
    }

    /// 가장 큰 끝 값
    pub fn max_end(&self) -> Option<u64> {
        self.ranges.values().next_back().copied()
    }

    /// 구간 순회 (오름차순)
    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.ranges.iter().map(|(&s, &e)| (s, e))
    }

    /// 저장된 구간 수
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}
