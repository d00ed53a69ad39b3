//! 스트림 정의
//!
//! - StreamId: 연결 내 유일한 32비트 식별자 (시작 주체 + 방향 비트 포함)
//! - SendStream: 송신 대기 바이트 + ACK 된 구간
//! - RecvBuffer: 오프셋 기반 재조립 버퍼 (빈틈 허용, 연속 구간만 전달)

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use bytes::{Bytes, BytesMut};

use crate::frame::{ConnectionId, Frame, MAX_STREAM_OFFSET};
use crate::range_set::RangeSet;
use crate::{Error, Result};

/// 연결에서의 역할
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// 연결 시작 측 (connect)
    Client,
    /// 연결 수락 측 (listen)
    Server,
}

impl Role {
    /// 상대방 역할
    pub fn peer(self) -> Self {
        match self {
            Role::Client => Role::Server,
            Role::Server => Role::Client,
        }
    }
}

/// 스트림 ID
///
/// 비트 구성: `(sequence << 2) | (unidirectional << 1) | server_initiated`
/// 0 은 연결 제어용 (핸드쉐이크, close, ping)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct StreamId(pub u32);

impl StreamId {
    /// 연결 제어 스트림
    pub const CONTROL: StreamId = StreamId(0);

    pub fn new(sequence: u32, initiator: Role, unidirectional: bool) -> Self {
        let mut raw = sequence << 2;
        if unidirectional {
            raw |= 0b10;
        }
        if initiator == Role::Server {
            raw |= 0b01;
        }
        Self(raw)
    }

    /// 스트림을 연 쪽
    pub fn initiator(self) -> Role {
        if self.0 & 0b01 == 0 {
            Role::Client
        } else {
            Role::Server
        }
    }

    /// 단방향 스트림 여부
    pub fn is_unidirectional(self) -> bool {
        self.0 & 0b10 != 0
    }

    /// 시작 주체/방향별 순번
    pub fn sequence(self) -> u32 {
        self.0 >> 2
    }

    pub fn is_control(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 로컬 관점의 스트림 방향
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// 송신 전용
    Send,
    /// 수신 전용
    Recv,
    /// 양방향
    Bidirectional,
}

impl Direction {
    pub fn can_send(self) -> bool {
        matches!(self, Direction::Send | Direction::Bidirectional)
    }

    pub fn can_recv(self) -> bool {
        matches!(self, Direction::Recv | Direction::Bidirectional)
    }
}

/// 스트림 읽기 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// 연속된 바이트
    Data(Bytes),
    /// 아직 읽을 데이터 없음
    WouldBlock,
    /// FIN 까지 모두 읽음
    Finished,
}

/// 송신측 스트림 상태
#[derive(Debug, Default)]
pub struct SendStream {
    /// 아직 프레임으로 잘리지 않은 바이트
    unsent: VecDeque<Bytes>,

    /// unsent 총 길이
    unsent_len: usize,

    /// 다음에 잘릴 바이트의 오프셋
    next_offset: u64,

    /// close 요청됨 (FIN 대기)
    fin_requested: bool,

    /// FIN 프레임 송신됨
    fin_sent: bool,

    /// 리셋됨
    reset: bool,

    /// ACK 된 시퀀스 구간 (FIN 단위 포함)
    acked: RangeSet,

    /// 버퍼에 보관 중인 바이트 (미송신 + 미확인)
    buffered: usize,

    /// 송신한 프레임 수 (재전송 제외)
    pub frames_sent: u64,
}

impl SendStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// 바이트 추가 (FIN 선택), 추가된 바이트 수 반환
    pub fn enqueue(&mut self, data: Bytes, fin: bool) -> Result<usize> {
        if self.fin_requested || self.reset {
            return Err(Error::ConnectionClosed);
        }
        let len = data.len();
        if len > 0 {
            self.unsent_len += len;
            self.buffered += len;
            self.unsent.push_back(data);
        }
        if fin {
            self.fin_requested = true;
        }
        Ok(len)
    }

    /// 송신 버퍼 여유 공간
    pub fn capacity(&self, limit: usize) -> usize {
        limit.saturating_sub(self.buffered)
    }

    /// 다음 프레임이 차지할 시퀀스 길이 (없으면 None)
    pub fn next_frame_len(&self, mtu: usize) -> Option<usize> {
        if self.reset {
            return None;
        }
        let payload = self.unsent_len.min(mtu);
        let fin = self.fin_requested && !self.fin_sent && payload == self.unsent_len;
        if payload == 0 && !fin {
            return None;
        }
        Some(payload + fin as usize)
    }

    pub fn has_ready(&self) -> bool {
        self.next_frame_len(usize::MAX).is_some()
    }

    /// MTU 이하로 잘라 다음 프레임 생성
    pub fn next_frame(
        &mut self,
        connection_id: ConnectionId,
        stream_id: StreamId,
        mtu: usize,
    ) -> Option<Frame> {
        self.next_frame_len(mtu)?;

        let take = self.unsent_len.min(mtu);
        let payload = self.take_bytes(take);
        let offset = self.next_offset;
        self.next_offset += take as u64;

        let fin = self.fin_requested && !self.fin_sent && self.unsent_len == 0;
        if fin {
            self.fin_sent = true;
        }
        self.frames_sent += 1;

        Some(Frame::data(connection_id, stream_id, offset, payload, fin))
    }

    /// 앞에서 n 바이트 꺼내기 (여러 조각에 걸치면 복사)
    fn take_bytes(&mut self, n: usize) -> Bytes {
        if n == 0 {
            return Bytes::new();
        }
        self.unsent_len -= n;

        if let Some(front) = self.unsent.front_mut() {
            if front.len() > n {
                return front.split_to(n);
            }
            if front.len() == n {
                return self.unsent.pop_front().unwrap_or_default();
            }
        }

        let mut out = BytesMut::with_capacity(n);
        while out.len() < n {
            let Some(mut front) = self.unsent.pop_front() else {
                break;
            };
            let need = n - out.len();
            if front.len() > need {
                out.extend_from_slice(&front.split_to(need));
                self.unsent.push_front(front);
            } else {
                out.extend_from_slice(&front);
            }
        }
        out.freeze()
    }

    /// ACK 범위 반영, 해제된 버퍼 바이트 수 반환
    pub fn on_acked(&mut self, start: u64, end: u64) -> usize {
        let newly = self.acked.insert(start, end) as usize;
        let freed = newly.min(self.buffered);
        self.buffered -= freed;
        freed
    }

    /// close (FIN) 요청
    pub fn finish(&mut self) {
        if !self.reset {
            self.fin_requested = true;
        }
    }

    /// 리셋: 미송신 데이터를 버리고 최종 크기 반환
    pub fn reset(&mut self) -> u64 {
        self.reset = true;
        self.unsent.clear();
        self.unsent_len = 0;
        self.buffered = 0;
        self.next_offset
    }

    /// ACK 로 연속 확인된 시퀀스 끝
    pub fn highest_contiguous_acked(&self) -> u64 {
        self.acked.contiguous_end(0)
    }

    /// 송신 방향 종료 + 모든 데이터/FIN 이 ACK 됨
    pub fn is_complete(&self) -> bool {
        if self.reset {
            return self.acked.contains(self.next_offset, self.next_offset + 1);
        }
        self.fin_sent && self.unsent_len == 0 && self.highest_contiguous_acked() > self.next_offset
    }

    pub fn is_finished(&self) -> bool {
        self.fin_requested || self.reset
    }

    pub fn is_reset(&self) -> bool {
        self.reset
    }

    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }
}

/// 수신 재조립 버퍼
///
/// offset -> 연속 구간 맵. 삽입 시 앞뒤 구간과 맞닿으면 병합
#[derive(Debug, Default)]
pub struct RecvBuffer {
    /// 아직 읽지 않은 연속 구간들 (서로 맞닿지 않음)
    runs: BTreeMap<u64, BytesMut>,

    /// 지금까지 받은 전체 바이트 구간
    received: RangeSet,

    /// 읽기 커서
    read_offset: u64,

    /// FIN 으로 확정된 최종 크기
    final_size: Option<u64>,

    /// 상대방 리셋 여부
    reset: bool,
}

impl RecvBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 데이터 삽입, 새로 들어온 바이트 수 반환
    pub fn insert(&mut self, offset: u64, data: &[u8], fin: bool) -> Result<usize> {
        let end = offset
            .checked_add(data.len() as u64)
            .filter(|&end| end.saturating_add(fin as u64) <= MAX_STREAM_OFFSET)
            .ok_or_else(|| {
                Error::ProtocolViolation(format!("스트림 오프셋 한도 초과: {}", offset))
            })?;

        if let Some(final_size) = self.final_size {
            if end > final_size || (fin && end != final_size) {
                return Err(Error::ProtocolViolation(format!(
                    "최종 크기 {} 를 넘는 데이터: [{}, {})",
                    final_size, offset, end
                )));
            }
        }
        if fin {
            if self.received.max_end().map_or(false, |max| max > end) {
                return Err(Error::ProtocolViolation(format!(
                    "FIN 위치 {} 이후 데이터가 이미 수신됨",
                    end
                )));
            }
            self.final_size = Some(end);
        }
        if self.reset {
            return Ok(0);
        }

        let mut added = 0;
        for (gap_start, gap_end) in self.received.gaps(offset, end) {
            let from = (gap_start - offset) as usize;
            let to = (gap_end - offset) as usize;
            self.insert_run(gap_start, &data[from..to]);
            added += to - from;
        }
        self.received.insert(offset, end);
        Ok(added)
    }

    fn insert_run(&mut self, start: u64, piece: &[u8]) {
        let mut run_start = start;
        let mut run = BytesMut::from(piece);

        // 앞 구간과 맞닿음
        let prev = self
            .runs
            .range(..start)
            .next_back()
            .map(|(&s, buf)| (s, buf.len() as u64));
        if let Some((prev_start, prev_len)) = prev {
            if prev_start + prev_len == start {
                if let Some(mut merged) = self.runs.remove(&prev_start) {
                    merged.extend_from_slice(&run);
                    run = merged;
                    run_start = prev_start;
                }
            }
        }

        // 뒤 구간과 맞닿음
        let run_end = run_start + run.len() as u64;
        if let Some(next) = self.runs.remove(&run_end) {
            run.extend_from_slice(&next);
        }

        self.runs.insert(run_start, run);
    }

    /// 상대방 리셋 반영
    pub fn on_reset(&mut self, final_size: u64) -> Result<()> {
        if let Some(known) = self.final_size {
            if known != final_size {
                return Err(Error::ProtocolViolation(format!(
                    "리셋 최종 크기 {} 가 FIN 크기 {} 와 다름",
                    final_size, known
                )));
            }
        }
        self.final_size = Some(final_size);
        self.reset = true;
        self.runs.clear();
        Ok(())
    }

    /// 읽기 커서부터 연속된 바이트 읽기
    pub fn read(&mut self) -> ReadOutcome {
        if let Some(entry) = self.runs.first_entry() {
            if *entry.key() == self.read_offset {
                let run = entry.remove();
                self.read_offset += run.len() as u64;
                return ReadOutcome::Data(run.freeze());
            }
        }
        if self.final_size == Some(self.read_offset) {
            ReadOutcome::Finished
        } else {
            ReadOutcome::WouldBlock
        }
    }

    /// 즉시 읽을 수 있는 데이터(또는 FIN) 존재 여부
    pub fn is_readable(&self) -> bool {
        self.runs.contains_key(&self.read_offset) || self.final_size == Some(self.read_offset)
    }

    /// FIN 까지 모두 읽음
    pub fn is_drained(&self) -> bool {
        self.final_size == Some(self.read_offset)
    }

    /// 데이터를 빠짐없이 모두 받음 (읽었는지와 무관)
    pub fn is_fully_received(&self) -> bool {
        match self.final_size {
            Some(size) => self.received.contains(0, size),
            None => false,
        }
    }

    pub fn is_reset(&self) -> bool {
        self.reset
    }

    pub fn read_offset(&self) -> u64 {
        self.read_offset
    }

    /// 버퍼링된 미전달 구간 수
    pub fn pending_runs(&self) -> usize {
        self.runs.len()
    }
}

/// 스트림
#[derive(Debug)]
pub struct Stream {
    pub id: StreamId,
    pub direction: Direction,
    pub send: Option<SendStream>,
    pub recv: Option<RecvBuffer>,
}

impl Stream {
    pub fn new(id: StreamId, direction: Direction) -> Self {
        Self {
            id,
            direction,
            send: direction.can_send().then(SendStream::new),
            recv: direction.can_recv().then(RecvBuffer::new),
        }
    }

    /// 로컬 관점 방향 결정
    pub fn local_direction(id: StreamId, local: Role) -> Direction {
        if !id.is_unidirectional() {
            Direction::Bidirectional
        } else if id.initiator() == local {
            Direction::Send
        } else {
            Direction::Recv
        }
    }

    /// 양방향 모두 종료되어 해제 가능
    pub fn is_done(&self) -> bool {
        let send_done = self.send.as_ref().map_or(true, |s| s.is_complete());
        let recv_done = self
            .recv
            .as_ref()
            .map_or(true, |r| r.is_drained() || (r.is_reset() && !r.is_readable()));
        send_done && recv_done
    }
}
