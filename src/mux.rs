//! 스트림 멀티플렉서
//!
//! 연결 하나에 속한 스트림들을 관리:
//! - 로컬 스트림 열기 / 상대가 연 스트림 지연 생성
//! - 송신 가능한 스트림 간 라운드로빈 스케줄링
//! - 수신 프레임을 스트림 재조립 버퍼로 전달
//! - 양방향이 모두 끝난 스트림 정리

use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;

use bytes::Bytes;
use tracing::debug;

use crate::frame::{AckRange, ConnectionId, Frame};
use crate::stream::{Direction, ReadOutcome, Role, SendStream, Stream, StreamId};
use crate::{Error, Result};

/// 수신 프레임 처리 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDisposition {
    /// 살아있는 스트림에 전달됨
    Delivered,
    /// 이미 정리된 스트림 (중복 재전송), ACK 만 다시 보냄
    Retired,
    /// 알 수 없는 로컬 스트림 ID
    Stray,
}

/// 정리된 스트림의 마지막 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retired {
    Finished,
    ResetByPeer,
    /// 연결 종료로 끝까지 받지 못하고 버려짐
    Abandoned,
}

#[derive(Debug)]
pub struct Multiplexer {
    role: Role,
    streams: BTreeMap<StreamId, Stream>,
    next_bidi: u32,
    next_uni: u32,
    /// 마지막으로 프레임을 내보낸 스트림 (라운드로빈 커서)
    last_scheduled: Option<StreamId>,
    /// 상대가 열었고 아직 accept 되지 않은 스트림
    incoming: VecDeque<StreamId>,
    /// 바닥값 이상에서 정리된 스트림
    retired: BTreeMap<StreamId, Retired>,
    /// ID 종류(하위 2비트)별 바닥값. 이보다 작은 시퀀스는 모두 정리됨
    retired_floor: [u32; 4],
    /// 바닥값 아래로 내려가 기록이 지워진 스트림
    pruned: Vec<StreamId>,
    /// 보내야 할 RESET (stream_id, 최종 크기)
    pending_resets: VecDeque<(StreamId, u64)>,
    max_streams: usize,
    send_buffer_size: usize,
}

impl Multiplexer {
    pub fn new(role: Role, max_streams: usize, send_buffer_size: usize) -> Self {
        Self {
            role,
            streams: BTreeMap::new(),
            next_bidi: 1,
            next_uni: 1,
            last_scheduled: None,
            incoming: VecDeque::new(),
            retired: BTreeMap::new(),
            retired_floor: [1; 4],
            pruned: Vec::new(),
            pending_resets: VecDeque::new(),
            max_streams,
            send_buffer_size,
        }
    }

    /// 로컬 스트림 열기 (Send = 단방향, Bidirectional = 양방향)
    pub fn open_stream(&mut self, direction: Direction) -> Result<StreamId> {
        let uni = match direction {
            Direction::Send => true,
            Direction::Bidirectional => false,
            Direction::Recv => {
                return Err(Error::InvalidDirection {
                    stream_id: StreamId::CONTROL,
                })
            }
        };
        if self.streams.len() >= self.max_streams {
            return Err(Error::StreamLimitExceeded {
                max: self.max_streams,
            });
        }

        let sequence = if uni { self.next_uni } else { self.next_bidi };
        let id = StreamId::new(sequence, self.role, uni);
        if !self.within_window(id) {
            return Err(Error::StreamLimitExceeded {
                max: self.max_streams,
            });
        }
        if uni {
            self.next_uni += 1;
        } else {
            self.next_bidi += 1;
        }

        self.streams.insert(id, Stream::new(id, direction));
        debug!("스트림 열림: {} ({:?})", id, direction);
        Ok(id)
    }

    /// 송신 버퍼 여유만큼 받아들이고 받아들인 바이트 수 반환
    pub fn write(&mut self, stream_id: StreamId, data: &[u8]) -> Result<usize> {
        let limit = self.send_buffer_size;
        let send = self.send_half(stream_id)?;
        if send.is_finished() {
            return Err(Error::StreamFinished { stream_id });
        }
        let accepted = send.capacity(limit).min(data.len());
        if accepted == 0 {
            return Ok(0);
        }
        send.enqueue(Bytes::copy_from_slice(&data[..accepted]), false)
    }

    /// 송신 방향 종료 (FIN)
    pub fn close(&mut self, stream_id: StreamId) -> Result<()> {
        if self.is_retired(stream_id) {
            return Ok(());
        }
        self.send_half(stream_id)?.finish();
        Ok(())
    }

    /// 송신 방향 리셋, 최종 크기 반환
    ///
    /// 이미 FIN 까지 ACK 된 스트림이면 None
    pub fn reset(&mut self, stream_id: StreamId) -> Result<Option<u64>> {
        if self.is_retired(stream_id) {
            return Ok(None);
        }
        let send = self.send_half(stream_id)?;
        if send.is_reset() || send.is_complete() {
            return Ok(None);
        }
        let final_size = send.reset();
        self.pending_resets.push_back((stream_id, final_size));
        debug!("스트림 리셋: {} (최종 크기 {})", stream_id, final_size);
        Ok(Some(final_size))
    }

    /// 연속된 수신 바이트 읽기
    pub fn read(&mut self, stream_id: StreamId) -> Result<ReadOutcome> {
        let stream = match self.streams.get_mut(&stream_id) {
            Some(stream) => stream,
            None => {
                return match self.retired_kind(stream_id) {
                    Some(Retired::Finished) => Ok(ReadOutcome::Finished),
                    Some(Retired::ResetByPeer) => Err(Error::StreamResetByPeer { stream_id }),
                    Some(Retired::Abandoned) => Err(Error::ConnectionClosed),
                    None => Err(Error::UnknownStream { stream_id }),
                };
            }
        };
        let recv = stream
            .recv
            .as_mut()
            .ok_or(Error::InvalidDirection { stream_id })?;
        if recv.is_reset() {
            self.reap(stream_id);
            return Err(Error::StreamResetByPeer { stream_id });
        }

        let outcome = recv.read();
        if outcome == ReadOutcome::Finished {
            self.reap(stream_id);
        }
        Ok(outcome)
    }

    /// 상대가 연 스트림 하나 꺼내기
    pub fn accept_stream(&mut self) -> Option<StreamId> {
        self.incoming.pop_front()
    }

    /// 라운드로빈으로 다음 송신 프레임 생성
    ///
    /// 차례가 된 스트림의 프레임이 `budget` 에 들어가지 않으면 None
    pub fn poll_transmit(
        &mut self,
        connection_id: ConnectionId,
        budget: usize,
        mtu: usize,
    ) -> Option<Frame> {
        if let Some(&(stream_id, final_size)) = self.pending_resets.front() {
            if budget == 0 {
                return None;
            }
            self.pending_resets.pop_front();
            return Some(Frame::reset(connection_id, stream_id, final_size));
        }

        let next = self.next_ready()?;
        let stream = self.streams.get_mut(&next)?;
        let send = stream.send.as_mut()?;
        if send.next_frame_len(mtu)? > budget {
            return None;
        }
        self.last_scheduled = Some(next);
        send.next_frame(connection_id, next, mtu)
    }

    /// 커서 다음부터 순회하며 송신할 데이터가 있는 첫 스트림
    fn next_ready(&self) -> Option<StreamId> {
        let ready = |(id, s): (&StreamId, &Stream)| {
            s.send.as_ref().filter(|send| send.has_ready()).map(|_| *id)
        };
        match self.last_scheduled {
            Some(last) => self
                .streams
                .range((Bound::Excluded(last), Bound::Unbounded))
                .find_map(ready)
                .or_else(|| self.streams.range(..=last).find_map(ready)),
            None => self.streams.iter().find_map(ready),
        }
    }

    /// 수신 데이터/FIN/RESET 프레임 반영
    pub fn on_frame(&mut self, frame: &Frame) -> Result<FrameDisposition> {
        let stream_id = frame.stream_id;

        if !self.streams.contains_key(&stream_id) {
            if self.is_retired(stream_id) {
                return Ok(FrameDisposition::Retired);
            }
            if stream_id.initiator() == self.role {
                return Ok(FrameDisposition::Stray);
            }
            if self.streams.len() >= self.max_streams || !self.within_window(stream_id) {
                return Err(Error::ProtocolViolation(format!(
                    "상대 스트림 {} 가 스트림 한도 {} 를 초과함",
                    stream_id, self.max_streams
                )));
            }
            let direction = Stream::local_direction(stream_id, self.role);
            self.streams.insert(stream_id, Stream::new(stream_id, direction));
            self.incoming.push_back(stream_id);
            debug!("상대 스트림 생성: {} ({:?})", stream_id, direction);
        }

        let stream = self
            .streams
            .get_mut(&stream_id)
            .ok_or(Error::UnknownStream { stream_id })?;
        let recv = stream.recv.as_mut().ok_or_else(|| {
            Error::ProtocolViolation(format!("송신 전용 스트림 {} 에 데이터 수신", stream_id))
        })?;

        if frame.is_reset() {
            recv.on_reset(frame.offset)?;
        } else {
            recv.insert(frame.offset, &frame.payload, frame.is_fin())?;
        }
        Ok(FrameDisposition::Delivered)
    }

    /// 상대의 ACK 범위 반영, 해제된 송신 버퍼 바이트 수 반환
    pub fn on_acked(&mut self, stream_id: StreamId, ranges: &[AckRange]) -> usize {
        let Some(send) = self
            .streams
            .get_mut(&stream_id)
            .and_then(|s| s.send.as_mut())
        else {
            return 0;
        };
        let freed: usize = ranges.iter().map(|r| send.on_acked(r.start, r.end)).sum();
        self.reap(stream_id);
        freed
    }

    /// 양방향이 모두 끝났으면 정리
    fn reap(&mut self, stream_id: StreamId) {
        let done = self.streams.get(&stream_id).map_or(false, Stream::is_done);
        if !done {
            return;
        }
        if let Some(stream) = self.streams.remove(&stream_id) {
            let reset = stream.recv.as_ref().map_or(false, |r| r.is_reset());
            let retired = if reset { Retired::ResetByPeer } else { Retired::Finished };
            self.retire(stream_id, retired);
            debug!("스트림 정리: {}", stream_id);
        }
    }

    /// 정리 기록. 바닥값부터 연속으로 정리된 만큼 바닥값을 올림
    ///
    /// Finished 는 바로 지움. ResetByPeer 는 바닥값 뒤 max_streams 까지 남김
    /// (다시 읽어도 리셋 에러). Abandoned 는 바닥값을 막음
    fn retire(&mut self, stream_id: StreamId, retired: Retired) {
        self.retired.insert(stream_id, retired);
        let class = id_class(stream_id);
        let start = self.retired_floor[class];
        loop {
            let floor = self.retired_floor[class];
            let floor_id = StreamId((floor << 2) | class as u32);
            match self.retired.get(&floor_id) {
                Some(Retired::Finished) => {
                    self.retired.remove(&floor_id);
                }
                Some(Retired::ResetByPeer) => {}
                _ => break,
            }
            self.retired_floor[class] = floor + 1;
            self.pruned.push(floor_id);
        }

        if self.retired_floor[class] != start {
            let stale =
                u64::from(self.retired_floor[class]).saturating_sub(self.max_streams as u64);
            self.retired.retain(|id, _| {
                id_class(*id) != class || u64::from(id.sequence()) >= stale
            });
        }
    }

    /// 바닥값 아래는 Finished 로 봄
    fn retired_kind(&self, stream_id: StreamId) -> Option<Retired> {
        if let Some(&retired) = self.retired.get(&stream_id) {
            return Some(retired);
        }
        let below_floor = !stream_id.is_control()
            && stream_id.sequence() < self.retired_floor[id_class(stream_id)];
        below_floor.then_some(Retired::Finished)
    }

    /// 같은 종류의 바닥값에서 max_streams 이내인지
    fn within_window(&self, stream_id: StreamId) -> bool {
        let floor = u64::from(self.retired_floor[id_class(stream_id)]);
        u64::from(stream_id.sequence()) < floor + self.max_streams as u64
    }

    /// 바닥값 아래로 지워진 스트림 꺼내기 (연결이 ACK 기록도 지움)
    pub fn take_pruned(&mut self) -> Vec<StreamId> {
        std::mem::take(&mut self.pruned)
    }

    /// 모든 송신 방향에 FIN 요청
    pub fn finish_all(&mut self) {
        for stream in self.streams.values_mut() {
            if let Some(send) = stream.send.as_mut() {
                send.finish();
            }
        }
    }

    /// 보낼 프레임이 있는지
    pub fn has_ready(&self) -> bool {
        !self.pending_resets.is_empty()
            || self
                .streams
                .values()
                .any(|s| s.send.as_ref().map_or(false, |send| send.has_ready()))
    }

    /// 모든 송신 방향이 끝났고 ACK 까지 받았는지
    pub fn all_acked(&self) -> bool {
        self.pending_resets.is_empty()
            && self
                .streams
                .values()
                .all(|s| s.send.as_ref().map_or(true, |send| send.is_complete()))
    }

    /// 연결 종료 시 송신 상태 해제. 읽을 수 있는 수신 데이터는 남김
    pub fn release_on_close(&mut self) {
        self.pending_resets.clear();
        self.last_scheduled = None;
        for stream in self.streams.values_mut() {
            stream.send = None;
        }
        let ids: Vec<StreamId> = self.streams.keys().copied().collect();
        for id in ids {
            let keep = self.streams.get(&id).map_or(false, |s| {
                s.recv
                    .as_ref()
                    .map_or(false, |r| r.is_readable() || r.pending_runs() > 0)
            });
            if keep {
                continue;
            }
            if let Some(stream) = self.streams.remove(&id) {
                let retired = match stream.recv {
                    Some(recv) if recv.is_reset() => Retired::ResetByPeer,
                    Some(recv) if !recv.is_drained() => Retired::Abandoned,
                    _ => Retired::Finished,
                };
                self.retire(id, retired);
            }
        }
    }

    pub fn stream(&self, stream_id: StreamId) -> Option<&Stream> {
        self.streams.get(&stream_id)
    }

    pub fn is_retired(&self, stream_id: StreamId) -> bool {
        self.retired_kind(stream_id).is_some()
    }

    /// 남아 있는 정리 기록 수
    pub fn retired_count(&self) -> usize {
        self.retired.len()
    }

    /// 살아있는 스트림 수
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    fn send_half(&mut self, stream_id: StreamId) -> Result<&mut SendStream> {
        if self.is_retired(stream_id) {
            return Err(Error::StreamFinished { stream_id });
        }
        let stream = self
            .streams
            .get_mut(&stream_id)
            .ok_or(Error::UnknownStream { stream_id })?;
        stream
            .send
            .as_mut()
            .ok_or(Error::InvalidDirection { stream_id })
    }
}

/// 시작 측 + 방향 (ID 하위 2비트)
fn id_class(stream_id: StreamId) -> usize {
    (stream_id.0 & 0b11) as usize
}
