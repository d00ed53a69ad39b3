//! 프레임 정의 및 코덱
//!
//! 데이터그램 하나 = 프레임 하나. 빅엔디안 고정 레이아웃:
//!
//! ```text
//! [connection_id:8][stream_id:4][offset:8][flags:1][length:2][payload]
//! [ack_range_count:1][count x (start:8, end:8)][crc32:4]
//! ```
//!
//! 체크섬은 무결성 확인용 CRC32 (암호학적 보호 아님)

use std::ops::BitOr;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::DecodeError;
use crate::stream::StreamId;

/// 연결 ID (64비트)
pub type ConnectionId = u64;

/// 헤더 크기: connection_id + stream_id + offset + flags + length
pub const HEADER_LEN: usize = 8 + 4 + 8 + 1 + 2;

/// 체크섬 크기
pub const CHECKSUM_LEN: usize = 4;

/// ACK 범위 하나의 크기
pub const ACK_RANGE_LEN: usize = 16;

/// 프레임 하나에 실을 수 있는 최대 ACK 범위 수
pub const MAX_ACK_RANGES: usize = 16;

/// 가장 작은 프레임 (페이로드/ACK 없음)
pub const MIN_FRAME_LEN: usize = HEADER_LEN + 1 + CHECKSUM_LEN;

/// 페이로드를 제외한 최대 프레임 오버헤드
pub const FRAME_OVERHEAD: usize = MIN_FRAME_LEN + MAX_ACK_RANGES * ACK_RANGE_LEN;

/// 스트림 시퀀스 공간 상한 (오프셋 + 길이 + FIN 이 넘을 수 없음)
pub const MAX_STREAM_OFFSET: u64 = 1 << 62;

/// 프레임 플래그 비트
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// 스트림 마지막 프레임
    pub const FIN: FrameFlags = FrameFlags(0x01);
    /// ACK 범위 포함
    pub const ACK: FrameFlags = FrameFlags(0x02);
    /// 연결 요청 (핸드쉐이크)
    pub const OPEN: FrameFlags = FrameFlags(0x04);
    /// 연결 수락 (핸드쉐이크)
    pub const ACCEPT: FrameFlags = FrameFlags(0x08);
    /// 연결 종료 요청
    pub const CLOSE: FrameFlags = FrameFlags(0x10);
    /// 스트림 리셋
    pub const RESET: FrameFlags = FrameFlags(0x20);
    /// 생존 확인
    pub const PING: FrameFlags = FrameFlags(0x40);
    /// 연결 종료 확인
    pub const CLOSE_ACK: FrameFlags = FrameFlags(0x80);

    pub const fn empty() -> Self {
        FrameFlags(0)
    }

    pub const fn from_bits(bits: u8) -> Self {
        FrameFlags(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: FrameFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: FrameFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: FrameFlags) {
        self.0 &= !other.0;
    }
}

impl BitOr for FrameFlags {
    type Output = FrameFlags;

    fn bitor(self, rhs: FrameFlags) -> FrameFlags {
        FrameFlags(self.0 | rhs.0)
    }
}

/// ACK 범위 `[start, end)` (스트림 시퀀스 공간)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AckRange {
    pub start: u64,
    pub end: u64,
}

impl AckRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// 프레임 (전송 단위)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub connection_id: ConnectionId,
    pub stream_id: StreamId,
    pub offset: u64,
    pub flags: FrameFlags,
    pub payload: Bytes,
    pub ack_ranges: Vec<AckRange>,
}

impl Frame {
    /// 스트림 데이터 프레임
    pub fn data(
        connection_id: ConnectionId,
        stream_id: StreamId,
        offset: u64,
        payload: Bytes,
        fin: bool,
    ) -> Self {
        let flags = if fin { FrameFlags::FIN } else { FrameFlags::empty() };
        Self {
            connection_id,
            stream_id,
            offset,
            flags,
            payload,
            ack_ranges: Vec::new(),
        }
    }

    /// ACK 전용 프레임
    pub fn ack(connection_id: ConnectionId, stream_id: StreamId, ranges: Vec<AckRange>) -> Self {
        Self::data(connection_id, stream_id, 0, Bytes::new(), false).with_acks(ranges)
    }

    /// 연결 제어 프레임 (스트림 0)
    pub fn control(connection_id: ConnectionId, flags: FrameFlags, payload: Bytes) -> Self {
        Self {
            connection_id,
            stream_id: StreamId::CONTROL,
            offset: 0,
            flags,
            payload,
            ack_ranges: Vec::new(),
        }
    }

    /// 스트림 리셋 프레임 (offset = 최종 크기)
    pub fn reset(connection_id: ConnectionId, stream_id: StreamId, final_size: u64) -> Self {
        Self {
            connection_id,
            stream_id,
            offset: final_size,
            flags: FrameFlags::RESET,
            payload: Bytes::new(),
            ack_ranges: Vec::new(),
        }
    }

    /// ACK 범위 부착 (최대 MAX_ACK_RANGES 개)
    pub fn with_acks(mut self, mut ranges: Vec<AckRange>) -> Self {
        ranges.truncate(MAX_ACK_RANGES);
        if ranges.is_empty() {
            self.flags.remove(FrameFlags::ACK);
        } else {
            self.flags.insert(FrameFlags::ACK);
        }
        self.ack_ranges = ranges;
        self
    }

    pub fn is_fin(&self) -> bool {
        self.flags.contains(FrameFlags::FIN)
    }

    pub fn is_reset(&self) -> bool {
        self.flags.contains(FrameFlags::RESET)
    }

    pub fn has_acks(&self) -> bool {
        self.flags.contains(FrameFlags::ACK)
    }

    /// 시퀀스 공간에서 차지하는 길이 (FIN/RESET 은 1 단위)
    pub fn seq_len(&self) -> u64 {
        self.payload.len() as u64 + (self.is_fin() || self.is_reset()) as u64
    }

    /// 상대방이 ACK 해야 하는 프레임인지 (스트림 데이터/FIN/RESET)
    pub fn is_ack_eliciting(&self) -> bool {
        !self.stream_id.is_control() && self.seq_len() > 0
    }

    /// 인코딩 후 크기
    pub fn encoded_len(&self) -> usize {
        MIN_FRAME_LEN + self.payload.len() + self.ack_ranges.len() * ACK_RANGE_LEN
    }

    /// 바이트로 직렬화
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u64(self.connection_id);
        buf.put_u32(self.stream_id.0);
        buf.put_u64(self.offset);
        buf.put_u8(self.flags.bits());
        buf.put_u16(self.payload.len() as u16);
        buf.put_slice(&self.payload);
        buf.put_u8(self.ack_ranges.len() as u8);
        for range in &self.ack_ranges {
            buf.put_u64(range.start);
            buf.put_u64(range.end);
        }
        let checksum = crc32fast::hash(&buf);
        buf.put_u32(checksum);
        buf.freeze()
    }

    /// 바이트에서 역직렬화
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < MIN_FRAME_LEN {
            return Err(DecodeError::Malformed {
                reason: "헤더보다 짧은 데이터그램",
            });
        }

        let (body, mut trailer) = bytes.split_at(bytes.len() - CHECKSUM_LEN);
        let expected = trailer.get_u32();
        let got = crc32fast::hash(body);
        if expected != got {
            return Err(DecodeError::ChecksumMismatch { expected, got });
        }

        let mut cur = body;
        let connection_id = cur.get_u64();
        let stream_id = StreamId(cur.get_u32());
        let offset = cur.get_u64();
        let flags = FrameFlags::from_bits(cur.get_u8());
        let len = cur.get_u16() as usize;

        // 페이로드 + ack_range_count(1)
        if cur.remaining() < len + 1 {
            return Err(DecodeError::Malformed {
                reason: "길이 필드가 버퍼를 초과함",
            });
        }
        let payload = Bytes::copy_from_slice(&cur[..len]);
        cur.advance(len);

        let fin_or_reset = flags.contains(FrameFlags::FIN) || flags.contains(FrameFlags::RESET);
        let seq_end = offset.checked_add(len as u64 + fin_or_reset as u64);
        if seq_end.map_or(true, |end| end > MAX_STREAM_OFFSET) {
            return Err(DecodeError::Malformed {
                reason: "스트림 오프셋 한도 초과",
            });
        }

        let count = cur.get_u8() as usize;
        let needed = count * ACK_RANGE_LEN;
        if cur.remaining() < needed {
            return Err(DecodeError::Malformed {
                reason: "ACK 범위가 버퍼를 초과함",
            });
        }
        if cur.remaining() > needed {
            return Err(DecodeError::Malformed {
                reason: "프레임 뒤에 남는 바이트",
            });
        }
        if flags.contains(FrameFlags::ACK) != (count > 0) {
            return Err(DecodeError::Malformed {
                reason: "ACK 플래그와 범위 수 불일치",
            });
        }

        let mut ack_ranges = Vec::with_capacity(count);
        for _ in 0..count {
            let start = cur.get_u64();
            let end = cur.get_u64();
            if start > end {
                return Err(DecodeError::Malformed {
                    reason: "역전된 ACK 범위",
                });
            }
            if end > MAX_STREAM_OFFSET {
                return Err(DecodeError::Malformed {
                    reason: "ACK 범위가 오프셋 한도를 넘음",
                });
            }
            ack_ranges.push(AckRange { start, end });
        }

        Ok(Self {
            connection_id,
            stream_id,
            offset,
            flags,
            payload,
            ack_ranges,
        })
    }
}

/// 프레임 인코딩
pub fn encode(frame: &Frame) -> Bytes {
    frame.encode()
}

/// 프레임 디코딩
pub fn decode(bytes: &[u8]) -> Result<Frame, DecodeError> {
    Frame::decode(bytes)
}

/// 데이터그램 앞 8바이트에서 연결 ID 추출 (보호 여부와 무관)
pub fn peek_connection_id(bytes: &[u8]) -> Option<ConnectionId> {
    let head: [u8; 8] = bytes.get(..8)?.try_into().ok()?;
    Some(u64::from_be_bytes(head))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frame() -> Frame {
        Frame::data(
            0xDEAD_BEEF_0000_0001,
            StreamId(4),
            1200,
            Bytes::from(vec![1, 2, 3, 4, 5]),
            true,
        )
        .with_acks(vec![AckRange::new(0, 100), AckRange::new(200, 300)])
    }

    #[test]
    fn test_frame_roundtrip() {
        let frame = sample_frame();
        let bytes = frame.encode();
        assert_eq!(bytes.len(), frame.encoded_len());

        let restored = Frame::decode(&bytes).unwrap();
        assert_eq!(restored, frame);
        assert_eq!(restored.encode(), bytes);
    }

    #[test]
    fn test_control_frame_roundtrip() {
        let frame = Frame::control(7, FrameFlags::CLOSE | FrameFlags::CLOSE_ACK, Bytes::new());
        let restored = decode(&encode(&frame)).unwrap();
        assert_eq!(restored, frame);
        assert!(restored.stream_id.is_control());
        assert!(!restored.is_ack_eliciting());
    }

    #[test]
    fn test_corrupted_byte_is_checksum_mismatch() {
        let mut bytes = sample_frame().encode().to_vec();
        bytes[HEADER_LEN + 2] ^= 0xFF;
        assert!(matches!(
            Frame::decode(&bytes),
            Err(DecodeError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_length_field_exceeding_buffer_is_malformed() {
        let frame = Frame::data(1, StreamId(4), 0, Bytes::from_static(b"abc"), false);
        let mut bytes = frame.encode().to_vec();
        bytes.truncate(bytes.len() - CHECKSUM_LEN);

        // length 필드 (offset 21..23) 를 크게 변조 후 체크섬 재계산
        bytes[21..23].copy_from_slice(&1000u16.to_be_bytes());
        let checksum = crc32fast::hash(&bytes);
        bytes.extend_from_slice(&checksum.to_be_bytes());

        assert!(matches!(
            Frame::decode(&bytes),
            Err(DecodeError::Malformed { .. })
        ));
    }

    #[test]
    fn test_truncated_datagram_is_malformed() {
        let bytes = sample_frame().encode();
        assert!(matches!(
            Frame::decode(&bytes[..10]),
            Err(DecodeError::Malformed { .. })
        ));
    }

    #[test]
    fn test_with_acks_truncates_and_sets_flag() {
        let ranges: Vec<AckRange> = (0..40).map(|i| AckRange::new(i * 10, i * 10 + 5)).collect();
        let frame = Frame::ack(1, StreamId(4), ranges);
        assert_eq!(frame.ack_ranges.len(), MAX_ACK_RANGES);
        assert!(frame.has_acks());

        let frame = frame.with_acks(Vec::new());
        assert!(!frame.has_acks());
    }

    #[test]
    fn test_seq_len_counts_fin_and_reset() {
        let fin = Frame::data(1, StreamId(4), 10, Bytes::new(), true);
        assert_eq!(fin.seq_len(), 1);
        let reset = Frame::reset(1, StreamId(4), 10);
        assert_eq!(reset.seq_len(), 1);
        assert!(reset.is_ack_eliciting());
    }

    #[test]
    fn test_offset_beyond_limit_is_malformed() {
        let frame = Frame::data(1, StreamId(4), u64::MAX - 1, Bytes::from_static(b"abcde"), false);
        assert!(matches!(
            decode(&frame.encode()),
            Err(DecodeError::Malformed { .. })
        ));

        // FIN 한 단위까지 포함해 정확히 한도에 닿는 것은 허용
        let edge = Frame::data(
            1,
            StreamId(4),
            MAX_STREAM_OFFSET - 4,
            Bytes::from_static(b"abc"),
            true,
        );
        assert_eq!(decode(&edge.encode()).unwrap(), edge);

        let ack = Frame::ack(1, StreamId(4), vec![AckRange::new(0, u64::MAX)]);
        assert!(decode(&ack.encode()).is_err());
    }

    #[test]
    fn test_peek_connection_id() {
        let bytes = sample_frame().encode();
        assert_eq!(peek_connection_id(&bytes), Some(0xDEAD_BEEF_0000_0001));
        assert_eq!(peek_connection_id(&bytes[..4]), None);
    }
}
