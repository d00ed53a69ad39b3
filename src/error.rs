//! 에러 타입 정의

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::stream::StreamId;

/// 프레임 디코딩 에러
///
/// 연결 내부에서 흡수되어 손실로 취급됨 (애플리케이션에 노출되지 않음)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("잘못된 프레임: {reason}")]
    Malformed { reason: &'static str },

    #[error("체크섬 불일치: expected {expected:08X}, got {got:08X}")]
    ChecksumMismatch { expected: u32, got: u32 },
}

/// MFP 프로토콜 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("직렬화 에러: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("디코딩 에러: {0}")]
    Decode(#[from] DecodeError),

    #[error("핸드쉐이크 타임아웃")]
    HandshakeTimeout,

    #[error("연결 종료")]
    ConnectionClosed,

    #[error("상대방이 스트림을 리셋함: stream_id={stream_id}")]
    StreamResetByPeer { stream_id: StreamId },

    #[error("유휴 타임아웃")]
    IdleTimeout,

    #[error("프로토콜 위반: {0}")]
    ProtocolViolation(String),

    #[error("알 수 없는 스트림: stream_id={stream_id}")]
    UnknownStream { stream_id: StreamId },

    #[error("이미 종료된 스트림: stream_id={stream_id}")]
    StreamFinished { stream_id: StreamId },

    #[error("허용되지 않는 스트림 방향: stream_id={stream_id}")]
    InvalidDirection { stream_id: StreamId },

    #[error("스트림 수 초과: 최대 {max}")]
    StreamLimitExceeded { max: usize },

    #[error("암호화 에러: {0}")]
    Crypto(#[from] CryptoError),

    #[error("유효하지 않은 설정: {0}")]
    InvalidConfig(String),

    #[error("유효하지 않은 전송 데이터: {0}")]
    InvalidTransfer(String),

    #[error("채널 에러")]
    ChannelError,
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
