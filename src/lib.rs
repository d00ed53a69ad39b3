//! # MFP (Multiplexed Flow Protocol)
//!
//! UDP 기반 신뢰성 멀티 스트림 전송 프로토콜
//!
//! ## 핵심 특징
//! - **멀티 스트림**: 하나의 연결 위에 독립적인 바이트 스트림 다중화
//! - **신뢰성**: 오프셋 기반 ACK 범위 + 재전송 타이머 + fast retransmit
//! - **순서 보장**: 스트림 내 바이트는 오프셋 순서대로, 빈틈 없이 전달
//! - **AIMD 혼잡제어**: slow start / congestion avoidance, 손실 시 절반
//! - **공정 스케줄링**: 송신 가능한 스트림 간 라운드로빈
//! - **멀티 플로우 파일 전송**: 파일을 인터리브된 블록으로 나눠 동시 전송
//! - **선택적 암호화**: X25519 + ChaCha20-Poly1305 패킷 보호

pub mod ack;
pub mod config;
pub mod congestion;
pub mod connection;
pub mod crypto;
pub mod driver;
pub mod endpoint;
pub mod error;
pub mod frame;
pub mod message;
pub mod mux;
pub mod range_set;
pub mod retransmit;
pub mod rtt;
pub mod stats;
pub mod stream;
pub mod transfer;

pub use config::Config;
pub use connection::{Connection, ConnectionState, Role};
pub use endpoint::{connect, listen, ConnectionHandle, Endpoint, Listener, StreamHandle};
pub use error::{DecodeError, Error, Result};
pub use frame::{AckRange, ConnectionId, Frame, FrameFlags};
pub use stats::{ConnectionStats, FlowStats, TransferReport};
pub use stream::{Direction, ReadOutcome, StreamId};

/// 프로토콜 버전
pub const PROTOCOL_VERSION: u8 = 1;

/// 기본 MTU 페이로드 크기 (바이트)
pub const DEFAULT_MTU_PAYLOAD_SIZE: usize = 1200;

/// 수신 버퍼 크기 (UDP 최대 데이터그램)
pub const MAX_DATAGRAM_SIZE: usize = 65535;
