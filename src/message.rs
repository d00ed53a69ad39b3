//! 핸드쉐이크 메시지 정의
//!
//! OPEN / ACCEPT 제어 프레임의 페이로드. bincode 로 직렬화됨

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::crypto::PUBLIC_KEY_SIZE;
use crate::{Config, Result, PROTOCOL_VERSION};

/// 현재 시각 (microseconds since epoch)
pub fn timestamp_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// 연결 요청 메시지 (클라이언트 → 서버)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenMessage {
    /// 프로토콜 버전
    pub protocol_version: u8,

    /// 클라이언트가 원하는 MTU 페이로드 크기
    pub mtu_payload_size: u16,

    /// 클라이언트 유휴 타임아웃 (밀리초)
    pub idle_timeout_ms: u64,

    /// 암호화 활성화 요청 여부
    pub encryption_enabled: bool,

    /// 클라이언트 공개키 (X25519, 32바이트)
    /// 암호화 비활성 시 0으로 채움
    pub public_key: [u8; PUBLIC_KEY_SIZE],

    /// 클라이언트 타임스탬프 (microseconds since epoch)
    pub timestamp_us: u64,
}

impl OpenMessage {
    pub fn new(config: &Config, public_key: Option<[u8; PUBLIC_KEY_SIZE]>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            mtu_payload_size: config.mtu_payload_size as u16,
            idle_timeout_ms: config.idle_timeout.as_millis() as u64,
            encryption_enabled: public_key.is_some(),
            public_key: public_key.unwrap_or([0u8; PUBLIC_KEY_SIZE]),
            timestamp_us: timestamp_us(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// 연결 수락 메시지 (서버 → 클라이언트)
///
/// 양측 설정 중 보수적인 값으로 협상된 결과를 담음
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptMessage {
    /// 프로토콜 버전
    pub protocol_version: u8,

    /// 확정된 MTU 페이로드 크기 (양측 최소값)
    pub mtu_payload_size: u16,

    /// 확정된 유휴 타임아웃 (양측 최소값, 밀리초)
    pub idle_timeout_ms: u64,

    /// 암호화 활성화 여부 (양측 모두 원할 때만)
    pub encryption_enabled: bool,

    /// 서버 공개키 (X25519, 32바이트)
    pub public_key: [u8; PUBLIC_KEY_SIZE],

    /// 클라이언트 타임스탬프 에코
    pub client_timestamp_us: u64,

    /// 서버 타임스탬프
    pub server_timestamp_us: u64,
}

impl AcceptMessage {
    /// OPEN 과 서버 설정으로 협상
    pub fn negotiate(
        open: &OpenMessage,
        config: &Config,
        public_key: Option<[u8; PUBLIC_KEY_SIZE]>,
    ) -> Self {
        let mtu = (open.mtu_payload_size as usize).min(config.mtu_payload_size);
        let idle_ms = open
            .idle_timeout_ms
            .min(config.idle_timeout.as_millis() as u64);
        let encryption_enabled = open.encryption_enabled && public_key.is_some();

        Self {
            protocol_version: PROTOCOL_VERSION,
            mtu_payload_size: mtu as u16,
            idle_timeout_ms: idle_ms,
            encryption_enabled,
            public_key: public_key
                .filter(|_| encryption_enabled)
                .unwrap_or([0u8; PUBLIC_KEY_SIZE]),
            client_timestamp_us: open.timestamp_us,
            server_timestamp_us: timestamp_us(),
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
