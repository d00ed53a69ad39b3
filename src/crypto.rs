//! 패킷 보호 모듈 - X25519 키 교환 + ChaCha20-Poly1305 대칭 암호화
//!
//! 흐름:
//! 1. 양측이 X25519 임시 키쌍 생성
//! 2. OPEN / ACCEPT 메시지로 공개키 교환
//! 3. 공유 비밀(shared secret) 계산
//! 4. 수립 이후 모든 데이터그램을 ChaCha20-Poly1305 로 보호
//!
//! 보호된 데이터그램: `[connection_id:8][nonce:12][ciphertext + tag:16]`.
//! 연결 ID 는 평문으로 남겨 수신 디스패처가 복호화 없이 라우팅할 수 있게 함.
//! 재전송 공격 방어는 제공하지 않음

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use rand_core::OsRng;
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::frame::{peek_connection_id, ConnectionId};
use crate::stream::Role;

/// X25519 공개키 (32 bytes)
pub const PUBLIC_KEY_SIZE: usize = 32;

/// ChaCha20-Poly1305 nonce 크기 (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// ChaCha20-Poly1305 태그 크기 (16 bytes)
pub const TAG_SIZE: usize = 16;

/// 보호 헤더 크기 (connection_id + nonce)
pub const PROTECTED_HEADER_LEN: usize = 8 + NONCE_SIZE;

/// 암호화 오류
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("암호화 실패: {0}")]
    EncryptionFailed(String),
    #[error("복호화 실패: {0}")]
    DecryptionFailed(String),
    #[error("nonce 공간 고갈")]
    NonceExhausted,
}

/// 임시 키쌍 (일회성 세션용)
pub struct EphemeralKeyPair {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl EphemeralKeyPair {
    /// 새 임시 키쌍 생성
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// 공개키를 바이트로 변환
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        *self.public.as_bytes()
    }

    /// 상대방 공개키로 공유 비밀 계산 (소비됨)
    pub fn compute_shared_secret(self, peer_public: &[u8; PUBLIC_KEY_SIZE]) -> [u8; 32] {
        let peer_public = PublicKey::from(*peer_public);
        let shared = self.secret.diffie_hellman(&peer_public);
        *shared.as_bytes()
    }
}

impl std::fmt::Debug for EphemeralKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralKeyPair")
            .field("public", &self.public.as_bytes())
            .finish_non_exhaustive()
    }
}

/// 교체 가능한 패킷 보호 계층
///
/// `seal` 입력은 인코딩된 프레임 전체, 출력은 소켓으로 나갈 데이터그램
pub trait PacketProtection: Send {
    /// 송신 데이터그램 보호
    fn seal(&mut self, connection_id: ConnectionId, frame: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// 수신 데이터그램 해제
    fn open(&self, datagram: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// 실제로 보호가 적용되는지 (평문 폴백 판단용)
    fn is_active(&self) -> bool;
}

/// 보호 없음 (기본)
#[derive(Debug, Default, Clone, Copy)]
pub struct Plaintext;

impl PacketProtection for Plaintext {
    fn seal(&mut self, _connection_id: ConnectionId, frame: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(frame.to_vec())
    }

    fn open(&self, datagram: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(datagram.to_vec())
    }

    fn is_active(&self) -> bool {
        false
    }
}

/// ChaCha20-Poly1305 패킷 보호
pub struct ChaChaProtection {
    cipher: ChaCha20Poly1305,
    role: Role,
    nonce_counter: u64,
}

impl ChaChaProtection {
    /// 공유 비밀로 보호 계층 생성
    pub fn new(shared_secret: &[u8; 32], role: Role) -> Self {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(shared_secret));
        Self {
            cipher,
            role,
            nonce_counter: 0,
        }
    }

    /// 다음 nonce 생성: [역할(1)][0(3)][카운터(8)]
    /// 양방향이 같은 키를 쓰므로 역할 바이트로 nonce 공간 분리
    fn next_nonce(&mut self) -> Result<[u8; NONCE_SIZE], CryptoError> {
        let counter = self.nonce_counter;
        self.nonce_counter = counter.checked_add(1).ok_or(CryptoError::NonceExhausted)?;

        let mut nonce = [0u8; NONCE_SIZE];
        nonce[0] = match self.role {
            Role::Client => 0,
            Role::Server => 1,
        };
        nonce[4..].copy_from_slice(&counter.to_be_bytes());
        Ok(nonce)
    }
}

impl PacketProtection for ChaChaProtection {
    fn seal(&mut self, connection_id: ConnectionId, frame: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce_bytes = self.next_nonce()?;
        let aad = connection_id.to_be_bytes();

        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload { msg: frame, aad: &aad },
            )
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        let mut out = Vec::with_capacity(PROTECTED_HEADER_LEN + ciphertext.len());
        out.extend_from_slice(&aad);
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn open(&self, datagram: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if datagram.len() < PROTECTED_HEADER_LEN + TAG_SIZE {
            return Err(CryptoError::DecryptionFailed("데이터가 너무 짧음".into()));
        }
        let connection_id = peek_connection_id(datagram)
            .ok_or_else(|| CryptoError::DecryptionFailed("연결 ID 없음".into()))?;
        let aad = connection_id.to_be_bytes();
        let nonce = Nonce::from_slice(&datagram[8..PROTECTED_HEADER_LEN]);

        self.cipher
            .decrypt(
                nonce,
                Payload {
                    msg: &datagram[PROTECTED_HEADER_LEN..],
                    aad: &aad,
                },
            )
            .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
    }

    fn is_active(&self) -> bool {
        true
    }
}
