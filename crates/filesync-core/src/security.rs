//! Security provider for framed messages
//!
//! Provides:
//! - The `SecurityProvider` seam used by the frame codec
//! - AES-256-GCM encryption with random 96-bit IVs
//! - SHA-256 integrity digests
//! - Pairing codes and SPAKE2 key agreement for deriving the session key

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use sha2::{Digest, Sha256};
use spake2::{Ed25519Group, Identity, Password, Spake2};
use tracing::debug;

use crate::error::FrameError;
use crate::DIGEST_LEN;

/// AES-GCM IV length in bytes
pub const IV_LEN: usize = 12;

/// The OS random source could not be read
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("random source failed: {0}")]
pub struct RandomError(pub String);

impl From<getrandom::Error> for RandomError {
    fn from(e: getrandom::Error) -> Self {
        RandomError(e.to_string())
    }
}

/// Symmetric key length in bytes
pub const KEY_SIZE: usize = 32;

/// Crypto collaborator consumed by the frame codec.
pub trait SecurityProvider: Send + Sync {
    /// Length of the IV produced by `encrypt`
    fn iv_len(&self) -> usize;

    /// Encrypt plaintext, returning `(iv, ciphertext)`
    fn encrypt(&self, plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>), FrameError>;

    /// Decrypt ciphertext with the carried IV
    fn decrypt(&self, iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, FrameError>;

    /// Integrity digest of `data`
    fn hash(&self, data: &[u8]) -> [u8; DIGEST_LEN] {
        checksum(data)
    }
}

/// Compute SHA-256 checksum of data
pub fn checksum(data: &[u8]) -> [u8; DIGEST_LEN] {
    Sha256::digest(data).into()
}

/// Verify SHA-256 checksum
pub fn verify_checksum(data: &[u8], expected: &[u8; DIGEST_LEN]) -> bool {
    &checksum(data) == expected
}

/// AES-256-GCM provider
pub struct AesGcmProvider {
    cipher: Aes256Gcm,
}

impl AesGcmProvider {
    pub fn new(key: &[u8; KEY_SIZE]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    /// Build a provider from a freshly generated random key
    pub fn generate() -> Result<Self, RandomError> {
        let mut key = [0u8; KEY_SIZE];
        getrandom::fill(&mut key)?;
        Ok(Self::new(&key))
    }
}

impl SecurityProvider for AesGcmProvider {
    fn iv_len(&self) -> usize {
        IV_LEN
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>), FrameError> {
        let mut iv = [0u8; IV_LEN];
        getrandom::fill(&mut iv).map_err(|e| FrameError::Encrypt(e.to_string()))?;

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&iv), plaintext)
            .map_err(|e| FrameError::Encrypt(e.to_string()))?;

        Ok((iv.to_vec(), ciphertext))
    }

    fn decrypt(&self, iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, FrameError> {
        if iv.len() != IV_LEN {
            return Err(FrameError::IntegrityFailure);
        }
        self.cipher
            .decrypt(Nonce::from_slice(iv), ciphertext)
            .map_err(|_| FrameError::IntegrityFailure)
    }
}

/// Provider for links without a negotiated key.
///
/// Integrity digests still apply; any frame asking for encryption is refused.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlaintextProvider;

impl SecurityProvider for PlaintextProvider {
    fn iv_len(&self) -> usize {
        0
    }

    fn encrypt(&self, _plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>), FrameError> {
        Err(FrameError::Encrypt("no session key negotiated".into()))
    }

    fn decrypt(&self, _iv: &[u8], _ciphertext: &[u8]) -> Result<Vec<u8>, FrameError> {
        Err(FrameError::IntegrityFailure)
    }
}

/// Length of a pairing code in characters (without dashes)
pub const PAIRING_CODE_LENGTH: usize = 6;

/// Characters used in pairing codes (unambiguous set)
const PAIRING_CODE_CHARS: &[u8] = b"23456789ABCDEFGHJKLMNPQRSTUVWXYZ";

/// Generate a random pairing code formatted as `XXX-XXX`
pub fn generate_pairing_code() -> Result<String, RandomError> {
    let mut bytes = [0u8; PAIRING_CODE_LENGTH];
    getrandom::fill(&mut bytes)?;

    let code: String = bytes
        .iter()
        .map(|b| PAIRING_CODE_CHARS[(*b as usize) % PAIRING_CODE_CHARS.len()] as char)
        .collect();

    Ok(format!("{}-{}", &code[..3], &code[3..]))
}

/// Normalize a pairing code (remove dashes and whitespace, uppercase)
pub fn normalize_pairing_code(code: &str) -> String {
    code.chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Validate a pairing code format
pub fn validate_pairing_code(code: &str) -> bool {
    let normalized = normalize_pairing_code(code);
    normalized.len() == PAIRING_CODE_LENGTH
        && normalized.bytes().all(|b| PAIRING_CODE_CHARS.contains(&b))
}

/// Size of PAKE output message
pub const PAKE_MESSAGE_SIZE: usize = 33;

/// PAKE identity for the filesync protocol
const PAKE_IDENTITY: &[u8] = b"filesync-pake-v1";

/// Role in PAKE handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PakeRole {
    /// The peer sending files
    Sender,
    /// The peer receiving files
    Receiver,
}

/// SPAKE2 handshake over a pairing code.
///
/// Both peers exchange one message; a matching code yields the same 32-byte
/// key on both ends, which then seeds `AesGcmProvider`.
pub struct PakeHandshake {
    state: Option<Spake2<Ed25519Group>>,
    outbound_msg: Vec<u8>,
    role: PakeRole,
}

impl PakeHandshake {
    pub fn start(role: PakeRole, code: &str) -> Self {
        let normalized = normalize_pairing_code(code);
        let password = Password::new(normalized.as_bytes());
        let identity = Identity::new(PAKE_IDENTITY);

        let (state, outbound_msg) = match role {
            PakeRole::Sender => Spake2::<Ed25519Group>::start_a(&password, &identity, &identity),
            PakeRole::Receiver => Spake2::<Ed25519Group>::start_b(&password, &identity, &identity),
        };

        debug!(?role, "started PAKE handshake");

        Self {
            state: Some(state),
            outbound_msg,
            role,
        }
    }

    /// Message to send to the peer
    pub fn outbound_message(&self) -> &[u8] {
        &self.outbound_msg
    }

    pub fn role(&self) -> PakeRole {
        self.role
    }

    /// Complete the handshake with the peer's message, returning the shared key
    pub fn finish(mut self, peer_message: &[u8]) -> Result<[u8; KEY_SIZE], PakeError> {
        let state = self.state.take().ok_or(PakeError::AlreadyFinished)?;

        let shared_key = state
            .finish(peer_message)
            .map_err(|_| PakeError::HandshakeFailed)?;

        if shared_key.len() != KEY_SIZE {
            return Err(PakeError::HandshakeFailed);
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&shared_key);

        debug!("PAKE handshake completed");
        Ok(key)
    }
}

/// PAKE errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PakeError {
    #[error("PAKE handshake already finished")]
    AlreadyFinished,
    #[error("PAKE handshake failed")]
    HandshakeFailed,
}
