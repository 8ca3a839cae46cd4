//! Frame codec
//!
//! Every application message travels in one envelope:
//!
//! ```text
//! ┌──────────┬─────────┬──────────┬───────┬──────────────┬──────────────┬──────────┐
//! │ magic    │ version │ length   │ flags │ iv           │ data         │ digest   │
//! │ u16 LE   │ u8      │ u32 LE   │ u8    │ 0 or iv_len  │ length-iv-32 │ 32 bytes │
//! └──────────┴─────────┴──────────┴───────┴──────────────┴──────────────┴──────────┘
//! ```
//!
//! `length` counts the body (iv + data + digest), not the 8-byte header.
//! The digest is SHA-256 over the plaintext, so a receiver verifies after
//! decrypting.

use std::fmt;

use tracing::trace;

use crate::error::FrameError;
use crate::security::SecurityProvider;
use crate::{DIGEST_LEN, PROTOCOL_MAGIC, PROTOCOL_VERSION};

/// Header size in bytes
pub const HEADER_LEN: usize = 8;

/// Frame flag bitset
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(u8);

impl Flags {
    pub const NONE: Flags = Flags(0);
    /// Payload is raw bytes (data block) rather than control text
    pub const BINARY: Flags = Flags(1 << 0);
    /// Payload is encrypted and an IV follows the header
    pub const ENCRYPTED: Flags = Flags(1 << 1);

    pub fn from_bits(bits: u8) -> Self {
        Flags(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_binary(self) -> bool {
        self.contains(Flags::BINARY)
    }

    pub fn is_encrypted(self) -> bool {
        self.contains(Flags::ENCRYPTED)
    }
}

impl std::ops::BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Flags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Flags(")?;
        let mut first = true;
        for (flag, name) in [(Flags::BINARY, "BINARY"), (Flags::ENCRYPTED, "ENCRYPTED")] {
            if self.contains(flag) {
                if !first {
                    write!(f, " | ")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        if first {
            write!(f, "NONE")?;
        }
        write!(f, ")")
    }
}

/// Fixed wire header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: u16,
    pub version: u8,
    /// Body length in bytes
    pub length: u32,
    pub flags: Flags,
}

impl FrameHeader {
    pub fn new(length: u32, flags: Flags) -> Self {
        Self {
            magic: PROTOCOL_MAGIC,
            version: PROTOCOL_VERSION,
            length,
            flags,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..2].copy_from_slice(&self.magic.to_le_bytes());
        buf[2] = self.version;
        buf[3..7].copy_from_slice(&self.length.to_le_bytes());
        buf[7] = self.flags.bits();
        buf
    }

    /// Parse the header without validating it.
    ///
    /// Returns `None` if fewer than `HEADER_LEN` bytes are available.
    pub fn peek(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        Some(Self {
            magic: u16::from_le_bytes([buf[0], buf[1]]),
            version: buf[2],
            length: u32::from_le_bytes([buf[3], buf[4], buf[5], buf[6]]),
            flags: Flags::from_bits(buf[7]),
        })
    }

    /// Check magic and version against this build's protocol
    pub fn validate(&self) -> Result<(), FrameError> {
        if self.magic != PROTOCOL_MAGIC || self.version != PROTOCOL_VERSION {
            return Err(FrameError::ProtocolMismatch {
                magic: self.magic,
                version: self.version,
            });
        }
        Ok(())
    }

    /// Total frame size on the wire
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.length as usize
    }
}

/// One complete envelope.
///
/// After `encode`, `data` holds what goes on the wire (ciphertext when
/// encrypted). After `decode`, `data` holds the verified plaintext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserMessage {
    pub header: FrameHeader,
    pub iv: Vec<u8>,
    pub data: Vec<u8>,
    pub digest: [u8; DIGEST_LEN],
}

impl UserMessage {
    pub fn is_binary(&self) -> bool {
        self.header.flags.is_binary()
    }

    pub fn is_encrypted(&self) -> bool {
        self.header.flags.is_encrypted()
    }

    /// Serialize header and body
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.header.frame_len());
        out.extend_from_slice(&self.header.encode());
        out.extend_from_slice(&self.iv);
        out.extend_from_slice(&self.data);
        out.extend_from_slice(&self.digest);
        out
    }
}

/// Wrap `plaintext` in an envelope.
pub fn encode(
    plaintext: &[u8],
    flags: Flags,
    provider: &dyn SecurityProvider,
) -> Result<UserMessage, FrameError> {
    let (iv, data) = if flags.is_encrypted() {
        provider.encrypt(plaintext)?
    } else {
        (Vec::new(), plaintext.to_vec())
    };
    let digest = provider.hash(plaintext);

    let body_len = iv.len() + data.len() + DIGEST_LEN;
    let length = u32::try_from(body_len).map_err(|_| FrameError::TooLarge {
        size: body_len,
        max: u32::MAX as usize,
    })?;

    trace!(len = body_len, ?flags, "encoded frame");

    Ok(UserMessage {
        header: FrameHeader::new(length, flags),
        iv,
        data,
        digest,
    })
}

/// Decode one frame from `raw`, verifying protocol, length and integrity.
///
/// Bytes past the declared length are ignored.
pub fn decode(raw: &[u8], provider: &dyn SecurityProvider) -> Result<UserMessage, FrameError> {
    let header = FrameHeader::peek(raw).ok_or(FrameError::Truncated {
        needed: HEADER_LEN,
        available: raw.len(),
    })?;
    header.validate()?;

    let body = &raw[HEADER_LEN..];
    let length = header.length as usize;
    if length > body.len() {
        return Err(FrameError::Truncated {
            needed: length,
            available: body.len(),
        });
    }

    let iv_len = if header.flags.is_encrypted() {
        provider.iv_len()
    } else {
        0
    };
    let overhead = iv_len + DIGEST_LEN;
    if length < overhead {
        return Err(FrameError::Truncated {
            needed: overhead,
            available: length,
        });
    }

    let body = &body[..length];
    let (iv, rest) = body.split_at(iv_len);
    let (data, digest_bytes) = rest.split_at(rest.len() - DIGEST_LEN);

    let plaintext = if header.flags.is_encrypted() {
        provider.decrypt(iv, data)?
    } else {
        data.to_vec()
    };

    let mut digest = [0u8; DIGEST_LEN];
    digest.copy_from_slice(digest_bytes);
    if provider.hash(&plaintext) != digest {
        return Err(FrameError::IntegrityFailure);
    }

    Ok(UserMessage {
        header,
        iv: iv.to_vec(),
        data: plaintext,
        digest,
    })
}
