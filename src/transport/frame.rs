//! Frame header encoding and decoding.
//!
//! Every datagram starts with a cleartext 24-byte header that doubles as AEAD
//! nonce and AAD:
//!
//! ```text
//! +--------+--------------------+-------------------+
//! | Kind   | Timestamp (LE48)   | Salt              |
//! | 1 byte | 6 bytes, µs        | 17 bytes, random  |
//! +--------+--------------------+-------------------+
//! ```
//!
//! The body is AEAD ciphertext followed by a 16-byte tag.

use crate::core::{
    FrameError, FRAME_HEADER_SIZE, FRAME_KIND_DATA, FRAME_KIND_MESSAGE, MIN_FRAME_SIZE, SALT_SIZE,
    TIMESTAMP_SIZE,
};

/// Largest timestamp the header can carry.
pub const TIMESTAMP_MASK: u64 = (1 << (8 * TIMESTAMP_SIZE)) - 1;

/// Frame kind identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// Application payload sealed with the data key.
    Data = FRAME_KIND_DATA,
    /// Control message sealed with the pre-shared key.
    Message = FRAME_KIND_MESSAGE,
}

impl FrameKind {
    /// Parse a kind from a byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            FRAME_KIND_DATA => Some(Self::Data),
            FRAME_KIND_MESSAGE => Some(Self::Message),
            _ => None,
        }
    }

    /// Convert to the wire byte.
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Cleartext frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Frame kind.
    pub kind: FrameKind,
    /// Sender wall clock in microseconds, truncated to 48 bits.
    pub timestamp: u64,
    /// Random bytes making the header unique.
    pub salt: [u8; SALT_SIZE],
}

impl FrameHeader {
    /// Create a header.
    pub fn new(kind: FrameKind, timestamp: u64, salt: [u8; SALT_SIZE]) -> Self {
        Self {
            kind,
            timestamp: timestamp & TIMESTAMP_MASK,
            salt,
        }
    }

    /// Serialize to bytes.
    pub fn to_bytes(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        buf[0] = self.kind.as_byte();
        buf[1..1 + TIMESTAMP_SIZE].copy_from_slice(&self.timestamp.to_le_bytes()[..TIMESTAMP_SIZE]);
        buf[1 + TIMESTAMP_SIZE..].copy_from_slice(&self.salt);
        buf
    }

    /// Parse the header of a datagram.
    ///
    /// The datagram must be long enough to also hold a tag.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < MIN_FRAME_SIZE {
            return Err(FrameError::TooShort {
                expected: MIN_FRAME_SIZE,
                actual: bytes.len(),
            });
        }

        let kind = FrameKind::from_byte(bytes[0]).ok_or(FrameError::InvalidKind(bytes[0]))?;

        let mut ts = [0u8; 8];
        ts[..TIMESTAMP_SIZE].copy_from_slice(&bytes[1..1 + TIMESTAMP_SIZE]);

        let mut salt = [0u8; SALT_SIZE];
        salt.copy_from_slice(&bytes[1 + TIMESTAMP_SIZE..FRAME_HEADER_SIZE]);

        Ok(Self {
            kind,
            timestamp: u64::from_le_bytes(ts),
            salt,
        })
    }

    /// Absolute difference to a local time, modulo the 48-bit wrap.
    pub fn time_diff(&self, now: u64) -> u64 {
        let now = now & TIMESTAMP_MASK;
        let d = now.wrapping_sub(self.timestamp) & TIMESTAMP_MASK;
        d.min(TIMESTAMP_MASK + 1 - d)
    }

    /// The timestamp placed on the local 64-bit clock nearest to `now`.
    pub fn sent_at(&self, now: u64) -> u64 {
        let d = (now & TIMESTAMP_MASK).wrapping_sub(self.timestamp) & TIMESTAMP_MASK;
        if d <= TIMESTAMP_MASK / 2 {
            now.saturating_sub(d)
        } else {
            now.saturating_add(TIMESTAMP_MASK + 1 - d)
        }
    }
}
