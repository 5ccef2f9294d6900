//! Error types for mptun.

use std::io;

use thiserror::Error;

use super::constants::KEY_SIZE;

/// Configuration errors.
///
/// Every setter that can fail validates the whole value first, so returning
/// one of these guarantees nothing was changed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Key material has the wrong length.
    #[error("invalid key length: expected {KEY_SIZE} bytes, got {0}")]
    InvalidKeyLength(usize),

    /// Interface name is too long or contains a NUL byte.
    #[error("invalid interface name: {0:?}")]
    InvalidInterface(String),

    /// No path uses the interface and no peer is registered to create one.
    #[error("unknown interface: {0:?}")]
    UnknownInterface(String),

    /// Keepalive beat below the accepted minimum.
    #[error("beat must be at least {min_ms} ms, got {actual_ms} ms")]
    InvalidBeat {
        /// Minimum accepted beat.
        min_ms: u64,
        /// Requested beat.
        actual_ms: u64,
    },

    /// RTT limit must be strictly positive.
    #[error("rtt limit must be positive")]
    InvalidRttLimit,

    /// A fixed rate needs an explicit transmit ceiling.
    #[error("fixed rate requires a non-zero tx_max_rate")]
    FixedRateWithoutLimit,

    /// The requested path state cannot be set explicitly.
    #[error("state {0} cannot be requested")]
    InvalidState(&'static str),

    /// A tunnel-wide timeout is zero or out of range.
    #[error("invalid {name}: {reason}")]
    InvalidTimeout {
        /// Name of the offending field.
        name: &'static str,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// The path state machine does not allow this transition.
    #[error("illegal path transition {from} -> {to}")]
    IllegalTransition {
        /// Current state.
        from: &'static str,
        /// Requested state.
        to: &'static str,
    },
}

/// Errors in the crypto layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// AEAD encryption failed.
    #[error("AEAD encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (invalid tag or corrupted).
    #[error("AEAD decryption failed (invalid tag or corrupted)")]
    DecryptionFailed,

    /// Key material rejected by the cipher.
    #[error("invalid key material")]
    InvalidKey,

    /// Key exchange produced a non-contributory secret.
    #[error("key exchange failed: {0}")]
    KeyExchangeFailed(&'static str),
}

/// Frame header parsing errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Frame is too short.
    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Minimum expected size.
        expected: usize,
        /// Actual size received.
        actual: usize,
    },

    /// Unknown frame kind.
    #[error("invalid frame kind: 0x{0:02x}")]
    InvalidKind(u8),
}

/// Top-level tunnel errors.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Crypto error.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Frame error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// I/O error from the transport.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// No path is currently eligible to carry payload.
    #[error("no usable path")]
    NoUsablePath,

    /// Every eligible path is out of send budget.
    #[error("rate limited: retry after {retry_after_us} us")]
    RateLimited {
        /// Earliest time, in microseconds from now, a path can take the frame.
        retry_after_us: u64,
    },

    /// Payload does not fit the MTU of any eligible path.
    #[error("payload too large: {size} bytes, mtu {mtu}")]
    PayloadTooLarge {
        /// Payload size.
        size: usize,
        /// Largest payload currently accepted.
        mtu: usize,
    },

    /// All path slots are in use.
    #[error("path table full")]
    PathTableFull,
}

impl TunnelError {
    /// Check if the caller's event loop should simply retry later.
    pub fn is_retryable(&self) -> bool {
        match self {
            TunnelError::RateLimited { .. } | TunnelError::NoUsablePath => true,
            TunnelError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// Check if this error was raised by argument validation.
    pub fn is_config_error(&self) -> bool {
        matches!(self, TunnelError::Config(_) | TunnelError::PathTableFull)
    }
}

/// Result type for tunnel operations.
pub type TunnelResult<T> = Result<T, TunnelError>;
