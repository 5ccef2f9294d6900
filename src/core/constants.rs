//! Protocol constants for mptun.
//!
//! Wire sizes are fixed by the frame format and MUST NOT be changed without
//! breaking compatibility with existing peers. Tuning constants (rates,
//! windows, timeouts) are local policy.

use std::time::Duration;

// =============================================================================
// PATH TABLE
// =============================================================================

/// Number of path slots owned by a tunnel.
pub const PATH_MAX: usize = 32;

/// Longest interface name accepted (`IFNAMSIZ` minus the terminating NUL).
pub const INTERFACE_NAME_MAX: usize = 15;

// =============================================================================
// CRYPTOGRAPHIC CONSTANTS
// =============================================================================

/// Symmetric key size for every supported AEAD suite.
pub const KEY_SIZE: usize = 32;

/// X25519 public key size.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// AEAD authentication tag size (Poly1305 and GCM alike).
pub const AEAD_TAG_SIZE: usize = 16;

/// XChaCha20-Poly1305 nonce size.
pub const XCHACHA_NONCE_SIZE: usize = 24;

/// AES-256-GCM nonce size.
pub const GCM_NONCE_SIZE: usize = 12;

// =============================================================================
// FRAME LAYOUT
// =============================================================================

/// Frame kind: encrypted application payload.
pub const FRAME_KIND_DATA: u8 = 0x01;

/// Frame kind: encrypted control message (keepalive, probe, key exchange).
pub const FRAME_KIND_MESSAGE: u8 = 0x02;

/// Timestamp size inside the frame header (48-bit microseconds).
pub const TIMESTAMP_SIZE: usize = 6;

/// Random salt completing the header to a full XChaCha20 nonce.
pub const SALT_SIZE: usize = 17;

/// Cleartext frame header size (kind + timestamp + salt).
pub const FRAME_HEADER_SIZE: usize = 1 + TIMESTAMP_SIZE + SALT_SIZE;

/// Bytes added to every payload on the wire.
pub const FRAME_OVERHEAD: usize = FRAME_HEADER_SIZE + AEAD_TAG_SIZE;

/// Smallest datagram that can possibly authenticate.
pub const MIN_FRAME_SIZE: usize = FRAME_OVERHEAD;

/// Largest datagram the tunnel ever reads.
pub const MAX_DATAGRAM_SIZE: usize = 65535;

// =============================================================================
// MTU DISCOVERY (UDP payload sizes)
// =============================================================================

/// Guaranteed frame size: IPv6 minimum link MTU (1280) minus IPv6 + UDP headers.
pub const MTU_MIN: usize = 1232;

/// Largest probed frame size toward IPv4 remotes (1500 - 20 - 8).
pub const MTU_MAX_V4: usize = 1472;

/// Largest probed frame size toward IPv6 remotes (1500 - 40 - 8).
pub const MTU_MAX_V6: usize = 1452;

/// Lower bound on the probe timeout.
pub const PROBE_TIMEOUT_MIN: u64 = 200_000;

/// Upper bound on the probe timeout.
pub const PROBE_TIMEOUT_MAX: u64 = 2_000_000;

// =============================================================================
// RATE CONTROL (bytes per second)
// =============================================================================

/// Ceiling used when neither side configures one.
pub const DEFAULT_MAX_RATE: u64 = 1_250_000_000;

/// Starting rate for auto-discovered paths.
pub const INITIAL_RATE: u64 = 1_250_000;

/// Floor for multiplicative decrease.
pub const MIN_RATE: u64 = 16 * 1024;

/// Minimum additive increase step.
pub const RATE_INCREASE_MIN: u64 = 32 * 1024;

/// Multiplicative decrease factor numerator (over [`RATE_DECREASE_DEN`]).
pub const RATE_DECREASE_NUM: u64 = 7;

/// Multiplicative decrease factor denominator.
pub const RATE_DECREASE_DEN: u64 = 10;

/// Token bucket depth expressed as time at the current rate.
pub const RATE_BURST: u64 = 20_000;

// =============================================================================
// PATH HEALTH
// =============================================================================

/// Samples required before an estimate is trusted.
pub const STAT_SETUP_SAMPLES: u32 = 3;

/// Unanswered requests after which a path stops being `ok`.
pub const MSG_SENT_MAX: u64 = 5;

/// Loss/rate feedback window.
pub const LOSS_WINDOW: u64 = 1_000_000;

/// A path idle longer than this multiple of `keepalive` is demoted to DOWN.
pub const IDLE_KEEPALIVE_FACTOR: u64 = 2;

/// Loss is expressed on a 0..=255 scale.
pub const LOSS_SCALE: u64 = 255;

/// Shortest accepted keepalive beat.
pub const MIN_BEAT: Duration = Duration::from_millis(10);

// =============================================================================
// DEFAULTS
// =============================================================================

/// Default tunnel keepalive interval.
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(25);

/// Default accepted clock skew between peers.
pub const DEFAULT_TIME_TOLERANCE: Duration = Duration::from_secs(600);

/// Default key-exchange renewal period.
pub const DEFAULT_KX_TIMEOUT: Duration = Duration::from_secs(3600);

/// Default per-path message interval.
pub const DEFAULT_BEAT: Duration = Duration::from_millis(100);

/// Default loss limit (no limit).
pub const DEFAULT_LOSS_LIMIT: u8 = 255;

/// Default RTT limit.
pub const DEFAULT_RTT_LIMIT: Duration = Duration::from_secs(5);

// =============================================================================
// ABUSE ACCOUNTING
// =============================================================================

/// Offenses older than this no longer accumulate; records are pruned.
pub const BAD_WINDOW: u64 = 60_000_000;

/// Maximum number of origins tracked at once.
pub const BAD_MAX_ORIGINS: usize = 1024;

/// Recently accepted nonces remembered for duplicate detection.
pub const REPLAY_CACHE_SIZE: usize = 4096;
