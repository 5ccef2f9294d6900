//! mptun - Tunnel
//!
//! - **Tunnel**: [`Tunnel`], the path set manager driving every path to one peer
//! - **Control messages**: [`Message`], keepalive, feedback and key exchange codec
//! - **Abuse accounting**: [`BadTracker`], per-origin offense counters
//!
//! ## Receive pipeline
//!
//! ```text
//! datagram ─► header ─► AEAD open ─► time window ─► replay ─► dispatch
//!               │           │             │            │
//!               └─ decrypt ─┘          difftime ───────┘    (bad traffic)
//! ```

mod bad;
mod message;
#[allow(clippy::module_inception)]
mod tunnel;

pub use bad::{BadCounter, BadKind, BadRecord, BadTracker};
pub use message::{Message, MESSAGE_SIZE};
pub use tunnel::Tunnel;
