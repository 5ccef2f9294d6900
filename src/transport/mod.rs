//! mptun - Transport Layer
//!
//! - **Frame header**: [`FrameHeader`] and [`FrameKind`], the cleartext part of every datagram
//! - **Async UDP**: [`UdpTransport`], the tokio implementation of [`Transport`](crate::core::Transport)
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │            Tunnel                       │
//! ├─────────────────────────────────────────┤
//! │         Crypto Layer                    │
//! ├─────────────────────────────────────────┤
//! │         Transport Layer                 │  ← This module
//! │   frame header, UDP socket              │
//! ├─────────────────────────────────────────┤
//! │              UDP                        │
//! └─────────────────────────────────────────┘
//! ```

mod frame;
#[cfg(feature = "transport")]
#[cfg_attr(docsrs, doc(cfg(feature = "transport")))]
mod socket;

pub use frame::*;
#[cfg(feature = "transport")]
pub use socket::UdpTransport;
