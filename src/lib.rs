//! # mptun
//!
//! **M**ulti**p**ath **tun**nel: one encrypted datagram link over many network paths.
//!
//! mptun carries opaque datagrams between two peers over every path they
//! share (one per local interface and remote address), keeping each path's
//! health, rate and MTU up to date and sending every payload over the best
//! path available at that moment.
//!
//! - **Security**: every datagram is authenticated; data keys come from an
//!   X25519 exchange bound to a pre-shared key
//! - **Multipath**: UP paths carry traffic, preferred BACKUP paths stand in
//!   when every UP path is lossy or laggy
//! - **Per-path control**: RTT estimation, loss feedback, AIMD rate control
//!   and MTU discovery by probing
//! - **Accounting**: origins sending bogus traffic are counted, never trusted
//!
//! ## Feature Flags
//!
//! - `transport` (default): tokio UDP transport
//! - `crypto` (default): XChaCha20-Poly1305 / AES-256-GCM, X25519 key exchange
//!
//! The [`tunnel`] module needs both.
//!
//! ## Modules
//!
//! - [`core`]: Constants, errors, configuration and the [`Transport`](core::Transport) seam
//! - [`path`]: Per-path estimators, state machine and the path table
//! - [`transport`]: Frame header and the UDP transport
//! - [`crypto`]: Ciphers, keys and the key exchange
//! - [`tunnel`]: The tunnel itself
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use mptun::prelude::*;
//!
//! # async fn run() -> TunnelResult<()> {
//! let mut tunnel = Tunnel::bind("0.0.0.0:5000".parse().unwrap()).await?;
//! tunnel.set_key(&[0x42; 32])?;
//! tunnel.peer("192.0.2.1:5000".parse().unwrap());
//! tunnel.set_state(PathPolicy::new(InterfaceName::default(), PathState::Up))?;
//!
//! let mut buf = vec![0u8; 65535];
//! loop {
//!     let tick = Duration::from_millis(10);
//!     if let Ok(received) = tokio::time::timeout(tick, tunnel.recv(&mut buf)).await {
//!         if let Some(len) = received? {
//!             let _payload = &buf[..len];
//!         }
//!     }
//!     tunnel.update().await?;
//! }
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Core module (always included)
pub mod core;

// Path bookkeeping (always included)
pub mod path;

// Transport layer (frame header always, socket feature-gated)
pub mod transport;

// Crypto layer (feature-gated)
#[cfg(feature = "crypto")]
#[cfg_attr(docsrs, doc(cfg(feature = "crypto")))]
pub mod crypto;

// Tunnel (needs both layers)
#[cfg(all(feature = "transport", feature = "crypto"))]
#[cfg_attr(docsrs, doc(cfg(all(feature = "transport", feature = "crypto"))))]
pub mod tunnel;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::core::*;
    pub use crate::path::{Path, PathOrigin, PathState};
    pub use crate::transport::{FrameHeader, FrameKind};

    #[cfg(feature = "transport")]
    pub use crate::transport::UdpTransport;

    #[cfg(feature = "crypto")]
    pub use crate::crypto::CipherSuite;

    #[cfg(all(feature = "transport", feature = "crypto"))]
    pub use crate::tunnel::{BadKind, BadRecord, Tunnel};
}

#[cfg(all(feature = "transport", feature = "crypto"))]
pub use tunnel::Tunnel;
