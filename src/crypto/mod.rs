//! Crypto layer.
//!
//! - [`CipherKey`]: XChaCha20-Poly1305 or AES-256-GCM over whole frames
//! - [`PresharedKey`] and [`Keypair`]: key material, zeroized on drop
//! - [`KeyExchange`]: X25519 agreement and data key rotation
//! - [`ReplayCache`]: duplicate frame detection

mod aead;
mod keys;
mod kx;
mod replay;

pub use aead::{CipherKey, CipherSuite};
pub use keys::{Keypair, PresharedKey};
pub use kx::{derive_data_key, KeyExchange, KeySlot, KxEvent};
pub use replay::ReplayCache;
