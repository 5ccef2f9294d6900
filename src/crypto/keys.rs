//! Key material.
//!
//! Secrets are zeroized on drop.

use rand::{rngs::OsRng, RngCore};
use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

use crate::core::{ConfigError, KEY_SIZE, PUBLIC_KEY_SIZE};

/// The 32-byte pre-shared key both peers are configured with.
///
/// It authenticates control messages and salts every derived data key.
pub struct PresharedKey {
    key: [u8; KEY_SIZE],
}

impl PresharedKey {
    /// Generate a random key.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        Self { key }
    }

    /// Take a key from caller-supplied bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ConfigError> {
        let key: [u8; KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| ConfigError::InvalidKeyLength(bytes.len()))?;
        Ok(Self { key })
    }

    /// Get the raw key bytes.
    ///
    /// # Security
    /// Handle with care - this exposes sensitive key material.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }

    /// Copy the key out in a buffer that wipes itself on drop.
    pub fn to_zeroizing(&self) -> Zeroizing<[u8; KEY_SIZE]> {
        Zeroizing::new(self.key)
    }
}

impl Drop for PresharedKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl std::fmt::Debug for PresharedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PresharedKey(..)")
    }
}

/// An X25519 keypair advertised in control messages.
pub struct Keypair {
    secret: StaticSecret,
    public: [u8; PUBLIC_KEY_SIZE],
}

impl Keypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret).to_bytes();
        Self { secret, public }
    }

    /// Get the public key.
    pub fn public_key(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.public
    }

    /// Compute the shared secret with a peer public key.
    ///
    /// Returns `None` if the peer key is a low-order point, in which case the
    /// result would not depend on our secret.
    pub fn diffie_hellman(&self, remote: &[u8; PUBLIC_KEY_SIZE]) -> Option<SharedSecret> {
        let shared = self.secret.diffie_hellman(&PublicKey::from(*remote));
        shared.was_contributory().then_some(shared)
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}
