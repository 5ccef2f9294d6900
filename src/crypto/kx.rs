//! Data key agreement and rotation.
//!
//! Each side advertises an X25519 public key in every control message,
//! together with the last peer key it saw. A new peer key yields a fresh
//! data key:
//!
//! ```text
//! key = HKDF-SHA256(
//!     salt = pre-shared key,
//!     ikm  = X25519(our secret, peer public),
//!     info = "mptun v1 data" || suite || min(pub) || max(pub),
//! )
//! ```
//!
//! Three data keys are kept: `current` seals outgoing frames, `next` waits
//! for confirmation, `last` keeps frames sealed just before a switch
//! readable.

use hkdf::Hkdf;
use sha2::Sha256;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use super::aead::{CipherKey, CipherSuite};
use super::keys::{Keypair, PresharedKey};
use crate::core::{CryptoError, KEY_SIZE, PUBLIC_KEY_SIZE};

const DATA_KEY_INFO: &[u8] = b"mptun v1 data";

/// Which data key authenticated a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySlot {
    /// The key in use.
    Current,
    /// The pending key; it is now current.
    Next,
    /// The previous key.
    Last,
}

/// Result of looking at the keys carried by a peer message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KxEvent {
    /// Nothing new.
    Unchanged,
    /// A new key was derived and awaits confirmation.
    Derived,
    /// The pending key became current.
    Promoted,
}

/// Derive the data key for a suite from a shared secret.
pub fn derive_data_key(
    psk: &PresharedKey,
    shared: &[u8; 32],
    suite: CipherSuite,
    ours: &[u8; PUBLIC_KEY_SIZE],
    theirs: &[u8; PUBLIC_KEY_SIZE],
) -> Result<CipherKey, CryptoError> {
    let (lo, hi) = if ours <= theirs { (ours, theirs) } else { (theirs, ours) };

    let mut info = Vec::with_capacity(DATA_KEY_INFO.len() + 1 + 2 * PUBLIC_KEY_SIZE);
    info.extend_from_slice(DATA_KEY_INFO);
    info.push(suite.id());
    info.extend_from_slice(lo);
    info.extend_from_slice(hi);

    let hk = Hkdf::<Sha256>::new(Some(&psk.as_bytes()[..]), shared);
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    hk.expand(&info, &mut key[..])
        .map_err(|_| CryptoError::KeyExchangeFailed("key derivation"))?;

    CipherKey::new(suite, &key)
}

/// Key exchange state.
#[derive(Debug)]
pub struct KeyExchange {
    keypair: Keypair,
    remote: Option<[u8; PUBLIC_KEY_SIZE]>,
    current: CipherKey,
    next: Option<CipherKey>,
    last: Option<CipherKey>,
    /// Suite of `next`, or of `current` once promoted.
    derived_suite: Option<CipherSuite>,
    /// Whether `current` came out of an exchange.
    established: bool,
    /// When the keypair was generated.
    created: u64,
}

impl KeyExchange {
    /// Start with a fresh keypair and the bootstrap data key.
    pub fn new(psk: &PresharedKey, now: u64) -> Result<Self, CryptoError> {
        Ok(Self {
            keypair: Keypair::generate(),
            remote: None,
            current: Self::bootstrap(psk)?,
            next: None,
            last: None,
            derived_suite: None,
            established: false,
            created: now,
        })
    }

    /// Key used before any exchange completed.
    fn bootstrap(psk: &PresharedKey) -> Result<CipherKey, CryptoError> {
        CipherKey::new(CipherSuite::XChaCha20Poly1305, psk.as_bytes())
    }

    /// Forget every data key and start over, e.g. after the pre-shared key changed.
    pub fn reset(&mut self, psk: &PresharedKey, now: u64) -> Result<(), CryptoError> {
        *self = Self::new(psk, now)?;
        debug!("key exchange reset");
        Ok(())
    }

    /// Our public key.
    pub fn public_key(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        self.keypair.public_key()
    }

    /// Last peer public key seen, all zeros if none.
    pub fn remote_public_key(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.remote.unwrap_or([0u8; PUBLIC_KEY_SIZE])
    }

    /// Check whether data is sealed with an exchanged key.
    pub fn is_established(&self) -> bool {
        self.established
    }

    /// Suite of the key sealing outgoing data.
    pub fn suite(&self) -> CipherSuite {
        self.current.suite()
    }

    /// Key sealing outgoing data.
    pub fn current(&self) -> &CipherKey {
        &self.current
    }

    /// Check whether the keypair is older than `timeout`.
    pub fn needs_rotation(&self, now: u64, timeout: u64) -> bool {
        now.saturating_sub(self.created) >= timeout
    }

    fn derive(
        &mut self,
        psk: &PresharedKey,
        remote: &[u8; PUBLIC_KEY_SIZE],
        suite: CipherSuite,
    ) -> Result<(), CryptoError> {
        let shared = self
            .keypair
            .diffie_hellman(remote)
            .ok_or(CryptoError::KeyExchangeFailed("non-contributory shared secret"))?;
        let key = derive_data_key(psk, shared.as_bytes(), suite, self.keypair.public_key(), remote)?;
        self.next = Some(key);
        self.derived_suite = Some(suite);
        Ok(())
    }

    fn promote(&mut self) {
        if let Some(next) = self.next.take() {
            self.last = Some(std::mem::replace(&mut self.current, next));
            self.established = true;
            debug!(suite = ?self.current.suite(), "data key promoted");
        }
    }

    /// Process the keys carried by an authenticated peer message.
    ///
    /// `echoed` is the peer's view of our public key. A non-contributory
    /// peer key is an error and leaves the state unchanged.
    pub fn on_peer_keys(
        &mut self,
        psk: &PresharedKey,
        peer: &[u8; PUBLIC_KEY_SIZE],
        echoed: &[u8; PUBLIC_KEY_SIZE],
        suite: CipherSuite,
    ) -> Result<KxEvent, CryptoError> {
        let mut event = KxEvent::Unchanged;

        if self.remote.as_ref() != Some(peer) || self.derived_suite != Some(suite) {
            if let Err(e) = self.derive(psk, peer, suite) {
                warn!(error = %e, "key exchange failed");
                return Err(e);
            }
            self.remote = Some(*peer);
            event = KxEvent::Derived;
        }

        if echoed == self.keypair.public_key() && self.next.is_some() {
            self.promote();
            event = KxEvent::Promoted;
        }
        Ok(event)
    }

    /// Generate a new keypair, deriving the matching key if the peer is known.
    pub fn rotate(&mut self, psk: &PresharedKey, now: u64) -> Result<(), CryptoError> {
        self.keypair = Keypair::generate();
        self.created = now;
        debug!("keypair rotated");

        match (self.remote, self.derived_suite) {
            (Some(remote), Some(suite)) => self.derive(psk, &remote, suite),
            _ => Ok(()),
        }
    }

    /// Open a data frame with whichever key fits.
    ///
    /// A frame opened with the pending key confirms it.
    pub fn open(&mut self, frame: &[u8], out: &mut Vec<u8>) -> Result<KeySlot, CryptoError> {
        if self.current.open(frame, out).is_ok() {
            return Ok(KeySlot::Current);
        }
        if let Some(next) = &self.next {
            if next.open(frame, out).is_ok() {
                self.promote();
                return Ok(KeySlot::Next);
            }
        }
        if let Some(last) = &self.last {
            if last.open(frame, out).is_ok() {
                return Ok(KeySlot::Last);
            }
        }
        Err(CryptoError::DecryptionFailed)
    }
}
