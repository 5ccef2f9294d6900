//! Frame encryption.
//!
//! Every frame is sealed with its cleartext 24-byte header serving both as
//! nonce and as AAD:
//!
//! ```text
//! [ header (24) | ciphertext | tag (16) ]
//! ```
//!
//! XChaCha20-Poly1305 uses the whole header as its nonce; AES-256-GCM uses
//! the first 12 bytes (kind, timestamp, and 5 salt bytes).

use chacha20poly1305::{
    aead::{AeadInPlace, KeyInit},
    Tag, XChaCha20Poly1305, XNonce,
};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use serde::{Deserialize, Serialize};

use crate::core::{CryptoError, AEAD_TAG_SIZE, FRAME_HEADER_SIZE, FRAME_OVERHEAD, GCM_NONCE_SIZE, KEY_SIZE};

/// AEAD construction used for a key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CipherSuite {
    /// XChaCha20-Poly1305, always available.
    #[default]
    XChaCha20Poly1305,
    /// AES-256-GCM, used only when both peers announce it.
    Aes256Gcm,
}

impl CipherSuite {
    /// Identifier mixed into key derivation.
    pub fn id(self) -> u8 {
        match self {
            CipherSuite::XChaCha20Poly1305 => 1,
            CipherSuite::Aes256Gcm => 2,
        }
    }

    /// Suite both peers can use.
    pub fn negotiate(local_aes: bool, peer_aes: bool) -> Self {
        if local_aes && peer_aes {
            CipherSuite::Aes256Gcm
        } else {
            CipherSuite::XChaCha20Poly1305
        }
    }
}

enum Cipher {
    XChaCha(Box<XChaCha20Poly1305>),
    Aes(Box<LessSafeKey>),
}

/// A keyed AEAD instance.
pub struct CipherKey {
    suite: CipherSuite,
    cipher: Cipher,
}

impl std::fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherKey")
            .field("suite", &self.suite)
            .finish_non_exhaustive()
    }
}

impl CipherKey {
    /// Key a cipher.
    pub fn new(suite: CipherSuite, key: &[u8; KEY_SIZE]) -> Result<Self, CryptoError> {
        let cipher = match suite {
            CipherSuite::XChaCha20Poly1305 => {
                Cipher::XChaCha(Box::new(XChaCha20Poly1305::new(key.into())))
            }
            CipherSuite::Aes256Gcm => {
                let unbound =
                    UnboundKey::new(&AES_256_GCM, key).map_err(|_| CryptoError::InvalidKey)?;
                Cipher::Aes(Box::new(LessSafeKey::new(unbound)))
            }
        };
        Ok(Self { suite, cipher })
    }

    /// Suite of this key.
    pub fn suite(&self) -> CipherSuite {
        self.suite
    }

    /// Encrypt a frame in place.
    ///
    /// `frame` holds the header followed by the plaintext; on return it holds
    /// the header, the ciphertext and the tag.
    pub fn seal(&self, frame: &mut Vec<u8>) -> Result<(), CryptoError> {
        if frame.len() < FRAME_HEADER_SIZE {
            return Err(CryptoError::EncryptionFailed);
        }

        let mut header = [0u8; FRAME_HEADER_SIZE];
        header.copy_from_slice(&frame[..FRAME_HEADER_SIZE]);
        let body = &mut frame[FRAME_HEADER_SIZE..];

        match &self.cipher {
            Cipher::XChaCha(cipher) => {
                let tag = cipher
                    .encrypt_in_place_detached(XNonce::from_slice(&header), &header, body)
                    .map_err(|_| CryptoError::EncryptionFailed)?;
                frame.extend_from_slice(&tag);
            }
            Cipher::Aes(key) => {
                let nonce = gcm_nonce(&header).map_err(|_| CryptoError::EncryptionFailed)?;
                let tag = key
                    .seal_in_place_separate_tag(nonce, Aad::from(&header), body)
                    .map_err(|_| CryptoError::EncryptionFailed)?;
                frame.extend_from_slice(tag.as_ref());
            }
        }
        Ok(())
    }

    /// Authenticate and decrypt a frame into `out`.
    ///
    /// `frame` is left untouched so the caller can retry with another key.
    pub fn open(&self, frame: &[u8], out: &mut Vec<u8>) -> Result<(), CryptoError> {
        if frame.len() < FRAME_OVERHEAD {
            return Err(CryptoError::DecryptionFailed);
        }

        let mut header = [0u8; FRAME_HEADER_SIZE];
        header.copy_from_slice(&frame[..FRAME_HEADER_SIZE]);
        let split = frame.len() - AEAD_TAG_SIZE;

        out.clear();
        out.extend_from_slice(&frame[FRAME_HEADER_SIZE..split]);

        let result = match &self.cipher {
            Cipher::XChaCha(cipher) => cipher
                .decrypt_in_place_detached(
                    XNonce::from_slice(&header),
                    &header,
                    out.as_mut_slice(),
                    Tag::from_slice(&frame[split..]),
                )
                .map_err(|_| CryptoError::DecryptionFailed),
            Cipher::Aes(key) => {
                out.extend_from_slice(&frame[split..]);
                match gcm_nonce(&header) {
                    Ok(nonce) => match key.open_in_place(nonce, Aad::from(&header), out.as_mut_slice()) {
                        Ok(plain) => {
                            let len = plain.len();
                            out.truncate(len);
                            Ok(())
                        }
                        Err(_) => Err(CryptoError::DecryptionFailed),
                    },
                    Err(e) => Err(e),
                }
            }
        };

        if result.is_err() {
            out.clear();
        }
        result
    }
}

fn gcm_nonce(header: &[u8; FRAME_HEADER_SIZE]) -> Result<Nonce, CryptoError> {
    Nonce::try_assume_unique_for_key(&header[..GCM_NONCE_SIZE]).map_err(|_| CryptoError::InvalidKey)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(header_byte: u8, payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![header_byte; FRAME_HEADER_SIZE];
        frame.extend_from_slice(payload);
        frame
    }

    #[test]
    fn test_seal_open_both_suites() {
        for suite in [CipherSuite::XChaCha20Poly1305, CipherSuite::Aes256Gcm] {
            let key = CipherKey::new(suite, &[7u8; KEY_SIZE]).unwrap();
            let mut sealed = frame(0x01, b"hello, multipath");
            key.seal(&mut sealed).unwrap();

            assert_eq!(sealed.len(), FRAME_OVERHEAD + 16);
            assert_eq!(&sealed[..FRAME_HEADER_SIZE], &[0x01; FRAME_HEADER_SIZE]);
            assert_ne!(&sealed[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + 16], b"hello, multipath");

            let mut out = Vec::new();
            key.open(&sealed, &mut out).unwrap();
            assert_eq!(out, b"hello, multipath", "{suite:?}");
        }
    }

    #[test]
    fn test_wrong_key_fails() {
        let key = CipherKey::new(CipherSuite::XChaCha20Poly1305, &[1u8; KEY_SIZE]).unwrap();
        let other = CipherKey::new(CipherSuite::XChaCha20Poly1305, &[2u8; KEY_SIZE]).unwrap();

        let mut sealed = frame(0x02, b"control");
        key.seal(&mut sealed).unwrap();

        let mut out = Vec::new();
        assert_eq!(other.open(&sealed, &mut out), Err(CryptoError::DecryptionFailed));
        assert!(out.is_empty());
    }

    #[test]
    fn test_suites_do_not_interoperate() {
        let chacha = CipherKey::new(CipherSuite::XChaCha20Poly1305, &[3u8; KEY_SIZE]).unwrap();
        let aes = CipherKey::new(CipherSuite::Aes256Gcm, &[3u8; KEY_SIZE]).unwrap();

        let mut sealed = frame(0x01, b"data");
        chacha.seal(&mut sealed).unwrap();
        assert!(aes.open(&sealed, &mut Vec::new()).is_err());
    }

    #[test]
    fn test_header_is_authenticated() {
        for suite in [CipherSuite::XChaCha20Poly1305, CipherSuite::Aes256Gcm] {
            let key = CipherKey::new(suite, &[9u8; KEY_SIZE]).unwrap();
            let mut sealed = frame(0x01, b"data");
            key.seal(&mut sealed).unwrap();

            // The last salt byte is outside the GCM nonce but still in the AAD.
            sealed[FRAME_HEADER_SIZE - 1] ^= 1;
            assert!(key.open(&sealed, &mut Vec::new()).is_err(), "{suite:?}");
        }
    }

    #[test]
    fn test_short_frame_rejected() {
        let key = CipherKey::new(CipherSuite::XChaCha20Poly1305, &[0u8; KEY_SIZE]).unwrap();
        let mut out = Vec::new();
        assert!(key.open(&[0u8; FRAME_OVERHEAD - 1], &mut out).is_err());
        assert!(key.seal(&mut vec![0u8; 3]).is_err());
    }

    #[test]
    fn test_empty_payload() {
        let key = CipherKey::new(CipherSuite::Aes256Gcm, &[4u8; KEY_SIZE]).unwrap();
        let mut sealed = frame(0x01, b"");
        key.seal(&mut sealed).unwrap();
        assert_eq!(sealed.len(), FRAME_OVERHEAD);

        let mut out = vec![1, 2, 3];
        key.open(&sealed, &mut out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_negotiate() {
        assert_eq!(CipherSuite::negotiate(true, true), CipherSuite::Aes256Gcm);
        assert_eq!(CipherSuite::negotiate(true, false), CipherSuite::XChaCha20Poly1305);
        assert_eq!(CipherSuite::negotiate(false, true), CipherSuite::XChaCha20Poly1305);
    }
}
