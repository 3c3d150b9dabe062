//! At-rest sealing with ChaCha20-Poly1305.
//!
//! Sealed layout: `nonce (12 bytes) ∥ ciphertext ∥ tag`. Callers bind the
//! owning row id as associated data so ciphertexts cannot be moved between
//! rows.

use crate::keys::{DatastoreKey, KeyError};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::RngCore;
use std::sync::Arc;
use thiserror::Error;
use vitalguard_core::{Classify, ErrorClass};
use zeroize::Zeroizing;

/// Nonce size for ChaCha20-Poly1305 (96 bits / 12 bytes).
pub const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum SealError {
    #[error(transparent)]
    Key(#[from] KeyError),

    #[error("Encryption failed")]
    Encryption,

    #[error("Sealed data failed authentication")]
    Authentication,

    #[error("Sealed data too short: {0} bytes")]
    Truncated(usize),
}

impl Classify for SealError {
    fn class(&self) -> ErrorClass {
        match self {
            SealError::Key(_) | SealError::Encryption => ErrorClass::Fatal,
            SealError::Authentication | SealError::Truncated(_) => ErrorClass::Integrity,
        }
    }
}

/// Seals and opens blobs under the datastore key.
#[derive(Debug, Clone)]
pub struct Sealer {
    key: Arc<DatastoreKey>,
}

impl Sealer {
    pub fn new(key: Arc<DatastoreKey>) -> Self {
        Self { key }
    }

    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, SealError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);

        let ciphertext = self.key.with_bytes(|key| {
            let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
            cipher.encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
        })?;
        let ciphertext = ciphertext.map_err(|_| SealError::Encryption)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    pub fn open(&self, sealed: &[u8], aad: &[u8]) -> Result<Zeroizing<Vec<u8>>, SealError> {
        if sealed.len() < NONCE_LEN {
            return Err(SealError::Truncated(sealed.len()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);

        let plaintext = self.key.with_bytes(|key| {
            let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
            cipher.decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
        })?;

        plaintext
            .map(Zeroizing::new)
            .map_err(|_| SealError::Authentication)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KEY_LEN;

    fn sealer() -> Sealer {
        Sealer::new(Arc::new(DatastoreKey::from_bytes([7u8; KEY_LEN])))
    }

    #[test]
    fn test_open_recovers_plaintext() {
        let s = sealer();
        let sealed = s.seal(b"certificate material", b"cert-1").unwrap();
        assert_ne!(&sealed[NONCE_LEN..], b"certificate material");
        assert_eq!(&s.open(&sealed, b"cert-1").unwrap()[..], b"certificate material");
    }

    #[test]
    fn test_row_binding_rejects_swapped_ciphertext() {
        let s = sealer();
        let sealed = s.seal(b"token", b"cred-1").unwrap();
        let err = s.open(&sealed, b"cred-2").unwrap_err();
        assert!(matches!(err, SealError::Authentication));
        assert_eq!(err.class(), ErrorClass::Integrity);
    }

    #[test]
    fn test_flipped_bit_fails_authentication() {
        let s = sealer();
        let mut sealed = s.seal(b"token", b"row").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(s.open(&sealed, b"row"), Err(SealError::Authentication)));
        assert!(matches!(s.open(&sealed[..4], b"row"), Err(SealError::Truncated(4))));
    }

    #[test]
    fn test_erased_key_refuses_to_seal() {
        let key = Arc::new(DatastoreKey::from_bytes([1u8; KEY_LEN]));
        let s = Sealer::new(key.clone());
        key.erase();
        assert!(matches!(
            s.seal(b"x", b"row"),
            Err(SealError::Key(KeyError::Erased))
        ));
    }

    #[test]
    fn test_nonces_are_unique_per_seal() {
        let s = sealer();
        let a = s.seal(b"same", b"row").unwrap();
        let b = s.seal(b"same", b"row").unwrap();
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
    }
}
