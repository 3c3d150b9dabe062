//! Device signing keys.
//!
//! Each device generates its own Ed25519 key pair at registration and on
//! every ClientAuth rotation. The private half is only ever persisted sealed
//! inside certificate material.
//!
//! # Security Model
//!
//! - Private keys never appear in logs or `Debug` output
//! - Key bytes handed out for sealing are wrapped in [`Zeroizing`]
//! - Verification uses strict Ed25519 checks

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::RngCore;
use std::fmt;
use thiserror::Error;
use vitalguard_core::{Classify, ErrorClass};
use zeroize::{Zeroize, Zeroizing};

pub const PUBLIC_KEY_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = 64;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SigningError {
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Malformed signature: {0}")]
    MalformedSignature(String),

    #[error("Signature verification failed")]
    VerificationFailed,
}

impl Classify for SigningError {
    fn class(&self) -> ErrorClass {
        ErrorClass::Validation
    }
}

/// An Ed25519 key pair owned by this device.
pub struct DeviceKeyPair {
    signing_key: SigningKey,
}

impl DeviceKeyPair {
    /// Generate a fresh key pair from the OS RNG.
    pub fn generate() -> Self {
        let mut secret = Zeroizing::new([0u8; 32]);
        rand::rngs::OsRng.fill_bytes(&mut secret[..]);
        Self {
            signing_key: SigningKey::from_bytes(&secret),
        }
    }

    /// Restore a key pair from its 32-byte secret.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, SigningError> {
        if bytes.len() != 32 {
            return Err(SigningError::InvalidKey(format!(
                "Invalid key length: {} (expected 32)",
                bytes.len()
            )));
        }
        let mut key_array = [0u8; 32];
        key_array.copy_from_slice(bytes);
        let signing_key = SigningKey::from_bytes(&key_array);
        key_array.zeroize();

        Ok(Self { signing_key })
    }

    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing_key.to_bytes())
    }

    pub fn public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Stable identifier derived from the public key.
    pub fn key_id(&self) -> String {
        key_id(&self.public_key())
    }

    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.signing_key.sign(message).to_bytes()
    }
}

impl fmt::Debug for DeviceKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceKeyPair")
            .field("key_id", &self.key_id())
            .finish_non_exhaustive()
    }
}

/// First 16 bytes of the BLAKE3 hash of a public key, hex encoded.
pub fn key_id(public_key: &[u8]) -> String {
    let hash = blake3::hash(public_key);
    hex::encode(&hash.as_bytes()[..16])
}

/// BLAKE3 digest.
pub fn digest(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

pub fn verifying_key(public_key: &[u8]) -> Result<VerifyingKey, SigningError> {
    let bytes: [u8; PUBLIC_KEY_LEN] = public_key.try_into().map_err(|_| {
        SigningError::InvalidKey(format!(
            "public key is {} bytes, expected {}",
            public_key.len(),
            PUBLIC_KEY_LEN
        ))
    })?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| SigningError::InvalidKey(e.to_string()))
}

/// Verify an Ed25519 signature over `message`.
pub fn verify_signature(
    public_key: &[u8],
    message: &[u8],
    signature: &[u8],
) -> Result<(), SigningError> {
    let key = verifying_key(public_key)?;
    let signature = Signature::from_slice(signature)
        .map_err(|e| SigningError::MalformedSignature(e.to_string()))?;
    key.verify_strict(message, &signature)
        .map_err(|_| SigningError::VerificationFailed)
}
