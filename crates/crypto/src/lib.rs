//! Cryptographic primitives for the VitalGuard device trust stack.
//!
//! # Core Capabilities
//!
//! - **Key Management**: Argon2id-derived datastore key with a persisted
//!   per-device salt, erased on shutdown
//! - **Sealing**: ChaCha20-Poly1305 protection of certificate material and
//!   credentials at rest
//! - **Device Signatures**: Ed25519 key pairs for client authentication and
//!   telemetry batch signing
//!
//! # Security Principles
//!
//! - Never roll custom cryptographic primitives
//! - Secrets must never be logged or hardcoded
//! - BLAKE3 for every integrity digest

pub mod keys;
pub mod sealed;
pub mod signing;

pub use keys::{
    DatastoreKey, EnvSecret, KdfParams, KeyError, KeyManager, SecretSource, StaticSecret,
};
pub use sealed::{SealError, Sealer};
pub use signing::{digest, key_id, verify_signature, DeviceKeyPair, SigningError};
