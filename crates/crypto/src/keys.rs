//! Datastore key management.
//!
//! The datastore key protects certificate material and credentials at rest.
//! It is derived with Argon2id from a device secret and a per-device random
//! salt. Only the salt is persisted; the key lives in memory for the process
//! lifetime and is wiped by [`KeyManager::shutdown`].

use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, info, warn};
use vitalguard_core::config::KeyConfig;
use vitalguard_core::{Classify, ErrorClass};
use zeroize::Zeroizing;

/// Derived key length (256-bit ChaCha20-Poly1305 key).
pub const KEY_LEN: usize = 32;

/// Persisted salt length.
pub const SALT_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("Key store IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Salt file {path:?} is corrupt ({len} bytes, expected 16)")]
    CorruptSalt { path: PathBuf, len: usize },

    #[error("Key derivation failed: {0}")]
    Derivation(String),

    #[error("Entropy source unavailable: {0}")]
    Entropy(String),

    #[error("Device secret unavailable: {0}")]
    SecretUnavailable(String),

    #[error("Datastore key has been erased")]
    Erased,

    #[error("Key manager lock poisoned")]
    LockPoisoned,
}

impl Classify for KeyError {
    fn class(&self) -> ErrorClass {
        ErrorClass::Fatal
    }
}

/// Argon2id work factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub iterations: u32,
    pub memory_kib: u32,
    pub lanes: u32,
}

impl From<&KeyConfig> for KdfParams {
    fn from(config: &KeyConfig) -> Self {
        Self {
            iterations: config.iterations,
            memory_kib: config.memory_kib,
            lanes: config.lanes,
        }
    }
}

/// Where the device secret comes from.
pub trait SecretSource: Send + Sync {
    fn secret(&self) -> Result<Zeroizing<Vec<u8>>, KeyError>;
}

/// Reads the device secret from an environment variable.
#[derive(Debug, Clone)]
pub struct EnvSecret {
    var: String,
}

impl EnvSecret {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl SecretSource for EnvSecret {
    fn secret(&self) -> Result<Zeroizing<Vec<u8>>, KeyError> {
        match std::env::var(&self.var) {
            Ok(value) if !value.is_empty() => Ok(Zeroizing::new(value.into_bytes())),
            _ => Err(KeyError::SecretUnavailable(format!(
                "environment variable {} is not set",
                self.var
            ))),
        }
    }
}

/// A secret supplied directly (provisioning tools, simulation, tests).
pub struct StaticSecret(Zeroizing<Vec<u8>>);

impl StaticSecret {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self(Zeroizing::new(secret.into()))
    }
}

impl SecretSource for StaticSecret {
    fn secret(&self) -> Result<Zeroizing<Vec<u8>>, KeyError> {
        Ok(self.0.clone())
    }
}

/// The in-memory datastore key.
///
/// Shared by every store that seals data. [`DatastoreKey::erase`] wipes the
/// bytes in place, so outstanding handles stop working instead of keeping a
/// copy alive.
pub struct DatastoreKey {
    bytes: RwLock<Option<Zeroizing<[u8; KEY_LEN]>>>,
}

impl DatastoreKey {
    fn new(bytes: Zeroizing<[u8; KEY_LEN]>) -> Self {
        Self {
            bytes: RwLock::new(Some(bytes)),
        }
    }

    /// Build a key from raw bytes (tests, simulation).
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self::new(Zeroizing::new(bytes))
    }

    /// Run `f` with the key bytes.
    pub fn with_bytes<T>(&self, f: impl FnOnce(&[u8; KEY_LEN]) -> T) -> Result<T, KeyError> {
        let guard = self.bytes.read().map_err(|_| KeyError::LockPoisoned)?;
        match guard.as_ref() {
            Some(bytes) => Ok(f(bytes)),
            None => Err(KeyError::Erased),
        }
    }

    /// Zeroize the key bytes.
    pub fn erase(&self) {
        match self.bytes.write() {
            Ok(mut guard) => {
                guard.take();
            }
            Err(poisoned) => {
                poisoned.into_inner().take();
            }
        }
    }

    pub fn is_erased(&self) -> bool {
        self.bytes.read().map(|g| g.is_none()).unwrap_or(true)
    }
}

impl fmt::Debug for DatastoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DatastoreKey(<redacted>)")
    }
}

/// Derive a key from `secret` and `salt` with Argon2id.
pub fn derive_with_salt(
    secret: &[u8],
    salt: &[u8],
    params: &KdfParams,
) -> Result<DatastoreKey, KeyError> {
    if secret.is_empty() {
        return Err(KeyError::Derivation("device secret is empty".to_string()));
    }

    let argon_params = Params::new(params.memory_kib, params.iterations, params.lanes, Some(KEY_LEN))
        .map_err(|e| KeyError::Derivation(e.to_string()))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);

    let mut out = Zeroizing::new([0u8; KEY_LEN]);
    argon2
        .hash_password_into(secret, salt, &mut out[..])
        .map_err(|e| KeyError::Derivation(e.to_string()))?;

    Ok(DatastoreKey::new(out))
}

/// Owns the datastore key for the lifetime of the process.
pub struct KeyManager {
    salt_path: PathBuf,
    params: KdfParams,
    source: Box<dyn SecretSource>,
    key: Mutex<Option<Arc<DatastoreKey>>>,
    salt_created: AtomicBool,
}

impl KeyManager {
    pub fn new(
        salt_path: impl Into<PathBuf>,
        params: KdfParams,
        source: Box<dyn SecretSource>,
    ) -> Self {
        Self {
            salt_path: salt_path.into(),
            params,
            source,
            key: Mutex::new(None),
            salt_created: AtomicBool::new(false),
        }
    }

    /// Derive a key from an explicit secret using this device's salt.
    pub fn derive_key(&self, secret: &[u8]) -> Result<DatastoreKey, KeyError> {
        let salt = self.load_or_create_salt()?;
        derive_with_salt(secret, &salt[..], &self.params)
    }

    /// Return the process-wide key, deriving it on first use.
    pub fn get_or_create_key(&self) -> Result<Arc<DatastoreKey>, KeyError> {
        let mut slot = self.key.lock().map_err(|_| KeyError::LockPoisoned)?;
        if let Some(key) = slot.as_ref() {
            return Ok(key.clone());
        }

        let secret = self.source.secret()?;
        let key = Arc::new(self.derive_key(&secret)?);
        info!(salt_path = %self.salt_path.display(), "Datastore key derived");
        *slot = Some(key.clone());
        Ok(key)
    }

    /// Whether this process generated the salt (first boot of the device).
    pub fn created_new_salt(&self) -> bool {
        self.salt_created.load(Ordering::SeqCst)
    }

    /// Erase the key. Every handle obtained earlier stops working.
    pub fn shutdown(&self) {
        let key = match self.key.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(key) = key {
            key.erase();
            info!("Datastore key erased");
        }
    }

    fn load_or_create_salt(&self) -> Result<Zeroizing<[u8; SALT_LEN]>, KeyError> {
        if self.salt_path.exists() {
            return read_salt(&self.salt_path);
        }

        let mut salt = Zeroizing::new([0u8; SALT_LEN]);
        getrandom::getrandom(&mut salt[..]).map_err(|e| KeyError::Entropy(e.to_string()))?;

        if let Some(parent) = self.salt_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.salt_path, &salt[..])?;
        self.salt_created.store(true, Ordering::SeqCst);
        debug!(path = %self.salt_path.display(), "Generated device salt");
        Ok(salt)
    }
}

impl Drop for KeyManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn read_salt(path: &Path) -> Result<Zeroizing<[u8; SALT_LEN]>, KeyError> {
    let bytes = std::fs::read(path)?;
    if bytes.len() != SALT_LEN {
        warn!(path = %path.display(), len = bytes.len(), "Salt file has unexpected length");
        return Err(KeyError::CorruptSalt {
            path: path.to_path_buf(),
            len: bytes.len(),
        });
    }
    let mut salt = Zeroizing::new([0u8; SALT_LEN]);
    salt.copy_from_slice(&bytes);
    Ok(salt)
}
