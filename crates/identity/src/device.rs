//! Device identity and server credentials.
//!
//! The device identity is assigned by the server at registration and never
//! changes afterwards except through explicit reprovisioning. Credentials
//! (auth tokens) are sealed at rest and superseded on every renewal.

use crate::error::{IdentityError, IdentityResult};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{info, warn};
use vitalguard_core::config::DeviceConfig;
use vitalguard_core::TimestampMs;
use vitalguard_crypto::Sealer;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Server-assigned identity of this device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub serial_number: String,
    pub model: String,
    pub firmware_version: String,
    pub registered_at_ms: TimestampMs,
}

/// Hardware metadata presented at registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareInfo {
    pub serial_number: String,
    pub model: String,
    pub firmware_version: String,
}

impl HardwareInfo {
    /// Rejects metadata the server would refuse anyway.
    pub fn validate(&self) -> IdentityResult<()> {
        for (field, value) in [
            ("serial_number", &self.serial_number),
            ("model", &self.model),
            ("firmware_version", &self.firmware_version),
        ] {
            if value.trim().is_empty() {
                return Err(IdentityError::Config(format!("device {} is empty", field)));
            }
        }
        Ok(())
    }
}

impl From<&DeviceConfig> for HardwareInfo {
    fn from(config: &DeviceConfig) -> Self {
        Self {
            serial_number: config.serial_number.clone(),
            model: config.model.clone(),
            firmware_version: config.firmware_version.clone(),
        }
    }
}

/// Server-issued auth token.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Credential {
    pub credential_id: String,
    pub device_id: String,
    pub auth_token: String,
    pub issued_at_ms: TimestampMs,
    pub expires_at_ms: TimestampMs,
}

impl Credential {
    pub fn is_expired(&self, now: TimestampMs) -> bool {
        now >= self.expires_at_ms
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("credential_id", &self.credential_id)
            .field("device_id", &self.device_id)
            .field("issued_at_ms", &self.issued_at_ms)
            .field("expires_at_ms", &self.expires_at_ms)
            .finish_non_exhaustive()
    }
}

/// Persists the device identity and its credentials.
pub struct IdentityStore {
    conn: Mutex<Connection>,
    sealer: Sealer,
}

impl IdentityStore {
    pub fn open(path: impl AsRef<Path>, sealer: Sealer) -> IdentityResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        Self::from_connection(conn, sealer)
    }

    pub fn open_in_memory(sealer: Sealer) -> IdentityResult<Self> {
        Self::from_connection(Connection::open_in_memory()?, sealer)
    }

    fn from_connection(conn: Connection, sealer: Sealer) -> IdentityResult<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS device_identity (
                slot INTEGER PRIMARY KEY CHECK (slot = 0),
                device_id TEXT NOT NULL,
                serial_number TEXT NOT NULL,
                model TEXT NOT NULL,
                firmware_version TEXT NOT NULL,
                registered_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS credentials (
                credential_id TEXT PRIMARY KEY,
                device_id TEXT NOT NULL,
                sealed_token BLOB NOT NULL,
                issued_at_ms INTEGER NOT NULL,
                expires_at_ms INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            sealer,
        })
    }

    fn lock(&self) -> IdentityResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| IdentityError::LockPoisoned)
    }

    pub fn device_identity(&self) -> IdentityResult<Option<DeviceIdentity>> {
        let conn = self.lock()?;
        let identity = conn
            .query_row(
                "SELECT device_id, serial_number, model, firmware_version, registered_at_ms \
                 FROM device_identity WHERE slot = 0",
                [],
                |row| {
                    Ok(DeviceIdentity {
                        device_id: row.get(0)?,
                        serial_number: row.get(1)?,
                        model: row.get(2)?,
                        firmware_version: row.get(3)?,
                        registered_at_ms: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(identity)
    }

    /// Persist the identity. An existing identity is only replaced when
    /// `reprovision` is set.
    pub fn store_identity(&self, identity: &DeviceIdentity, reprovision: bool) -> IdentityResult<()> {
        if let Some(existing) = self.device_identity()? {
            if !reprovision && existing.device_id != identity.device_id {
                return Err(IdentityError::IdentityExists {
                    device_id: existing.device_id,
                });
            }
            if existing.device_id != identity.device_id {
                warn!(
                    previous = %existing.device_id,
                    device_id = %identity.device_id,
                    "Reprovisioning replaces device identity"
                );
            }
        }

        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO device_identity \
             (slot, device_id, serial_number, model, firmware_version, registered_at_ms) \
             VALUES (0, ?1, ?2, ?3, ?4, ?5)",
            params![
                identity.device_id,
                identity.serial_number,
                identity.model,
                identity.firmware_version,
                identity.registered_at_ms,
            ],
        )?;
        info!(device_id = %identity.device_id, "Device identity stored");
        Ok(())
    }

    pub fn store_credential(&self, credential: &Credential) -> IdentityResult<()> {
        let sealed = self.sealer.seal(
            credential.auth_token.as_bytes(),
            credential.credential_id.as_bytes(),
        )?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO credentials (credential_id, device_id, sealed_token, issued_at_ms, expires_at_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                credential.credential_id,
                credential.device_id,
                sealed,
                credential.issued_at_ms,
                credential.expires_at_ms,
            ],
        )?;
        Ok(())
    }

    /// Most recently issued credential.
    pub fn current_credential(&self) -> IdentityResult<Option<Credential>> {
        let row: Option<(String, String, Vec<u8>, i64, i64)> = {
            let conn = self.lock()?;
            conn.query_row(
                "SELECT credential_id, device_id, sealed_token, issued_at_ms, expires_at_ms \
                 FROM credentials ORDER BY issued_at_ms DESC, rowid DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
            )
            .optional()?
        };
        let Some((credential_id, device_id, sealed, issued_at_ms, expires_at_ms)) = row else {
            return Ok(None);
        };

        let token = self.sealer.open(&sealed, credential_id.as_bytes())?;
        let token = Zeroizing::new(
            String::from_utf8(token.to_vec())
                .map_err(|_| IdentityError::CorruptRecord("auth token is not UTF-8".into()))?,
        );
        Ok(Some(Credential {
            credential_id,
            device_id,
            auth_token: token.to_string(),
            issued_at_ms,
            expires_at_ms,
        }))
    }

    pub fn credential_count(&self) -> IdentityResult<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM credentials", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn discard_credential(&self, credential_id: &str) -> IdentityResult<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM credentials WHERE credential_id = ?1", [credential_id])?;
        Ok(())
    }

    /// Drop every credential other than `keep`. Returns how many were removed.
    pub fn discard_credentials_except(&self, keep: &str) -> IdentityResult<usize> {
        let conn = self.lock()?;
        Ok(conn.execute("DELETE FROM credentials WHERE credential_id != ?1", [keep])?)
    }
}
