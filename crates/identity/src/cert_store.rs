//! Durable certificate storage.
//!
//! Public certificate fields are stored in the clear for querying. The secret
//! material (private key, issuer chain) is sealed with the datastore key and
//! bound to the certificate id as associated data.
//!
//! The store enforces one invariant itself: promotion of a certificate to
//! Active demotes every other in-service certificate of the same type in the
//! same transaction, so readers never observe zero or two in-service
//! certificates for a type.

use crate::error::{IdentityError, IdentityResult};
use crate::pki::{Certificate, CertificateMaterial, CertificateStatus, CertificateType};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};
use vitalguard_core::TimestampMs;
use vitalguard_crypto::Sealer;
use zeroize::Zeroizing;

const COLUMNS: &str =
    "id, cert_type, subject, issuer, public_key, not_before_ms, not_after_ms, signature, status";

const IN_SERVICE: &str = "('Active', 'ExpiringSoon')";

/// SQLite-backed certificate store.
pub struct CertificateStore {
    conn: Mutex<Connection>,
    sealer: Sealer,
}

fn read_certificate(row: &Row<'_>) -> rusqlite::Result<(Certificate, String, String)> {
    let cert_type: String = row.get(1)?;
    let status: String = row.get(8)?;
    Ok((
        Certificate {
            id: row.get(0)?,
            // parsed by the caller so a corrupt value surfaces as CorruptRecord
            cert_type: CertificateType::ClientAuth,
            subject: row.get(2)?,
            issuer: row.get(3)?,
            public_key: row.get(4)?,
            not_before_ms: row.get(5)?,
            not_after_ms: row.get(6)?,
            signature: row.get(7)?,
            status: CertificateStatus::Pending,
        },
        cert_type,
        status,
    ))
}

fn finish(raw: (Certificate, String, String)) -> IdentityResult<Certificate> {
    let (mut cert, cert_type, status) = raw;
    cert.cert_type = cert_type.parse()?;
    cert.status = status.parse()?;
    Ok(cert)
}

impl CertificateStore {
    pub fn open(path: impl AsRef<Path>, sealer: Sealer) -> IdentityResult<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Opening certificate store");

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
            CREATE TABLE IF NOT EXISTS certificates (
                id TEXT PRIMARY KEY,
                cert_type TEXT NOT NULL,
                subject TEXT NOT NULL,
                issuer TEXT NOT NULL,
                public_key BLOB NOT NULL,
                not_before_ms INTEGER NOT NULL,
                not_after_ms INTEGER NOT NULL,
                signature BLOB NOT NULL,
                status TEXT NOT NULL,
                material BLOB NOT NULL,
                installed_at_ms INTEGER NOT NULL,
                updated_at_ms INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_cert_type_status ON certificates(cert_type, status);
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

    /// Insert a new certificate with its sealed material.
    pub fn insert(
        &self,
        cert: &Certificate,
        material: &CertificateMaterial,
        now: TimestampMs,
    ) -> IdentityResult<()> {
        let plaintext = Zeroizing::new(serde_json::to_vec(material)?);
        let sealed = self.sealer.seal(&plaintext, cert.id.as_bytes())?;

        let conn = self.lock()?;
        let exists: Option<i64> = conn
            .query_row("SELECT 1 FROM certificates WHERE id = ?1", [&cert.id], |row| {
                row.get(0)
            })
            .optional()?;
        if exists.is_some() {
            return Err(IdentityError::CertificateExists {
                cert_id: cert.id.clone(),
            });
        }

        conn.execute(
            &format!(
                "INSERT INTO certificates ({}, material, installed_at_ms, updated_at_ms) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
                COLUMNS
            ),
            params![
                cert.id,
                cert.cert_type.as_str(),
                cert.subject,
                cert.issuer,
                cert.public_key,
                cert.not_before_ms,
                cert.not_after_ms,
                cert.signature,
                cert.status.as_str(),
                sealed,
                now,
            ],
        )?;
        debug!(cert_id = %cert.id, cert_type = %cert.cert_type, "Certificate stored");
        Ok(())
    }

    pub fn get(&self, cert_id: &str) -> IdentityResult<Option<Certificate>> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                &format!("SELECT {} FROM certificates WHERE id = ?1", COLUMNS),
                [cert_id],
                read_certificate,
            )
            .optional()?;
        raw.map(finish).transpose()
    }

    pub fn require(&self, cert_id: &str) -> IdentityResult<Certificate> {
        self.get(cert_id)?.ok_or_else(|| IdentityError::CertificateNotFound {
            cert_id: cert_id.to_string(),
        })
    }

    fn query(&self, sql: &str, params: impl rusqlite::Params) -> IdentityResult<Vec<Certificate>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let raw = stmt
            .query_map(params, read_certificate)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raw.into_iter().map(finish).collect()
    }

    /// Every stored certificate, oldest first.
    pub fn list(&self) -> IdentityResult<Vec<Certificate>> {
        self.query(
            &format!("SELECT {} FROM certificates ORDER BY installed_at_ms, id", COLUMNS),
            [],
        )
    }

    pub fn list_by_type(&self, cert_type: CertificateType) -> IdentityResult<Vec<Certificate>> {
        self.query(
            &format!(
                "SELECT {} FROM certificates WHERE cert_type = ?1 ORDER BY installed_at_ms, id",
                COLUMNS
            ),
            [cert_type.as_str()],
        )
    }

    /// All Active or ExpiringSoon certificates.
    pub fn in_service(&self) -> IdentityResult<Vec<Certificate>> {
        self.query(
            &format!(
                "SELECT {} FROM certificates WHERE status IN {} ORDER BY cert_type",
                COLUMNS, IN_SERVICE
            ),
            [],
        )
    }

    pub fn set_status(
        &self,
        cert_id: &str,
        status: CertificateStatus,
        now: TimestampMs,
    ) -> IdentityResult<()> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE certificates SET status = ?1, updated_at_ms = ?2 WHERE id = ?3",
            params![status.as_str(), now, cert_id],
        )?;
        if changed == 0 {
            return Err(IdentityError::CertificateNotFound {
                cert_id: cert_id.to_string(),
            });
        }
        Ok(())
    }

    /// Atomically put a Pending certificate in service as `status` (Active or
    /// ExpiringSoon) and supersede the previous in-service certificate(s) of
    /// its type.
    ///
    /// Returns the ids that were superseded.
    pub fn promote(
        &self,
        cert_id: &str,
        status: CertificateStatus,
        now: TimestampMs,
    ) -> IdentityResult<Vec<String>> {
        let target = status;
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let row: Option<(String, String)> = tx
            .query_row(
                "SELECT cert_type, status FROM certificates WHERE id = ?1",
                [cert_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (cert_type, status) = row.ok_or_else(|| IdentityError::CertificateNotFound {
            cert_id: cert_id.to_string(),
        })?;
        let status: CertificateStatus = status.parse()?;
        if status != CertificateStatus::Pending || !target.is_in_service() {
            return Err(IdentityError::InvalidTransition {
                cert_id: cert_id.to_string(),
                from: status,
                to: target,
            });
        }

        let superseded = {
            let mut stmt = tx.prepare(&format!(
                "SELECT id FROM certificates WHERE cert_type = ?1 AND status IN {} AND id != ?2",
                IN_SERVICE
            ))?;
            let ids = stmt
                .query_map(params![cert_type, cert_id], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            ids
        };

        tx.execute(
            &format!(
                "UPDATE certificates SET status = 'Superseded', updated_at_ms = ?1 \
                 WHERE cert_type = ?2 AND status IN {} AND id != ?3",
                IN_SERVICE
            ),
            params![now, cert_type, cert_id],
        )?;
        tx.execute(
            "UPDATE certificates SET status = ?1, updated_at_ms = ?2 WHERE id = ?3",
            params![target.as_str(), now, cert_id],
        )?;
        tx.commit()?;

        info!(cert_id, cert_type = %cert_type, status = %target, superseded = ?superseded, "Certificate promoted");
        Ok(superseded)
    }

    /// Undo a promotion in one transaction: drop `cert_id` and give each
    /// previously superseded certificate back the status listed for it.
    pub fn roll_back(
        &self,
        cert_id: &str,
        restore: &[(String, CertificateStatus)],
        now: TimestampMs,
    ) -> IdentityResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM certificates WHERE id = ?1", [cert_id])?;
        for (id, status) in restore {
            tx.execute(
                "UPDATE certificates SET status = ?1, updated_at_ms = ?2 \
                 WHERE id = ?3 AND status = 'Superseded'",
                params![status.as_str(), now, id],
            )?;
        }
        tx.commit()?;

        info!(cert_id, restored = restore.len(), "Certificate promotion rolled back");
        Ok(())
    }

    pub fn delete(&self, cert_id: &str) -> IdentityResult<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM certificates WHERE id = ?1", [cert_id])?;
        Ok(())
    }

    /// Open the sealed material of a certificate.
    pub fn material(&self, cert_id: &str) -> IdentityResult<CertificateMaterial> {
        let sealed: Option<Vec<u8>> = {
            let conn = self.lock()?;
            conn.query_row(
                "SELECT material FROM certificates WHERE id = ?1",
                [cert_id],
                |row| row.get(0),
            )
            .optional()?
        };
        let sealed = sealed.ok_or_else(|| IdentityError::CertificateNotFound {
            cert_id: cert_id.to_string(),
        })?;
        let plaintext = self.sealer.open(&sealed, cert_id.as_bytes())?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    #[doc(hidden)]
    pub fn __test_execute_raw_sql(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> IdentityResult<usize> {
        let conn = self.lock()?;
        Ok(conn.execute(sql, params)?)
    }
}
