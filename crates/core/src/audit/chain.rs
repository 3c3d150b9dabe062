//! Audit Chain - Append-Only, Hash-Linked Security Log
//!
//! Every security-relevant transition in the device (registration,
//! certificate lifecycle, clock corrections, telemetry sessions) is appended
//! here. The chain is persisted in SQLite with WAL journaling.
//!
//! # Guarantees
//!
//! - Single writer: appends are serialized through one lock, so `sequence`
//!   order matches call order and no two entries share a sequence
//! - Atomic appends: an entry is either fully committed or not recorded
//! - Startup continuity check: the whole chain is re-verified on open
//! - Fail closed: once tamper is detected, further appends are refused

use super::entry::{
    compute_entry_hash, payload_hash, AuditEntry, AuditEventType, Hash256, GENESIS_HASH,
};
use crate::clock::{CorrectedClock, TimestampMs};
use crate::error::{Classify, ErrorClass};
use crate::notify::{Notification, NotificationBus};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use std::ops::Range;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Tamper detected at sequence {at}: {reason}")]
    TamperDetected { at: u64, reason: String },

    #[error("Audit chain compromised at sequence {at}, appends refused")]
    ChainCompromised { at: u64 },

    #[error("Audit entry not found: sequence={sequence}")]
    EntryNotFound { sequence: u64 },

    #[error("Audit writer lock poisoned")]
    LockPoisoned,
}

impl Classify for AuditError {
    fn class(&self) -> ErrorClass {
        match self {
            AuditError::TamperDetected { .. } | AuditError::ChainCompromised { .. } => {
                ErrorClass::Integrity
            }
            AuditError::Serialization(_) | AuditError::EntryNotFound { .. } => {
                ErrorClass::Validation
            }
            AuditError::Database(_) | AuditError::Io(_) | AuditError::LockPoisoned => {
                ErrorClass::Fatal
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, AuditError>;

/// Chain health as last observed by the startup check or `verify`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainHealth {
    Ok,
    Compromised {
        first_bad_sequence: u64,
        reason: String,
    },
}

impl ChainHealth {
    pub fn is_ok(&self) -> bool {
        matches!(self, ChainHealth::Ok)
    }
}

#[derive(Debug, Clone, Copy)]
struct Head {
    sequence: u64,
    entry_hash: Hash256,
}

struct Writer {
    conn: Connection,
    head: Option<Head>,
    health: ChainHealth,
}

impl Writer {
    fn len(&self) -> u64 {
        self.head.map(|h| h.sequence + 1).unwrap_or(0)
    }
}

/// Row exactly as stored, before any interpretation.
struct StoredRow {
    sequence: u64,
    timestamp_ms: TimestampMs,
    event_type: String,
    payload: String,
    payload_hash: Vec<u8>,
    prev_hash: Vec<u8>,
    entry_hash: Vec<u8>,
}

const COLUMNS: &str =
    "sequence, timestamp_ms, event_type, payload, payload_hash, prev_hash, entry_hash";

fn read_row(row: &Row<'_>) -> rusqlite::Result<StoredRow> {
    Ok(StoredRow {
        sequence: row.get::<_, i64>(0)? as u64,
        timestamp_ms: row.get(1)?,
        event_type: row.get(2)?,
        payload: row.get(3)?,
        payload_hash: row.get(4)?,
        prev_hash: row.get(5)?,
        entry_hash: row.get(6)?,
    })
}

fn to_hash(bytes: &[u8]) -> Option<Hash256> {
    bytes.try_into().ok()
}

impl StoredRow {
    fn into_entry(self) -> Result<AuditEntry> {
        let at = self.sequence;
        let tamper = |reason: &str| AuditError::TamperDetected {
            at,
            reason: reason.to_string(),
        };
        let event_type = self
            .event_type
            .parse::<AuditEventType>()
            .map_err(|_| tamper("unknown event type"))?;
        let payload_hash = to_hash(&self.payload_hash).ok_or_else(|| tamper("bad payload hash"))?;
        let prev_hash = to_hash(&self.prev_hash).ok_or_else(|| tamper("bad prev hash"))?;
        let entry_hash = to_hash(&self.entry_hash).ok_or_else(|| tamper("bad entry hash"))?;

        Ok(AuditEntry {
            sequence: self.sequence,
            timestamp_ms: self.timestamp_ms,
            event_type,
            payload: self.payload,
            payload_hash,
            prev_hash,
            entry_hash,
        })
    }

    /// First problem with this row given the expected sequence and link.
    fn check(&self, expected_sequence: u64, expected_prev: &Hash256) -> Option<&'static str> {
        if self.sequence != expected_sequence {
            return Some("missing entry");
        }
        if self.event_type.parse::<AuditEventType>().is_err() {
            return Some("unknown event type");
        }
        let computed_payload_hash = payload_hash(self.payload.as_bytes());
        if self.payload_hash.as_slice() != &computed_payload_hash[..] {
            return Some("payload hash mismatch");
        }
        if self.prev_hash.as_slice() != &expected_prev[..] {
            return Some("prev hash does not link to predecessor");
        }
        let computed = compute_entry_hash(
            self.sequence,
            self.timestamp_ms,
            &self.event_type,
            &computed_payload_hash,
            expected_prev,
        );
        if self.entry_hash.as_slice() != &computed[..] {
            return Some("entry hash mismatch");
        }
        None
    }
}

/// Append-only, hash-linked audit log backed by SQLite.
pub struct AuditChain {
    writer: Mutex<Writer>,
    clock: Arc<CorrectedClock>,
    notifications: NotificationBus,
}

impl AuditChain {
    /// Create or open the chain at `path` and run the startup continuity check.
    ///
    /// A chain that fails the check still opens, but in the compromised
    /// state: reads work, appends are refused.
    pub fn open(
        path: impl AsRef<Path>,
        clock: Arc<CorrectedClock>,
        notifications: NotificationBus,
    ) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Opening audit chain");

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

        Self::from_connection(conn, clock, notifications)
    }

    /// Open a volatile chain (tests, simulation).
    pub fn open_in_memory(clock: Arc<CorrectedClock>, notifications: NotificationBus) -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, clock, notifications)
    }

    fn from_connection(
        conn: Connection,
        clock: Arc<CorrectedClock>,
        notifications: NotificationBus,
    ) -> Result<Self> {
        Self::init_schema(&conn)?;
        let head = Self::load_head(&conn)?;

        let chain = Self {
            writer: Mutex::new(Writer {
                conn,
                head,
                health: ChainHealth::Ok,
            }),
            clock,
            notifications,
        };
        chain.startup_continuity_check()?;
        Ok(chain)
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS audit_entries (
                sequence INTEGER PRIMARY KEY,
                timestamp_ms INTEGER NOT NULL,
                event_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                payload_hash BLOB NOT NULL,
                prev_hash BLOB NOT NULL,
                entry_hash BLOB NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_audit_event_type ON audit_entries(event_type);
            CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_entries(timestamp_ms);
            "#,
        )?;
        Ok(())
    }

    fn load_head(conn: &Connection) -> Result<Option<Head>> {
        let head = conn
            .query_row(
                "SELECT sequence, entry_hash FROM audit_entries ORDER BY sequence DESC LIMIT 1",
                [],
                |row| Ok((row.get::<_, i64>(0)? as u64, row.get::<_, Vec<u8>>(1)?)),
            )
            .optional()?;

        Ok(head.map(|(sequence, hash)| Head {
            sequence,
            // a malformed stored hash is reported by the continuity check
            entry_hash: to_hash(&hash).unwrap_or(GENESIS_HASH),
        }))
    }

    fn lock(&self) -> Result<MutexGuard<'_, Writer>> {
        self.writer.lock().map_err(|_| AuditError::LockPoisoned)
    }

    /// Re-verify the full chain. Marks the chain compromised on failure.
    fn startup_continuity_check(&self) -> Result<()> {
        match self.verify_all() {
            Ok(()) => {
                info!(entries = self.len()?, "Audit chain continuity check passed");
                Ok(())
            }
            Err(AuditError::TamperDetected { at, reason }) => {
                error!(sequence = at, reason = %reason, "Audit chain failed startup continuity check");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Append an entry stamped with corrected time.
    ///
    /// Fails only on storage errors or when the chain is compromised; a failed
    /// append leaves no trace in the chain.
    pub fn append(
        &self,
        event_type: AuditEventType,
        payload: &serde_json::Value,
    ) -> Result<AuditEntry> {
        let payload = serde_json::to_string(payload)?;
        let mut writer = self.lock()?;

        if let ChainHealth::Compromised {
            first_bad_sequence, ..
        } = writer.health
        {
            return Err(AuditError::ChainCompromised {
                at: first_bad_sequence,
            });
        }

        let sequence = writer.len();
        let prev_hash = writer.head.map(|h| h.entry_hash).unwrap_or(GENESIS_HASH);
        let timestamp_ms = self.clock.now();
        let payload_hash = payload_hash(payload.as_bytes());
        let entry_hash = compute_entry_hash(
            sequence,
            timestamp_ms,
            event_type.as_str(),
            &payload_hash,
            &prev_hash,
        );

        let tx = writer.conn.transaction()?;
        tx.execute(
            r#"
            INSERT INTO audit_entries (
                sequence, timestamp_ms, event_type, payload,
                payload_hash, prev_hash, entry_hash
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                sequence as i64,
                timestamp_ms,
                event_type.as_str(),
                payload,
                &payload_hash[..],
                &prev_hash[..],
                &entry_hash[..],
            ],
        )?;
        tx.commit()?;

        writer.head = Some(Head {
            sequence,
            entry_hash,
        });

        debug!(sequence, event_type = %event_type, "Audit entry appended");

        Ok(AuditEntry {
            sequence,
            timestamp_ms,
            event_type,
            payload,
            payload_hash,
            prev_hash,
            entry_hash,
        })
    }

    /// Verify entries in `range` (clamped to the chain length).
    ///
    /// Recomputes each entry's payload and entry hash and checks the link to
    /// its predecessor. Stops at the first break and reports its sequence.
    pub fn verify(&self, range: Range<u64>) -> Result<()> {
        let mut writer = self.lock()?;
        let end = range.end.min(writer.len());
        if range.start >= end {
            return Ok(());
        }

        match Self::find_break(&writer.conn, range.start, end)? {
            None => {
                debug!(start = range.start, end, "Audit range verified");
                Ok(())
            }
            Some((at, reason)) => {
                self.mark_compromised(&mut writer, at, reason);
                Err(AuditError::TamperDetected {
                    at,
                    reason: reason.to_string(),
                })
            }
        }
    }

    /// Verify the whole chain.
    pub fn verify_all(&self) -> Result<()> {
        self.verify(0..u64::MAX)
    }

    fn find_break(conn: &Connection, start: u64, end: u64) -> Result<Option<(u64, &'static str)>> {
        let mut expected_prev = if start == 0 {
            GENESIS_HASH
        } else {
            let prev: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT entry_hash FROM audit_entries WHERE sequence = ?1",
                    [(start - 1) as i64],
                    |row| row.get(0),
                )
                .optional()?;
            match prev.as_deref().and_then(to_hash) {
                Some(hash) => hash,
                None => return Ok(Some((start - 1, "missing entry"))),
            }
        };

        let sql = format!(
            "SELECT {} FROM audit_entries WHERE sequence >= ?1 AND sequence < ?2 ORDER BY sequence ASC",
            COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![start as i64, end as i64], read_row)?;

        let mut expected = start;
        for row in rows {
            let row = row?;
            if let Some(reason) = row.check(expected, &expected_prev) {
                return Ok(Some((expected, reason)));
            }
            expected_prev = match to_hash(&row.entry_hash) {
                Some(hash) => hash,
                None => return Ok(Some((expected, "entry hash mismatch"))),
            };
            expected += 1;
        }

        if expected < end {
            return Ok(Some((expected, "missing entry")));
        }
        Ok(None)
    }

    fn mark_compromised(&self, writer: &mut Writer, at: u64, reason: &str) {
        error!(sequence = at, reason, "Audit chain tamper detected");
        if writer.health.is_ok() {
            writer.health = ChainHealth::Compromised {
                first_bad_sequence: at,
                reason: reason.to_string(),
            };
        }
        self.notifications.publish(Notification::IntegrityAlert {
            component: "audit".to_string(),
            detail: format!("tamper detected at sequence {}: {}", at, reason),
        });
    }

    pub fn health(&self) -> Result<ChainHealth> {
        Ok(self.lock()?.health.clone())
    }

    /// Number of entries in the chain.
    pub fn len(&self) -> Result<u64> {
        Ok(self.lock()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn latest(&self) -> Result<Option<AuditEntry>> {
        let writer = self.lock()?;
        match writer.head {
            None => Ok(None),
            Some(head) => Self::query(
                &writer.conn,
                "WHERE sequence = ?1",
                [head.sequence as i64],
            )
            .map(|mut v| v.pop()),
        }
    }

    pub fn entry(&self, sequence: u64) -> Result<AuditEntry> {
        let writer = self.lock()?;
        Self::query(&writer.conn, "WHERE sequence = ?1", [sequence as i64])?
            .pop()
            .ok_or(AuditError::EntryNotFound { sequence })
    }

    pub fn entries(&self, range: Range<u64>) -> Result<Vec<AuditEntry>> {
        let writer = self.lock()?;
        let end = range.end.min(writer.len());
        Self::query(
            &writer.conn,
            "WHERE sequence >= ?1 AND sequence < ?2",
            params![range.start as i64, end as i64],
        )
    }

    pub fn entries_by_type(&self, event_type: AuditEventType) -> Result<Vec<AuditEntry>> {
        let writer = self.lock()?;
        Self::query(&writer.conn, "WHERE event_type = ?1", [event_type.as_str()])
    }

    /// Entries with `start_ms <= timestamp_ms < end_ms`.
    pub fn entries_between(&self, start_ms: TimestampMs, end_ms: TimestampMs) -> Result<Vec<AuditEntry>> {
        let writer = self.lock()?;
        Self::query(
            &writer.conn,
            "WHERE timestamp_ms >= ?1 AND timestamp_ms < ?2",
            params![start_ms, end_ms],
        )
    }

    fn query<P: rusqlite::Params>(conn: &Connection, clause: &str, params: P) -> Result<Vec<AuditEntry>> {
        let sql = format!(
            "SELECT {} FROM audit_entries {} ORDER BY sequence ASC",
            COLUMNS, clause
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params, read_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().map(StoredRow::into_entry).collect()
    }

    /// Execute raw SQL for testing purposes only
    ///
    /// **WARNING**: This bypasses the single append path and exists only so
    /// tests can simulate tampering with the stored chain.
    #[doc(hidden)]
    pub fn __test_execute_raw_sql(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<usize> {
        let writer = self.lock()?;
        Ok(writer.conn.execute(sql, params)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;

    fn test_clock() -> (Arc<ManualClock>, Arc<CorrectedClock>) {
        let manual = Arc::new(ManualClock::new(1_700_000_000_000));
        let clock = Arc::new(CorrectedClock::new(manual.clone()));
        (manual, clock)
    }

    fn chain_with(n: u64) -> AuditChain {
        let (manual, clock) = test_clock();
        let chain = AuditChain::open_in_memory(clock, NotificationBus::default()).unwrap();
        for i in 0..n {
            manual.advance_ms(10);
            chain
                .append(AuditEventType::ClockSynced, &json!({ "offset_ms": i }))
                .unwrap();
        }
        chain
    }

    #[test]
    fn test_first_entry_links_to_genesis() {
        let chain = chain_with(0);
        let entry = chain
            .append(AuditEventType::KeyCreated, &json!({ "salt": "new" }))
            .unwrap();

        assert_eq!(entry.sequence, 0);
        assert_eq!(entry.prev_hash, GENESIS_HASH);
        assert_eq!(entry.entry_hash, entry.recompute_hash());
        assert_eq!(entry.timestamp_ms, 1_700_000_000_000);
    }

    #[test]
    fn test_entries_link_in_order() {
        let chain = chain_with(5);
        let entries = chain.entries(0..5).unwrap();

        assert_eq!(entries.len(), 5);
        for (i, pair) in entries.windows(2).enumerate() {
            assert_eq!(pair[0].sequence, i as u64);
            assert_eq!(pair[1].prev_hash, pair[0].entry_hash);
        }
        assert_eq!(chain.len().unwrap(), 5);
        assert_eq!(chain.latest().unwrap().unwrap().sequence, 4);
    }

    #[test]
    fn test_verify_passes_on_untouched_chain() {
        let chain = chain_with(10);
        chain.verify(0..10).unwrap();
        chain.verify(3..7).unwrap();
        chain.verify_all().unwrap();
        assert!(chain.health().unwrap().is_ok());
    }

    #[test]
    fn test_payload_edit_detected_at_that_sequence() {
        for target in [0u64, 4, 9] {
            let chain = chain_with(10);
            chain
                .__test_execute_raw_sql(
                    "UPDATE audit_entries SET payload = ?1 WHERE sequence = ?2",
                    &[&"{\"offset_ms\":999}" as &dyn rusqlite::ToSql, &(target as i64)],
                )
                .unwrap();

            match chain.verify(0..10) {
                Err(AuditError::TamperDetected { at, .. }) => assert_eq!(at, target),
                other => panic!("expected tamper at {}, got {:?}", target, other),
            }
        }
    }

    #[test]
    fn test_recomputed_payload_hash_still_breaks_entry_hash() {
        let chain = chain_with(6);
        let forged = "{\"offset_ms\":-1}";
        let forged_hash = payload_hash(forged.as_bytes());
        chain
            .__test_execute_raw_sql(
                "UPDATE audit_entries SET payload = ?1, payload_hash = ?2 WHERE sequence = 2",
                &[&forged as &dyn rusqlite::ToSql, &forged_hash.to_vec()],
            )
            .unwrap();

        match chain.verify_all() {
            Err(AuditError::TamperDetected { at, reason }) => {
                assert_eq!(at, 2);
                assert_eq!(reason, "entry hash mismatch");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_deleted_entry_detected() {
        let chain = chain_with(5);
        chain
            .__test_execute_raw_sql("DELETE FROM audit_entries WHERE sequence = 3", &[])
            .unwrap();

        match chain.verify_all() {
            Err(AuditError::TamperDetected { at, .. }) => assert_eq!(at, 3),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_appends_refused_after_tamper() {
        let chain = chain_with(3);
        let mut alerts = chain.notifications.subscribe();
        chain
            .__test_execute_raw_sql(
                "UPDATE audit_entries SET timestamp_ms = 0 WHERE sequence = 1",
                &[],
            )
            .unwrap();

        assert!(chain.verify_all().is_err());
        let err = chain
            .append(AuditEventType::ClockSynced, &json!({}))
            .unwrap_err();
        assert!(matches!(err, AuditError::ChainCompromised { at: 1 }));
        assert_eq!(err.class(), ErrorClass::Integrity);
        assert!(matches!(
            alerts.try_recv().unwrap(),
            Notification::IntegrityAlert { .. }
        ));
    }

    #[test]
    fn test_startup_check_detects_tamper_on_reopen() {
        let db_path =
            std::env::temp_dir().join(format!("test_audit_{}.db", uuid::Uuid::new_v4()));
        {
            let (_, clock) = test_clock();
            let chain = AuditChain::open(&db_path, clock, NotificationBus::default()).unwrap();
            for i in 0..4 {
                chain
                    .append(AuditEventType::SessionConnecting, &json!({ "n": i }))
                    .unwrap();
            }
            chain
                .__test_execute_raw_sql(
                    "UPDATE audit_entries SET prev_hash = ?1 WHERE sequence = 2",
                    &[&vec![0xFFu8; 32] as &dyn rusqlite::ToSql],
                )
                .unwrap();
        }

        let (_, clock) = test_clock();
        let chain = AuditChain::open(&db_path, clock, NotificationBus::default()).unwrap();
        assert_eq!(
            chain.health().unwrap(),
            ChainHealth::Compromised {
                first_bad_sequence: 2,
                reason: "prev hash does not link to predecessor".to_string(),
            }
        );

        drop(chain);
        std::fs::remove_file(&db_path).ok();
    }

    #[test]
    fn test_reopen_continues_sequence() {
        let db_path =
            std::env::temp_dir().join(format!("test_audit_{}.db", uuid::Uuid::new_v4()));
        {
            let (_, clock) = test_clock();
            let chain = AuditChain::open(&db_path, clock, NotificationBus::default()).unwrap();
            chain.append(AuditEventType::KeyCreated, &json!({})).unwrap();
            chain.append(AuditEventType::DeviceRegistered, &json!({})).unwrap();
        }

        let (_, clock) = test_clock();
        let chain = AuditChain::open(&db_path, clock, NotificationBus::default()).unwrap();
        let entry = chain.append(AuditEventType::ClockSynced, &json!({})).unwrap();
        assert_eq!(entry.sequence, 2);
        chain.verify_all().unwrap();

        drop(chain);
        std::fs::remove_file(&db_path).ok();
    }

    #[test]
    fn test_query_helpers() {
        let (manual, clock) = test_clock();
        let chain = AuditChain::open_in_memory(clock, NotificationBus::default()).unwrap();
        chain.append(AuditEventType::KeyCreated, &json!({})).unwrap();
        manual.advance_ms(1_000);
        chain.append(AuditEventType::ClockSynced, &json!({})).unwrap();
        manual.advance_ms(1_000);
        chain.append(AuditEventType::ClockSynced, &json!({})).unwrap();

        assert_eq!(chain.entries_by_type(AuditEventType::ClockSynced).unwrap().len(), 2);
        let start = 1_700_000_000_000;
        assert_eq!(chain.entries_between(start, start + 1_000).unwrap().len(), 1);
        assert_eq!(chain.entries_between(start, start + 2_001).unwrap().len(), 3);
        assert_eq!(chain.entry(1).unwrap().event_type, AuditEventType::ClockSynced);
        assert!(matches!(
            chain.entry(7),
            Err(AuditError::EntryNotFound { sequence: 7 })
        ));
    }

    #[test]
    fn test_concurrent_appends_are_serialized() {
        let chain = Arc::new(chain_with(0));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let chain = chain.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        chain
                            .append(AuditEventType::BatchSpilled, &json!({ "t": t, "i": i }))
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(chain.len().unwrap(), 200);
        chain.verify_all().unwrap();
    }
}
