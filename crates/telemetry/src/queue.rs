//! Bounded batch queue with durable spill.
//!
//! Batches live in memory up to `capacity`. When the memory queue is full
//! the oldest unsent batch is spilled to SQLite to make room, or the new
//! batch itself when every batch in memory is checked out; only when the
//! spill store is full as well does an enqueue block or fail, depending on
//! [`EnqueueMode`]. Spilled batches are delivered first since they are the
//! oldest.
//!
//! A batch leaves the queue only through [`BatchQueue::acknowledge`] or
//! [`BatchQueue::discard`]. Checked-out batches stay accounted for until one
//! of those, or [`BatchQueue::requeue`], is called.

use crate::batch::TelemetryBatch;
use crate::error::{TelemetryError, TelemetryResult};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use vitalguard_core::{EnqueueMode, TimestampMs};
use vitalguard_crypto::Sealer;
use zeroize::Zeroizing;

/// Durable, sealed overflow storage for batches.
pub struct SpillStore {
    conn: Mutex<Connection>,
    sealer: Sealer,
}

impl SpillStore {
    pub fn open(path: impl AsRef<Path>, sealer: Sealer) -> TelemetryResult<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Opening telemetry spill store");
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
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::from_connection(conn, sealer)
    }

    pub fn open_in_memory(sealer: Sealer) -> TelemetryResult<Self> {
        Self::from_connection(Connection::open_in_memory()?, sealer)
    }

    fn from_connection(conn: Connection, sealer: Sealer) -> TelemetryResult<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS spilled_batches (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                batch_id TEXT NOT NULL UNIQUE,
                created_at_ms INTEGER NOT NULL,
                sealed_body BLOB NOT NULL
            );
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            sealer,
        })
    }

    fn lock(&self) -> TelemetryResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| TelemetryError::LockPoisoned)
    }

    fn seal(&self, batch: &TelemetryBatch) -> TelemetryResult<Vec<u8>> {
        let body = Zeroizing::new(serde_json::to_vec(batch)?);
        Ok(self.sealer.seal(&body, batch.batch_id.as_bytes())?)
    }

    /// Insert, or update in place keeping the original position.
    pub fn put(&self, batch: &TelemetryBatch) -> TelemetryResult<()> {
        let sealed = self.seal(batch)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO spilled_batches (batch_id, created_at_ms, sealed_body) VALUES (?1, ?2, ?3) \
             ON CONFLICT(batch_id) DO UPDATE SET sealed_body = excluded.sealed_body",
            params![batch.batch_id, batch.created_at_ms, sealed],
        )?;
        Ok(())
    }

    pub fn remove(&self, batch_id: &str) -> TelemetryResult<bool> {
        let conn = self.lock()?;
        Ok(conn.execute("DELETE FROM spilled_batches WHERE batch_id = ?1", [batch_id])? > 0)
    }

    pub fn get(&self, batch_id: &str) -> TelemetryResult<Option<TelemetryBatch>> {
        let sealed: Option<Vec<u8>> = {
            let conn = self.lock()?;
            conn.query_row(
                "SELECT sealed_body FROM spilled_batches WHERE batch_id = ?1",
                [batch_id],
                |row| row.get(0),
            )
            .optional()?
        };
        sealed.map(|s| self.unseal(batch_id, &s)).transpose()
    }

    fn unseal(&self, batch_id: &str, sealed: &[u8]) -> TelemetryResult<TelemetryBatch> {
        let body = self.sealer.open(sealed, batch_id.as_bytes())?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Oldest spilled batch whose id is not in `exclude`.
    pub fn oldest_excluding(&self, exclude: &HashSet<String>) -> TelemetryResult<Option<TelemetryBatch>> {
        let rows: Vec<(String, Vec<u8>)> = {
            let conn = self.lock()?;
            let mut stmt = conn.prepare(
                "SELECT batch_id, sealed_body FROM spilled_batches ORDER BY seq LIMIT ?1",
            )?;
            let limit = exclude.len() as i64 + 1;
            let rows = stmt
                .query_map([limit], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        rows.into_iter()
            .find(|(id, _)| !exclude.contains(id))
            .map(|(id, sealed)| self.unseal(&id, &sealed))
            .transpose()
    }

    pub fn len(&self) -> TelemetryResult<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM spilled_batches", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> TelemetryResult<bool> {
        Ok(self.len()? == 0)
    }
}

/// What happened on a successful enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// Queued after spilling this older batch to durable storage
    SpilledOldest { batch_id: String },
    /// Memory held only checked-out batches, so this one went straight to
    /// durable storage
    Spilled { batch_id: String },
}

impl EnqueueOutcome {
    /// Id of the batch written to durable storage by this enqueue, if any.
    pub fn spilled_batch(&self) -> Option<&str> {
        match self {
            EnqueueOutcome::Queued => None,
            EnqueueOutcome::SpilledOldest { batch_id } | EnqueueOutcome::Spilled { batch_id } => {
                Some(batch_id)
            }
        }
    }
}

struct Checkout {
    batch: TelemetryBatch,
    spilled: bool,
}

#[derive(Default)]
struct Inner {
    pending: VecDeque<TelemetryBatch>,
    in_flight: HashMap<String, Checkout>,
}

impl Inner {
    fn memory_len(&self) -> usize {
        self.pending.len() + self.in_flight.values().filter(|c| !c.spilled).count()
    }
}

pub struct BatchQueue {
    inner: Mutex<Inner>,
    spill: SpillStore,
    capacity: usize,
    spill_capacity: usize,
    mode: EnqueueMode,
    space: Notify,
    work: Notify,
}

impl BatchQueue {
    pub fn new(spill: SpillStore, capacity: usize, spill_capacity: usize, mode: EnqueueMode) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            spill,
            capacity: capacity.max(1),
            spill_capacity,
            mode,
            space: Notify::new(),
            work: Notify::new(),
        }
    }

    fn lock(&self) -> TelemetryResult<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| TelemetryError::LockPoisoned)
    }

    pub fn mode(&self) -> EnqueueMode {
        self.mode
    }

    /// Enqueue according to the configured mode: wait for room, or fail
    /// with [`TelemetryError::QueueFull`].
    pub async fn enqueue(&self, batch: TelemetryBatch) -> TelemetryResult<EnqueueOutcome> {
        let mut batch = batch;
        loop {
            match self.offer(batch)? {
                Ok(outcome) => return Ok(outcome),
                Err(rejected) => {
                    if self.mode == EnqueueMode::Reject {
                        return Err(TelemetryError::QueueFull {
                            capacity: self.capacity + self.spill_capacity,
                        });
                    }
                    debug!(batch_id = %rejected.batch_id, "Telemetry queue full, waiting for space");
                    batch = rejected;
                    self.space.notified().await;
                }
            }
        }
    }

    /// Never waits.
    pub fn try_enqueue(&self, batch: TelemetryBatch) -> TelemetryResult<EnqueueOutcome> {
        match self.offer(batch)? {
            Ok(outcome) => Ok(outcome),
            Err(_) => Err(TelemetryError::QueueFull {
                capacity: self.capacity + self.spill_capacity,
            }),
        }
    }

    /// Inner result carries the batch back when there is no room.
    fn offer(
        &self,
        batch: TelemetryBatch,
    ) -> TelemetryResult<Result<EnqueueOutcome, TelemetryBatch>> {
        let mut inner = self.lock()?;
        let mut outcome = EnqueueOutcome::Queued;

        if inner.memory_len() >= self.capacity {
            if self.spill.len()? >= self.spill_capacity {
                return Ok(Err(batch));
            }
            if inner.pending.is_empty() {
                self.spill.put(&batch)?;
                debug!(batch_id = %batch.batch_id, "Memory holds only in-flight batches, spilled new batch");
                drop(inner);
                self.work.notify_one();
                return Ok(Ok(EnqueueOutcome::Spilled {
                    batch_id: batch.batch_id,
                }));
            }
            if let Some(oldest) = inner.pending.pop_front() {
                self.spill.put(&oldest)?;
                debug!(batch_id = %oldest.batch_id, "Spilled oldest unsent batch");
                outcome = EnqueueOutcome::SpilledOldest {
                    batch_id: oldest.batch_id,
                };
            }
        }

        inner.pending.push_back(batch);
        drop(inner);
        self.work.notify_one();
        Ok(Ok(outcome))
    }

    /// Take the next batch for delivery, if any. Spilled batches go first.
    pub fn checkout(&self) -> TelemetryResult<Option<TelemetryBatch>> {
        let mut inner = self.lock()?;

        let spilled_in_flight: HashSet<String> = inner
            .in_flight
            .iter()
            .filter(|(_, c)| c.spilled)
            .map(|(id, _)| id.clone())
            .collect();
        if let Some(batch) = self.spill.oldest_excluding(&spilled_in_flight)? {
            inner.in_flight.insert(
                batch.batch_id.clone(),
                Checkout {
                    batch: batch.clone(),
                    spilled: true,
                },
            );
            return Ok(Some(batch));
        }

        match inner.pending.pop_front() {
            Some(batch) => {
                inner.in_flight.insert(
                    batch.batch_id.clone(),
                    Checkout {
                        batch: batch.clone(),
                        spilled: false,
                    },
                );
                Ok(Some(batch))
            }
            None => Ok(None),
        }
    }

    /// Wait until a batch is available and check it out.
    pub async fn next(&self) -> TelemetryResult<TelemetryBatch> {
        loop {
            if let Some(batch) = self.checkout()? {
                return Ok(batch);
            }
            self.work.notified().await;
        }
    }

    /// Record a send attempt on a checked-out batch.
    pub fn mark_sent(&self, batch_id: &str, now: TimestampMs) -> TelemetryResult<TelemetryBatch> {
        let mut inner = self.lock()?;
        let checkout = inner
            .in_flight
            .get_mut(batch_id)
            .ok_or_else(|| TelemetryError::UnknownBatch {
                batch_id: batch_id.to_string(),
            })?;
        checkout.batch.attempt_count = checkout.batch.attempt_count.saturating_add(1);
        checkout.batch.sent_at_ms = Some(now);
        if checkout.spilled {
            self.spill.put(&checkout.batch)?;
        }
        Ok(checkout.batch.clone())
    }

    /// Remove a batch wherever it is. Returns it if it was still queued.
    fn remove(&self, batch_id: &str) -> TelemetryResult<Option<TelemetryBatch>> {
        let mut inner = self.lock()?;
        let removed = if let Some(checkout) = inner.in_flight.remove(batch_id) {
            if checkout.spilled {
                self.spill.remove(batch_id)?;
            }
            Some(checkout.batch)
        } else if let Some(pos) = inner.pending.iter().position(|b| b.batch_id == batch_id) {
            inner.pending.remove(pos)
        } else {
            let spilled = self.spill.get(batch_id)?;
            if spilled.is_some() {
                self.spill.remove(batch_id)?;
            }
            spilled
        };
        drop(inner);
        if removed.is_some() {
            self.space.notify_one();
        }
        Ok(removed)
    }

    /// Positive acknowledgment: the batch is delivered and leaves the queue.
    /// Late acks for batches already requeued are honoured too.
    pub fn acknowledge(&self, batch_id: &str) -> TelemetryResult<Option<TelemetryBatch>> {
        self.remove(batch_id)
    }

    /// Drop a batch that will never be delivered.
    pub fn discard(&self, batch_id: &str) -> TelemetryResult<Option<TelemetryBatch>> {
        self.remove(batch_id)
    }

    /// Put a checked-out batch back at the head of the queue.
    pub fn requeue(&self, batch_id: &str) -> TelemetryResult<()> {
        let mut inner = self.lock()?;
        let checkout = inner
            .in_flight
            .remove(batch_id)
            .ok_or_else(|| TelemetryError::UnknownBatch {
                batch_id: batch_id.to_string(),
            })?;
        // spilled batches never left the spill store
        if !checkout.spilled {
            inner.pending.push_front(checkout.batch);
        }
        drop(inner);
        self.work.notify_one();
        Ok(())
    }

    /// Move every batch held in memory to the spill store, ignoring the
    /// spill capacity. Used on shutdown.
    pub fn spill_all(&self) -> TelemetryResult<usize> {
        let mut inner = self.lock()?;
        let mut spilled = 0;

        let in_flight: Vec<Checkout> = inner.in_flight.drain().map(|(_, c)| c).collect();
        for checkout in in_flight.into_iter().filter(|c| !c.spilled) {
            self.spill.put(&checkout.batch)?;
            spilled += 1;
        }
        while let Some(batch) = inner.pending.pop_front() {
            self.spill.put(&batch)?;
            spilled += 1;
        }

        let total = self.spill.len()?;
        if total > self.spill_capacity {
            warn!(total, capacity = self.spill_capacity, "Spill store above capacity after shutdown spill");
        }
        Ok(spilled)
    }

    pub fn memory_len(&self) -> TelemetryResult<usize> {
        Ok(self.lock()?.memory_len())
    }

    pub fn spilled_len(&self) -> TelemetryResult<usize> {
        self.spill.len()
    }

    /// Every batch not yet acknowledged or discarded.
    pub fn len(&self) -> TelemetryResult<usize> {
        let memory = self.memory_len()?;
        Ok(memory + self.spill.len()?)
    }

    pub fn is_empty(&self) -> TelemetryResult<bool> {
        Ok(self.len()? == 0)
    }

    pub fn in_flight_len(&self) -> TelemetryResult<usize> {
        Ok(self.lock()?.in_flight.len())
    }
}
