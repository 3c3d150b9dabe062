//! Local and corrected time sources.
//!
//! All timestamps are Unix epoch milliseconds as `i64`. The local clock is
//! never adjusted; corrected time is the local reading plus the offset that
//! [`crate::clock_sync::ClockSync`] last published.

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Unix epoch milliseconds.
pub type TimestampMs = i64;

/// Source of local (uncorrected) time.
pub trait LocalClock: Send + Sync {
    fn now_ms(&self) -> TimestampMs;
}

/// The operating system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl LocalClock for SystemClock {
    fn now_ms(&self) -> TimestampMs {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// A settable clock for deterministic tests and simulation.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: TimestampMs) -> Self {
        Self {
            now: AtomicI64::new(start_ms),
        }
    }

    pub fn set(&self, now_ms: TimestampMs) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance_ms(&self, delta_ms: i64) {
        self.now.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl LocalClock for ManualClock {
    fn now_ms(&self) -> TimestampMs {
        self.now.load(Ordering::SeqCst)
    }
}

/// Result of one successful clock measurement.
///
/// Replaced wholesale on every sync; never merged with a previous value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ClockOffset {
    /// Signed correction added to local time
    pub offset_ms: i64,
    /// Corrected time at which the measurement was applied (0 = never synced)
    pub last_synced_at_ms: TimestampMs,
    /// Round trip of the exchange that produced the offset
    pub round_trip_ms: i64,
}

impl ClockOffset {
    /// Offset for `(t0, ts, t1)`: `ts + (t1 - t0) / 2 - t1`.
    pub fn compute(t0: TimestampMs, ts: TimestampMs, t1: TimestampMs) -> i64 {
        ts + (t1 - t0) / 2 - t1
    }

    pub fn is_synced(&self) -> bool {
        self.last_synced_at_ms != 0
    }
}

/// Read side of the application clock shared by every timestamp producer.
///
/// Readers load a complete [`ClockOffset`] snapshot; the writer swaps in a new
/// one. No reader ever sees a half-updated offset.
pub struct CorrectedClock {
    local: Arc<dyn LocalClock>,
    offset: ArcSwap<ClockOffset>,
}

impl CorrectedClock {
    pub fn new(local: Arc<dyn LocalClock>) -> Self {
        Self {
            local,
            offset: ArcSwap::from_pointee(ClockOffset::default()),
        }
    }

    /// Corrected clock over the system wall clock.
    pub fn system() -> Self {
        Self::new(Arc::new(SystemClock))
    }

    /// Corrected current time. Pure read, never touches the OS clock.
    pub fn now(&self) -> TimestampMs {
        self.local.now_ms() + self.offset.load().offset_ms
    }

    /// Uncorrected local time, used for round-trip measurement.
    pub fn local_now(&self) -> TimestampMs {
        self.local.now_ms()
    }

    /// Current offset snapshot.
    pub fn offset(&self) -> ClockOffset {
        **self.offset.load()
    }

    pub(crate) fn publish(&self, offset: ClockOffset) {
        self.offset.store(Arc::new(offset));
    }
}

impl std::fmt::Debug for CorrectedClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrectedClock")
            .field("offset", &self.offset())
            .finish()
    }
}
