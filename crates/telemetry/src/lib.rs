//! VitalGuard telemetry delivery.
//!
//! Sensor readings are grouped into [`TelemetryBatch`]es, signed with the
//! device's Active ClientAuth key and delivered over a mutually
//! authenticated session by [`TelemetryTransport`]. Delivery is
//! at-least-once: a batch leaves the [`BatchQueue`] only when the server
//! acknowledges its `batch_id`.
//!
//! When the in-memory queue is full the oldest unsent batches spill to an
//! encrypted SQLite store instead of being dropped.

pub mod batch;
pub mod breaker;
pub mod error;
pub mod queue;
pub mod session;
pub mod transport;

pub use batch::{Reading, SignedBatch, TelemetryBatch, MAX_READINGS_PER_BATCH};
pub use breaker::{BreakerState, CircuitBreaker};
pub use error::{TelemetryError, TelemetryResult};
pub use queue::{BatchQueue, EnqueueOutcome, SpillStore};
pub use session::{
    BatchResponse, ClientHello, Rejection, SessionState, SessionStateMachine, SessionTransition,
    TelemetryChannel, TelemetrySession,
};
pub use transport::TelemetryTransport;
