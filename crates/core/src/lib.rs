//! Core functionality for the VitalGuard bedside device trust stack.
//!
//! This crate provides the shared error taxonomy, configuration, logging,
//! retry policy, corrected time and the tamper-evident audit chain used
//! across the VitalGuard crates.

pub mod audit;
pub mod backoff;
pub mod channel;
pub mod clock;
pub mod clock_sync;
pub mod config;
pub mod error;
pub mod logging;
pub mod notify;

pub use audit::{AuditChain, AuditEntry, AuditError, AuditEventType, ChainHealth};
pub use backoff::{RetryError, RetryPolicy};
pub use channel::{with_timeout, ChannelError};
pub use clock::{ClockOffset, CorrectedClock, LocalClock, ManualClock, SystemClock, TimestampMs};
pub use clock_sync::{ClockSync, ClockSyncChannel, ClockSyncError, ClockSyncReply, ClockSyncRequest};
pub use config::{EnqueueMode, NodeConfig};
pub use error::{Classify, Error, ErrorClass, Result};
pub use notify::{Notification, NotificationBus};
