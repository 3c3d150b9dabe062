//! Application-level clock synchronization against the central server.
//!
//! A sync records local send time `t0`, the server's reply time `ts` and the
//! local receive time `t1`, then publishes `offset = ts + (t1 - t0)/2 - t1`
//! into the shared [`CorrectedClock`]. The OS clock is never touched.

use crate::audit::{AuditChain, AuditError, AuditEventType};
use crate::backoff::{RetryError, RetryPolicy};
use crate::channel::{with_timeout, ChannelError};
use crate::clock::{ClockOffset, CorrectedClock, TimestampMs};
use crate::config::ClockConfig;
use crate::error::{Classify, ErrorClass};
use crate::notify::{Notification, NotificationBus};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockSyncRequest {
    pub client_send_ms: TimestampMs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockSyncReply {
    pub server_time_ms: TimestampMs,
}

/// Network collaborator answering time requests.
#[async_trait]
pub trait ClockSyncChannel: Send + Sync {
    async fn exchange(&self, request: ClockSyncRequest) -> Result<ClockSyncReply, ChannelError>;
}

#[derive(Debug, Error)]
pub enum ClockSyncError {
    #[error("Clock sync channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Clock sync reply rejected: {0}")]
    InvalidReply(String),

    #[error("Clock sync failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: Box<ClockSyncError> },

    #[error("Clock sync cancelled")]
    Cancelled,

    #[error("Audit append failed: {0}")]
    Audit(#[from] AuditError),
}

impl Classify for ClockSyncError {
    fn class(&self) -> ErrorClass {
        match self {
            ClockSyncError::Channel(e) => e.class(),
            ClockSyncError::InvalidReply(_) => ErrorClass::Validation,
            ClockSyncError::Exhausted { .. } | ClockSyncError::Cancelled => ErrorClass::Transient,
            ClockSyncError::Audit(e) => e.class(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Measurement {
    t0: TimestampMs,
    ts: TimestampMs,
    t1: TimestampMs,
}

/// Sanity bounds on one exchange.
fn validate_reply(
    t0: TimestampMs,
    ts: TimestampMs,
    t1: TimestampMs,
    max_round_trip_ms: i64,
) -> Result<(), ClockSyncError> {
    if t1 < t0 {
        return Err(ClockSyncError::InvalidReply(format!(
            "receive time {} precedes send time {}",
            t1, t0
        )));
    }
    if t1 - t0 > max_round_trip_ms {
        return Err(ClockSyncError::InvalidReply(format!(
            "round trip {} ms exceeds limit of {} ms",
            t1 - t0,
            max_round_trip_ms
        )));
    }
    if ts <= 0 {
        return Err(ClockSyncError::InvalidReply(format!(
            "server time {} is not a valid epoch timestamp",
            ts
        )));
    }
    Ok(())
}

/// Sole writer of the corrected clock offset.
pub struct ClockSync {
    channel: Arc<dyn ClockSyncChannel>,
    clock: Arc<CorrectedClock>,
    audit: Arc<AuditChain>,
    notifications: NotificationBus,
    retry: RetryPolicy,
    config: ClockConfig,
}

impl ClockSync {
    pub fn new(
        channel: Arc<dyn ClockSyncChannel>,
        clock: Arc<CorrectedClock>,
        audit: Arc<AuditChain>,
        notifications: NotificationBus,
        retry: RetryPolicy,
        config: ClockConfig,
    ) -> Self {
        Self {
            channel,
            clock,
            audit,
            notifications,
            retry,
            config,
        }
    }

    /// Corrected current time.
    pub fn now(&self) -> TimestampMs {
        self.clock.now()
    }

    /// Offset currently in effect.
    pub fn offset(&self) -> ClockOffset {
        self.clock.offset()
    }

    /// Perform one synchronization, retrying transient failures.
    pub async fn sync(&self) -> Result<ClockOffset, ClockSyncError> {
        self.sync_until(&CancellationToken::new()).await
    }

    /// Like [`ClockSync::sync`], but stops retrying once `cancel` fires.
    ///
    /// On any failure the previous offset stays in effect.
    pub async fn sync_until(&self, cancel: &CancellationToken) -> Result<ClockOffset, ClockSyncError> {
        let outcome = self
            .retry
            .run(cancel, "clock_sync", |_| self.measure_once())
            .await;

        match outcome {
            Ok(measurement) => self.apply(measurement),
            Err(RetryError::Cancelled { .. }) => Err(ClockSyncError::Cancelled),
            Err(RetryError::Permanent { attempts, error }) => {
                let event = match error {
                    ClockSyncError::InvalidReply(_) => AuditEventType::ClockSyncRejected,
                    _ => AuditEventType::ClockSyncFailed,
                };
                warn!(error = %error, attempts, "Clock sync reply rejected");
                self.audit.append(
                    event,
                    &json!({ "reason": error.to_string(), "attempts": attempts }),
                )?;
                Err(error)
            }
            Err(RetryError::Exhausted { attempts, last }) => {
                warn!(error = %last, attempts, "Clock sync failed, keeping previous offset");
                self.audit.append(
                    AuditEventType::ClockSyncFailed,
                    &json!({ "reason": last.to_string(), "attempts": attempts }),
                )?;
                Err(ClockSyncError::Exhausted {
                    attempts,
                    last: Box::new(last),
                })
            }
        }
    }

    async fn measure_once(&self) -> Result<Measurement, ClockSyncError> {
        let t0 = self.clock.local_now();
        let reply = with_timeout(
            self.config.exchange_timeout(),
            "clock sync exchange",
            self.channel.exchange(ClockSyncRequest { client_send_ms: t0 }),
        )
        .await?;
        let t1 = self.clock.local_now();

        validate_reply(t0, reply.server_time_ms, t1, self.config.max_round_trip_ms)?;
        Ok(Measurement {
            t0,
            ts: reply.server_time_ms,
            t1,
        })
    }

    fn apply(&self, m: Measurement) -> Result<ClockOffset, ClockSyncError> {
        let previous = self.clock.offset();
        let offset_ms = ClockOffset::compute(m.t0, m.ts, m.t1);
        let offset = ClockOffset {
            offset_ms,
            last_synced_at_ms: m.t1 + offset_ms,
            round_trip_ms: m.t1 - m.t0,
        };

        self.clock.publish(offset);

        let jump = (offset_ms - previous.offset_ms).abs();
        if jump > self.config.jump_threshold_ms {
            warn!(
                previous_offset_ms = previous.offset_ms,
                offset_ms, "Clock offset jumped beyond threshold"
            );
            self.notifications.publish(Notification::ClockOffsetJumped {
                previous_offset_ms: previous.offset_ms,
                new_offset_ms: offset_ms,
            });
            self.audit.append(
                AuditEventType::ClockOffsetJumped,
                &json!({
                    "previous_offset_ms": previous.offset_ms,
                    "offset_ms": offset_ms,
                    "threshold_ms": self.config.jump_threshold_ms,
                }),
            )?;
        }

        self.audit.append(
            AuditEventType::ClockSynced,
            &json!({
                "offset_ms": offset.offset_ms,
                "round_trip_ms": offset.round_trip_ms,
            }),
        )?;

        debug!(
            offset_ms = offset.offset_ms,
            round_trip_ms = offset.round_trip_ms,
            "Clock offset applied"
        );
        Ok(offset)
    }

    /// Sync immediately, then once per configured interval until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(interval_secs = self.config.sync_interval_secs, "Clock sync task started");
        loop {
            match self.sync_until(&cancel).await {
                Ok(offset) => info!(offset_ms = offset.offset_ms, "Clock synchronized"),
                Err(ClockSyncError::Cancelled) => break,
                Err(e) => warn!(error = %e, "Clock sync unsuccessful, previous offset retained"),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.sync_interval()) => {}
            }
        }
        info!("Clock sync task stopped");
    }
}
