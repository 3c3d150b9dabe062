//! Telemetry delivery over mutually authenticated sessions.
//!
//! The drain loop takes batches from the [`BatchQueue`], opens a session with
//! the Active ClientAuth certificate, checks the server against the Active
//! ServerTrust certificate and streams batches one at a time. A batch leaves
//! the queue only on a positive acknowledgment carrying its id; a missing ack
//! puts it back for another attempt, so delivery is at-least-once and the
//! server is expected to dedupe by `batch_id`.
//!
//! Every session state change is audited. The session faults immediately if
//! the client certificate is revoked, superseded or expires mid-session, and
//! the next connect picks up whatever certificate is Active by then.

use crate::batch::{SignedBatch, TelemetryBatch};
use crate::breaker::{BreakerState, CircuitBreaker};
use crate::error::{TelemetryError, TelemetryResult};
use crate::queue::{BatchQueue, EnqueueOutcome};
use crate::session::{
    BatchResponse, ClientHello, Rejection, SessionState, SessionStateMachine, TelemetryChannel,
    TelemetrySession,
};
use serde_json::json;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vitalguard_core::config::TelemetryConfig;
use vitalguard_core::{
    with_timeout, AuditChain, AuditEventType, Classify, CorrectedClock, ErrorClass, Notification,
    NotificationBus, RetryPolicy,
};
use vitalguard_identity::{CertificateManager, CertificateStatus, ClientCredentials};

/// How often an idle session re-checks its client certificate.
const CREDENTIAL_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// How one delivery attempt ended.
#[derive(Debug)]
enum Delivery {
    Acked,
    /// Removed without delivery (abandoned or rejected as malformed)
    Dropped,
    TimedOut,
    RateLimited,
    Fault(String),
}

#[derive(Debug)]
enum SessionEnd {
    Shutdown,
    Faulted(String),
}

pub struct TelemetryTransport {
    queue: Arc<BatchQueue>,
    channel: Arc<dyn TelemetryChannel>,
    certificates: Arc<CertificateManager>,
    clock: Arc<CorrectedClock>,
    audit: Arc<AuditChain>,
    notifications: NotificationBus,
    retry: RetryPolicy,
    connect_timeout: Duration,
    ack_timeout: Duration,
    max_batch_attempts: u32,
    batch_retention: Duration,
    machine: Mutex<SessionStateMachine>,
    breaker: Mutex<CircuitBreaker>,
}

impl TelemetryTransport {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<BatchQueue>,
        channel: Arc<dyn TelemetryChannel>,
        certificates: Arc<CertificateManager>,
        clock: Arc<CorrectedClock>,
        audit: Arc<AuditChain>,
        notifications: NotificationBus,
        retry: RetryPolicy,
        config: &TelemetryConfig,
    ) -> Self {
        Self {
            queue,
            channel,
            certificates,
            clock,
            audit,
            notifications,
            retry,
            connect_timeout: config.connect_timeout(),
            ack_timeout: config.ack_timeout(),
            max_batch_attempts: config.max_batch_attempts.max(1),
            batch_retention: config.batch_retention(),
            machine: Mutex::new(SessionStateMachine::new()),
            breaker: Mutex::new(CircuitBreaker::new(
                config.breaker_failure_threshold,
                config.breaker_reset(),
            )),
        }
    }

    /// Queue a batch for delivery. Waits or fails with `QueueFull` per the
    /// queue's enqueue mode once memory and spill storage are both full.
    pub async fn enqueue(&self, batch: TelemetryBatch) -> TelemetryResult<EnqueueOutcome> {
        let outcome = self.queue.enqueue(batch).await?;
        if let Some(batch_id) = outcome.spilled_batch() {
            self.audit
                .append(AuditEventType::BatchSpilled, &json!({ "batch_id": batch_id }))?;
        }
        Ok(outcome)
    }

    pub fn state(&self) -> TelemetryResult<SessionState> {
        Ok(self.machine()?.current())
    }

    pub fn subscribe_state(&self) -> TelemetryResult<watch::Receiver<SessionState>> {
        Ok(self.machine()?.subscribe())
    }

    pub fn breaker_state(&self) -> TelemetryResult<BreakerState> {
        Ok(self.breaker()?.state())
    }

    /// Batches not yet acknowledged, in memory and spilled.
    pub fn queue_len(&self) -> TelemetryResult<usize> {
        self.queue.len()
    }

    pub fn queue(&self) -> &Arc<BatchQueue> {
        &self.queue
    }

    fn machine(&self) -> TelemetryResult<MutexGuard<'_, SessionStateMachine>> {
        self.machine.lock().map_err(|_| TelemetryError::LockPoisoned)
    }

    fn breaker(&self) -> TelemetryResult<MutexGuard<'_, CircuitBreaker>> {
        self.breaker.lock().map_err(|_| TelemetryError::LockPoisoned)
    }

    fn set_state(&self, to: SessionState, reason: Option<String>) -> TelemetryResult<()> {
        let transition = {
            let mut machine = self.machine()?;
            if machine.current() == to {
                return Ok(());
            }
            machine.transition(to, self.clock.now(), reason)?
        };

        let event_type = match to {
            SessionState::Connecting => AuditEventType::SessionConnecting,
            SessionState::Authenticated => AuditEventType::SessionAuthenticated,
            SessionState::Streaming => AuditEventType::SessionStreaming,
            SessionState::Disconnected => AuditEventType::SessionDisconnected,
            SessionState::Faulted => AuditEventType::SessionFaulted,
        };
        self.audit.append(
            event_type,
            &json!({
                "from": transition.from,
                "to": transition.to,
                "reason": transition.reason,
            }),
        )?;

        if to == SessionState::Faulted {
            warn!(from = %transition.from, reason = ?transition.reason, "Telemetry session faulted");
        } else {
            info!(from = %transition.from, to = %to, "Telemetry session state changed");
        }
        Ok(())
    }

    fn alert(&self, detail: String) {
        self.notifications.publish(Notification::IntegrityAlert {
            component: "telemetry".to_string(),
            detail,
        });
    }

    fn record_failure(&self) -> TelemetryResult<bool> {
        let mut breaker = self.breaker()?;
        breaker.record_failure(tokio::time::Instant::now());
        Ok(matches!(breaker.state(), BreakerState::Open { .. }))
    }

    /// Sleep unless cancelled first. Returns false on cancellation.
    async fn pause(&self, delay: Duration, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Drain loop. Returns once `cancel` fires, after closing any session
    /// and spilling everything still queued in memory to durable storage.
    pub async fn run(&self, cancel: CancellationToken) -> TelemetryResult<()> {
        info!(queued = self.queue.len()?, "Telemetry transport started");

        let drained = self.drain(&cancel).await;
        if let Err(e) = &drained {
            error!(error = %e, "Telemetry drain loop failed");
        }

        let spilled = self.queue.spill_all()?;
        self.set_state(SessionState::Disconnected, Some("shutdown".to_string()))?;
        info!(spilled, "Telemetry transport stopped");
        drained
    }

    async fn drain(&self, cancel: &CancellationToken) -> TelemetryResult<()> {
        let mut failures: u32 = 0;
        loop {
            let wait = {
                let mut breaker = self.breaker()?;
                let now = tokio::time::Instant::now();
                (!breaker.allow(now)).then(|| breaker.remaining(now))
            };
            if let Some(wait) = wait {
                debug!(wait_ms = wait.as_millis() as u64, "Delivery circuit open, waiting");
                if !self.pause(wait, cancel).await {
                    return Ok(());
                }
                continue;
            }

            let first = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                batch = self.queue.next() => batch?,
            };

            let reason = match self.open_session().await {
                Ok((mut session, credentials)) => {
                    failures = 0;
                    let end = self
                        .stream(session.as_mut(), &credentials, first, cancel)
                        .await;
                    session.close().await;
                    match end? {
                        SessionEnd::Shutdown => return Ok(()),
                        SessionEnd::Faulted(reason) => reason,
                    }
                }
                Err(e) => {
                    self.queue.requeue(&first.batch_id)?;
                    if e.class() == ErrorClass::Fatal {
                        return Err(e);
                    }
                    self.record_failure()?;
                    e.to_string()
                }
            };

            self.set_state(SessionState::Faulted, Some(reason))?;
            let delay = self.retry.delay_for(failures);
            failures = failures.saturating_add(1);
            if !self.pause(delay, cancel).await {
                return Ok(());
            }
        }
    }

    async fn open_session(&self) -> TelemetryResult<(Box<dyn TelemetrySession>, ClientCredentials)> {
        self.set_state(SessionState::Connecting, None)?;

        let credentials = self.certificates.client_credentials()?;
        let trust = self.certificates.server_trust()?;
        let hello = ClientHello::new(&credentials, self.clock.now());

        let mut session = with_timeout(
            self.connect_timeout,
            "session handshake",
            self.channel.connect(hello),
        )
        .await?;

        let peer = session.peer_certificate();
        if peer.public_key != trust.public_key {
            let detail = format!(
                "server presented {} which does not match trusted certificate {}",
                peer.id, trust.id
            );
            session.close().await;
            self.alert(detail.clone());
            return Err(TelemetryError::PeerAuthentication(detail));
        }

        self.set_state(
            SessionState::Authenticated,
            Some(format!("client {} server {}", credentials.certificate.id, trust.id)),
        )?;
        self.set_state(SessionState::Streaming, None)?;
        Ok((session, credentials))
    }

    async fn stream(
        &self,
        session: &mut dyn TelemetrySession,
        credentials: &ClientCredentials,
        first: TelemetryBatch,
        cancel: &CancellationToken,
    ) -> TelemetryResult<SessionEnd> {
        let mut next = Some(first);
        let mut throttled: u32 = 0;
        let mut events = self.notifications.subscribe();
        let mut events_open = true;
        let mut credential_check = tokio::time::interval(CREDENTIAL_CHECK_INTERVAL);
        credential_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            let batch = match next.take() {
                Some(batch) => batch,
                None => tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(SessionEnd::Shutdown),
                    event = events.recv(), if events_open => {
                        let recheck = match event {
                            Ok(Notification::CertificateRevoked { cert_id, .. })
                            | Ok(Notification::CertificateExpired { cert_id, .. }) => {
                                cert_id == credentials.certificate.id
                            }
                            Ok(_) => false,
                            Err(broadcast::error::RecvError::Lagged(_)) => true,
                            Err(broadcast::error::RecvError::Closed) => {
                                events_open = false;
                                false
                            }
                        };
                        if recheck {
                            if let Some(reason) = self.credential_fault(credentials)? {
                                return Ok(SessionEnd::Faulted(reason));
                            }
                        }
                        continue;
                    }
                    _ = credential_check.tick() => {
                        if let Some(reason) = self.credential_fault(credentials)? {
                            return Ok(SessionEnd::Faulted(reason));
                        }
                        continue;
                    }
                    batch = self.queue.next() => batch?,
                },
            };

            match self.deliver(session, credentials, batch).await? {
                Delivery::Acked => throttled = 0,
                Delivery::Dropped | Delivery::TimedOut => {}
                Delivery::RateLimited => {
                    let delay = self.retry.delay_for(throttled);
                    throttled = throttled.saturating_add(1);
                    if !self.pause(delay, cancel).await {
                        return Ok(SessionEnd::Shutdown);
                    }
                }
                Delivery::Fault(reason) => return Ok(SessionEnd::Faulted(reason)),
            }
        }
    }

    /// Why the session's client certificate can no longer be used, if it
    /// can't. Revocation raises an integrity alert.
    fn credential_fault(&self, credentials: &ClientCredentials) -> TelemetryResult<Option<String>> {
        let cert_id = &credentials.certificate.id;
        let status = self.certificates.credential_status(cert_id)?;
        if status.is_in_service() {
            return Ok(None);
        }
        if status == CertificateStatus::Revoked {
            self.alert(format!("client certificate {} revoked mid-session", cert_id));
        }
        let failure = TelemetryError::CredentialInvalid {
            cert_id: cert_id.clone(),
            status,
        };
        Ok(Some(failure.to_string()))
    }

    /// One attempt at one batch. The batch is back in the queue unless it
    /// was acknowledged or dropped.
    async fn deliver(
        &self,
        session: &mut dyn TelemetrySession,
        credentials: &ClientCredentials,
        batch: TelemetryBatch,
    ) -> TelemetryResult<Delivery> {
        let batch_id = batch.batch_id.clone();

        if let Some(reason) = self.credential_fault(credentials)? {
            self.queue.requeue(&batch_id)?;
            return Ok(Delivery::Fault(reason));
        }

        let now = self.clock.now();
        let retention_ms = self.batch_retention.as_millis() as i64;
        if batch.attempt_count >= self.max_batch_attempts || batch.age_ms(now) > retention_ms {
            self.abandon(&batch, now)?;
            return Ok(Delivery::Dropped);
        }

        let batch = self.queue.mark_sent(&batch_id, now)?;
        let signed = SignedBatch::sign(batch, credentials, now)?;
        debug!(batch_id = %batch_id, attempt = signed.batch.attempt_count, "Sending batch");

        if let Err(e) = with_timeout(self.ack_timeout, "batch send", session.send(&signed)).await {
            self.queue.requeue(&batch_id)?;
            self.record_failure()?;
            return Ok(Delivery::Fault(format!("send failed: {}", e)));
        }

        let deadline = tokio::time::Instant::now() + self.ack_timeout;
        loop {
            let response = match tokio::time::timeout_at(deadline, session.next_response()).await {
                Err(_) => {
                    warn!(batch_id = %batch_id, "No acknowledgment before timeout, requeueing");
                    self.queue.requeue(&batch_id)?;
                    if self.record_failure()? {
                        return Ok(Delivery::Fault("delivery circuit opened".to_string()));
                    }
                    return Ok(Delivery::TimedOut);
                }
                Ok(Err(e)) => {
                    self.queue.requeue(&batch_id)?;
                    self.record_failure()?;
                    return Ok(Delivery::Fault(format!("session lost: {}", e)));
                }
                Ok(Ok(response)) => response,
            };

            if response.batch_id() != batch_id {
                self.settle_stale(response)?;
                continue;
            }

            return match response {
                BatchResponse::Ack { .. } => {
                    self.queue.acknowledge(&batch_id)?;
                    self.breaker()?.record_success();
                    debug!(batch_id = %batch_id, "Batch acknowledged");
                    Ok(Delivery::Acked)
                }
                BatchResponse::Rejected { reason, detail, .. } => {
                    self.on_rejection(&batch_id, reason, &detail)
                }
            };
        }
    }

    fn on_rejection(&self, batch_id: &str, reason: Rejection, detail: &str) -> TelemetryResult<Delivery> {
        match reason {
            Rejection::Malformed => {
                self.discard_malformed(batch_id, detail)?;
                Ok(Delivery::Dropped)
            }
            Rejection::RateLimited => {
                debug!(batch_id = %batch_id, "Server rate limited delivery");
                self.queue.requeue(batch_id)?;
                Ok(Delivery::RateLimited)
            }
            Rejection::AuthExpired => {
                self.queue.requeue(batch_id)?;
                let failure = TelemetryError::Rejected {
                    batch_id: batch_id.to_string(),
                    reason,
                };
                Ok(Delivery::Fault(failure.to_string()))
            }
        }
    }

    /// Response for a batch that is no longer the one in flight, typically an
    /// ack arriving after its timeout.
    fn settle_stale(&self, response: BatchResponse) -> TelemetryResult<()> {
        match response {
            BatchResponse::Ack { batch_id } => {
                if self.queue.acknowledge(&batch_id)?.is_some() {
                    debug!(batch_id = %batch_id, "Late acknowledgment accepted");
                }
            }
            BatchResponse::Rejected {
                batch_id,
                reason: Rejection::Malformed,
                detail,
            } => {
                if self.queue.discard(&batch_id)?.is_some() {
                    self.audit_rejection(&batch_id, &detail)?;
                }
            }
            BatchResponse::Rejected { batch_id, reason, .. } => {
                debug!(batch_id = %batch_id, reason = %reason, "Ignoring stale rejection");
            }
        }
        Ok(())
    }

    fn discard_malformed(&self, batch_id: &str, detail: &str) -> TelemetryResult<()> {
        self.queue.discard(batch_id)?;
        self.audit_rejection(batch_id, detail)
    }

    fn audit_rejection(&self, batch_id: &str, detail: &str) -> TelemetryResult<()> {
        warn!(batch_id = %batch_id, detail = %detail, "Server rejected batch as malformed, discarding");
        self.audit.append(
            AuditEventType::BatchRejected,
            &json!({
                "batch_id": batch_id,
                "reason": Rejection::Malformed,
                "detail": detail,
            }),
        )?;
        Ok(())
    }

    fn abandon(&self, batch: &TelemetryBatch, now: i64) -> TelemetryResult<()> {
        let reason = if batch.attempt_count >= self.max_batch_attempts {
            format!("no acknowledgment after {} attempts", batch.attempt_count)
        } else {
            format!("older than retention ({} ms)", batch.age_ms(now))
        };
        self.queue.discard(&batch.batch_id)?;
        warn!(batch_id = %batch.batch_id, reason = %reason, "Abandoning batch");
        self.audit.append(
            AuditEventType::BatchAbandoned,
            &json!({
                "batch_id": batch.batch_id,
                "attempts": batch.attempt_count,
                "created_at_ms": batch.created_at_ms,
                "reason": reason,
            }),
        )?;
        self.notifications.publish(Notification::TelemetryBatchAbandoned {
            batch_id: batch.batch_id.clone(),
            attempts: batch.attempt_count,
            reason,
        });
        Ok(())
    }
}
