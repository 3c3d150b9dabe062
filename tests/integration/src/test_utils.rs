//! Test utilities for end-to-end device tests
//!
//! [`MockCentral`] plays the central server (registration authority, time
//! server, telemetry sink) with scriptable faults. [`TestDevice`] wires the
//! full device stack against it on disk, the way the node binary does.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use vitalguard_core::config::{
    CertificateConfig, ClockConfig, DeviceConfig, RetryConfig, TelemetryConfig,
};
use vitalguard_core::{
    AuditChain, ChannelError, ClockSync, ClockSyncChannel, ClockSyncReply, ClockSyncRequest,
    CorrectedClock, EnqueueMode, LocalClock, ManualClock, NotificationBus, TimestampMs,
};
use vitalguard_crypto::{verify_signature, DeviceKeyPair, KdfParams, KeyManager, Sealer, StaticSecret};
use vitalguard_identity::{
    Certificate, CertificateAuthority, CertificateManager, CertificateStore, CertificateType,
    ChannelIssuer, DeviceRegistration, HardwareInfo, IdentityStore, RefusalCode,
    RegistrationChannel, RegistrationGrant, RegistrationRequest, RegistrationResponse,
    RenewalRequest, RenewalResponse, TrustAnchors,
};
use vitalguard_telemetry::{
    BatchQueue, BatchResponse, ClientHello, Reading, Rejection, SignedBatch, SpillStore,
    TelemetryBatch, TelemetryChannel, TelemetrySession, TelemetryTransport,
};

pub const NOW: TimestampMs = 1_700_000_000_000;
pub const DAY_MS: i64 = 24 * 60 * 60 * 1000;
pub const DEVICE_SECRET: &[u8] = b"integration-device-secret";

const ISSUER: &str = "vitalguard-test-ca";
const CERT_VALIDITY_MS: i64 = 90 * DAY_MS;

/// Scratch directory removed on drop. Survives device restarts within a test.
pub struct TestDir {
    path: PathBuf,
}

impl TestDir {
    pub fn new() -> Self {
        let path = std::env::temp_dir().join(format!("vitalguard-it-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&path).expect("create test dir");
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Default for TestDir {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TestDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Scriptable central server.
///
/// Its notion of time is the shared [`ManualClock`] plus a configurable skew,
/// so a test can move device and server time together.
pub struct MockCentral {
    ca: Mutex<CertificateAuthority>,
    ca_public_key: Vec<u8>,
    server_key: DeviceKeyPair,
    server_cert: Certificate,
    clock: Arc<ManualClock>,
    skew_ms: AtomicI64,
    registration_calls: AtomicU32,
    registration_outages: AtomicU32,
    refusal: Mutex<Option<RefusalCode>>,
    telemetry_online: AtomicBool,
    acks_to_drop: AtomicU32,
    received: Arc<Mutex<Vec<String>>>,
    sessions: AtomicU32,
}

impl MockCentral {
    pub fn new() -> Arc<Self> {
        let clock = Arc::new(ManualClock::new(NOW));
        let mut ca = CertificateAuthority::new(ISSUER);
        let ca_public_key = ca.public_key();
        let server_key = DeviceKeyPair::generate();
        let server_cert = ca.issue(
            CertificateType::ServerTrust,
            "central.test",
            server_key.public_key().to_vec(),
            NOW - DAY_MS,
            NOW + CERT_VALIDITY_MS,
        );
        Arc::new(Self {
            ca: Mutex::new(ca),
            ca_public_key,
            server_key,
            server_cert,
            clock,
            skew_ms: AtomicI64::new(0),
            registration_calls: AtomicU32::new(0),
            registration_outages: AtomicU32::new(0),
            refusal: Mutex::new(None),
            telemetry_online: AtomicBool::new(true),
            acks_to_drop: AtomicU32::new(0),
            received: Arc::new(Mutex::new(Vec::new())),
            sessions: AtomicU32::new(0),
        })
    }

    /// Wall clock shared with every device booted against this server.
    pub fn clock(&self) -> Arc<ManualClock> {
        self.clock.clone()
    }

    pub fn trust_anchors(&self) -> TrustAnchors {
        let mut anchors = TrustAnchors::new();
        anchors.add(ISSUER, self.ca_public_key.clone());
        anchors
    }

    pub fn set_skew_ms(&self, skew_ms: i64) {
        self.skew_ms.store(skew_ms, Ordering::SeqCst);
    }

    /// Fail the next `n` registration exchanges as unreachable.
    pub fn fail_registrations(&self, n: u32) {
        self.registration_outages.store(n, Ordering::SeqCst);
    }

    pub fn refuse_registrations(&self, code: RefusalCode) {
        *self.refusal.lock().expect("refusal lock") = Some(code);
    }

    pub fn registration_calls(&self) -> u32 {
        self.registration_calls.load(Ordering::SeqCst)
    }

    pub fn set_telemetry_online(&self, online: bool) {
        self.telemetry_online.store(online, Ordering::SeqCst);
    }

    /// Swallow the acks for the next `n` batches.
    pub fn drop_acks(&self, n: u32) {
        self.acks_to_drop.store(n, Ordering::SeqCst);
    }

    /// Every batch id received, duplicates included, in arrival order.
    pub fn received(&self) -> Vec<String> {
        self.received.lock().expect("received lock").clone()
    }

    pub fn distinct_received(&self) -> usize {
        let mut ids = self.received();
        ids.sort();
        ids.dedup();
        ids.len()
    }

    pub fn sessions_opened(&self) -> u32 {
        self.sessions.load(Ordering::SeqCst)
    }

    pub fn server_now(&self) -> TimestampMs {
        self.clock.now_ms() + self.skew_ms.load(Ordering::SeqCst)
    }

    fn issue(&self, cert_type: CertificateType, subject: &str, public_key: Vec<u8>) -> Certificate {
        let now = self.server_now();
        self.ca.lock().expect("ca lock").issue(
            cert_type,
            subject,
            public_key,
            now - 60_000,
            now + CERT_VALIDITY_MS,
        )
    }
}

#[async_trait]
impl RegistrationChannel for MockCentral {
    async fn register(
        &self,
        request: RegistrationRequest,
    ) -> Result<RegistrationResponse, ChannelError> {
        self.registration_calls.fetch_add(1, Ordering::SeqCst);
        if self
            .registration_outages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ChannelError::Unavailable("registration service down".into()));
        }
        if let Some(code) = *self.refusal.lock().expect("refusal lock") {
            return Ok(RegistrationResponse::Refused {
                code,
                message: "refused by test".into(),
            });
        }

        let device_id = format!("vg-{}", request.hardware.serial_number.to_lowercase());
        let client_certificate =
            self.issue(CertificateType::ClientAuth, &device_id, request.public_key);
        Ok(RegistrationResponse::Granted(RegistrationGrant {
            device_id,
            auth_token: "token-1".into(),
            token_expires_at_ms: self.server_now() + 30 * DAY_MS,
            client_certificate,
            server_trust: Some(self.server_cert.clone()),
        }))
    }

    async fn renew(&self, request: RenewalRequest) -> Result<RenewalResponse, ChannelError> {
        let public_key = match request.cert_type {
            CertificateType::ServerTrust => self.server_key.public_key().to_vec(),
            _ => match request.public_key {
                Some(key) => key,
                None => {
                    return Ok(RenewalResponse::Refused {
                        code: RefusalCode::InvalidMetadata,
                        message: "public key required".into(),
                    })
                }
            },
        };
        Ok(RenewalResponse::Issued(self.issue(
            request.cert_type,
            &request.subject,
            public_key,
        )))
    }
}

#[async_trait]
impl ClockSyncChannel for MockCentral {
    async fn exchange(&self, _request: ClockSyncRequest) -> Result<ClockSyncReply, ChannelError> {
        Ok(ClockSyncReply {
            server_time_ms: self.server_now(),
        })
    }
}

#[async_trait]
impl TelemetryChannel for MockCentral {
    async fn connect(&self, hello: ClientHello) -> Result<Box<dyn TelemetrySession>, ChannelError> {
        if !self.telemetry_online.load(Ordering::SeqCst) {
            return Err(ChannelError::Unavailable("telemetry endpoint down".into()));
        }
        hello
            .verify_possession()
            .map_err(|e| ChannelError::Protocol(e.to_string()))?;
        verify_signature(
            &self.ca_public_key,
            &hello.certificate.canonical_bytes(),
            &hello.certificate.signature,
        )
        .map_err(|_| ChannelError::Protocol("unknown client certificate".into()))?;

        self.sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSession {
            received: self.received.clone(),
            acks_to_drop: self.acks_to_drop.swap(0, Ordering::SeqCst),
            peer: self.server_cert.clone(),
            client_key: hello.certificate.public_key,
            responses: VecDeque::new(),
        }))
    }
}

struct MockSession {
    received: Arc<Mutex<Vec<String>>>,
    acks_to_drop: u32,
    peer: Certificate,
    client_key: Vec<u8>,
    responses: VecDeque<BatchResponse>,
}

#[async_trait]
impl TelemetrySession for MockSession {
    fn peer_certificate(&self) -> &Certificate {
        &self.peer
    }

    async fn send(&mut self, batch: &SignedBatch) -> Result<(), ChannelError> {
        let batch_id = batch.batch.batch_id.clone();
        if let Err(e) = batch.verify(&self.client_key) {
            self.responses.push_back(BatchResponse::Rejected {
                batch_id,
                reason: Rejection::Malformed,
                detail: e.to_string(),
            });
            return Ok(());
        }
        self.received
            .lock()
            .map_err(|_| ChannelError::Unavailable("mock state poisoned".into()))?
            .push(batch_id.clone());
        if self.acks_to_drop > 0 {
            self.acks_to_drop -= 1;
            return Ok(());
        }
        self.responses.push_back(BatchResponse::Ack { batch_id });
        Ok(())
    }

    async fn next_response(&mut self) -> Result<BatchResponse, ChannelError> {
        match self.responses.pop_front() {
            Some(response) => Ok(response),
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) {
        self.responses.clear();
    }
}

pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        base_delay_ms: 5,
        max_delay_ms: 20,
        jitter: 0.0,
        max_attempts: 4,
    }
}

pub fn fast_telemetry() -> TelemetryConfig {
    TelemetryConfig {
        queue_capacity: 2,
        spill_capacity: 64,
        enqueue_mode: EnqueueMode::Reject,
        connect_timeout_ms: 500,
        ack_timeout_ms: 150,
        max_batch_attempts: 10,
        batch_retention_secs: 24 * 60 * 60,
        breaker_failure_threshold: 50,
        breaker_reset_secs: 1,
    }
}

pub fn device_config() -> DeviceConfig {
    DeviceConfig {
        serial_number: "SN-IT-001".into(),
        model: "VG-BEDSIDE-1".into(),
        firmware_version: "2.4.1".into(),
    }
}

/// The full device stack against a [`MockCentral`], persisted under a
/// [`TestDir`]. Dropping it and booting again in the same directory is a
/// device restart.
pub struct TestDevice {
    pub clock: Arc<CorrectedClock>,
    pub notifications: NotificationBus,
    pub audit: Arc<AuditChain>,
    pub clock_sync: ClockSync,
    pub certificates: Arc<CertificateManager>,
    pub registration: DeviceRegistration,
    pub queue: Arc<BatchQueue>,
    pub transport: Arc<TelemetryTransport>,
    pub cancel: CancellationToken,
    _keys: KeyManager,
}

impl TestDevice {
    pub fn boot(dir: &TestDir, central: &Arc<MockCentral>) -> Self {
        Self::boot_with(dir, central, fast_telemetry())
    }

    pub fn boot_with(dir: &TestDir, central: &Arc<MockCentral>, telemetry: TelemetryConfig) -> Self {
        let local: Arc<dyn LocalClock> = central.clock();
        let clock = Arc::new(CorrectedClock::new(local));
        let notifications = NotificationBus::default();
        let retry = fast_retry().policy();

        let keys = KeyManager::new(
            dir.path().join("datastore.salt"),
            KdfParams {
                iterations: 1,
                memory_kib: 64,
                lanes: 1,
            },
            Box::new(StaticSecret::new(DEVICE_SECRET)),
        );
        let key = keys.get_or_create_key().expect("datastore key");

        let audit = Arc::new(
            AuditChain::open(dir.path().join("audit.db"), clock.clone(), notifications.clone())
                .expect("open audit chain"),
        );

        let clock_sync = ClockSync::new(
            central.clone(),
            clock.clone(),
            audit.clone(),
            notifications.clone(),
            retry.clone(),
            ClockConfig::default(),
        );

        let cert_path = dir.path().join("certificates.db");
        let store = Arc::new(
            CertificateStore::open(&cert_path, Sealer::new(key.clone())).expect("certificate store"),
        );
        let identity = Arc::new(
            IdentityStore::open(&cert_path, Sealer::new(key.clone())).expect("identity store"),
        );
        let channel: Arc<dyn RegistrationChannel> = central.clone();
        let certificates = Arc::new(
            CertificateManager::new(
                store,
                central.trust_anchors(),
                Arc::new(ChannelIssuer::new(channel.clone(), identity.clone())),
                clock.clone(),
                audit.clone(),
                notifications.clone(),
                retry.clone(),
                &CertificateConfig::default(),
            )
            .expect("certificate manager"),
        );
        let registration = DeviceRegistration::new(
            channel,
            identity,
            certificates.clone(),
            clock.clone(),
            audit.clone(),
            notifications.clone(),
            retry.clone(),
            HardwareInfo::from(&device_config()),
            Duration::from_secs(1),
        )
        .expect("device registration");

        let spill = SpillStore::open(dir.path().join("spill.db"), Sealer::new(key))
            .expect("spill store");
        let queue = Arc::new(BatchQueue::new(
            spill,
            telemetry.queue_capacity,
            telemetry.spill_capacity,
            telemetry.enqueue_mode,
        ));
        let transport = Arc::new(TelemetryTransport::new(
            queue.clone(),
            central.clone(),
            certificates.clone(),
            clock.clone(),
            audit.clone(),
            notifications.clone(),
            retry,
            &telemetry,
        ));

        Self {
            clock,
            notifications,
            audit,
            clock_sync,
            certificates,
            registration,
            queue,
            transport,
            cancel: CancellationToken::new(),
            _keys: keys,
        }
    }

    pub async fn register(&self) -> String {
        self.registration
            .register_device(false, &self.cancel)
            .await
            .expect("registration")
            .device_id
    }

    /// Run the telemetry transport in the background until [`Self::stop`].
    pub fn start_telemetry(&self) -> JoinHandle<()> {
        let transport = self.transport.clone();
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            if let Err(e) = transport.run(cancel).await {
                tracing::error!(error = %e, "telemetry transport stopped with error");
            }
        })
    }

    pub async fn stop(&self, handle: JoinHandle<()>) {
        self.cancel.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
    }

    pub fn batch(&self, device_id: &str, value: i64) -> TelemetryBatch {
        let now = self.clock.now();
        TelemetryBatch::new(device_id, vec![Reading::new("heart_rate", now, value.into())], now)
            .expect("batch")
    }
}
