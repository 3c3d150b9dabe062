//! VitalGuard bedside device agent.
//!
//! Wires the trust core together: datastore key, audit chain, clock sync,
//! certificate lifecycle, registration and telemetry delivery, then runs the
//! scheduled tasks until Ctrl-C.

mod simulator;

use anyhow::{bail, Context};
use rand::Rng;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use vitalguard_core::{
    logging, AuditChain, AuditEventType, ClockSync, ClockSyncChannel, Classify, CorrectedClock,
    ErrorClass, NodeConfig, Notification, NotificationBus,
};
use vitalguard_crypto::{EnvSecret, KdfParams, KeyManager, SecretSource, Sealer, StaticSecret};
use vitalguard_identity::{
    CertificateManager, CertificateStore, CertificateType, ChannelIssuer, DeviceRegistration,
    HardwareInfo, IdentityStore, RegistrationChannel, RegistrationError, TrustAnchors,
};
use vitalguard_telemetry::{
    BatchQueue, Reading, SpillStore, TelemetryBatch, TelemetryChannel, TelemetryTransport,
};

use simulator::SimulatedCentral;

const SIMULATED_READING_INTERVAL: Duration = Duration::from_secs(5);
const SIMULATOR_SECRET: &[u8] = b"vitalguard-simulator-device-secret";

#[derive(Debug, Default, PartialEq, Eq)]
struct NodeArgs {
    config_path: Option<PathBuf>,
    simulate: bool,
}

/// Network collaborators of the trust core.
struct Channels {
    registration: Arc<dyn RegistrationChannel>,
    clock: Arc<dyn ClockSyncChannel>,
    telemetry: Arc<dyn TelemetryChannel>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let args = parse_args(&args)?;
    let config = match &args.config_path {
        Some(path) => NodeConfig::from_file(path)?,
        None => NodeConfig::default(),
    };
    logging::init_with(&config.logging.level, config.logging.json);

    if !args.simulate {
        bail!("no central server channel is configured; run with --simulate to use the in-process simulator");
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        serial_number = %config.device.serial_number,
        data_dir = %config.storage.data_dir.display(),
        simulate = args.simulate,
        "VitalGuard node starting"
    );

    let secret: Box<dyn SecretSource> = match std::env::var(&config.keys.secret_env) {
        Ok(value) if !value.is_empty() => Box::new(EnvSecret::new(&config.keys.secret_env)),
        _ => {
            warn!(var = %config.keys.secret_env, "Device secret not set, using simulator secret");
            Box::new(StaticSecret::new(SIMULATOR_SECRET.to_vec()))
        }
    };
    let keys = KeyManager::new(
        config.storage.salt_path(),
        KdfParams::from(&config.keys),
        secret,
    );

    let result = run(config, &keys).await;
    keys.shutdown();
    if let Err(e) = &result {
        error!(error = %format!("{:#}", e), "VitalGuard node stopped with error");
    }
    result
}

fn parse_args(args: &[String]) -> anyhow::Result<NodeArgs> {
    let mut parsed = NodeArgs::default();
    let mut args_iter = args.iter().skip(1);
    while let Some(arg) = args_iter.next() {
        match arg.as_str() {
            "--config" => match args_iter.next() {
                Some(path) => parsed.config_path = Some(PathBuf::from(path)),
                None => bail!("--config was provided without a path"),
            },
            "--simulate" => parsed.simulate = true,
            other => bail!("unrecognized argument: {}", other),
        }
    }
    Ok(parsed)
}

async fn run(config: NodeConfig, keys: &KeyManager) -> anyhow::Result<()> {
    let key = keys
        .get_or_create_key()
        .context("deriving the datastore key")?;
    let sealer = Sealer::new(key);
    let bus = NotificationBus::default();
    let clock = Arc::new(CorrectedClock::system());

    let audit = Arc::new(
        AuditChain::open(config.storage.audit_path(), clock.clone(), bus.clone())
            .context("opening the audit chain")?,
    );
    let health = audit.health()?;
    if !health.is_ok() {
        bail!("audit chain failed its continuity check ({:?}), refusing to start", health);
    }
    if keys.created_new_salt() {
        audit.append(
            AuditEventType::KeyCreated,
            &json!({ "salt_path": config.storage.salt_path().display().to_string() }),
        )?;
    }

    let central = Arc::new(SimulatedCentral::new(0, 365)?);
    let mut cert_config = config.certificates.clone();
    cert_config.trust_anchors.push(central.anchor_config());
    let channels = Channels {
        registration: central.clone(),
        clock: central.clone(),
        telemetry: central.clone(),
    };

    let retry = config.retry.policy();
    let clock_sync = Arc::new(ClockSync::new(
        channels.clock,
        clock.clone(),
        audit.clone(),
        bus.clone(),
        retry.clone(),
        config.clock.clone(),
    ));

    let cert_store = Arc::new(CertificateStore::open(
        config.storage.certificate_path(),
        sealer.clone(),
    )?);
    let identity = Arc::new(IdentityStore::open(
        config.storage.certificate_path(),
        sealer.clone(),
    )?);
    let certificates = Arc::new(CertificateManager::new(
        cert_store,
        TrustAnchors::from_config(&cert_config.trust_anchors)?,
        Arc::new(ChannelIssuer::new(channels.registration.clone(), identity.clone())),
        clock.clone(),
        audit.clone(),
        bus.clone(),
        retry.clone(),
        &cert_config,
    )?);
    let registration = Arc::new(DeviceRegistration::new(
        channels.registration,
        identity,
        certificates.clone(),
        clock.clone(),
        audit.clone(),
        bus.clone(),
        retry.clone(),
        HardwareInfo::from(&config.device),
        config.registration.timeout(),
    )?);

    let queue = Arc::new(BatchQueue::new(
        SpillStore::open(config.storage.spill_path(), sealer)?,
        config.telemetry.queue_capacity,
        config.telemetry.spill_capacity,
        config.telemetry.enqueue_mode,
    ));
    let transport = Arc::new(TelemetryTransport::new(
        queue,
        channels.telemetry,
        certificates.clone(),
        clock.clone(),
        audit.clone(),
        bus.clone(),
        retry.clone(),
        &config.telemetry,
    ));

    let root = CancellationToken::new();
    {
        let root = root.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Shutdown requested"),
                Err(e) => error!(error = %e, "Failed to listen for Ctrl-C, shutting down"),
            }
            root.cancel();
        });
    }

    let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

    tasks.push(("notifications", {
        let mut rx = bus.subscribe();
        let token = root.child_token();
        tokio::spawn(async move {
            loop {
                let notification = tokio::select! {
                    _ = token.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(n) => n,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Operator notifications dropped");
                            continue;
                        }
                        Err(_) => break,
                    },
                };
                surface(&notification);
            }
        })
    }));

    // first sync before anything is timestamped against the server
    if let Err(e) = clock_sync.sync_until(&root).await {
        warn!(error = %e, "Initial clock sync failed, starting with local time");
    }

    tasks.push(("clock_sync", {
        let clock_sync = clock_sync.clone();
        let token = root.child_token();
        let interval = config.clock.sync_interval();
        tokio::spawn(async move {
            let cancelled = tokio::select! {
                _ = token.cancelled() => true,
                _ = tokio::time::sleep(interval) => false,
            };
            if !cancelled {
                clock_sync.run(token).await;
            }
        })
    }));

    tasks.push(("registration", {
        let registration = registration.clone();
        let certificates = certificates.clone();
        let token = root.child_token();
        let pause = retry.max_delay;
        tokio::spawn(async move {
            ensure_registered(&registration, &certificates, pause, &token).await;
        })
    }));

    tasks.push(("certificates", {
        let certificates = certificates.clone();
        let token = root.child_token();
        let interval = cert_config.check_interval();
        tokio::spawn(async move { certificates.run(interval, token).await })
    }));

    tasks.push(("telemetry", {
        let transport = transport.clone();
        let token = root.child_token();
        tokio::spawn(async move {
            if let Err(e) = transport.run(token).await {
                error!(error = %e, class = %e.class(), "Telemetry transport failed");
            }
        })
    }));

    tasks.push(("sensor_feed", {
        let transport = transport.clone();
        let registration = registration.clone();
        let clock = clock.clone();
        let token = root.child_token();
        tokio::spawn(async move {
            simulate_readings(&transport, &registration, &clock, &token).await;
        })
    }));

    info!(tasks = tasks.len(), "VitalGuard node running");
    root.cancelled().await;

    for (name, handle) in tasks {
        if let Err(e) = handle.await {
            error!(task = name, error = %e, "Task ended abnormally");
        }
    }

    info!(
        audit_entries = audit.len()?,
        delivered = central.delivered_count(),
        "VitalGuard node stopped"
    );
    Ok(())
}

/// Register when no ClientAuth certificate is in service, retrying until it
/// works, the server refuses for good, or shutdown.
async fn ensure_registered(
    registration: &DeviceRegistration,
    certificates: &CertificateManager,
    pause: Duration,
    cancel: &CancellationToken,
) {
    while certificates.active(CertificateType::ClientAuth).is_none() {
        match registration.register_device(false, cancel).await {
            Ok(identity) => {
                info!(device_id = %identity.device_id, "Device registered");
                return;
            }
            Err(RegistrationError::Cancelled) => return,
            Err(e) if matches!(e.class(), ErrorClass::Validation | ErrorClass::Fatal) => {
                error!(error = %e, class = %e.class(), "Registration cannot proceed");
                return;
            }
            Err(e) => warn!(error = %e, "Registration failed, will retry"),
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(pause) => {}
        }
    }
}

/// Stand-in sensor source for simulation.
async fn simulate_readings(
    transport: &TelemetryTransport,
    registration: &DeviceRegistration,
    clock: &CorrectedClock,
    cancel: &CancellationToken,
) {
    let mut ticker = tokio::time::interval(SIMULATED_READING_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let device_id = match registration.device_identity() {
            Ok(Some(identity)) => identity.device_id,
            Ok(None) => continue,
            Err(e) => {
                warn!(error = %e, "Cannot read device identity");
                continue;
            }
        };

        let now = clock.now();
        let readings = {
            let mut rng = rand::thread_rng();
            vec![
                Reading::new("heart_rate", now, json!({ "bpm": rng.gen_range(58..96) })),
                Reading::new("spo2", now, json!({ "percent": rng.gen_range(94..100) })),
                Reading::new(
                    "nibp",
                    now,
                    json!({ "systolic": rng.gen_range(105..135), "diastolic": rng.gen_range(65..88) }),
                ),
            ]
        };
        let batch = match TelemetryBatch::new(device_id, readings, now) {
            Ok(batch) => batch,
            Err(e) => {
                warn!(error = %e, "Could not build telemetry batch");
                continue;
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            result = transport.enqueue(batch) => {
                if let Err(e) = result {
                    warn!(error = %e, "Telemetry batch not queued");
                }
            }
        }
    }
}

/// Operator-facing output. A real deployment forwards these to its console.
fn surface(notification: &Notification) {
    if notification.is_high_priority() {
        error!(notification = ?notification, "OPERATOR ALERT");
    } else {
        info!(notification = ?notification, "Operator notice");
    }
}
