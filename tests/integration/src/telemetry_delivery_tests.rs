//! Telemetry delivery against the mock central server

use crate::test_utils::*;
use std::time::Duration;
use vitalguard_core::{AuditEventType, EnqueueMode};
use vitalguard_telemetry::{EnqueueOutcome, SessionState, TelemetryError};

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn test_registered_device_delivers_batches() {
    let _ = tracing_subscriber::fmt::try_init();
    let dir = TestDir::new();
    let central = MockCentral::new();
    let device = TestDevice::boot(&dir, &central);
    let device_id = device.register().await;

    let handle = device.start_telemetry();
    for value in 0..5 {
        device
            .transport
            .enqueue(device.batch(&device_id, 60 + value))
            .await
            .unwrap();
    }

    let queue = device.queue.clone();
    assert!(
        wait_until(DELIVERY_TIMEOUT, || {
            central.distinct_received() == 5 && queue.is_empty().unwrap_or(false)
        })
        .await
    );
    assert_eq!(device.transport.state().unwrap(), SessionState::Streaming);
    assert_eq!(central.sessions_opened(), 1);

    device.stop(handle).await;
    assert_eq!(device.transport.state().unwrap(), SessionState::Disconnected);
    assert!(device.audit.verify_all().is_ok());
    assert_eq!(
        device
            .audit
            .entries_by_type(AuditEventType::SessionStreaming)
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn test_missing_ack_redelivers_same_batch() {
    let dir = TestDir::new();
    let central = MockCentral::new();
    let device = TestDevice::boot(&dir, &central);
    let device_id = device.register().await;
    central.drop_acks(1);

    let handle = device.start_telemetry();
    let batch = device.batch(&device_id, 72);
    let batch_id = batch.batch_id.clone();
    device.transport.enqueue(batch).await.unwrap();

    let queue = device.queue.clone();
    assert!(wait_until(DELIVERY_TIMEOUT, || queue.is_empty().unwrap_or(false)).await);
    device.stop(handle).await;

    assert_eq!(central.received(), vec![batch_id.clone(), batch_id]);
    assert_eq!(central.distinct_received(), 1);
}

#[tokio::test]
async fn test_spilled_batches_survive_restart() {
    let dir = TestDir::new();
    let central = MockCentral::new();
    central.set_telemetry_online(false);

    {
        let device = TestDevice::boot(&dir, &central);
        let device_id = device.register().await;

        let mut spilled = 0;
        for value in 0..6 {
            if let EnqueueOutcome::SpilledOldest { .. } = device
                .transport
                .enqueue(device.batch(&device_id, value))
                .await
                .unwrap()
            {
                spilled += 1;
            }
        }
        assert_eq!(spilled, 4);

        let handle = device.start_telemetry();
        tokio::time::sleep(Duration::from_millis(200)).await;
        device.stop(handle).await;

        assert_eq!(central.distinct_received(), 0);
        assert_eq!(device.queue.memory_len().unwrap(), 0);
        assert_eq!(device.queue.spilled_len().unwrap(), 6);
        assert_eq!(
            device
                .audit
                .entries_by_type(AuditEventType::BatchSpilled)
                .unwrap()
                .len(),
            4
        );
    }

    central.set_telemetry_online(true);
    let device = TestDevice::boot(&dir, &central);
    assert_eq!(device.queue.len().unwrap(), 6);

    let handle = device.start_telemetry();
    let queue = device.queue.clone();
    assert!(
        wait_until(DELIVERY_TIMEOUT, || {
            central.distinct_received() == 6 && queue.is_empty().unwrap_or(false)
        })
        .await
    );
    device.stop(handle).await;
}

#[tokio::test]
async fn test_reject_mode_refuses_when_memory_and_spill_are_full() {
    let dir = TestDir::new();
    let central = MockCentral::new();
    let device = TestDevice::boot_with(
        &dir,
        &central,
        vitalguard_core::config::TelemetryConfig {
            queue_capacity: 2,
            spill_capacity: 1,
            enqueue_mode: EnqueueMode::Reject,
            ..fast_telemetry()
        },
    );
    let device_id = device.register().await;

    for value in 0..3 {
        device
            .transport
            .enqueue(device.batch(&device_id, value))
            .await
            .unwrap();
    }
    let err = device
        .transport
        .enqueue(device.batch(&device_id, 3))
        .await
        .unwrap_err();
    assert!(matches!(err, TelemetryError::QueueFull { capacity: 3 }));
    assert_eq!(device.queue.len().unwrap(), 3);
}

#[tokio::test]
async fn test_rotated_client_certificate_is_used_for_new_sessions() {
    let dir = TestDir::new();
    let central = MockCentral::new();
    let device = TestDevice::boot(&dir, &central);
    let device_id = device.register().await;

    central.clock().advance_ms(61 * DAY_MS);
    device.certificates.check_expirations().unwrap();
    let rotated = device
        .certificates
        .rotate(
            vitalguard_identity::CertificateType::ClientAuth,
            &tokio_util::sync::CancellationToken::new(),
        )
        .await
        .unwrap();

    let handle = device.start_telemetry();
    device
        .transport
        .enqueue(device.batch(&device_id, 80))
        .await
        .unwrap();
    assert!(wait_until(DELIVERY_TIMEOUT, || central.distinct_received() == 1).await);
    device.stop(handle).await;

    let authenticated = device
        .audit
        .entries_by_type(AuditEventType::SessionAuthenticated)
        .unwrap();
    let payload = authenticated.last().unwrap().payload_json().unwrap();
    let reason = payload["reason"].as_str().unwrap();
    assert!(reason.contains(&rotated.id));
}
