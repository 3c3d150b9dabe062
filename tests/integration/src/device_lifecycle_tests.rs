//! Registration, clock sync and certificate lifecycle

use crate::test_utils::*;
use tokio_util::sync::CancellationToken;
use vitalguard_core::{AuditEventType, Notification};
use vitalguard_identity::{
    CertificateStatus, CertificateType, RefusalCode, RegistrationError, RegistrationStatus,
};

#[tokio::test]
async fn test_first_boot_syncs_clock_and_registers() {
    let _ = tracing_subscriber::fmt::try_init();
    let dir = TestDir::new();
    let central = MockCentral::new();
    central.set_skew_ms(5_000);

    let device = TestDevice::boot(&dir, &central);
    let mut notifications = device.notifications.subscribe();

    let offset = device.clock_sync.sync().await.expect("clock sync");
    assert_eq!(offset.offset_ms, 5_000);
    assert_eq!(device.clock.now(), central.server_now());
    assert_eq!(
        notifications.try_recv().expect("jump notification"),
        Notification::ClockOffsetJumped {
            previous_offset_ms: 0,
            new_offset_ms: 5_000,
        }
    );

    let device_id = device.register().await;
    assert_eq!(device_id, "vg-sn-it-001");
    assert_eq!(
        device.registration.status(),
        RegistrationStatus::Registered {
            device_id: device_id.clone()
        }
    );

    let client = device
        .certificates
        .active(CertificateType::ClientAuth)
        .expect("client certificate");
    assert_eq!(client.status, CertificateStatus::Active);
    assert_eq!(client.subject, device_id);
    assert!(device.certificates.server_trust().is_ok());
    assert!(device.certificates.client_credentials().is_ok());

    assert_eq!(
        device
            .audit
            .entries_by_type(AuditEventType::DeviceRegistered)
            .unwrap()
            .len(),
        1
    );
    assert_eq!(
        device
            .audit
            .entries_by_type(AuditEventType::ClockOffsetJumped)
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn test_registration_retries_through_outage() {
    let dir = TestDir::new();
    let central = MockCentral::new();
    central.fail_registrations(2);

    let device = TestDevice::boot(&dir, &central);
    device.register().await;

    assert_eq!(central.registration_calls(), 3);
    assert!(device
        .audit
        .entries_by_type(AuditEventType::RegistrationFailed)
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_registration_refusal_is_not_retried() {
    let dir = TestDir::new();
    let central = MockCentral::new();
    central.refuse_registrations(RefusalCode::InvalidMetadata);

    let device = TestDevice::boot(&dir, &central);
    let mut notifications = device.notifications.subscribe();

    let err = device
        .registration
        .register_device(false, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RegistrationError::Refused {
            code: RefusalCode::InvalidMetadata,
            ..
        }
    ));
    assert_eq!(central.registration_calls(), 1);
    assert!(matches!(
        device.registration.status(),
        RegistrationStatus::Failed { attempts: 1, .. }
    ));
    assert!(matches!(
        notifications.try_recv().unwrap(),
        Notification::RegistrationFailed { attempts: 1, .. }
    ));
    assert!(device.certificates.active(CertificateType::ClientAuth).is_none());
    assert_eq!(
        device
            .audit
            .entries_by_type(AuditEventType::RegistrationFailed)
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn test_registration_survives_restart() {
    let dir = TestDir::new();
    let central = MockCentral::new();

    let device_id = {
        let device = TestDevice::boot(&dir, &central);
        device.register().await
    };

    let device = TestDevice::boot(&dir, &central);
    assert_eq!(
        device.registration.status(),
        RegistrationStatus::Registered {
            device_id: device_id.clone()
        }
    );
    let err = device
        .registration
        .register_device(false, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RegistrationError::AlreadyProvisioned { .. }));
    assert_eq!(central.registration_calls(), 1);
    assert!(device.certificates.client_credentials().is_ok());
}

#[tokio::test]
async fn test_rotation_replaces_expiring_certificates() {
    let dir = TestDir::new();
    let central = MockCentral::new();
    let device = TestDevice::boot(&dir, &central);
    device.register().await;

    let old_client = device
        .certificates
        .active(CertificateType::ClientAuth)
        .unwrap();

    // inside the 30 day rotation window of a 90 day certificate
    central.clock().advance_ms(61 * DAY_MS);
    let mut notifications = device.notifications.subscribe();
    let due = device.certificates.check_expirations().unwrap();
    let due_types: Vec<_> = due.iter().map(|c| c.cert_type).collect();
    assert!(due_types.contains(&CertificateType::ClientAuth));
    assert!(due_types.contains(&CertificateType::ServerTrust));
    assert!(matches!(
        notifications.try_recv().unwrap(),
        Notification::CertificateExpiringSoon { .. }
    ));

    // still in service while expiring
    assert_eq!(
        device
            .certificates
            .active(CertificateType::ClientAuth)
            .map(|c| c.id),
        Some(old_client.id.clone())
    );

    let replacement = device
        .certificates
        .rotate(CertificateType::ClientAuth, &CancellationToken::new())
        .await
        .expect("rotation");
    assert_ne!(replacement.id, old_client.id);
    assert_ne!(replacement.public_key, old_client.public_key);
    assert_eq!(
        device
            .certificates
            .active(CertificateType::ClientAuth)
            .map(|c| c.id),
        Some(replacement.id.clone())
    );
    assert_eq!(
        device.certificates.credential_status(&old_client.id).unwrap(),
        CertificateStatus::Superseded
    );
    assert_eq!(
        device
            .certificates
            .client_credentials()
            .unwrap()
            .certificate
            .id,
        replacement.id
    );

    device
        .certificates
        .rotate(CertificateType::ServerTrust, &CancellationToken::new())
        .await
        .expect("server trust rotation");
    assert!(device.certificates.check_expirations().unwrap().is_empty());
    assert_eq!(
        device
            .audit
            .entries_by_type(AuditEventType::CertificateRotated)
            .unwrap()
            .len(),
        2
    );
}

#[tokio::test]
async fn test_revocation_takes_credentials_out_of_service() {
    let dir = TestDir::new();
    let central = MockCentral::new();
    let device = TestDevice::boot(&dir, &central);
    device.register().await;
    let mut notifications = device.notifications.subscribe();

    let client = device
        .certificates
        .active(CertificateType::ClientAuth)
        .unwrap();
    device.certificates.revoke(&client.id, "key compromise").unwrap();
    device.certificates.revoke(&client.id, "key compromise").unwrap();

    assert_eq!(
        device.certificates.credential_status(&client.id).unwrap(),
        CertificateStatus::Revoked
    );
    assert!(device.certificates.client_credentials().is_err());

    let notification = notifications.try_recv().unwrap();
    assert!(notification.is_high_priority());
    assert!(matches!(notification, Notification::CertificateRevoked { .. }));
    assert!(notifications.try_recv().is_err());
    assert_eq!(
        device
            .audit
            .entries_by_type(AuditEventType::CertificateRevoked)
            .unwrap()
            .len(),
        1
    );
}
