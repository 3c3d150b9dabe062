//! Audit chain continuity and at-rest protection across restarts

use crate::test_utils::*;
use vitalguard_core::{AuditError, AuditEventType, ChainHealth};
use vitalguard_crypto::{KdfParams, KeyManager, Sealer, StaticSecret};
use vitalguard_identity::{CertificateStore, CertificateType};

#[tokio::test]
async fn test_chain_continues_across_restart() {
    let dir = TestDir::new();
    let central = MockCentral::new();

    let before = {
        let device = TestDevice::boot(&dir, &central);
        device.clock_sync.sync().await.unwrap();
        device.register().await;
        device.audit.len().unwrap()
    };
    assert!(before >= 3);

    let device = TestDevice::boot(&dir, &central);
    assert!(device.audit.health().unwrap().is_ok());
    assert_eq!(device.audit.len().unwrap(), before);

    device.clock_sync.sync().await.unwrap();
    let entry = device.audit.latest().unwrap().expect("latest entry");
    assert_eq!(entry.sequence, before);
    assert_eq!(entry.event_type, AuditEventType::ClockSynced);
    assert_eq!(
        entry.prev_hash,
        device.audit.entry(before - 1).unwrap().entry_hash
    );
    device.audit.verify_all().unwrap();
}

#[tokio::test]
async fn test_tampered_chain_is_detected_at_startup() {
    let dir = TestDir::new();
    let central = MockCentral::new();

    {
        let device = TestDevice::boot(&dir, &central);
        device.register().await;
        assert!(device.audit.len().unwrap() >= 2);
    }

    {
        let conn = rusqlite::Connection::open(dir.path().join("audit.db")).unwrap();
        let changed = conn
            .execute(
                "UPDATE audit_entries SET payload = ?1 WHERE sequence = ?2",
                rusqlite::params![r#"{"forged":true}"#, 1i64],
            )
            .unwrap();
        assert_eq!(changed, 1);
    }

    let device = TestDevice::boot(&dir, &central);
    match device.audit.health().unwrap() {
        ChainHealth::Compromised {
            first_bad_sequence, ..
        } => assert_eq!(first_bad_sequence, 1),
        ChainHealth::Ok => panic!("tampering went unnoticed"),
    }
    assert!(device.audit.verify_all().is_err());

    let err = device
        .audit
        .append(AuditEventType::ClockSynced, &serde_json::json!({}))
        .unwrap_err();
    assert!(matches!(err, AuditError::ChainCompromised { .. }));
}

#[tokio::test]
async fn test_sealed_key_material_needs_device_secret() {
    let dir = TestDir::new();
    let central = MockCentral::new();

    let client_id = {
        let device = TestDevice::boot(&dir, &central);
        device.register().await;
        device
            .certificates
            .active(CertificateType::ClientAuth)
            .unwrap()
            .id
    };

    let keys = KeyManager::new(
        dir.path().join("datastore.salt"),
        KdfParams {
            iterations: 1,
            memory_kib: 64,
            lanes: 1,
        },
        Box::new(StaticSecret::new(b"some-other-secret".to_vec())),
    );
    let wrong_key = keys.get_or_create_key().unwrap();
    assert!(!keys.created_new_salt());

    let store = CertificateStore::open(
        dir.path().join("certificates.db"),
        Sealer::new(wrong_key),
    )
    .unwrap();
    assert!(store.material(&client_id).is_err());
    // metadata is not sealed
    assert_eq!(
        store.require(&client_id).unwrap().cert_type,
        CertificateType::ClientAuth
    );
}
