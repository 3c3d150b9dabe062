//! Telemetry batches and their signed envelope.
//!
//! A batch is signed with the device's ClientAuth key over a BLAKE3 digest
//! of its canonical encoding, a random nonce and the corrected signing time.
//! Delivery metadata (attempt count, send/ack times) is not covered.

use crate::error::{TelemetryError, TelemetryResult};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use vitalguard_core::TimestampMs;
use vitalguard_crypto::{digest, verify_signature};
use vitalguard_identity::ClientCredentials;

pub const MAX_READINGS_PER_BATCH: usize = 1000;

const BATCH_DOMAIN: &[u8] = b"vitalguard-batch-v1";
const NONCE_LEN: usize = 16;

/// One opaque sensor reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub kind: String,
    pub captured_at_ms: TimestampMs,
    pub value: serde_json::Value,
}

impl Reading {
    pub fn new(kind: impl Into<String>, captured_at_ms: TimestampMs, value: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            captured_at_ms,
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryBatch {
    pub batch_id: String,
    pub device_id: String,
    pub readings: Vec<Reading>,
    pub created_at_ms: TimestampMs,
    pub sent_at_ms: Option<TimestampMs>,
    pub acked_at_ms: Option<TimestampMs>,
    pub attempt_count: u32,
}

/// Fields covered by the batch digest.
#[derive(Serialize)]
struct CanonicalBatch<'a> {
    batch_id: &'a str,
    device_id: &'a str,
    created_at_ms: TimestampMs,
    readings: &'a [Reading],
}

impl TelemetryBatch {
    pub fn new(
        device_id: impl Into<String>,
        readings: Vec<Reading>,
        created_at_ms: TimestampMs,
    ) -> TelemetryResult<Self> {
        if readings.is_empty() {
            return Err(TelemetryError::EmptyBatch);
        }
        if readings.len() > MAX_READINGS_PER_BATCH {
            return Err(TelemetryError::BatchTooLarge {
                len: readings.len(),
                max: MAX_READINGS_PER_BATCH,
            });
        }
        Ok(Self {
            batch_id: uuid::Uuid::new_v4().to_string(),
            device_id: device_id.into(),
            readings,
            created_at_ms,
            sent_at_ms: None,
            acked_at_ms: None,
            attempt_count: 0,
        })
    }

    pub fn canonical_bytes(&self) -> TelemetryResult<Vec<u8>> {
        Ok(serde_json::to_vec(&CanonicalBatch {
            batch_id: &self.batch_id,
            device_id: &self.device_id,
            created_at_ms: self.created_at_ms,
            readings: &self.readings,
        })?)
    }

    pub fn digest(&self) -> TelemetryResult<[u8; 32]> {
        Ok(digest(&self.canonical_bytes()?))
    }

    pub fn age_ms(&self, now: TimestampMs) -> i64 {
        now.saturating_sub(self.created_at_ms)
    }
}

/// A batch ready for the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedBatch {
    pub batch: TelemetryBatch,
    pub cert_id: String,
    pub key_id: String,
    /// Hex-encoded random nonce
    pub nonce: String,
    pub signed_at_ms: TimestampMs,
    pub signature: Vec<u8>,
}

fn signing_message(digest: &[u8; 32], nonce: &[u8], signed_at_ms: TimestampMs) -> Vec<u8> {
    let mut message = Vec::with_capacity(BATCH_DOMAIN.len() + 32 + nonce.len() + 8);
    message.extend_from_slice(BATCH_DOMAIN);
    message.extend_from_slice(digest);
    message.extend_from_slice(nonce);
    message.extend_from_slice(&signed_at_ms.to_le_bytes());
    message
}

impl SignedBatch {
    pub fn sign(
        batch: TelemetryBatch,
        credentials: &ClientCredentials,
        signed_at_ms: TimestampMs,
    ) -> TelemetryResult<Self> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let message = signing_message(&batch.digest()?, &nonce, signed_at_ms);
        let signature = credentials.key_pair.sign(&message).to_vec();

        Ok(Self {
            batch,
            cert_id: credentials.certificate.id.clone(),
            key_id: credentials.key_pair.key_id(),
            nonce: hex::encode(nonce),
            signed_at_ms,
            signature,
        })
    }

    /// Check the signature against the signer's public key.
    pub fn verify(&self, public_key: &[u8]) -> TelemetryResult<()> {
        let nonce = hex::decode(&self.nonce).map_err(|_| {
            TelemetryError::Signing(vitalguard_crypto::SigningError::MalformedSignature(
                "nonce is not hex".into(),
            ))
        })?;
        let message = signing_message(&self.batch.digest()?, &nonce, self.signed_at_ms);
        verify_signature(public_key, &message, &self.signature)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use vitalguard_crypto::DeviceKeyPair;
    use vitalguard_identity::{CertificateAuthority, CertificateType};

    fn readings(n: usize) -> Vec<Reading> {
        (0..n)
            .map(|i| Reading::new("heart_rate", 1_000 + i as i64, json!({ "bpm": 60 + i })))
            .collect()
    }

    fn credentials() -> ClientCredentials {
        let key_pair = DeviceKeyPair::generate();
        let mut ca = CertificateAuthority::new("ca");
        let certificate = ca.issue(
            CertificateType::ClientAuth,
            "dev-1",
            key_pair.public_key().to_vec(),
            0,
            i64::MAX,
        );
        ClientCredentials {
            certificate,
            key_pair,
        }
    }

    #[test]
    fn test_batch_size_limits() {
        assert!(matches!(
            TelemetryBatch::new("dev-1", vec![], 0),
            Err(TelemetryError::EmptyBatch)
        ));
        assert!(matches!(
            TelemetryBatch::new("dev-1", readings(MAX_READINGS_PER_BATCH + 1), 0),
            Err(TelemetryError::BatchTooLarge { .. })
        ));
        let batch = TelemetryBatch::new("dev-1", readings(MAX_READINGS_PER_BATCH), 0).unwrap();
        assert_eq!(batch.attempt_count, 0);
    }

    #[test]
    fn test_batch_ids_are_unique() {
        let a = TelemetryBatch::new("dev-1", readings(1), 0).unwrap();
        let b = TelemetryBatch::new("dev-1", readings(1), 0).unwrap();
        assert_ne!(a.batch_id, b.batch_id);
    }

    #[test]
    fn test_delivery_metadata_not_in_digest() {
        let mut batch = TelemetryBatch::new("dev-1", readings(3), 10).unwrap();
        let before = batch.digest().unwrap();
        batch.attempt_count = 4;
        batch.sent_at_ms = Some(99);
        assert_eq!(before, batch.digest().unwrap());

        batch.readings[0].value = json!({ "bpm": 200 });
        assert_ne!(before, batch.digest().unwrap());
    }

    #[test]
    fn test_signed_batch_verifies() {
        let creds = credentials();
        let batch = TelemetryBatch::new("dev-1", readings(2), 10).unwrap();
        let signed = SignedBatch::sign(batch, &creds, 1_234).unwrap();

        assert_eq!(signed.cert_id, creds.certificate.id);
        signed.verify(&creds.key_pair.public_key()).unwrap();

        let mut tampered = signed.clone();
        tampered.batch.readings.pop();
        assert!(tampered.verify(&creds.key_pair.public_key()).is_err());

        let mut replayed = signed.clone();
        replayed.signed_at_ms += 1;
        assert!(replayed.verify(&creds.key_pair.public_key()).is_err());
    }

    #[test]
    fn test_nonce_differs_per_signature() {
        let creds = credentials();
        let batch = TelemetryBatch::new("dev-1", readings(1), 10).unwrap();
        let a = SignedBatch::sign(batch.clone(), &creds, 1).unwrap();
        let b = SignedBatch::sign(batch, &creds, 1).unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.signature, b.signature);
    }
}
