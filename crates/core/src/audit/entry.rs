//! Audit entry model and hash-chain primitives.

use crate::clock::TimestampMs;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 256-bit BLAKE3 digest.
pub type Hash256 = [u8; 32];

/// `prev_hash` of entry 0.
pub const GENESIS_HASH: Hash256 = [0u8; 32];

/// Security-relevant transitions recorded in the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditEventType {
    KeyCreated,
    DeviceRegistered,
    RegistrationFailed,
    CertificateInstalled,
    CertificateValidationFailed,
    CertificateRotated,
    CertificateRotationFailed,
    CertificateRevoked,
    CertificateExpiringSoon,
    CertificateExpired,
    ClockSynced,
    ClockOffsetJumped,
    ClockSyncFailed,
    ClockSyncRejected,
    SessionConnecting,
    SessionAuthenticated,
    SessionStreaming,
    SessionDisconnected,
    SessionFaulted,
    BatchRejected,
    BatchAbandoned,
    BatchSpilled,
}

impl AuditEventType {
    pub const ALL: [AuditEventType; 22] = [
        AuditEventType::KeyCreated,
        AuditEventType::DeviceRegistered,
        AuditEventType::RegistrationFailed,
        AuditEventType::CertificateInstalled,
        AuditEventType::CertificateValidationFailed,
        AuditEventType::CertificateRotated,
        AuditEventType::CertificateRotationFailed,
        AuditEventType::CertificateRevoked,
        AuditEventType::CertificateExpiringSoon,
        AuditEventType::CertificateExpired,
        AuditEventType::ClockSynced,
        AuditEventType::ClockOffsetJumped,
        AuditEventType::ClockSyncFailed,
        AuditEventType::ClockSyncRejected,
        AuditEventType::SessionConnecting,
        AuditEventType::SessionAuthenticated,
        AuditEventType::SessionStreaming,
        AuditEventType::SessionDisconnected,
        AuditEventType::SessionFaulted,
        AuditEventType::BatchRejected,
        AuditEventType::BatchAbandoned,
        AuditEventType::BatchSpilled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::KeyCreated => "KeyCreated",
            AuditEventType::DeviceRegistered => "DeviceRegistered",
            AuditEventType::RegistrationFailed => "RegistrationFailed",
            AuditEventType::CertificateInstalled => "CertificateInstalled",
            AuditEventType::CertificateValidationFailed => "CertificateValidationFailed",
            AuditEventType::CertificateRotated => "CertificateRotated",
            AuditEventType::CertificateRotationFailed => "CertificateRotationFailed",
            AuditEventType::CertificateRevoked => "CertificateRevoked",
            AuditEventType::CertificateExpiringSoon => "CertificateExpiringSoon",
            AuditEventType::CertificateExpired => "CertificateExpired",
            AuditEventType::ClockSynced => "ClockSynced",
            AuditEventType::ClockOffsetJumped => "ClockOffsetJumped",
            AuditEventType::ClockSyncFailed => "ClockSyncFailed",
            AuditEventType::ClockSyncRejected => "ClockSyncRejected",
            AuditEventType::SessionConnecting => "SessionConnecting",
            AuditEventType::SessionAuthenticated => "SessionAuthenticated",
            AuditEventType::SessionStreaming => "SessionStreaming",
            AuditEventType::SessionDisconnected => "SessionDisconnected",
            AuditEventType::SessionFaulted => "SessionFaulted",
            AuditEventType::BatchRejected => "BatchRejected",
            AuditEventType::BatchAbandoned => "BatchAbandoned",
            AuditEventType::BatchSpilled => "BatchSpilled",
        }
    }
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AuditEventType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown audit event type: {}", s))
    }
}

/// One immutable link of the audit chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Gapless, starting at 0
    pub sequence: u64,
    /// Corrected time at append
    pub timestamp_ms: TimestampMs,
    pub event_type: AuditEventType,
    /// Canonical JSON payload as stored
    pub payload: String,
    pub payload_hash: Hash256,
    pub prev_hash: Hash256,
    pub entry_hash: Hash256,
}

impl AuditEntry {
    /// Parse the stored payload.
    pub fn payload_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::from_str(&self.payload)
    }

    /// Recompute this entry's hash from its fields.
    pub fn recompute_hash(&self) -> Hash256 {
        compute_entry_hash(
            self.sequence,
            self.timestamp_ms,
            self.event_type.as_str(),
            &self.payload_hash,
            &self.prev_hash,
        )
    }
}

pub fn payload_hash(payload: &[u8]) -> Hash256 {
    *blake3::hash(payload).as_bytes()
}

/// `H(sequence ∥ timestamp ∥ eventType ∥ payloadHash ∥ prevHash)`.
///
/// Integers are little-endian; the event type is length-prefixed so that
/// adjacent fields cannot be shifted into one another.
pub fn compute_entry_hash(
    sequence: u64,
    timestamp_ms: TimestampMs,
    event_type: &str,
    payload_hash: &Hash256,
    prev_hash: &Hash256,
) -> Hash256 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&sequence.to_le_bytes());
    hasher.update(&timestamp_ms.to_le_bytes());
    hasher.update(&(event_type.len() as u32).to_le_bytes());
    hasher.update(event_type.as_bytes());
    hasher.update(payload_hash);
    hasher.update(prev_hash);
    *hasher.finalize().as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_names_parse_back() {
        for t in AuditEventType::ALL {
            assert_eq!(t.as_str().parse::<AuditEventType>().unwrap(), t);
        }
        assert!("Bogus".parse::<AuditEventType>().is_err());
    }

    #[test]
    fn test_entry_hash_covers_every_field() {
        let ph = payload_hash(b"{}");
        let base = compute_entry_hash(1, 1_000, "ClockSynced", &ph, &GENESIS_HASH);

        assert_ne!(base, compute_entry_hash(2, 1_000, "ClockSynced", &ph, &GENESIS_HASH));
        assert_ne!(base, compute_entry_hash(1, 1_001, "ClockSynced", &ph, &GENESIS_HASH));
        assert_ne!(base, compute_entry_hash(1, 1_000, "ClockSyncFailed", &ph, &GENESIS_HASH));
        assert_ne!(
            base,
            compute_entry_hash(1, 1_000, "ClockSynced", &payload_hash(b"[]"), &GENESIS_HASH)
        );
        assert_ne!(base, compute_entry_hash(1, 1_000, "ClockSynced", &ph, &[1u8; 32]));
        assert_eq!(base, compute_entry_hash(1, 1_000, "ClockSynced", &ph, &GENESIS_HASH));
    }
}
