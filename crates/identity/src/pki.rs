//! Certificate model and trust anchors.
//!
//! Certificates are signed by an issuer's Ed25519 key over a canonical,
//! length-prefixed encoding of their identifying fields. The device trusts a
//! configured set of issuers (trust anchors) and nothing else.

use crate::error::{IdentityError, IdentityResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use vitalguard_core::config::TrustAnchorConfig;
use vitalguard_core::TimestampMs;
use vitalguard_crypto::{verify_signature, DeviceKeyPair};
use zeroize::{Zeroize, ZeroizeOnDrop};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CertificateType {
    ClientAuth,
    ServerTrust,
    CodeSigning,
}

impl CertificateType {
    pub const ALL: [CertificateType; 3] = [
        CertificateType::ClientAuth,
        CertificateType::ServerTrust,
        CertificateType::CodeSigning,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CertificateType::ClientAuth => "ClientAuth",
            CertificateType::ServerTrust => "ServerTrust",
            CertificateType::CodeSigning => "CodeSigning",
        }
    }

    /// Whether the device holds the private key for this type.
    pub fn has_device_key(&self) -> bool {
        !matches!(self, CertificateType::ServerTrust)
    }
}

impl fmt::Display for CertificateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CertificateType {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CertificateType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| IdentityError::CorruptRecord(format!("unknown certificate type {}", s)))
    }
}

/// Lifecycle status. Only the certificate manager changes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CertificateStatus {
    Pending,
    Active,
    ExpiringSoon,
    Expired,
    Revoked,
    /// Demoted by a newer certificate of the same type
    Superseded,
}

impl CertificateStatus {
    const ALL: [CertificateStatus; 6] = [
        CertificateStatus::Pending,
        CertificateStatus::Active,
        CertificateStatus::ExpiringSoon,
        CertificateStatus::Expired,
        CertificateStatus::Revoked,
        CertificateStatus::Superseded,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CertificateStatus::Pending => "Pending",
            CertificateStatus::Active => "Active",
            CertificateStatus::ExpiringSoon => "ExpiringSoon",
            CertificateStatus::Expired => "Expired",
            CertificateStatus::Revoked => "Revoked",
            CertificateStatus::Superseded => "Superseded",
        }
    }

    /// Active or ExpiringSoon: usable for sessions.
    pub fn is_in_service(&self) -> bool {
        matches!(self, CertificateStatus::Active | CertificateStatus::ExpiringSoon)
    }
}

impl fmt::Display for CertificateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CertificateStatus {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CertificateStatus::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| IdentityError::CorruptRecord(format!("unknown certificate status {}", s)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    pub id: String,
    pub cert_type: CertificateType,
    pub subject: String,
    pub issuer: String,
    /// Subject's Ed25519 public key
    pub public_key: Vec<u8>,
    pub not_before_ms: TimestampMs,
    pub not_after_ms: TimestampMs,
    /// Issuer signature over [`Certificate::canonical_bytes`]
    pub signature: Vec<u8>,
    pub status: CertificateStatus,
}

fn put_field(out: &mut Vec<u8>, field: &[u8]) {
    out.extend_from_slice(&(field.len() as u32).to_le_bytes());
    out.extend_from_slice(field);
}

impl Certificate {
    /// Bytes covered by the issuer signature. Status is deliberately excluded.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128 + self.public_key.len());
        put_field(&mut out, self.id.as_bytes());
        put_field(&mut out, self.cert_type.as_str().as_bytes());
        put_field(&mut out, self.subject.as_bytes());
        put_field(&mut out, self.issuer.as_bytes());
        out.extend_from_slice(&self.not_before_ms.to_le_bytes());
        out.extend_from_slice(&self.not_after_ms.to_le_bytes());
        put_field(&mut out, &self.public_key);
        out
    }

    pub fn is_within_validity(&self, now: TimestampMs) -> bool {
        now >= self.not_before_ms && now < self.not_after_ms
    }

    /// Time-derived status for an in-service certificate.
    pub fn status_at(&self, now: TimestampMs, rotation_window: Duration) -> CertificateStatus {
        let window_ms = rotation_window.as_millis().min(i64::MAX as u128) as i64;
        if now >= self.not_after_ms {
            CertificateStatus::Expired
        } else if now >= self.not_after_ms.saturating_sub(window_ms) {
            CertificateStatus::ExpiringSoon
        } else {
            CertificateStatus::Active
        }
    }
}

/// Secret half of a certificate, sealed at rest.
#[derive(Clone, Default, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct CertificateMaterial {
    /// Device private key for types the device signs with
    pub private_key: Option<Vec<u8>>,
    /// Opaque issuer-supplied chain bytes
    pub chain: Vec<u8>,
}

impl CertificateMaterial {
    pub fn with_private_key(key_pair: &DeviceKeyPair) -> Self {
        Self {
            private_key: Some(key_pair.secret_bytes().to_vec()),
            chain: Vec::new(),
        }
    }

    pub fn public_only() -> Self {
        Self::default()
    }
}

impl fmt::Debug for CertificateMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateMaterial")
            .field("has_private_key", &self.private_key.is_some())
            .field("chain_len", &self.chain.len())
            .finish()
    }
}

/// Outcome of [`crate::cert_manager::CertificateManager::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidityReport {
    pub cert_id: String,
    pub signature_valid: bool,
    pub within_validity: bool,
    pub revoked: bool,
    pub problems: Vec<String>,
}

impl ValidityReport {
    pub fn is_valid(&self) -> bool {
        self.signature_valid && self.within_validity && !self.revoked
    }
}

/// Issuers the device trusts, keyed by issuer name.
#[derive(Debug, Clone, Default)]
pub struct TrustAnchors {
    anchors: HashMap<String, Vec<u8>>,
}

impl TrustAnchors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(configs: &[TrustAnchorConfig]) -> IdentityResult<Self> {
        let mut anchors = Self::new();
        for anchor in configs {
            let key = hex::decode(&anchor.public_key_hex).map_err(|e| {
                IdentityError::Config(format!("trust anchor {}: {}", anchor.issuer, e))
            })?;
            anchors.add(anchor.issuer.clone(), key);
        }
        Ok(anchors)
    }

    pub fn add(&mut self, issuer: impl Into<String>, public_key: Vec<u8>) {
        self.anchors.insert(issuer.into(), public_key);
    }

    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    /// Verify the issuer signature on `cert` against the configured anchor.
    pub fn verify(&self, cert: &Certificate) -> Result<(), String> {
        let anchor = self
            .anchors
            .get(&cert.issuer)
            .ok_or_else(|| format!("issuer {} is not a trust anchor", cert.issuer))?;
        verify_signature(anchor, &cert.canonical_bytes(), &cert.signature)
            .map_err(|e| format!("issuer signature invalid: {}", e))
    }
}

/// Signs certificates with an Ed25519 issuer key.
///
/// The central server plays this role in production; the device uses it only
/// in simulation and tests.
#[derive(Debug)]
pub struct CertificateAuthority {
    issuer: String,
    key_pair: DeviceKeyPair,
    next_serial: u64,
}

impl CertificateAuthority {
    pub fn new(issuer: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            key_pair: DeviceKeyPair::generate(),
            next_serial: 1,
        }
    }

    /// Authority with a fixed signing key, numbering certificates from `first_serial`.
    pub fn with_key(issuer: impl Into<String>, key_pair: DeviceKeyPair, first_serial: u64) -> Self {
        Self {
            issuer: issuer.into(),
            key_pair,
            next_serial: first_serial,
        }
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn public_key(&self) -> Vec<u8> {
        self.key_pair.public_key().to_vec()
    }

    /// Trust anchor entry for this authority.
    pub fn anchor_config(&self) -> TrustAnchorConfig {
        TrustAnchorConfig {
            issuer: self.issuer.clone(),
            public_key_hex: hex::encode(self.key_pair.public_key()),
        }
    }

    pub fn issue(
        &mut self,
        cert_type: CertificateType,
        subject: impl Into<String>,
        public_key: Vec<u8>,
        not_before_ms: TimestampMs,
        not_after_ms: TimestampMs,
    ) -> Certificate {
        let serial = self.next_serial;
        self.next_serial += 1;

        let mut cert = Certificate {
            id: format!("{}-{}-{}", self.issuer, cert_type.as_str().to_lowercase(), serial),
            cert_type,
            subject: subject.into(),
            issuer: self.issuer.clone(),
            public_key,
            not_before_ms,
            not_after_ms,
            signature: Vec::new(),
            status: CertificateStatus::Pending,
        };
        self.sign(&mut cert);
        cert
    }

    /// (Re)sign `cert` after its fields were changed.
    pub fn sign(&self, cert: &mut Certificate) {
        cert.signature = self.key_pair.sign(&cert.canonical_bytes()).to_vec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY_MS: i64 = 24 * 60 * 60 * 1000;

    fn issued(ca: &mut CertificateAuthority, not_after_ms: i64) -> Certificate {
        let device = DeviceKeyPair::generate();
        ca.issue(
            CertificateType::ClientAuth,
            "device-1",
            device.public_key().to_vec(),
            0,
            not_after_ms,
        )
    }

    #[test]
    fn test_issued_certificate_verifies_against_anchor() {
        let mut ca = CertificateAuthority::new("vitalguard-ca");
        let cert = issued(&mut ca, 365 * DAY_MS);

        let anchors = TrustAnchors::from_config(&[ca.anchor_config()]).unwrap();
        anchors.verify(&cert).unwrap();
    }

    #[test]
    fn test_unknown_issuer_and_tampered_fields_fail() {
        let mut ca = CertificateAuthority::new("vitalguard-ca");
        let rogue = CertificateAuthority::new("vitalguard-ca");
        let mut anchors = TrustAnchors::new();
        anchors.add("vitalguard-ca", rogue.public_key());

        let cert = issued(&mut ca, 365 * DAY_MS);
        assert!(anchors.verify(&cert).is_err());

        let anchors = TrustAnchors::from_config(&[ca.anchor_config()]).unwrap();
        let mut tampered = cert.clone();
        tampered.not_after_ms += DAY_MS;
        assert!(anchors.verify(&tampered).is_err());

        let mut other = cert;
        other.issuer = "someone-else".into();
        assert!(anchors.verify(&other).unwrap_err().contains("not a trust anchor"));
    }

    #[test]
    fn test_status_is_not_covered_by_signature() {
        let mut ca = CertificateAuthority::new("ca");
        let mut cert = issued(&mut ca, 10 * DAY_MS);
        let before = cert.canonical_bytes();
        cert.status = CertificateStatus::Active;
        assert_eq!(before, cert.canonical_bytes());
    }

    #[test]
    fn test_rotation_window_boundary() {
        let now = 1_700_000_000_000;
        let window = Duration::from_secs(30 * 24 * 60 * 60);
        let mut ca = CertificateAuthority::new("ca");

        let soon = issued(&mut ca, now + 29 * DAY_MS);
        assert_eq!(soon.status_at(now, window), CertificateStatus::ExpiringSoon);

        let later = issued(&mut ca, now + 31 * DAY_MS);
        assert_eq!(later.status_at(now, window), CertificateStatus::Active);

        let past = issued(&mut ca, now);
        assert_eq!(past.status_at(now, window), CertificateStatus::Expired);
    }

    #[test]
    fn test_material_debug_hides_key() {
        let pair = DeviceKeyPair::generate();
        let material = CertificateMaterial::with_private_key(&pair);
        let rendered = format!("{:?}", material);
        assert!(rendered.contains("has_private_key: true"));
        assert!(!rendered.contains(&hex::encode(&pair.secret_bytes()[..])));
    }
}
