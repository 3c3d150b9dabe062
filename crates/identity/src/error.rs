//! Error types for VitalGuard identity operations.
//!
//! Covers certificate lifecycle, device identity storage and the issuance
//! channel. Registration has its own error type layered on top.

use crate::pki::{CertificateStatus, CertificateType};
use thiserror::Error;
use vitalguard_core::{AuditError, ChannelError, Classify, ErrorClass};
use vitalguard_crypto::{KeyError, SealError, SigningError};

/// Errors that can occur in identity operations.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// Local certificate/identity database failure
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Sealed material could not be sealed or opened
    #[error("Sealed material error: {0}")]
    Seal(#[from] SealError),

    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    #[error("Signing error: {0}")]
    Signing(#[from] SigningError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Audit error: {0}")]
    Audit(#[from] AuditError),

    /// Issuance or registration channel failure
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Certificate {cert_id} failed validation: {reason}")]
    CertificateValidation { cert_id: String, reason: String },

    #[error("Certificate not found: {cert_id}")]
    CertificateNotFound { cert_id: String },

    #[error("Certificate already installed: {cert_id}")]
    CertificateExists { cert_id: String },

    #[error("No in-service {cert_type} certificate")]
    NoActiveCertificate { cert_type: CertificateType },

    #[error("Certificate {cert_id} cannot move from {from} to {to}")]
    InvalidTransition {
        cert_id: String,
        from: CertificateStatus,
        to: CertificateStatus,
    },

    #[error("Issuer refused certificate: {0}")]
    IssuanceRejected(String),

    #[error("Device identity already assigned: {device_id}")]
    IdentityExists { device_id: String },

    #[error("Device is not registered")]
    NotRegistered,

    #[error("Corrupt stored record: {0}")]
    CorruptRecord(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Lock poisoned")]
    LockPoisoned,
}

impl Classify for IdentityError {
    fn class(&self) -> ErrorClass {
        match self {
            IdentityError::Seal(e) => e.class(),
            IdentityError::Audit(e) => e.class(),
            IdentityError::Channel(e) => e.class(),
            IdentityError::Signing(_)
            | IdentityError::Serialization(_)
            | IdentityError::CertificateValidation { .. }
            | IdentityError::CertificateNotFound { .. }
            | IdentityError::CertificateExists { .. }
            | IdentityError::NoActiveCertificate { .. }
            | IdentityError::InvalidTransition { .. }
            | IdentityError::IssuanceRejected(_)
            | IdentityError::IdentityExists { .. }
            | IdentityError::NotRegistered
            | IdentityError::Config(_) => ErrorClass::Validation,
            IdentityError::CorruptRecord(_) => ErrorClass::Integrity,
            IdentityError::Cancelled => ErrorClass::Transient,
            IdentityError::Storage(_)
            | IdentityError::Io(_)
            | IdentityError::Key(_)
            | IdentityError::LockPoisoned => ErrorClass::Fatal,
        }
    }
}

/// Result type for identity operations.
pub type IdentityResult<T> = Result<T, IdentityError>;
