//! Error types for the telemetry pipeline.

use crate::session::{Rejection, SessionState};
use thiserror::Error;
use vitalguard_core::{AuditError, ChannelError, Classify, ErrorClass};
use vitalguard_crypto::{SealError, SigningError};
use vitalguard_identity::{CertificateStatus, IdentityError};

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Batch has no readings")]
    EmptyBatch,

    #[error("Batch has {len} readings, limit is {max}")]
    BatchTooLarge { len: usize, max: usize },

    /// Memory queue and spill store are both at capacity
    #[error("Telemetry queue full ({capacity} batches)")]
    QueueFull { capacity: usize },

    #[error("Batch not found: {batch_id}")]
    UnknownBatch { batch_id: String },

    #[error("Spill storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Spill sealing error: {0}")]
    Seal(#[from] SealError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Audit error: {0}")]
    Audit(#[from] AuditError),

    #[error("Signature error: {0}")]
    Signing(#[from] SigningError),

    #[error("Invalid session transition from {from} to {to}")]
    InvalidTransition { from: SessionState, to: SessionState },

    /// Server did not present the trusted certificate
    #[error("Peer authentication failed: {0}")]
    PeerAuthentication(String),

    /// Session certificate stopped being usable mid-session
    #[error("Session certificate {cert_id} is {status}")]
    CredentialInvalid {
        cert_id: String,
        status: CertificateStatus,
    },

    #[error("Server rejected batch {batch_id}: {reason}")]
    Rejected { batch_id: String, reason: Rejection },

    #[error("Delivery circuit open")]
    CircuitOpen,

    #[error("Lock poisoned")]
    LockPoisoned,
}

impl Classify for TelemetryError {
    fn class(&self) -> ErrorClass {
        match self {
            TelemetryError::Channel(e) => e.class(),
            TelemetryError::Identity(e) => e.class(),
            TelemetryError::Audit(e) => e.class(),
            TelemetryError::Seal(e) => e.class(),
            TelemetryError::QueueFull { .. } | TelemetryError::CircuitOpen => ErrorClass::Transient,
            TelemetryError::Rejected { reason, .. } => match reason {
                Rejection::Malformed => ErrorClass::Validation,
                Rejection::AuthExpired | Rejection::RateLimited => ErrorClass::Transient,
            },
            TelemetryError::EmptyBatch
            | TelemetryError::BatchTooLarge { .. }
            | TelemetryError::UnknownBatch { .. }
            | TelemetryError::Serialization(_)
            | TelemetryError::Signing(_)
            | TelemetryError::InvalidTransition { .. } => ErrorClass::Validation,
            TelemetryError::PeerAuthentication(_) | TelemetryError::CredentialInvalid { .. } => {
                ErrorClass::Integrity
            }
            TelemetryError::Storage(_) | TelemetryError::Io(_) | TelemetryError::LockPoisoned => {
                ErrorClass::Fatal
            }
        }
    }
}

pub type TelemetryResult<T> = Result<T, TelemetryError>;
