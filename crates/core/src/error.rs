//! Error types and failure classification for VitalGuard.
//!
//! Every error raised by a VitalGuard component belongs to exactly one
//! [`ErrorClass`]. The class decides what the caller does next: transient
//! failures are retried under the shared backoff policy, everything else is
//! surfaced immediately.

use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure taxonomy shared by every component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Network timeout or temporary server refusal. Retried with backoff.
    Transient,
    /// Malformed input, failed signature check, insane clock reply. Never retried.
    Validation,
    /// Audit chain mismatch or credential revoked mid-session. Security incident.
    Integrity,
    /// Storage unavailable or key derivation failure. Dependent work must stop.
    Fatal,
}

impl ErrorClass {
    /// Whether the shared retry policy may attempt the operation again.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::Transient)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Validation => "validation",
            ErrorClass::Integrity => "integrity",
            ErrorClass::Fatal => "fatal",
        };
        f.write_str(label)
    }
}

/// Implemented by every error type so callers can route failures by class.
pub trait Classify {
    fn class(&self) -> ErrorClass;
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),
}

impl Classify for Error {
    fn class(&self) -> ErrorClass {
        match self {
            Error::Config(_) | Error::Serialization(_) => ErrorClass::Validation,
            Error::Io(_) | Error::Storage(_) | Error::LockPoisoned(_) => ErrorClass::Fatal,
        }
    }
}
