//! Shared failure type for every network collaborator.
//!
//! Registration, clock sync and telemetry channels all report transport-level
//! failures with [`ChannelError`]. Server-side refusals that carry meaning
//! (rejection codes, structured telemetry rejections) travel in the typed
//! responses of each channel instead.

use crate::error::{Classify, ErrorClass};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    /// The operation did not complete within its caller-configured timeout.
    #[error("{operation} timed out after {after_ms} ms")]
    Timeout { operation: String, after_ms: u64 },

    /// The peer could not be reached or refused temporarily.
    #[error("Peer unavailable: {0}")]
    Unavailable(String),

    /// The peer answered with something that does not parse or violates the protocol.
    #[error("Protocol violation: {0}")]
    Protocol(String),
}

impl Classify for ChannelError {
    fn class(&self) -> ErrorClass {
        match self {
            ChannelError::Timeout { .. } | ChannelError::Unavailable(_) => ErrorClass::Transient,
            ChannelError::Protocol(_) => ErrorClass::Validation,
        }
    }
}

/// Runs `future` under a timeout, mapping expiry to [`ChannelError::Timeout`].
///
/// A stalled peer therefore surfaces as a recoverable error instead of
/// freezing the caller.
pub async fn with_timeout<T, F>(
    timeout: Duration,
    operation: &str,
    future: F,
) -> Result<T, ChannelError>
where
    F: Future<Output = Result<T, ChannelError>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => Err(ChannelError::Timeout {
            operation: operation.to_string(),
            after_ms: timeout.as_millis() as u64,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_timeout_maps_to_transient_error() {
        let result: Result<(), ChannelError> = with_timeout(
            Duration::from_millis(10),
            "sync exchange",
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
        )
        .await;

        let err = result.unwrap_err();
        assert!(matches!(err, ChannelError::Timeout { after_ms: 10, .. }));
        assert_eq!(err.class(), ErrorClass::Transient);
    }

    #[tokio::test]
    async fn test_completed_future_passes_through() {
        let result = with_timeout(Duration::from_secs(1), "noop", async { Ok(7u32) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[test]
    fn test_protocol_errors_are_not_retried() {
        assert_eq!(
            ChannelError::Protocol("garbage".into()).class(),
            ErrorClass::Validation
        );
    }
}
