//! Shared retry policy with exponential backoff and jitter.
//!
//! Registration, clock sync, certificate rotation and the telemetry reconnect
//! path all retry through the same [`RetryPolicy`]. The delay before retry
//! `attempt` (0-based) is `min(max_delay, base_delay * 2^attempt)`, then
//! spread uniformly by `± jitter * delay` so that a fleet of devices does not
//! retry in lockstep.

use crate::error::Classify;
use rand::Rng;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Exponential backoff parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound for any single delay (before jitter)
    pub max_delay: Duration,
    /// Jitter as a fraction of the capped delay, in `[0, 1]`
    pub jitter: f64,
    /// Total number of attempts, including the first one
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: 0.2,
            max_attempts: 6,
        }
    }
}

/// Outcome of a retried operation that did not succeed.
#[derive(Debug)]
pub enum RetryError<E> {
    /// The operation failed with a non-transient error; no retry was attempted after it.
    Permanent { attempts: u32, error: E },
    /// Every allowed attempt failed with a transient error.
    Exhausted { attempts: u32, last: E },
    /// Cancellation was requested before the operation succeeded.
    Cancelled { attempts: u32 },
}

impl<E> RetryError<E> {
    /// Number of attempts made before giving up.
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Permanent { attempts, .. }
            | RetryError::Exhausted { attempts, .. }
            | RetryError::Cancelled { attempts } => *attempts,
        }
    }

    /// The last underlying error, if the operation ran at all.
    pub fn into_inner(self) -> Option<E> {
        match self {
            RetryError::Permanent { error, .. } => Some(error),
            RetryError::Exhausted { last, .. } => Some(last),
            RetryError::Cancelled { .. } => None,
        }
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Permanent { error, .. } => write!(f, "{}", error),
            RetryError::Exhausted { attempts, last } => {
                write!(f, "gave up after {} attempts: {}", attempts, last)
            }
            RetryError::Cancelled { attempts } => {
                write!(f, "cancelled after {} attempts", attempts)
            }
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for RetryError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RetryError::Permanent { error, .. } => Some(error),
            RetryError::Exhausted { last, .. } => Some(last),
            RetryError::Cancelled { .. } => None,
        }
    }
}

impl RetryPolicy {
    /// Create a policy from explicit parameters.
    pub fn new(base_delay: Duration, max_delay: Duration, jitter: f64, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter: jitter.clamp(0.0, 1.0),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Capped delay before retry `attempt`, without jitter.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis();
        let factor = 1u128.checked_shl(attempt).unwrap_or(u128::MAX);
        let delay_ms = base_ms.saturating_mul(factor).min(self.max_delay.as_millis());
        Duration::from_millis(delay_ms.min(u64::MAX as u128) as u64)
    }

    /// Delay before retry `attempt` with jitter from the thread-local RNG.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.jittered_delay_for(attempt, &mut rand::thread_rng())
    }

    /// Delay before retry `attempt` with jitter drawn from `rng`.
    pub fn jittered_delay_for<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay_for(attempt).as_secs_f64();
        let spread = base * self.jitter;
        if spread <= 0.0 {
            return Duration::from_secs_f64(base);
        }
        let offset = rng.gen_range(-spread..=spread);
        Duration::from_secs_f64((base + offset).max(0.0))
    }

    /// Run `operation` until it succeeds, fails permanently, runs out of
    /// attempts, or `cancel` fires.
    ///
    /// The closure receives the 0-based attempt number. Only errors classified
    /// as transient are retried. Cancellation is honoured between attempts and
    /// during the backoff sleep, never in the middle of an attempt.
    pub async fn run<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        operation: &str,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + fmt::Display,
    {
        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled { attempts: attempt });
            }

            let error = match op(attempt).await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(operation, attempts = attempt + 1, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            let attempts = attempt + 1;
            if !error.class().is_retryable() {
                return Err(RetryError::Permanent { attempts, error });
            }
            if attempts >= self.max_attempts {
                warn!(operation, attempts, error = %error, "Retry budget exhausted");
                return Err(RetryError::Exhausted {
                    attempts,
                    last: error,
                });
            }

            let delay = self.delay_for(attempt);
            warn!(
                operation,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Transient failure, backing off"
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(RetryError::Cancelled { attempts });
                }
                _ = tokio::time::sleep(delay) => {}
            }
            attempt = attempts;
        }
    }
}
