//! Delivery circuit breaker.
//!
//! Closed: deliveries proceed. After `failure_threshold` consecutive failures
//! the breaker opens and deliveries pause for `reset_after`. The first call
//! after that runs half-open: success closes the breaker, failure reopens it.

use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open { since: Instant },
    HalfOpen,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    state: BreakerState,
    consecutive_failures: u32,
    failure_threshold: u32,
    reset_after: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, reset_after: Duration) -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            failure_threshold: failure_threshold.max(1),
            reset_after,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Whether a delivery may be attempted at `now`. Moves Open to HalfOpen
    /// once the reset period has passed.
    pub fn allow(&mut self, now: Instant) -> bool {
        match self.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open { since } => {
                if now.saturating_duration_since(since) >= self.reset_after {
                    info!("Delivery circuit half-open, probing");
                    self.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Time left before an open breaker admits a probe.
    pub fn remaining(&self, now: Instant) -> Duration {
        match self.state {
            BreakerState::Open { since } => self
                .reset_after
                .saturating_sub(now.saturating_duration_since(since)),
            _ => Duration::ZERO,
        }
    }

    pub fn record_success(&mut self) {
        if self.state != BreakerState::Closed {
            info!("Delivery circuit closed");
        }
        self.state = BreakerState::Closed;
        self.consecutive_failures = 0;
    }

    pub fn record_failure(&mut self, now: Instant) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let trip = matches!(self.state, BreakerState::HalfOpen)
            || self.consecutive_failures >= self.failure_threshold;
        if trip && !matches!(self.state, BreakerState::Open { .. }) {
            warn!(
                failures = self.consecutive_failures,
                reset_ms = self.reset_after.as_millis() as u64,
                "Delivery circuit opened"
            );
            self.state = BreakerState::Open { since: now };
        }
    }
}
