//! Structured logging infrastructure for VitalGuard.
//!
//! This module provides centralized logging initialization with support
//! for structured JSON output and environment-based configuration.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Build the filter from `RUST_LOG`, falling back to `default_level`.
fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Initialize the logging system with structured output.
///
/// Log level can be configured via the `RUST_LOG` environment variable.
/// If not set, defaults to `info` level.
///
/// # Example
/// ```no_run
/// use vitalguard_core::logging;
///
/// logging::init();
/// tracing::info!("Device agent started");
/// ```
pub fn init() {
    init_with("info", false);
}

/// Initialize the logging system with JSON output for production devices.
///
/// This format is suitable for log aggregation systems and structured log analysis.
/// Log level can be configured via the `RUST_LOG` environment variable.
///
/// # Example
/// ```no_run
/// use vitalguard_core::logging;
///
/// logging::init_json();
/// tracing::info!(component = "telemetry", "Transport started");
/// ```
pub fn init_json() {
    init_with("info", true);
}

/// Initialize logging from configuration values.
///
/// `RUST_LOG` still takes precedence over `default_level`. Calling this more
/// than once per process is a no-op.
pub fn init_with(default_level: &str, json: bool) {
    let filter = env_filter(default_level);
    let registry = tracing_subscriber::registry().with(filter);

    let result = if json {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .try_init()
    };

    if result.is_err() {
        tracing::debug!("Logging already initialized");
    }
}
