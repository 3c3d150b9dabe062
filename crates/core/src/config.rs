//! Configuration management for VitalGuard devices.
//!
//! Every section carries `#[serde(default)]`, so a partial TOML file is valid
//! and only the values a deployment cares about need to be spelled out.

use crate::backoff::RetryPolicy;
use crate::error::{Error, Result};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub device: DeviceConfig,
    pub storage: StorageConfig,
    pub keys: KeyConfig,
    pub retry: RetryConfig,
    pub clock: ClockConfig,
    pub certificates: CertificateConfig,
    pub registration: RegistrationConfig,
    pub telemetry: TelemetryConfig,
    pub logging: LoggingConfig,
}

/// Locally-known hardware metadata sent with registration requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub serial_number: String,
    pub model: String,
    pub firmware_version: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            serial_number: "UNPROVISIONED".to_string(),
            model: "VG-BEDSIDE-1".to_string(),
            firmware_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub audit_db: String,
    pub certificate_db: String,
    pub spill_db: String,
    pub salt_file: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            audit_db: "audit.db".to_string(),
            certificate_db: "certificates.db".to_string(),
            spill_db: "telemetry_spill.db".to_string(),
            salt_file: "keystore.salt".to_string(),
        }
    }
}

impl StorageConfig {
    pub fn audit_path(&self) -> PathBuf {
        self.data_dir.join(&self.audit_db)
    }

    pub fn certificate_path(&self) -> PathBuf {
        self.data_dir.join(&self.certificate_db)
    }

    pub fn spill_path(&self) -> PathBuf {
        self.data_dir.join(&self.spill_db)
    }

    pub fn salt_path(&self) -> PathBuf {
        self.data_dir.join(&self.salt_file)
    }
}

/// Argon2id work factor and the source of the device secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyConfig {
    pub iterations: u32,
    pub memory_kib: u32,
    pub lanes: u32,
    /// Environment variable holding the device secret
    pub secret_env: String,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            iterations: 3,
            memory_kib: 64 * 1024,
            lanes: 1,
            secret_env: "VITALGUARD_DEVICE_SECRET".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: f64,
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            jitter: 0.2,
            max_attempts: 6,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            self.jitter,
            self.max_attempts,
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    pub sync_interval_secs: u64,
    pub jump_threshold_ms: i64,
    pub exchange_timeout_ms: u64,
    pub max_round_trip_ms: i64,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            sync_interval_secs: 15 * 60,
            jump_threshold_ms: 1_000,
            exchange_timeout_ms: 5_000,
            max_round_trip_ms: 10_000,
        }
    }
}

impl ClockConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_millis(self.exchange_timeout_ms)
    }
}

/// Issuer name and its hex-encoded Ed25519 verifying key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustAnchorConfig {
    pub issuer: String,
    pub public_key_hex: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CertificateConfig {
    pub rotation_window_days: u32,
    pub check_interval_secs: u64,
    pub network_timeout_ms: u64,
    pub trust_anchors: Vec<TrustAnchorConfig>,
}

impl Default for CertificateConfig {
    fn default() -> Self {
        Self {
            rotation_window_days: 30,
            check_interval_secs: 24 * 60 * 60,
            network_timeout_ms: 10_000,
            trust_anchors: Vec::new(),
        }
    }
}

impl CertificateConfig {
    pub fn rotation_window(&self) -> Duration {
        Duration::from_secs(u64::from(self.rotation_window_days) * 24 * 60 * 60)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_millis(self.network_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationConfig {
    pub timeout_ms: u64,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self { timeout_ms: 10_000 }
    }
}

impl RegistrationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// What `enqueue` does when both the queue and the spill store are full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnqueueMode {
    /// Wait until space frees up
    #[default]
    Block,
    /// Fail immediately with `QueueFull`
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub queue_capacity: usize,
    pub spill_capacity: usize,
    pub enqueue_mode: EnqueueMode,
    pub connect_timeout_ms: u64,
    pub ack_timeout_ms: u64,
    pub max_batch_attempts: u32,
    pub batch_retention_secs: u64,
    pub breaker_failure_threshold: u32,
    pub breaker_reset_secs: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            spill_capacity: 10_000,
            enqueue_mode: EnqueueMode::Block,
            connect_timeout_ms: 10_000,
            ack_timeout_ms: 5_000,
            max_batch_attempts: 10,
            batch_retention_secs: 24 * 60 * 60,
            breaker_failure_threshold: 5,
            breaker_reset_secs: 30,
        }
    }
}

impl TelemetryConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn batch_retention(&self) -> Duration {
        Duration::from_secs(self.batch_retention_secs)
    }

    pub fn breaker_reset(&self) -> Duration {
        Duration::from_secs(self.breaker_reset_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl NodeConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config = Self::from_toml(&content)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values no deployment could mean.
    pub fn validate(&self) -> Result<()> {
        fn invalid(msg: &str) -> Result<()> {
            Err(Error::Config(msg.to_string()))
        }

        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1");
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return invalid("retry.base_delay_ms must not exceed retry.max_delay_ms");
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return invalid("retry.jitter must be within [0, 1]");
        }
        if self.keys.iterations == 0 || self.keys.lanes == 0 {
            return invalid("keys.iterations and keys.lanes must be positive");
        }
        if self.keys.memory_kib < 8 * self.keys.lanes {
            return invalid("keys.memory_kib must be at least 8 KiB per lane");
        }
        if self.clock.sync_interval_secs == 0 {
            return invalid("clock.sync_interval_secs must be positive");
        }
        if self.clock.jump_threshold_ms < 0 || self.clock.max_round_trip_ms <= 0 {
            return invalid("clock thresholds must be positive");
        }
        if self.certificates.check_interval_secs == 0 {
            return invalid("certificates.check_interval_secs must be positive");
        }
        for anchor in &self.certificates.trust_anchors {
            match hex::decode(&anchor.public_key_hex) {
                Ok(bytes) if bytes.len() == 32 => {}
                _ => {
                    return Err(Error::Config(format!(
                        "trust anchor {} must be a 32-byte hex Ed25519 key",
                        anchor.issuer
                    )))
                }
            }
        }
        if self.telemetry.queue_capacity == 0 {
            return invalid("telemetry.queue_capacity must be positive");
        }
        if self.telemetry.max_batch_attempts == 0 {
            return invalid("telemetry.max_batch_attempts must be positive");
        }
        if self.telemetry.breaker_failure_threshold == 0 {
            return invalid("telemetry.breaker_failure_threshold must be positive");
        }
        if self.telemetry.ack_timeout_ms == 0 || self.telemetry.connect_timeout_ms == 0 {
            return invalid("telemetry timeouts must be positive");
        }
        Ok(())
    }
}
