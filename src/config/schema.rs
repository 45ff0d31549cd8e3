//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the
//! resilience core. All types derive Serde traits for deserialization from
//! config files, and every section falls back to its defaults when omitted.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct BulkheadConfig {
    /// Connection admission settings.
    pub admission: AdmissionConfig,

    /// Breaker settings shared by every resource class.
    pub breaker: BreakerConfig,

    /// Cross-boundary call settings.
    pub calls: CallConfig,

    /// Two-tier cache settings.
    pub cache: CacheConfig,

    /// Logging and metrics.
    pub observability: ObservabilityConfig,

    /// Admin HTTP surface.
    pub admin: AdminConfig,

    /// Shutdown behaviour.
    pub lifecycle: LifecycleConfig,
}

/// Connection admission configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Maximum concurrent long-lived connections.
    pub max_connections: u64,

    /// Maximum concurrent connections per identity (user or IP).
    pub per_identity_limit: u64,

    /// Inactivity after which a connection is probed, in seconds.
    pub idle_timeout_secs: u64,

    /// Interval between idle sweeps, in seconds.
    pub idle_sweep_interval_secs: u64,

    /// How long a probed connection has to answer, in milliseconds.
    pub probe_grace_ms: u64,

    /// Utilisation ratio at which backpressure is signalled.
    pub backpressure_threshold: f64,

    /// Rough per-connection memory estimate used for reporting.
    pub estimated_connection_bytes: u64,
}

impl AdmissionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn idle_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.idle_sweep_interval_secs)
    }

    pub fn probe_grace(&self) -> Duration {
        Duration::from_millis(self.probe_grace_ms)
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            per_identity_limit: 10,
            idle_timeout_secs: 300,
            idle_sweep_interval_secs: 60,
            probe_grace_ms: 5_000,
            backpressure_threshold: 0.85,
            estimated_connection_bytes: 64 * 1024,
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Failures within the window that open the circuit.
    pub failure_threshold: u32,

    /// Rolling window over which failures are counted, in seconds.
    pub failure_window_secs: u64,

    /// Time an open circuit waits before allowing a probe, in seconds.
    pub cooldown_secs: u64,
}

impl BreakerConfig {
    pub fn failure_window(&self) -> Duration {
        Duration::from_secs(self.failure_window_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window_secs: 60,
            cooldown_secs: 30,
        }
    }
}

/// Call boundary configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CallConfig {
    /// Default per-attempt timeout in milliseconds.
    pub timeout_ms: u64,

    /// Default number of retries after the first attempt.
    pub max_retries: u32,

    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,

    /// Maximum delay for exponential backoff in milliseconds.
    pub max_delay_ms: u64,
}

impl CallConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            max_retries: 2,
            base_delay_ms: 100,
            max_delay_ms: 2_000,
        }
    }
}

/// Two-tier cache configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of entries in the in-memory tier.
    pub hot_capacity: u64,

    /// Directory holding the disk-backed tier.
    pub warm_dir: PathBuf,

    /// Byte budget of the disk-backed tier.
    pub warm_capacity_bytes: u64,

    /// Interval between disk health probes, in seconds.
    pub health_check_interval_secs: u64,

    /// Consecutive disk failures that switch the cache to memory-only mode.
    pub disk_failure_threshold: u32,

    /// Factor applied to the hot capacity while in memory-only mode.
    pub memory_only_multiplier: u64,

    /// Recovery probe delays in minutes, applied in order.
    pub recovery_backoff_mins: Vec<u64>,

    /// Upper bound for recovery probe delays once the schedule is exhausted.
    pub recovery_cap_mins: u64,

    /// How long quarantined entries are kept, in hours.
    pub quarantine_retention_hours: u64,
}

impl CacheConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn recovery_schedule(&self) -> Vec<Duration> {
        self.recovery_backoff_mins
            .iter()
            .map(|m| Duration::from_secs(m * 60))
            .collect()
    }

    pub fn recovery_cap(&self) -> Duration {
        Duration::from_secs(self.recovery_cap_mins * 60)
    }

    pub fn quarantine_retention(&self) -> Duration {
        Duration::from_secs(self.quarantine_retention_hours * 3600)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            hot_capacity: 1_000,
            warm_dir: PathBuf::from("./data/warm"),
            warm_capacity_bytes: 256 * 1024 * 1024,
            health_check_interval_secs: 60,
            disk_failure_threshold: 3,
            memory_only_multiplier: 2,
            recovery_backoff_mins: vec![5, 10, 20, 40],
            recovery_cap_mins: 60,
            quarantine_retention_hours: 7 * 24,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable the Prometheus metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Admin surface configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable the admin HTTP surface.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Admin bind address.
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            // WARNING: This is a placeholder! Change this in production.
            api_key: "CHANGE_ME_IN_PRODUCTION".to_string(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}

/// Shutdown configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Grace period each component gets to finish in-flight work, in seconds.
    pub drain_grace_secs: u64,
}

impl LifecycleConfig {
    pub fn drain_grace(&self) -> Duration {
        Duration::from_secs(self.drain_grace_secs)
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            drain_grace_secs: 10,
        }
    }
}
