//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (capacities > 0, ratios in (0, 1])
//! - Check that related limits agree with each other
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: BulkheadConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use thiserror::Error;

use crate::config::schema::BulkheadConfig;

/// A single semantic problem found in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("{field} must be within (0, 1], got {value}")]
    OutOfRange { field: &'static str, value: String },

    #[error("admission.per_identity_limit ({limit}) exceeds admission.max_connections ({capacity})")]
    PerIdentityAboveCapacity { limit: u64, capacity: u64 },

    #[error("calls.max_delay_ms ({max}) is below calls.base_delay_ms ({base})")]
    BackoffInverted { base: u64, max: u64 },

    #[error("cache.recovery_backoff_mins must be strictly increasing")]
    RecoveryNotIncreasing,

    #[error("cache.recovery_cap_mins ({cap}) is below the last scheduled delay ({last})")]
    RecoveryCapTooLow { cap: u64, last: u64 },

    #[error("{field} is not a valid socket address: {value}")]
    BadAddress { field: &'static str, value: String },
}

/// Validate a configuration, collecting every problem found.
pub fn validate_config(config: &BulkheadConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let mut non_zero = |field: &'static str, value: u64| {
        if value == 0 {
            errors.push(ValidationError::Zero { field });
        }
    };

    let admission = &config.admission;
    non_zero("admission.max_connections", admission.max_connections);
    non_zero("admission.per_identity_limit", admission.per_identity_limit);
    non_zero("admission.idle_timeout_secs", admission.idle_timeout_secs);
    non_zero("admission.idle_sweep_interval_secs", admission.idle_sweep_interval_secs);
    non_zero("breaker.failure_threshold", config.breaker.failure_threshold as u64);
    non_zero("breaker.failure_window_secs", config.breaker.failure_window_secs);
    non_zero("calls.timeout_ms", config.calls.timeout_ms);
    non_zero("cache.hot_capacity", config.cache.hot_capacity);
    non_zero("cache.warm_capacity_bytes", config.cache.warm_capacity_bytes);
    non_zero("cache.health_check_interval_secs", config.cache.health_check_interval_secs);
    non_zero("cache.disk_failure_threshold", config.cache.disk_failure_threshold as u64);
    non_zero("cache.memory_only_multiplier", config.cache.memory_only_multiplier);
    non_zero("cache.recovery_cap_mins", config.cache.recovery_cap_mins);

    let threshold = admission.backpressure_threshold;
    if !(threshold > 0.0 && threshold <= 1.0) {
        errors.push(ValidationError::OutOfRange {
            field: "admission.backpressure_threshold",
            value: threshold.to_string(),
        });
    }

    if admission.per_identity_limit > admission.max_connections {
        errors.push(ValidationError::PerIdentityAboveCapacity {
            limit: admission.per_identity_limit,
            capacity: admission.max_connections,
        });
    }

    if config.calls.max_delay_ms < config.calls.base_delay_ms {
        errors.push(ValidationError::BackoffInverted {
            base: config.calls.base_delay_ms,
            max: config.calls.max_delay_ms,
        });
    }

    let schedule = &config.cache.recovery_backoff_mins;
    if schedule.windows(2).any(|w| w[0] >= w[1]) || schedule.first() == Some(&0) {
        errors.push(ValidationError::RecoveryNotIncreasing);
    }
    if let Some(&last) = schedule.last() {
        if config.cache.recovery_cap_mins < last {
            errors.push(ValidationError::RecoveryCapTooLow {
                cap: config.cache.recovery_cap_mins,
                last,
            });
        }
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<std::net::SocketAddr>().is_err()
    {
        errors.push(ValidationError::BadAddress {
            field: "observability.metrics_address",
            value: config.observability.metrics_address.clone(),
        });
    }
    if config.admin.enabled
        && config.admin.bind_address.parse::<std::net::SocketAddr>().is_err()
    {
        errors.push(ValidationError::BadAddress {
            field: "admin.bind_address",
            value: config.admin.bind_address.clone(),
        });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
