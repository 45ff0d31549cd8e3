//! TOML config loading.

use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::config::schema::BulkheadConfig;
use crate::config::validation::{validate_config, ValidationError};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {}", join(.0))]
    Validation(Vec<ValidationError>),
}

fn join(errors: &[ValidationError]) -> String {
    errors.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<BulkheadConfig, ConfigError> {
    let config: BulkheadConfig = toml::from_str(content)?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Read, parse and validate a TOML config file.
pub fn load_config(path: &Path) -> Result<BulkheadConfig, ConfigError> {
    parse_config(&fs::read_to_string(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config = parse_config(
            r#"
            [admission]
            max_connections = 250

            [cache]
            recovery_backoff_mins = [1, 2, 4]
            recovery_cap_mins = 8
            "#,
        )
        .unwrap();

        assert_eq!(config.admission.max_connections, 250);
        assert_eq!(config.admission.per_identity_limit, 10);
        assert_eq!(config.cache.recovery_backoff_mins, vec![1, 2, 4]);
        assert_eq!(config.breaker.failure_threshold, 5);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = parse_config(
            r#"
            [admission]
            backpressure_threshold = 0.0
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
        assert!(err.to_string().contains("backpressure_threshold"));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let err = parse_config("[admission\nmax_connections = 1").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = load_config(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
