//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → BulkheadConfig (validated, immutable)
//!     → each section handed to the component that owns it
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require a restart
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use schema::AdminConfig;
pub use schema::AdmissionConfig;
pub use schema::BreakerConfig;
pub use schema::BulkheadConfig;
pub use schema::CacheConfig;
pub use schema::CallConfig;
pub use schema::LifecycleConfig;
pub use schema::ObservabilityConfig;
pub use loader::{load_config, parse_config, ConfigError};
