//! Bulkhead: bounded-resource resilience core.
//!
//! Components:
//! - [`admission`]: caps concurrent long-lived connections, reclaims idle ones
//! - [`boundary`]: timeout, retry, circuit breaking and fallback for outbound calls
//! - [`cache`]: HOT/WARM cache that degrades to memory-only on disk trouble
//!
//! Shared building blocks live in [`resilience`] (breaker, ledger, backoff)
//! and [`lifecycle`] (task scheduling, drain, startup).

pub mod admin;
pub mod admission;
pub mod boundary;
pub mod cache;
pub mod config;
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use config::BulkheadConfig;
pub use lifecycle::{Services, Shutdown};
