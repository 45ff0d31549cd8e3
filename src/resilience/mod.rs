//! Resilience primitives shared by every resource class.
//!
//! # Data Flow
//! ```text
//! Admission / call / cache write:
//!     → circuit_breaker.rs (per-key gate: allow or deny)
//!     → ledger.rs (capacity accounting: grant or deny with reason)
//!     → timeouts.rs (deadline + cancellation for cross-boundary calls)
//!     → On failure: retries.rs + backoff.rs (bounded, jittered retries)
//! ```
//!
//! # Design Decisions
//! - One breaker implementation, instantiated per resource class
//! - Registries and ledgers are owned by the component that creates them, never global
//! - Timeouts are non-negotiable; every cross-boundary call has a deadline

pub mod backoff;
pub mod circuit_breaker;
pub mod ledger;
pub mod retries;
pub mod timeouts;

pub use circuit_breaker::{BreakerPolicy, BreakerRegistry, BreakerSnapshot, CircuitState, Decision, Permit};
pub use ledger::{Denial, ResourceLedger};
