//! Connection admission subsystem.
//!
//! # Data Flow
//! ```text
//! New long-lived connection:
//!     → controller.rs (draining? identity breaker? ledger grant?)
//!     → connection.rs (record with lastActivityAt = now)
//!     → backpressure.rs (edge-triggered signal near capacity)
//!
//! While open:
//!     heartbeat → lastActivityAt = now
//!     sweep.rs (periodic) → probe idle → evict if silent
//!
//! Close:
//!     release / transport close / idle eviction / drain → ledger slot returned
//! ```

pub mod backpressure;
pub mod connection;
pub mod controller;
pub mod sweep;

use thiserror::Error;

pub use backpressure::BackpressureSignal;
pub use connection::{CloseReason, Connection, ConnectionId};
pub use controller::{AdmissionController, AdmissionStats};
pub use sweep::{LivenessProbe, NoopProbe};

/// Reasons a connection is refused or an operation on it fails.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("connection capacity exceeded")]
    CapacityExceeded,

    #[error("per-identity connection limit exceeded")]
    PerIdentityExceeded,

    #[error("identity is temporarily blocked after repeated dead connections")]
    BreakerOpen,

    #[error("admission is draining")]
    Draining,

    #[error("connection {0} was reclaimed after idle timeout")]
    IdleTimeout(ConnectionId),

    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
}
