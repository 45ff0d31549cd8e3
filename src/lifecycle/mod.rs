//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Load config → Validate → Build components → Start background tasks
//!
//! Background work (scheduler.rs):
//!     Each component owns a TaskScheduler; stop(grace) cancels and joins its tasks
//!
//! Shutdown (shutdown.rs, signals.rs, drain.rs):
//!     SIGTERM/SIGINT → admission drain → call drain → cache drain → Exit
//! ```
//!
//! # Design Decisions
//! - Ordered shutdown: stop intake first, then wait for in-flight work
//! - Every wait has a grace period; stragglers are force-released

pub mod drain;
pub mod scheduler;
pub mod shutdown;
pub mod signals;
pub mod startup;

pub use drain::{InFlightGuard, InFlightTracker};
pub use scheduler::TaskScheduler;
pub use shutdown::Shutdown;
pub use startup::Services;
