//! Cache resilience subsystem.
//!
//! # Data Flow
//! ```text
//! get(key):
//!     → hot.rs (LRU hit?)
//!     → warm.rs (unless memory-only; verify checksum, quarantine on mismatch)
//!     → promote WARM hit into HOT
//!
//! set(key, value):
//!     → hot.rs (always)
//!     → warm.rs atomic write (Normal mode only, storage breaker permitting)
//!     → failures feed health.rs
//!
//! Background (layer.rs):
//!     health monitor → probe disk, purge expired quarantine
//!     recovery scheduler → probe on the backoff schedule while memory-only
//! ```

pub mod health;
pub(crate) mod hot;
pub mod layer;
pub(crate) mod warm;

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub use health::{DiskHealth, DiskMode};
pub use layer::{CacheStats, ResilientCache};

/// Disk-level failures. Contained by the cache; callers never see them.
#[derive(Debug, Error)]
pub(crate) enum StorageError {
    #[error("disk write failed at {}: {source}", .path.display())]
    DiskWriteFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("disk read failed at {}: {source}", .path.display())]
    DiskReadFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("corrupt entry at {}: {reason}", .path.display())]
    DiskCorruption { path: PathBuf, reason: &'static str },

    #[error("entry of {size} bytes exceeds warm capacity of {capacity} bytes")]
    TooLarge { size: u64, capacity: u64 },

    #[error("blocking disk task failed: {0}")]
    TaskFailed(String),
}
