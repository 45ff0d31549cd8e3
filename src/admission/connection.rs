//! Connection records and identifiers.
//!
//! # Responsibilities
//! - Generate connection IDs unique within one controller
//! - Hold the liveness timestamps the idle sweep works from
//! - Name the reasons a connection can leave the controller

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::time::Instant;

/// Unique identifier for a connection within one admission controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for ConnectionId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Per-controller ID source. Relaxed ordering is enough since only uniqueness matters.
#[derive(Debug)]
pub(crate) struct ConnectionIdGen(AtomicU64);

impl ConnectionIdGen {
    pub(crate) fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    pub(crate) fn next(&self) -> ConnectionId {
        ConnectionId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

/// An admitted long-lived connection.
///
/// Refers to its ledger slot by `identity` only; the ledger owns the accounting.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: ConnectionId,
    pub identity: String,
    pub created_at: Instant,
    pub last_activity_at: Instant,
    pub estimated_bytes: u64,
}

impl Connection {
    pub(crate) fn new(id: ConnectionId, identity: String, estimated_bytes: u64, now: Instant) -> Self {
        Self {
            id,
            identity,
            created_at: now,
            last_activity_at: now,
            estimated_bytes,
        }
    }

    /// Time since the last sign of life.
    pub fn idle_for(&self, now: Instant) -> std::time::Duration {
        now.saturating_duration_since(self.last_activity_at)
    }
}

/// Connection plus the sweep's probe bookkeeping.
#[derive(Debug, Clone)]
pub(crate) struct Tracked {
    pub(crate) conn: Connection,
    /// Set when a liveness probe was sent; cleared by any heartbeat.
    pub(crate) probe_sent_at: Option<Instant>,
}

/// Why a connection left the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Caller released it explicitly.
    Released,
    /// The transport reported the peer gone.
    TransportClosed,
    /// Idle, probed, and silent through the grace period.
    IdleTimeout,
    /// Force-released at the end of a drain.
    Drained,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Released => "released",
            CloseReason::TransportClosed => "transport_closed",
            CloseReason::IdleTimeout => "idle_timeout",
            CloseReason::Drained => "drained",
        }
    }
}
