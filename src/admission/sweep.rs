//! Idle connection sweep.
//!
//! # Data Flow
//! ```text
//! Every idle_sweep_interval:
//!     → find connections idle for >= idle_timeout
//!     → send each a liveness probe (LivenessProbe::probe)
//!     → wait probe_grace (cancellable)
//!     → evict those that did not heartbeat; release their ledger slot
//! ```
//!
//! # Design Decisions
//! - Two-phase probe-then-evict so a quiet but healthy peer is not dropped
//! - A heartbeat during the grace period cancels that connection's eviction
//! - No map lock is held while probing or waiting

use tokio_util::sync::CancellationToken;

use crate::admission::connection::{CloseReason, Connection};
use crate::admission::controller::Shared;
use crate::observability::metrics;

/// Transport hook used by the idle sweep.
///
/// Implementations must not block; queue the work and return.
pub trait LivenessProbe: Send + Sync {
    /// Ask the peer to prove it is alive. An answer arrives as a heartbeat.
    fn probe(&self, connection: &Connection);

    /// The controller dropped this connection; the transport should close it.
    fn evicted(&self, connection: &Connection, reason: CloseReason);
}

/// Probe that does nothing; idle connections are evicted after the grace period.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProbe;

impl LivenessProbe for NoopProbe {
    fn probe(&self, _connection: &Connection) {}

    fn evicted(&self, _connection: &Connection, _reason: CloseReason) {}
}

/// One probe-then-evict pass. Returns the number of connections evicted.
pub(crate) async fn sweep_once(shared: &Shared, token: &CancellationToken) -> usize {
    let now = tokio::time::Instant::now();
    let idle_timeout = shared.config.idle_timeout();
    shared
        .recently_evicted
        .retain(|_, evicted_at| now.saturating_duration_since(*evicted_at) < idle_timeout);

    let mut probed = Vec::new();
    for mut entry in shared.connections.iter_mut() {
        if entry.conn.idle_for(now) >= idle_timeout {
            let sent_at = *entry.probe_sent_at.get_or_insert(now);
            probed.push((entry.conn.clone(), sent_at));
        }
    }
    if probed.is_empty() {
        return 0;
    }

    tracing::debug!(candidates = probed.len(), "Probing idle connections");
    for (conn, _) in &probed {
        shared.probe.probe(conn);
    }

    tokio::select! {
        _ = token.cancelled() => return 0,
        _ = tokio::time::sleep(shared.config.probe_grace()) => {}
    }

    let mut evicted = 0;
    for (conn, sent_at) in probed {
        if let Some(conn) = shared.evict_if_silent(conn.id, sent_at) {
            shared.breakers.record_failure(&conn.identity);
            shared
                .counters
                .idle_evictions
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            metrics::record_idle_eviction();
            tracing::info!(
                connection_id = %conn.id,
                identity = %conn.identity,
                idle_for = ?conn.idle_for(tokio::time::Instant::now()),
                "Evicted idle connection"
            );
            evicted += 1;
        }
    }
    evicted
}
