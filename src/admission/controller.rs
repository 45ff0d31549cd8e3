//! Connection admission controller.
//!
//! # Responsibilities
//! - Accept or reject new long-lived connections against the ledger
//! - Hold off identities whose connections keep dying (per-identity breaker)
//! - Track liveness through heartbeats
//! - Reclaim idle connections (see sweep.rs) and drain on shutdown
//!
//! # Design Decisions
//! - Rejections carry an explicit reason and are never retried here
//! - Ledger and breaker registry are owned by this controller, not shared globally
//! - Backpressure is advisory; the hard limit is the ledger

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;

use crate::admission::backpressure::{Backpressure, BackpressureSignal};
use crate::admission::connection::{CloseReason, Connection, ConnectionId, ConnectionIdGen, Tracked};
use crate::admission::sweep::{self, LivenessProbe};
use crate::admission::AdmissionError;
use crate::config::AdmissionConfig;
use crate::lifecycle::TaskScheduler;
use crate::observability::metrics;
use crate::resilience::{BreakerPolicy, BreakerRegistry, BreakerSnapshot, Denial, ResourceLedger};

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) admitted: AtomicU64,
    pub(crate) rejected_capacity: AtomicU64,
    pub(crate) rejected_per_identity: AtomicU64,
    pub(crate) rejected_breaker: AtomicU64,
    pub(crate) rejected_draining: AtomicU64,
    pub(crate) idle_evictions: AtomicU64,
}

/// State shared between the controller and its sweep task.
pub(crate) struct Shared {
    pub(crate) config: AdmissionConfig,
    pub(crate) ledger: ResourceLedger<String>,
    pub(crate) breakers: BreakerRegistry<String>,
    pub(crate) connections: DashMap<ConnectionId, Tracked>,
    pub(crate) backpressure: Backpressure,
    pub(crate) probe: Arc<dyn LivenessProbe>,
    pub(crate) counters: Counters,
    /// Idle-evicted connections, kept for one idle_timeout so late heartbeats get a reason.
    pub(crate) recently_evicted: DashMap<ConnectionId, Instant>,
    ids: ConnectionIdGen,
    draining: AtomicBool,
    emptied: Notify,
}

impl Shared {
    /// Remove a connection and give back its slot. False if it was already gone.
    pub(crate) fn remove(&self, id: ConnectionId, reason: CloseReason) -> bool {
        match self.connections.remove(&id) {
            Some((_, tracked)) => {
                self.finish_removal(tracked, reason);
                true
            }
            None => false,
        }
    }

    /// Evict a probed connection unless a heartbeat answered the probe sent at `probed_at`.
    pub(crate) fn evict_if_silent(&self, id: ConnectionId, probed_at: Instant) -> Option<Connection> {
        let (_, tracked) = self
            .connections
            .remove_if(&id, |_, t| t.probe_sent_at == Some(probed_at))?;
        let conn = tracked.conn.clone();
        self.recently_evicted.insert(id, Instant::now());
        self.finish_removal(tracked, CloseReason::IdleTimeout);
        Some(conn)
    }

    fn finish_removal(&self, tracked: Tracked, reason: CloseReason) {
        self.ledger.release(&tracked.conn.identity, 1);
        self.refresh_backpressure();
        metrics::record_active_connections(self.ledger.used());

        tracing::debug!(
            connection_id = %tracked.conn.id,
            identity = %tracked.conn.identity,
            reason = reason.as_str(),
            "Connection closed"
        );
        if matches!(reason, CloseReason::IdleTimeout | CloseReason::Drained) {
            self.probe.evicted(&tracked.conn, reason);
        }
        if self.connections.is_empty() {
            self.emptied.notify_waiters();
        }
    }

    pub(crate) fn refresh_backpressure(&self) {
        self.backpressure
            .update(|| (self.ledger.used(), self.ledger.capacity()));
    }
}

/// Admission statistics for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct AdmissionStats {
    pub active: u64,
    pub capacity: u64,
    pub utilization: f64,
    pub per_identity_limit: u64,
    pub estimated_bytes: u64,
    pub admitted_total: u64,
    pub rejected_capacity: u64,
    pub rejected_per_identity: u64,
    pub rejected_breaker_open: u64,
    pub rejected_draining: u64,
    pub idle_evictions: u64,
    pub backpressure_engaged: bool,
    pub draining: bool,
}

/// Governs concurrent long-lived connections.
pub struct AdmissionController {
    shared: Arc<Shared>,
    scheduler: TaskScheduler,
}

impl AdmissionController {
    /// Create a controller. Background tasks start with `start_background_tasks`.
    pub fn new(config: AdmissionConfig, breaker: BreakerPolicy, probe: Arc<dyn LivenessProbe>) -> Self {
        let ledger = ResourceLedger::new(
            "connections",
            config.max_connections,
            Some(config.per_identity_limit),
        );
        let backpressure = Backpressure::new(config.backpressure_threshold);

        tracing::info!(
            max_connections = config.max_connections,
            per_identity_limit = config.per_identity_limit,
            idle_timeout = ?config.idle_timeout(),
            "Admission controller created"
        );

        Self {
            shared: Arc::new(Shared {
                config,
                ledger,
                breakers: BreakerRegistry::new("connection", breaker),
                connections: DashMap::new(),
                backpressure,
                probe,
                counters: Counters::default(),
                recently_evicted: DashMap::new(),
                ids: ConnectionIdGen::new(),
                draining: AtomicBool::new(false),
                emptied: Notify::new(),
            }),
            scheduler: TaskScheduler::new("admission"),
        }
    }

    /// Start the periodic idle sweep.
    pub fn start_background_tasks(&self) {
        let shared = Arc::clone(&self.shared);
        let token = self.scheduler.token();
        self.scheduler.spawn_periodic(
            "idle_sweep",
            self.shared.config.idle_sweep_interval(),
            move || {
                let shared = Arc::clone(&shared);
                let token = token.clone();
                async move {
                    sweep::sweep_once(&shared, &token).await;
                }
            },
        );
    }

    /// Decide whether to accept a new connection for `identity`.
    pub fn admit(&self, identity: &str) -> Result<Connection, AdmissionError> {
        let shared = &self.shared;
        let identity = identity.to_string();

        if shared.draining.load(Ordering::SeqCst) {
            shared.counters.rejected_draining.fetch_add(1, Ordering::Relaxed);
            metrics::record_admission("draining");
            return Err(AdmissionError::Draining);
        }

        let Some(permit) = shared.breakers.permit(&identity) else {
            shared.counters.rejected_breaker.fetch_add(1, Ordering::Relaxed);
            metrics::record_admission("breaker_open");
            tracing::debug!(identity = %identity, "Admission denied, identity breaker open");
            return Err(AdmissionError::BreakerOpen);
        };

        if let Err(denial) = shared.ledger.try_acquire(&identity, 1) {
            drop(permit);
            let (counter, label, err) = match denial {
                Denial::CapacityExceeded => (
                    &shared.counters.rejected_capacity,
                    "capacity_exceeded",
                    AdmissionError::CapacityExceeded,
                ),
                Denial::PerIdentityExceeded => (
                    &shared.counters.rejected_per_identity,
                    "per_identity_exceeded",
                    AdmissionError::PerIdentityExceeded,
                ),
            };
            counter.fetch_add(1, Ordering::Relaxed);
            metrics::record_admission(label);
            tracing::debug!(identity = %identity, reason = label, "Admission rejected");
            return Err(err);
        }

        // An identity that gets a slot again has recovered.
        permit.success();

        let conn = Connection::new(
            shared.ids.next(),
            identity,
            shared.config.estimated_connection_bytes,
            Instant::now(),
        );
        shared.connections.insert(
            conn.id,
            Tracked {
                conn: conn.clone(),
                probe_sent_at: None,
            },
        );
        shared.counters.admitted.fetch_add(1, Ordering::Relaxed);
        metrics::record_admission("admitted");
        metrics::record_active_connections(shared.ledger.used());
        shared.refresh_backpressure();

        tracing::debug!(connection_id = %conn.id, identity = %conn.identity, "Connection admitted");
        Ok(conn)
    }

    /// Record activity on a connection, answering any outstanding probe.
    pub fn heartbeat(&self, id: ConnectionId) -> Result<(), AdmissionError> {
        let Some(mut tracked) = self.shared.connections.get_mut(&id) else {
            if self.shared.recently_evicted.contains_key(&id) {
                return Err(AdmissionError::IdleTimeout(id));
            }
            return Err(AdmissionError::UnknownConnection(id));
        };
        tracked.conn.last_activity_at = Instant::now();
        if tracked.probe_sent_at.take().is_some() {
            tracing::trace!(connection_id = %id, "Liveness probe answered");
        }
        Ok(())
    }

    /// Explicit close. Returns false if the connection was already gone.
    pub fn release(&self, id: ConnectionId) -> bool {
        self.shared.remove(id, CloseReason::Released)
    }

    /// The transport noticed the peer went away.
    pub fn transport_closed(&self, id: ConnectionId) -> bool {
        self.shared.remove(id, CloseReason::TransportClosed)
    }

    /// Run one probe-then-evict pass now. Returns the number evicted.
    pub async fn sweep_now(&self) -> usize {
        sweep::sweep_once(&self.shared, &self.scheduler.token()).await
    }

    pub fn subscribe_backpressure(&self) -> broadcast::Receiver<BackpressureSignal> {
        self.shared.backpressure.subscribe()
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Connection> {
        self.shared.connections.get(&id).map(|t| t.conn.clone())
    }

    pub fn active(&self) -> u64 {
        self.shared.ledger.used()
    }

    pub fn breaker_states(&self) -> Vec<BreakerSnapshot> {
        self.shared.breakers.snapshot()
    }

    pub fn stats(&self) -> AdmissionStats {
        let shared = &self.shared;
        let c = &shared.counters;
        let active = shared.ledger.used();
        AdmissionStats {
            active,
            capacity: shared.ledger.capacity(),
            utilization: shared.ledger.utilization(),
            per_identity_limit: shared.config.per_identity_limit,
            estimated_bytes: active * shared.config.estimated_connection_bytes,
            admitted_total: c.admitted.load(Ordering::Relaxed),
            rejected_capacity: c.rejected_capacity.load(Ordering::Relaxed),
            rejected_per_identity: c.rejected_per_identity.load(Ordering::Relaxed),
            rejected_breaker_open: c.rejected_breaker.load(Ordering::Relaxed),
            rejected_draining: c.rejected_draining.load(Ordering::Relaxed),
            idle_evictions: c.idle_evictions.load(Ordering::Relaxed),
            backpressure_engaged: shared.backpressure.is_engaged(),
            draining: shared.draining.load(Ordering::SeqCst),
        }
    }

    /// Stop admitting, wait up to `grace` for owners to release their
    /// connections, then force-release the rest.
    pub async fn drain(&self, grace: Duration) {
        let shared = &self.shared;
        shared.draining.store(true, Ordering::SeqCst);
        self.scheduler.stop(grace).await;

        let wait = async {
            loop {
                let emptied = shared.emptied.notified();
                if shared.connections.is_empty() {
                    return;
                }
                emptied.await;
            }
        };
        if tokio::time::timeout(grace, wait).await.is_err() {
            let remaining: Vec<ConnectionId> = shared.connections.iter().map(|e| *e.key()).collect();
            tracing::warn!(remaining = remaining.len(), "Drain grace elapsed, force-releasing connections");
            for id in remaining {
                shared.remove(id, CloseReason::Drained);
            }
        }
        tracing::info!("Admission controller drained");
    }
}

impl std::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionController")
            .field("active", &self.shared.ledger.used())
            .field("capacity", &self.shared.ledger.capacity())
            .finish()
    }
}
