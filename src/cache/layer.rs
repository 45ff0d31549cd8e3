//! Two-tier cache with contained storage failures.
//!
//! # Responsibilities
//! - Serve reads from HOT, then WARM (promoting WARM hits)
//! - Write through to WARM while the disk is healthy
//! - Switch to memory-only after repeated disk failures and probe for recovery
//! - Quarantine WARM entries that fail verification
//!
//! # Design Decisions
//! - Callers only ever see a value or a miss; storage errors stay in here
//! - WARM I/O runs on the blocking pool; no lock is held across it
//! - Keys whose WARM copy is known to be stale are never read from WARM

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cache::health::{DiskHealth, DiskHealthState, DiskMode};
use crate::cache::hot::HotTier;
use crate::cache::warm::WarmStore;
use crate::cache::StorageError;
use crate::config::CacheConfig;
use crate::lifecycle::{InFlightTracker, TaskScheduler};
use crate::observability::metrics;
use crate::resilience::backoff::RecoveryBackoff;
use crate::resilience::{BreakerPolicy, BreakerRegistry, BreakerSnapshot, CircuitState};

#[derive(Debug, Default)]
struct Counters {
    hot_hits: AtomicU64,
    warm_hits: AtomicU64,
    misses: AtomicU64,
    warm_writes: AtomicU64,
    warm_write_failures: AtomicU64,
    warm_writes_skipped: AtomicU64,
}

/// Cache statistics for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hit_rate: f64,
    pub hot_hits: u64,
    pub warm_hits: u64,
    pub misses: u64,
    pub hot_size: usize,
    pub hot_capacity: usize,
    pub warm_entries: usize,
    pub warm_bytes: u64,
    pub warm_capacity_bytes: u64,
    pub warm_mode: DiskMode,
    pub disk_health: DiskHealth,
    pub recovery_countdown_ms: Option<u64>,
    pub quarantined: u64,
    pub warm_writes: u64,
    pub warm_write_failures: u64,
    pub warm_writes_skipped: u64,
}

struct Inner {
    config: CacheConfig,
    hot: Mutex<HotTier>,
    warm: Arc<WarmStore>,
    health: Mutex<DiskHealthState>,
    recovery: RecoveryBackoff,
    breakers: BreakerRegistry<String>,
    storage_key: String,
    /// Version stamp for writes and removals, taken in HOT order.
    generation: AtomicU64,
    /// Keys whose WARM copy is older than the HOT one, with the generation
    /// that made it so.
    stale: Mutex<HashMap<String, u64>>,
    /// WARM writes not yet committed or abandoned, per key.
    pending: Mutex<HashMap<String, u32>>,
    in_flight: InFlightTracker,
    wake_recovery: Notify,
    counters: Counters,
}

impl Inner {
    fn base_hot_capacity(&self) -> usize {
        self.config.hot_capacity as usize
    }

    fn mode(&self) -> DiskMode {
        self.health.lock().expect("disk health mutex poisoned").mode()
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&WarmStore) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        let warm = Arc::clone(&self.warm);
        tokio::task::spawn_blocking(move || f(&warm))
            .await
            .map_err(|e| StorageError::TaskFailed(e.to_string()))?
    }

    fn disk_success(&self) {
        self.health.lock().expect("disk health mutex poisoned").record_success();
    }

    fn disk_failure(&self, context: &'static str, error: &StorageError) {
        let switched = self
            .health
            .lock()
            .expect("disk health mutex poisoned")
            .record_failure(self.config.disk_failure_threshold, Instant::now(), &self.recovery);
        tracing::warn!(context, error = %error, "Warm tier failure");
        if switched {
            self.enter_memory_only();
        }
    }

    fn enter_memory_only(&self) {
        let capacity = self.base_hot_capacity() * self.config.memory_only_multiplier as usize;
        self.hot.lock().expect("hot tier mutex poisoned").set_capacity(capacity);
        metrics::record_disk_mode(true);
        tracing::warn!(
            mode = DiskMode::MemoryOnly.as_str(),
            hot_capacity = capacity,
            next_probe_in = ?self.recovery.delay(0),
            "Disk unhealthy, cache switched to memory-only"
        );
        self.wake_recovery.notify_one();
    }

    /// Update HOT and stamp the change. The stamp is taken under the HOT
    /// lock, so generations follow HOT order.
    fn update_hot(self: &Arc<Self>, key: &str, value: Option<Vec<u8>>) -> HotUpdate {
        let mut hot = self.hot.lock().expect("hot tier mutex poisoned");
        let held = match value {
            Some(value) => {
                hot.insert(key, value);
                true
            }
            None => hot.remove(key),
        };
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        *self
            .pending
            .lock()
            .expect("pending writes mutex poisoned")
            .entry(key.to_string())
            .or_default() += 1;
        HotUpdate {
            held,
            pending: PendingWrite {
                inner: Arc::clone(self),
                key: key.to_string(),
                generation,
            },
        }
    }

    fn has_pending(&self, key: &str) -> bool {
        self.pending
            .lock()
            .expect("pending writes mutex poisoned")
            .contains_key(key)
    }

    /// Record that WARM may hold an older value for `key` than HOT.
    fn mark_stale(&self, key: &str, generation: u64) {
        // Pending first: a write leaves `pending` only after it is in the index.
        if self.has_pending(key) || self.warm.contains(key) {
            let mut stale = self.stale.lock().expect("stale set mutex poisoned");
            let entry = stale.entry(key.to_string()).or_insert(generation);
            *entry = (*entry).max(generation);
        }
    }

    fn is_stale(&self, key: &str) -> bool {
        self.stale.lock().expect("stale set mutex poisoned").contains_key(key)
    }

    /// WARM now holds the value stamped `generation`.
    fn clear_stale(&self, key: &str, generation: u64) {
        let mut stale = self.stale.lock().expect("stale set mutex poisoned");
        if stale.get(key).is_some_and(|marked| *marked <= generation) {
            stale.remove(key);
        }
    }

    async fn health_tick(&self) {
        if self.mode() == DiskMode::Normal {
            let result = self.blocking(|warm| warm.probe()).await;
            self.health
                .lock()
                .expect("disk health mutex poisoned")
                .record_probe(result.is_ok(), Instant::now());
            match result {
                Ok(()) => {
                    self.disk_success();
                    // A passing probe closes the storage breaker.
                    if self.breakers.state(&self.storage_key) != CircuitState::Closed {
                        self.breakers.reset(&self.storage_key);
                    }
                }
                Err(e) => self.disk_failure("health_probe", &e),
            }
        }

        let retention = self.config.quarantine_retention();
        if let Err(e) = self.blocking(move |warm| Ok(warm.purge_quarantine(retention))).await {
            tracing::debug!(error = %e, "Quarantine purge skipped");
        }
    }

    /// Probe the disk and drop stale WARM entries. Returns true if the
    /// cache is (now) in normal mode.
    async fn attempt_recovery(&self) -> bool {
        if self.mode() == DiskMode::Normal {
            return true;
        }

        let stale: Vec<(String, u64)> = self
            .stale
            .lock()
            .expect("stale set mutex poisoned")
            .iter()
            .map(|(key, generation)| (key.clone(), *generation))
            .collect();
        let result = self
            .blocking(move |warm| {
                warm.probe()?;
                for (key, _) in &stale {
                    warm.remove(key)?;
                }
                Ok(stale)
            })
            .await;

        let now = Instant::now();
        let mut health = self.health.lock().expect("disk health mutex poisoned");
        health.record_probe(result.is_ok(), now);
        match result {
            Ok(cleared) => {
                health.recovered();
                drop(health);

                for (key, generation) in &cleared {
                    self.clear_stale(key, *generation);
                }

                let evicted = self
                    .hot
                    .lock()
                    .expect("hot tier mutex poisoned")
                    .set_capacity(self.base_hot_capacity());
                self.breakers.reset(&self.storage_key);
                metrics::record_disk_mode(false);
                tracing::info!(
                    mode = DiskMode::Normal.as_str(),
                    evicted,
                    stale_cleared = cleared.len(),
                    "Disk recovered, warm tier re-enabled"
                );
                true
            }
            Err(e) => {
                let delay = health.recovery_failed(now, &self.recovery);
                tracing::warn!(error = %e, next_probe_in = ?delay, "Disk recovery probe failed");
                false
            }
        }
    }

    async fn recovery_loop(&self, token: CancellationToken) {
        loop {
            let next = self
                .health
                .lock()
                .expect("disk health mutex poisoned")
                .next_recovery_at();
            match next {
                None => tokio::select! {
                    _ = token.cancelled() => break,
                    _ = self.wake_recovery.notified() => {}
                },
                Some(at) => tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep_until(at) => {
                        self.attempt_recovery().await;
                    }
                },
            }
        }
        tracing::debug!("Recovery scheduler stopped");
    }
}

struct HotUpdate {
    /// Whether HOT holds the key after the update (for removals: held it before).
    held: bool,
    pending: PendingWrite,
}

/// One HOT change whose WARM side is not settled yet.
struct PendingWrite {
    inner: Arc<Inner>,
    key: String,
    generation: u64,
}

impl Drop for PendingWrite {
    fn drop(&mut self) {
        let mut pending = self.inner.pending.lock().expect("pending writes mutex poisoned");
        if let Some(count) = pending.get_mut(&self.key) {
            *count -= 1;
            if *count == 0 {
                pending.remove(&self.key);
            }
        }
    }
}

/// HOT/WARM cache that degrades to memory-only when the disk misbehaves.
pub struct ResilientCache {
    inner: Arc<Inner>,
    scheduler: TaskScheduler,
}

impl ResilientCache {
    /// Create the cache and load the WARM index from disk.
    ///
    /// A disk that cannot be read counts as a failure; the cache still starts.
    pub fn new(config: CacheConfig, breaker: BreakerPolicy) -> Self {
        let warm = Arc::new(WarmStore::new(&config.warm_dir, config.warm_capacity_bytes));
        let recovery = RecoveryBackoff::new(config.recovery_schedule(), config.recovery_cap());
        let storage_key = warm.root().display().to_string();

        let inner = Arc::new(Inner {
            hot: Mutex::new(HotTier::new(config.hot_capacity as usize)),
            warm,
            health: Mutex::new(DiskHealthState::new()),
            recovery,
            breakers: BreakerRegistry::new("storage", breaker),
            storage_key,
            generation: AtomicU64::new(1),
            stale: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            in_flight: InFlightTracker::new(),
            wake_recovery: Notify::new(),
            counters: Counters::default(),
            config,
        });

        if let Err(e) = inner.warm.load() {
            inner.disk_failure("load", &e);
        }
        metrics::record_disk_mode(inner.mode() == DiskMode::MemoryOnly);

        tracing::info!(
            warm_dir = %inner.storage_key,
            hot_capacity = inner.config.hot_capacity,
            warm_capacity_bytes = inner.config.warm_capacity_bytes,
            "Cache created"
        );

        Self {
            inner,
            scheduler: TaskScheduler::new("cache"),
        }
    }

    /// Start the health monitor and the recovery scheduler.
    pub fn start_background_tasks(&self) {
        let inner = Arc::clone(&self.inner);
        self.scheduler.spawn_periodic(
            "health_monitor",
            self.inner.config.health_check_interval(),
            move || {
                let inner = Arc::clone(&inner);
                async move { inner.health_tick().await }
            },
        );

        let inner = Arc::clone(&self.inner);
        self.scheduler
            .spawn("recovery_scheduler", move |token| async move { inner.recovery_loop(token).await });
    }

    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let inner = &self.inner;
        if let Some(value) = inner.hot.lock().expect("hot tier mutex poisoned").get(key) {
            inner.counters.hot_hits.fetch_add(1, Ordering::Relaxed);
            metrics::record_cache_request("hot", true);
            return Some(value);
        }
        metrics::record_cache_request("hot", false);

        let value = self.read_warm(key).await;
        match &value {
            Some(v) => {
                inner.counters.warm_hits.fetch_add(1, Ordering::Relaxed);
                inner
                    .hot
                    .lock()
                    .expect("hot tier mutex poisoned")
                    .insert(key, v.clone());
            }
            None => {
                inner.counters.misses.fetch_add(1, Ordering::Relaxed);
            }
        }
        value
    }

    async fn read_warm(&self, key: &str) -> Option<Vec<u8>> {
        let inner = &self.inner;
        if inner.mode() == DiskMode::MemoryOnly || inner.is_stale(key) {
            return None;
        }
        let _guard = inner.in_flight.enter()?;

        let owned = key.to_string();
        match inner.blocking(move |warm| warm.read(&owned)).await {
            Ok(Some(value)) => {
                metrics::record_cache_request("warm", true);
                Some(value)
            }
            Ok(None) => {
                metrics::record_cache_request("warm", false);
                None
            }
            Err(StorageError::DiskCorruption { .. }) => {
                metrics::record_cache_request("warm", false);
                metrics::record_quarantine();
                None
            }
            Err(e) => {
                metrics::record_cache_request("warm", false);
                tracing::debug!(key = %key, error = %e, "Warm read failed, treating as miss");
                None
            }
        }
    }

    /// Store a value. Never fails; WARM problems only affect durability.
    pub async fn set(&self, key: &str, value: Vec<u8>) {
        let inner = &self.inner;
        let pending = inner.update_hot(key, Some(value.clone())).pending;
        let generation = pending.generation;

        if inner.mode() == DiskMode::MemoryOnly {
            self.skip_warm(pending, "memory_only");
            return;
        }
        let Some(_guard) = inner.in_flight.enter() else {
            self.skip_warm(pending, "draining");
            return;
        };
        let Some(permit) = inner.breakers.permit(&inner.storage_key) else {
            self.skip_warm(pending, "breaker_open");
            return;
        };

        // `pending` is released on the blocking pool once the write settles,
        // even if this future is dropped first.
        let result = inner
            .blocking(move |warm| {
                let result = warm.write(&pending.key, &value, pending.generation);
                drop(pending);
                result
            })
            .await;
        match result {
            Ok(committed) => {
                permit.success();
                inner.disk_success();
                if committed {
                    inner.counters.warm_writes.fetch_add(1, Ordering::Relaxed);
                    inner.clear_stale(key, generation);
                }
            }
            Err(e @ StorageError::TooLarge { .. }) => {
                drop(permit);
                tracing::debug!(key = %key, error = %e, "Entry not written to warm tier");
                self.count_skip(key, generation, "too_large");
            }
            Err(e) => {
                permit.failure();
                inner.counters.warm_write_failures.fetch_add(1, Ordering::Relaxed);
                inner.mark_stale(key, generation);
                inner.disk_failure("write", &e);
            }
        }
    }

    fn skip_warm(&self, pending: PendingWrite, reason: &'static str) {
        let key = pending.key.clone();
        let generation = pending.generation;
        drop(pending);
        self.count_skip(&key, generation, reason);
    }

    fn count_skip(&self, key: &str, generation: u64, reason: &'static str) {
        self.inner
            .counters
            .warm_writes_skipped
            .fetch_add(1, Ordering::Relaxed);
        self.inner.mark_stale(key, generation);
        tracing::trace!(key = %key, reason, "Warm write skipped");
    }

    /// Remove a key from both tiers. Returns true if either tier held it.
    pub async fn remove(&self, key: &str) -> bool {
        let inner = &self.inner;
        let update = inner.update_hot(key, None);
        let (hot, generation) = (update.held, update.pending.generation);
        drop(update);
        if !inner.warm.contains(key) && !inner.has_pending(key) {
            return hot;
        }

        let guard = inner.in_flight.enter();
        if inner.mode() == DiskMode::MemoryOnly || guard.is_none() {
            inner.mark_stale(key, generation);
            return true;
        }
        let owned = key.to_string();
        match inner.blocking(move |warm| warm.remove(&owned)).await {
            Ok(removed) => {
                // An older write still in flight could land after the delete.
                if inner.has_pending(key) {
                    inner.mark_stale(key, generation);
                } else {
                    inner.clear_stale(key, generation);
                }
                hot || removed
            }
            Err(e) => {
                inner.mark_stale(key, generation);
                inner.disk_failure("remove", &e);
                true
            }
        }
    }

    pub fn disk_mode(&self) -> DiskMode {
        self.inner.mode()
    }

    pub fn disk_health(&self) -> DiskHealth {
        self.inner
            .health
            .lock()
            .expect("disk health mutex poisoned")
            .snapshot(Instant::now())
    }

    /// State of the breaker guarding WARM writes.
    pub fn breaker_states(&self) -> Vec<BreakerSnapshot> {
        self.inner.breakers.snapshot()
    }

    /// Run one health-monitor tick now.
    pub async fn check_health_now(&self) {
        self.inner.health_tick().await;
    }

    /// Run a recovery probe now, regardless of the schedule.
    /// Returns true if the cache is in normal mode afterwards.
    pub async fn recover_now(&self) -> bool {
        self.inner.attempt_recovery().await
    }

    pub fn stats(&self) -> CacheStats {
        let inner = &self.inner;
        let c = &inner.counters;
        let hot_hits = c.hot_hits.load(Ordering::Relaxed);
        let warm_hits = c.warm_hits.load(Ordering::Relaxed);
        let misses = c.misses.load(Ordering::Relaxed);
        let lookups = hot_hits + warm_hits + misses;
        let (hot_size, hot_capacity) = {
            let hot = inner.hot.lock().expect("hot tier mutex poisoned");
            (hot.len(), hot.capacity())
        };
        let disk_health = self.disk_health();

        CacheStats {
            hit_rate: if lookups == 0 {
                0.0
            } else {
                (hot_hits + warm_hits) as f64 / lookups as f64
            },
            hot_hits,
            warm_hits,
            misses,
            hot_size,
            hot_capacity,
            warm_entries: inner.warm.len(),
            warm_bytes: inner.warm.used_bytes(),
            warm_capacity_bytes: inner.warm.capacity_bytes(),
            warm_mode: disk_health.mode,
            recovery_countdown_ms: disk_health.recovery_countdown_ms,
            disk_health,
            quarantined: inner.warm.quarantined(),
            warm_writes: c.warm_writes.load(Ordering::Relaxed),
            warm_write_failures: c.warm_write_failures.load(Ordering::Relaxed),
            warm_writes_skipped: c.warm_writes_skipped.load(Ordering::Relaxed),
        }
    }

    /// Stop WARM traffic, wait up to `grace` for in-flight disk work, then
    /// stop the background tasks. HOT keeps serving.
    pub async fn drain(&self, grace: Duration) {
        if !self.inner.in_flight.drain(grace).await {
            tracing::warn!(
                remaining = self.inner.in_flight.active(),
                "Drain grace elapsed with warm I/O still running"
            );
        }
        self.scheduler.stop(grace).await;
        tracing::info!("Cache drained");
    }

    #[cfg(test)]
    pub(crate) fn warm_entry_path(&self, key: &str) -> std::path::PathBuf {
        self.inner.warm.entry_path(key)
    }
}

impl std::fmt::Debug for ResilientCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientCache")
            .field("warm_dir", &self.inner.storage_key)
            .field("mode", &self.inner.mode())
            .finish()
    }
}
