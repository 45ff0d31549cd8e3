//! In-flight work tracking for graceful drain.
//!
//! # Responsibilities
//! - Count units of in-flight work (calls, cache writes)
//! - Refuse new work once draining starts
//! - Wake drainers when the count reaches zero

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Inner {
    active: AtomicU64,
    draining: AtomicBool,
    idle: Notify,
}

/// Tracks in-flight work for a component.
#[derive(Debug, Clone, Default)]
pub struct InFlightTracker {
    inner: Arc<Inner>,
}

impl InFlightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new unit of work. Returns `None` once draining has started.
    pub fn enter(&self) -> Option<InFlightGuard> {
        if self.inner.draining.load(Ordering::SeqCst) {
            return None;
        }
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        // Re-check so drain never misses work admitted concurrently with it.
        if self.inner.draining.load(Ordering::SeqCst) {
            self.leave();
            return None;
        }
        Some(InFlightGuard {
            inner: Arc::clone(&self.inner),
        })
    }

    /// Current in-flight count.
    pub fn active(&self) -> u64 {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub fn is_draining(&self) -> bool {
        self.inner.draining.load(Ordering::SeqCst)
    }

    /// Stop accepting work and wait up to `grace` for in-flight work to finish.
    ///
    /// Returns true if everything finished in time.
    pub async fn drain(&self, grace: Duration) -> bool {
        self.inner.draining.store(true, Ordering::SeqCst);
        let wait = async {
            loop {
                let notified = self.inner.idle.notified();
                if self.active() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(grace, wait).await.is_ok()
    }

    fn leave(&self) {
        leave(&self.inner);
    }
}

fn leave(inner: &Inner) {
    if inner.active.fetch_sub(1, Ordering::SeqCst) == 1 {
        inner.idle.notify_waiters();
    }
}

/// Guard for one unit of in-flight work. Decrements the count when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    inner: Arc<Inner>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        leave(&self.inner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guards_count_work() {
        let tracker = InFlightTracker::new();
        let g1 = tracker.enter().unwrap();
        let g2 = tracker.enter().unwrap();
        assert_eq!(tracker.active(), 2);
        drop(g1);
        assert_eq!(tracker.active(), 1);
        drop(g2);
        assert_eq!(tracker.active(), 0);
    }

    #[tokio::test]
    async fn drain_refuses_new_work_and_waits() {
        let tracker = InFlightTracker::new();
        let guard = tracker.enter().unwrap();

        let t = tracker.clone();
        let drained = tokio::spawn(async move { t.drain(Duration::from_secs(5)).await });
        tokio::task::yield_now().await;

        assert!(tracker.enter().is_none());
        drop(guard);
        assert!(drained.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn drain_times_out_with_stuck_work() {
        let tracker = InFlightTracker::new();
        let _guard = tracker.enter().unwrap();
        assert!(!tracker.drain(Duration::from_secs(1)).await);
        assert_eq!(tracker.active(), 1);
    }
}
