//! Advisory backpressure signalling.
//!
//! Fires once when utilisation crosses the threshold upwards and once when
//! it falls back below it. Subscribers get the edges, never a stream of
//! repeats, and sending never blocks the admission path.

use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::observability::metrics;

/// Edge-triggered capacity signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum BackpressureSignal {
    /// Utilisation reached the threshold; stop advertising new capacity.
    Engaged { used: u64, capacity: u64 },
    /// Utilisation dropped below the threshold again.
    Released { used: u64, capacity: u64 },
}

#[derive(Debug)]
pub struct Backpressure {
    threshold: f64,
    engaged: Mutex<bool>,
    tx: broadcast::Sender<BackpressureSignal>,
}

impl Backpressure {
    pub fn new(threshold: f64) -> Self {
        let (tx, _) = broadcast::channel(16);
        Self {
            threshold,
            engaged: Mutex::new(false),
            tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BackpressureSignal> {
        self.tx.subscribe()
    }

    pub fn is_engaged(&self) -> bool {
        *self.engaged.lock().expect("backpressure mutex poisoned")
    }

    /// Re-evaluate after a usage change.
    ///
    /// `read` is called under this monitor's lock so the last updater always
    /// judges the latest usage.
    pub fn update(&self, read: impl FnOnce() -> (u64, u64)) {
        let mut engaged = self.engaged.lock().expect("backpressure mutex poisoned");
        let (used, capacity) = read();
        let ratio = if capacity == 0 {
            1.0
        } else {
            used as f64 / capacity as f64
        };

        let signal = if ratio >= self.threshold && !*engaged {
            *engaged = true;
            tracing::warn!(used, capacity, threshold = self.threshold, "Backpressure engaged");
            BackpressureSignal::Engaged { used, capacity }
        } else if ratio < self.threshold && *engaged {
            *engaged = false;
            tracing::info!(used, capacity, "Backpressure released");
            BackpressureSignal::Released { used, capacity }
        } else {
            return;
        };

        metrics::record_backpressure(*engaged);
        // No subscribers is fine; the signal is advisory.
        let _ = self.tx.send(signal);
    }
}
