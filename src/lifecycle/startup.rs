//! Startup orchestration.
//!
//! # Responsibilities
//! - Build every component from one validated configuration
//! - Start their background tasks
//! - Drain them in order on shutdown
//!
//! # Design Decisions
//! - Components are owned here and shared by `Arc`; nothing is global
//! - Drain order: admission (stop intake), calls, then cache

use std::sync::Arc;

use crate::admission::{AdmissionController, LivenessProbe};
use crate::boundary::CallBoundary;
use crate::cache::ResilientCache;
use crate::config::BulkheadConfig;
use crate::resilience::BreakerPolicy;

/// The running set of resilience components.
#[derive(Debug, Clone)]
pub struct Services {
    pub config: Arc<BulkheadConfig>,
    pub admission: Arc<AdmissionController>,
    pub calls: Arc<CallBoundary>,
    pub cache: Arc<ResilientCache>,
}

impl Services {
    /// Build the components. Background tasks start with `start`.
    pub fn build(config: BulkheadConfig, probe: Arc<dyn LivenessProbe>) -> Self {
        let breaker = BreakerPolicy::from(&config.breaker);

        let admission = AdmissionController::new(config.admission.clone(), breaker, probe);
        let calls = CallBoundary::new(config.calls.clone(), breaker);
        let cache = ResilientCache::new(config.cache.clone(), breaker);

        Self {
            config: Arc::new(config),
            admission: Arc::new(admission),
            calls: Arc::new(calls),
            cache: Arc::new(cache),
        }
    }

    pub fn start(&self) {
        self.admission.start_background_tasks();
        self.cache.start_background_tasks();
        tracing::info!("Background tasks started");
    }

    /// Drain every component, each with the configured grace period.
    pub async fn drain(&self) {
        let grace = self.config.lifecycle.drain_grace();
        tracing::info!(grace = ?grace, "Draining");
        self.admission.drain(grace).await;
        self.calls.drain(grace).await;
        self.cache.drain(grace).await;
        tracing::info!("Drain complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{AdmissionError, NoopProbe};
    use crate::boundary::{CallError, InvokeOptions};

    #[tokio::test]
    async fn drain_stops_every_component() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = BulkheadConfig::default();
        config.cache.warm_dir = dir.path().join("warm");
        config.lifecycle.drain_grace_secs = 1;

        let services = Services::build(config, Arc::new(NoopProbe));
        services.start();
        services.admission.admit("u").unwrap();
        services.cache.set("k", b"v".to_vec()).await;

        services.drain().await;

        assert_eq!(services.admission.active(), 0);
        assert_eq!(services.admission.admit("u").unwrap_err(), AdmissionError::Draining);
        let err = services
            .calls
            .invoke("peer", (), InvokeOptions::<()>::new(), |_, _| async { Ok(()) })
            .await
            .unwrap_err();
        assert_eq!(err, CallError::Draining);
        assert_eq!(services.cache.get("k").await, Some(b"v".to_vec()));
    }
}
