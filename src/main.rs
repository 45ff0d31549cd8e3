//! Bulkhead daemon.
//!
//! Builds the admission controller, call boundary and cache from a TOML
//! file, serves the admin API and Prometheus metrics, and drains every
//! component on SIGINT/SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;

use bulkhead::admin::{serve_admin, AdminState};
use bulkhead::admission::NoopProbe;
use bulkhead::config::{load_config, BulkheadConfig};
use bulkhead::lifecycle::signals::shutdown_signal;
use bulkhead::observability::{logging, metrics};
use bulkhead::{Services, Shutdown};

#[derive(Parser)]
#[command(name = "bulkhead")]
#[command(about = "Bounded-resource resilience daemon", long_about = None)]
struct Args {
    /// Path to the TOML configuration file. Defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => BulkheadConfig::default(),
    };

    logging::init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "bulkhead starting");
    tracing::info!(
        config = ?args.config,
        max_connections = config.admission.max_connections,
        call_timeout = ?config.calls.timeout(),
        warm_dir = %config.cache.warm_dir.display(),
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let services = Services::build(config, Arc::new(NoopProbe));
    services.start();

    let shutdown = Shutdown::new();
    let admin = if services.config.admin.enabled {
        let listener = TcpListener::bind(&services.config.admin.bind_address).await?;
        let stop = shutdown.signalled();
        let state = AdminState::new(services.clone());
        Some(tokio::spawn(async move {
            if let Err(e) = serve_admin(listener, state, stop).await {
                tracing::error!(error = %e, "Admin server failed");
            }
        }))
    } else {
        None
    };

    shutdown_signal().await;
    shutdown.trigger();
    services.drain().await;
    if let Some(handle) = admin {
        let _ = handle.await;
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
