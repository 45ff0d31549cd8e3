//! Admin HTTP surface.
//!
//! # Endpoints
//! - `GET /admin/status`: version, drain state, headline numbers
//! - `GET /admin/health`: 200 when healthy, 503 while draining; reports disk mode
//! - `GET /admin/admission`: connection counts, rejections, backpressure
//! - `GET /admin/breakers`: breaker state per resource class and key
//! - `GET /admin/cache`: hit rate, tier sizes, disk mode, recovery countdown
//!
//! Every route requires `Authorization: Bearer <admin.api_key>`.

pub mod auth;
pub mod handlers;

use std::sync::Arc;

use axum::{middleware, routing::get, Router};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use self::auth::admin_auth_middleware;
use self::handlers::*;
use crate::lifecycle::Services;

/// State shared by the admin handlers.
#[derive(Debug, Clone)]
pub struct AdminState {
    pub services: Services,
    pub api_key: Arc<str>,
}

impl AdminState {
    pub fn new(services: Services) -> Self {
        let api_key = Arc::from(services.config.admin.api_key.as_str());
        Self { services, api_key }
    }
}

pub fn setup_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/health", get(get_health))
        .route("/admin/admission", get(get_admission))
        .route("/admin/breakers", get(get_breakers))
        .route("/admin/cache", get(get_cache))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the admin router until `shutdown` resolves.
pub async fn serve_admin(
    listener: TcpListener,
    state: AdminState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(address = %addr, "Admin API listening");
    axum::serve(listener, setup_admin_router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
