use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::admin::AdminState;
use crate::admission::AdmissionStats;
use crate::boundary::ChannelStats;
use crate::cache::{CacheStats, DiskMode};
use crate::resilience::BreakerSnapshot;

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub active_connections: u64,
    pub connection_capacity: u64,
    pub calls_in_flight: u64,
    pub disk_mode: DiskMode,
    pub channels: Vec<ChannelStats>,
}

#[derive(Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub disk_mode: DiskMode,
    pub backpressure_engaged: bool,
}

#[derive(Serialize)]
pub struct BreakerReport {
    pub connection: Vec<BreakerSnapshot>,
    pub channel: Vec<BreakerSnapshot>,
    pub storage: Vec<BreakerSnapshot>,
}

pub async fn get_status(State(state): State<AdminState>) -> Json<SystemStatus> {
    let services = &state.services;
    let admission = services.admission.stats();
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: if admission.draining { "draining" } else { "operational" },
        active_connections: admission.active,
        connection_capacity: admission.capacity,
        calls_in_flight: services.calls.in_flight(),
        disk_mode: services.cache.disk_mode(),
        channels: services.calls.stats(),
    })
}

pub async fn get_health(State(state): State<AdminState>) -> (StatusCode, Json<HealthReport>) {
    let services = &state.services;
    let admission = services.admission.stats();
    let disk_mode = services.cache.disk_mode();

    let (code, status) = if admission.draining {
        (StatusCode::SERVICE_UNAVAILABLE, "draining")
    } else if disk_mode == DiskMode::MemoryOnly {
        (StatusCode::OK, "degraded")
    } else {
        (StatusCode::OK, "healthy")
    };

    (
        code,
        Json(HealthReport {
            status,
            disk_mode,
            backpressure_engaged: admission.backpressure_engaged,
        }),
    )
}

pub async fn get_admission(State(state): State<AdminState>) -> Json<AdmissionStats> {
    Json(state.services.admission.stats())
}

pub async fn get_breakers(State(state): State<AdminState>) -> Json<BreakerReport> {
    let services = &state.services;
    Json(BreakerReport {
        connection: services.admission.breaker_states(),
        channel: services.calls.breaker_states(),
        storage: services.cache.breaker_states(),
    })
}

pub async fn get_cache(State(state): State<AdminState>) -> Json<CacheStats> {
    Json(state.services.cache.stats())
}
