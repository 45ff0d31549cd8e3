//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define resilience metrics (admissions, breaker transitions, call outcomes, cache health)
//! - Expose Prometheus-compatible metrics endpoint
//! - Track per-channel and aggregate metrics
//!
//! # Metrics
//! - `bulkhead_admissions_total` (counter): admissions by result
//! - `bulkhead_active_connections` (gauge): current connection count
//! - `bulkhead_idle_evictions_total` (counter): connections reclaimed by the idle sweep
//! - `bulkhead_backpressure_engaged` (gauge): 1=engaged, 0=clear
//! - `bulkhead_breaker_transitions_total` (counter): by resource class and target state
//! - `bulkhead_call_attempts_total` (counter): by channel and outcome
//! - `bulkhead_call_duration_seconds` (histogram): per-attempt latency by channel
//! - `bulkhead_cache_requests_total` (counter): by tier and result
//! - `bulkhead_cache_disk_mode` (gauge): 0=normal, 1=memory-only
//! - `bulkhead_cache_quarantined_total` (counter): entries moved to quarantine
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; with no recorder installed it is a no-op
//! - Labels are low-cardinality (class, channel, outcome), never identities

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its HTTP listener.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_admission(result: &'static str) {
    counter!("bulkhead_admissions_total", "result" => result).increment(1);
}

pub fn record_active_connections(count: u64) {
    gauge!("bulkhead_active_connections").set(count as f64);
}

pub fn record_idle_eviction() {
    counter!("bulkhead_idle_evictions_total").increment(1);
}

pub fn record_backpressure(engaged: bool) {
    gauge!("bulkhead_backpressure_engaged").set(if engaged { 1.0 } else { 0.0 });
}

pub fn record_breaker_transition(class: &'static str, to: &'static str) {
    counter!("bulkhead_breaker_transitions_total", "class" => class, "to" => to).increment(1);
}

pub fn record_call_attempt(channel: &str, outcome: &'static str, start_time: Instant) {
    counter!(
        "bulkhead_call_attempts_total",
        "channel" => channel.to_string(),
        "outcome" => outcome
    )
    .increment(1);
    histogram!("bulkhead_call_duration_seconds", "channel" => channel.to_string())
        .record(start_time.elapsed().as_secs_f64());
}

pub fn record_cache_request(tier: &'static str, hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    counter!("bulkhead_cache_requests_total", "tier" => tier, "result" => result).increment(1);
}

pub fn record_disk_mode(memory_only: bool) {
    gauge!("bulkhead_cache_disk_mode").set(if memory_only { 1.0 } else { 0.0 });
}

pub fn record_quarantine() {
    counter!("bulkhead_cache_quarantined_total").increment(1);
}
