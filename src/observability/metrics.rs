//! Metrics collection and exposition.
//!
//! # Metrics
//! - `ha_pool_probes_total` (counter): liveness probes by result
//! - `ha_pool_connectivity` (gauge): 1=reachable, 0=unreachable
//! - `ha_pool_recovered_connections_total` (counter): defunct connections retired
//! - `ha_pool_cancel_queued_total` (counter): process ids queued for backend cancel
//! - `ha_pool_cancel_attempts_total` (counter): cancel requests by result
//! - `ha_pool_forced_reclaims_total` (counter): idle leases reclaimed at shutdown
//! - `ha_pool_rejected_waiters_total` (counter): queued checkouts rejected at shutdown
//! - `ha_pool_checkouts_total` (counter): checkouts by outcome
//! - `ha_pool_errors_total` (counter): error events by kind
//! - `ha_pool_connections` (gauge): live connections by state
//!
//! All recorders are no-ops until `init_metrics` installs an exporter.

use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::pool::types::PoolStatus;

/// Install the Prometheus exporter with its own HTTP listener.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

pub fn record_probe(reachable: bool) {
    let result = if reachable { "reachable" } else { "unreachable" };
    metrics::counter!("ha_pool_probes_total", "result" => result).increment(1);
}

pub fn record_connectivity(reachable: bool) {
    metrics::gauge!("ha_pool_connectivity").set(if reachable { 1.0 } else { 0.0 });
}

pub fn record_recovered(count: usize) {
    metrics::counter!("ha_pool_recovered_connections_total").increment(count as u64);
}

pub fn record_cancel_queued() {
    metrics::counter!("ha_pool_cancel_queued_total").increment(1);
}

pub fn record_cancel_attempt(ok: bool) {
    let result = if ok { "ok" } else { "failed" };
    metrics::counter!("ha_pool_cancel_attempts_total", "result" => result).increment(1);
}

pub fn record_forced_reclaim() {
    metrics::counter!("ha_pool_forced_reclaims_total").increment(1);
}

pub fn record_rejected_waiters(count: usize) {
    metrics::counter!("ha_pool_rejected_waiters_total").increment(count as u64);
}

pub fn record_checkout(outcome: &'static str) {
    metrics::counter!("ha_pool_checkouts_total", "outcome" => outcome).increment(1);
}

pub fn record_error(kind: &'static str) {
    metrics::counter!("ha_pool_errors_total", "kind" => kind).increment(1);
}

pub fn record_pool_status(status: &PoolStatus) {
    metrics::gauge!("ha_pool_connections", "state" => "used").set(status.used as f64);
    metrics::gauge!("ha_pool_connections", "state" => "idle").set(status.idle as f64);
    metrics::gauge!("ha_pool_connections", "state" => "defunct").set(status.defunct as f64);
    metrics::gauge!("ha_pool_connections", "state" => "pending").set(status.pending as f64);
}
