//! Metrics collection and exposition.
//!
//! # Metrics
//! - `relay_requests_total` (counter): proxied requests by method, status, outcome
//! - `relay_request_duration_seconds` (histogram): time until the response body finished
//! - `relay_upstream_bytes_total` (counter): response bytes streamed to callers
//! - `relay_in_flight_requests` (gauge): requests between start and terminal event
//! - `relay_log_subscribers` (gauge): live log stream subscribers
//! - `relay_config_writes_total` (counter): env file writes by result
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a no-op
//! - Prometheus exposition is opt-in via `METRICS_ENABLED`

use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its HTTP listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

/// Record a finished proxied request.
pub fn record_request(method: &str, status: u16, outcome: &'static str, start: Instant) {
    metrics::counter!("relay_requests_total",
        "method" => method.to_string(), "status" => status.to_string(), "outcome" => outcome
    )
    .increment(1);
    metrics::histogram!("relay_request_duration_seconds", "outcome" => outcome)
        .record(start.elapsed().as_secs_f64());
}

pub fn record_upstream_bytes(bytes: u64) {
    metrics::counter!("relay_upstream_bytes_total").increment(bytes);
}

pub fn set_in_flight(count: usize) {
    metrics::gauge!("relay_in_flight_requests").set(count as f64);
}

pub fn set_log_subscribers(count: usize) {
    metrics::gauge!("relay_log_subscribers").set(count as f64);
}

pub fn record_config_write(ok: bool) {
    let result = if ok { "ok" } else { "error" };
    metrics::counter!("relay_config_writes_total", "result" => result).increment(1);
}
