//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define gateway metrics (requests, latency, proxy errors, servers, TLS)
//! - Optionally expose a Prometheus-compatible scrape endpoint
//!
//! # Metrics
//! - `gateway_requests_total` (counter): requests by port, route, status
//! - `gateway_request_duration_seconds` (histogram): latency by port, route
//! - `gateway_proxy_errors_total` (counter): failed upstream calls by kind
//! - `gateway_active_servers` (gauge): live port servers
//! - `gateway_tls_handshake_failures_total` (counter): by reason
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a no-op

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use std::net::SocketAddr;
use std::time::Instant;

/// Install the Prometheus recorder and its HTTP listener.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

pub fn record_request(port: u16, route: &str, status: u16, start: Instant) {
    let port = port.to_string();
    ::metrics::counter!(
        "gateway_requests_total",
        "port" => port.clone(),
        "route" => route.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    ::metrics::histogram!(
        "gateway_request_duration_seconds",
        "port" => port,
        "route" => route.to_string()
    )
    .record(start.elapsed().as_secs_f64());
}

pub fn record_proxy_error(kind: &'static str) {
    ::metrics::counter!("gateway_proxy_errors_total", "kind" => kind).increment(1);
}

pub fn set_active_servers(count: usize) {
    ::metrics::gauge!("gateway_active_servers").set(count as f64);
}

pub fn record_tls_handshake_failure(reason: &'static str) {
    ::metrics::counter!("gateway_tls_handshake_failures_total", "reason" => reason).increment(1);
}
