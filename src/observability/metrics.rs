//! Capture metrics.
//!
//! # Metrics
//! - `capture_cycles_total` (counter): cycles by outcome
//!   (`relayed`, `served_file`, `file_missing`, `gateway_error`, `abandoned`, `rejected`)
//! - `capture_cycle_duration_seconds` (histogram): time until the caller
//!   received a response head
//! - `capture_artifact_failures_total` (counter): lost artifacts by kind
//!
//! # Design Decisions
//! - Label values come from fixed sets; no hostnames or paths as labels

use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter with its own scrape listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

/// Record a cycle's outcome and head latency.
pub fn record_cycle(outcome: &'static str, start: Instant) {
    metrics::counter!("capture_cycles_total", "outcome" => outcome).increment(1);
    metrics::histogram!("capture_cycle_duration_seconds", "outcome" => outcome)
        .record(start.elapsed().as_secs_f64());
}

/// Record an artifact that could not be persisted.
pub fn record_artifact_failure(artifact: &'static str) {
    metrics::counter!("capture_artifact_failures_total", "artifact" => artifact).increment(1);
}
