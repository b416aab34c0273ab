//! Metrics collection and export for Beacon.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "beacon_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "beacon_connections_active";
    pub const ENVELOPES_TOTAL: &str = "beacon_envelopes_total";
    pub const ENVELOPES_BYTES: &str = "beacon_envelopes_bytes";
    pub const RATE_LIMITED_TOTAL: &str = "beacon_rate_limited_total";
    pub const PRESENCE_SWEPT_TOTAL: &str = "beacon_presence_swept_total";
    pub const PUBLISHED_TOTAL: &str = "beacon_published_total";
    pub const ERRORS_TOTAL: &str = "beacon_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of event streams opened since server start"
    );
    metrics::describe_gauge!(names::CONNECTIONS_ACTIVE, "Current number of open event streams");
    metrics::describe_counter!(names::ENVELOPES_TOTAL, "Envelopes written to event streams");
    metrics::describe_counter!(names::ENVELOPES_BYTES, "Bytes written to event streams");
    metrics::describe_counter!(names::RATE_LIMITED_TOTAL, "Requests rejected by rate limits");
    metrics::describe_counter!(
        names::PRESENCE_SWEPT_TOTAL,
        "Users marked offline by the stale-presence sweep"
    );
    metrics::describe_counter!(names::PUBLISHED_TOTAL, "Envelopes accepted for publishing");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new event stream.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record an event stream ending.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record an envelope written to a stream.
pub fn record_envelope(kind: &str, bytes: usize) {
    counter!(names::ENVELOPES_TOTAL, "type" => kind.to_string()).increment(1);
    counter!(names::ENVELOPES_BYTES).increment(bytes as u64);
}

/// Record a rejected request.
pub fn record_rate_limited(scope: &'static str) {
    counter!(names::RATE_LIMITED_TOTAL, "scope" => scope).increment(1);
}

/// Record users corrected by a sweep.
pub fn record_swept(count: usize) {
    counter!(names::PRESENCE_SWEPT_TOTAL).increment(count as u64);
}

/// Record an envelope accepted by the publish endpoint.
pub fn record_published(channel_kind: &str) {
    counter!(names::PUBLISHED_TOTAL, "channel" => channel_kind.to_string()).increment(1);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}
