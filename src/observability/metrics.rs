//! Metrics collection and exposition.
//!
//! # Metrics
//! - `dnp3_sessions_accepted_total` (counter): sessions handed to the upper layer, by listener
//! - `dnp3_sessions_rejected_total` (counter): sessions torn down before hand-off, by listener and reason
//! - `dnp3_handshake_duration_seconds` (histogram): successful TLS handshakes, by listener
//! - `dnp3_active_channels` (gauge): channels not yet closed
//! - `dnp3_connect_failures_total` (counter): failed outbound connects, by connector

use std::net::SocketAddr;
use std::time::Duration;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Start the Prometheus exporter on `addr`.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

pub fn record_session_accepted(listener: &str) {
    metrics::counter!("dnp3_sessions_accepted_total", "listener" => listener.to_owned()).increment(1);
}

/// `reason` is one of `connection`, `certificate`, `handshake`, `timeout`,
/// `stopped`, `manager_closed`.
pub fn record_session_rejected(listener: &str, reason: &'static str) {
    metrics::counter!(
        "dnp3_sessions_rejected_total",
        "listener" => listener.to_owned(),
        "reason" => reason
    )
    .increment(1);
}

pub fn record_handshake_duration(listener: &str, elapsed: Duration) {
    metrics::histogram!("dnp3_handshake_duration_seconds", "listener" => listener.to_owned())
        .record(elapsed.as_secs_f64());
}

pub fn record_channel_opened() {
    metrics::gauge!("dnp3_active_channels").increment(1.0);
}

pub fn record_channel_closed() {
    metrics::gauge!("dnp3_active_channels").decrement(1.0);
}

pub fn record_connect_failure(connector: &str) {
    metrics::counter!("dnp3_connect_failures_total", "connector" => connector.to_owned()).increment(1);
}
