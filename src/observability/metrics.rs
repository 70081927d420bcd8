//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define listener metrics (connections, handshakes, channels, engine sessions)
//! - Expose Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `sftp_connections_total` (counter): accepted TCP connections
//! - `sftp_active_connections` (gauge): connections currently held
//! - `sftp_handshake_failures_total` (counter): failed handshakes by kind
//! - `sftp_sessions_established_total` (counter): authenticated sessions
//! - `sftp_channels_total` (counter): terminal channel states by state
//! - `sftp_channel_rejections_total` (counter): refused channel opens by reason
//! - `sftp_subsystem_requests_total` (counter): subsystem requests by outcome
//! - `sftp_global_requests_total` (counter): discarded connection-level requests
//! - `sftp_active_engine_sessions` (gauge): running protocol engines
//! - `sftp_engine_sessions_total` (counter): finished engines by outcome
//!
//! # Design Decisions
//! - Recording is a no-op until an exporter is installed, so tests need no setup
//! - Labels are small closed sets; no user names or addresses

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter with its own HTTP listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(
            address = %addr,
            error = %e,
            "Failed to install metrics exporter"
        ),
    }
}

pub fn record_connection_accepted() {
    ::metrics::counter!("sftp_connections_total").increment(1);
    ::metrics::gauge!("sftp_active_connections").increment(1.0);
}

pub fn record_connection_closed() {
    ::metrics::gauge!("sftp_active_connections").decrement(1.0);
}

pub fn record_handshake_failure(kind: &'static str) {
    ::metrics::counter!("sftp_handshake_failures_total", "kind" => kind).increment(1);
}

pub fn record_session_established() {
    ::metrics::counter!("sftp_sessions_established_total").increment(1);
}

pub fn record_channel_finished(state: &'static str) {
    ::metrics::counter!("sftp_channels_total", "state" => state).increment(1);
}

pub fn record_channel_rejected(reason: &'static str) {
    ::metrics::counter!("sftp_channel_rejections_total", "reason" => reason).increment(1);
}

pub fn record_subsystem_request(accepted: bool) {
    let outcome = if accepted { "accepted" } else { "rejected" };
    ::metrics::counter!("sftp_subsystem_requests_total", "outcome" => outcome).increment(1);
}

pub fn record_global_request() {
    ::metrics::counter!("sftp_global_requests_total").increment(1);
}

pub fn record_engine_started() {
    ::metrics::gauge!("sftp_active_engine_sessions").increment(1.0);
}

pub fn record_engine_finished(outcome: &'static str) {
    ::metrics::gauge!("sftp_active_engine_sessions").decrement(1.0);
    ::metrics::counter!("sftp_engine_sessions_total", "outcome" => outcome).increment(1);
}
