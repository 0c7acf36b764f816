//! Metrics collection and export for the chat node.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use anyhow::{Context, Result};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "chat_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "chat_connections_active";
    pub const MESSAGES_TOTAL: &str = "chat_messages_total";
    pub const MESSAGES_BYTES: &str = "chat_messages_bytes";
    pub const CLIENTS_REGISTERED: &str = "chat_clients_registered";
    pub const NAME_COLLISIONS_TOTAL: &str = "chat_name_collisions_total";
    pub const ERRORS_TOTAL: &str = "chat_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of client connections since start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of client connections"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of chat messages");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of chat messages");
    metrics::describe_gauge!(
        names::CLIENTS_REGISTERED,
        "Clients registered on this node"
    );
    metrics::describe_counter!(
        names::NAME_COLLISIONS_TOTAL,
        "Init messages rejected for a username already in use"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    info!(addr = %addr, "Metrics server listening");
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a message.
pub fn record_message(bytes: usize, direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Update the registered client count.
pub fn set_clients_registered(count: usize) {
    gauge!(names::CLIENTS_REGISTERED).set(count as f64);
}

/// Record a rejected duplicate username.
pub fn record_name_collision() {
    counter!(names::NAME_COLLISIONS_TOTAL).increment(1);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}
