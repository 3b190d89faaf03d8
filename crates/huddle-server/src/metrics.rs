//! Metrics export for Huddle.
//!
//! Sessions record through the `metrics` facade (see
//! [`huddle_gateway::metrics`]); this module describes those metrics and
//! serves them in Prometheus format.

use anyhow::{Context, Result};
use huddle_core::PersistenceStats;
use huddle_gateway::metrics::names;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Persistence counter, labelled by outcome.
pub const PERSISTENCE_TOTAL: &str = "huddle_persistence_total";

/// Initialize the metrics system.
pub fn init_metrics() {
    describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    describe_counter!(names::EVENTS_TOTAL, "Events handled, by name and direction");
    describe_counter!(names::BYTES_TOTAL, "Bytes on the wire, by direction");
    describe_counter!(names::ERRORS_TOTAL, "Errors reported to clients, by kind");
    describe_counter!(
        names::OUTBOX_DROPPED_TOTAL,
        "Deliveries dropped because a connection's outbox was full"
    );
    describe_gauge!(names::ROOMS_ACTIVE, "Current number of non-empty rooms");
    describe_gauge!(names::USERS_ONLINE, "Current number of online usernames");
    describe_histogram!(
        names::HANDLE_SECONDS,
        "Time to handle one inbound event, in seconds"
    );
    describe_counter!(PERSISTENCE_TOTAL, "Messages by persistence outcome");

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

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Publish the change in persistence counters since `previous`.
pub fn record_persistence(previous: PersistenceStats, current: PersistenceStats) {
    let deltas = [
        ("submitted", current.submitted.saturating_sub(previous.submitted)),
        ("dropped", current.dropped.saturating_sub(previous.dropped)),
        ("appended", current.appended.saturating_sub(previous.appended)),
        ("failed", current.failed.saturating_sub(previous.failed)),
    ];
    for (outcome, delta) in deltas {
        if delta > 0 {
            counter!(PERSISTENCE_TOTAL, "outcome" => outcome).increment(delta);
        }
    }
}
