//! Session instrumentation.
//!
//! Recorded through the `metrics` facade; the server installs the exporter.

use huddle_core::ErrorKind;
use metrics::{counter, gauge, histogram};

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "huddle_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "huddle_connections_active";
    pub const EVENTS_TOTAL: &str = "huddle_events_total";
    pub const BYTES_TOTAL: &str = "huddle_bytes_total";
    pub const ERRORS_TOTAL: &str = "huddle_errors_total";
    pub const OUTBOX_DROPPED_TOTAL: &str = "huddle_outbox_dropped_total";
    pub const ROOMS_ACTIVE: &str = "huddle_rooms_active";
    pub const USERS_ONLINE: &str = "huddle_users_online";
    pub const HANDLE_SECONDS: &str = "huddle_handle_seconds";
}

/// Direction label for client-to-server traffic.
pub const INBOUND: &str = "inbound";
/// Direction label for server-to-client traffic.
pub const OUTBOUND: &str = "outbound";

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record an event by name and direction.
pub fn record_event(event: &'static str, direction: &'static str) {
    counter!(names::EVENTS_TOTAL, "event" => event, "direction" => direction).increment(1);
}

/// Record bytes on the wire.
pub fn record_bytes(bytes: usize, direction: &'static str) {
    counter!(names::BYTES_TOTAL, "direction" => direction).increment(bytes as u64);
}

/// Record an error reported to a client.
pub fn record_error(kind: ErrorKind) {
    counter!(names::ERRORS_TOTAL, "kind" => error_label(kind)).increment(1);
}

/// Record deliveries a connection lost to a full outbox.
pub fn record_outbox_dropped(count: u64) {
    if count > 0 {
        counter!(names::OUTBOX_DROPPED_TOTAL).increment(count);
    }
}

/// Update registry gauges.
pub fn set_registry_gauges(rooms: usize, users: usize) {
    gauge!(names::ROOMS_ACTIVE).set(rooms as f64);
    gauge!(names::USERS_ONLINE).set(users as f64);
}

/// Record how long one inbound event took to handle.
pub fn record_handle_latency(seconds: f64) {
    histogram!(names::HANDLE_SECONDS).record(seconds);
}

fn error_label(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Malformed => "malformed",
        ErrorKind::NotJoined => "not_joined",
        ErrorKind::NotAMember => "not_a_member",
        ErrorKind::UsernameMismatch => "username_mismatch",
        ErrorKind::InvalidInput => "invalid_input",
        ErrorKind::LimitReached => "limit_reached",
        ErrorKind::Closed => "closed",
    }
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
