//! Per-connection session loop.
//!
//! A [`Session`] owns one client's socket and its router [`Connection`]. It
//! announces the connection, then services the outbox and the socket until
//! either side goes away, and always leaves the registry clean on exit.

use crate::gateway::{decode_command, encode_delivery, Inbound};
use crate::metrics::{self, ConnectionMetricsGuard};
use crate::traits::EventSocket;
use huddle_core::{Broadcaster, Command, Connection, Delivery, ErrorKind, Router};
use huddle_protocol::{ClientEvent, ServerEvent};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// One client connection being served.
pub struct Session<S> {
    router: Arc<Router>,
    socket: S,
}

impl<S: EventSocket> Session<S> {
    /// Create a session over an established socket.
    #[must_use]
    pub fn new(router: Arc<Router>, socket: S) -> Self {
        Self { router, socket }
    }

    /// Serve the connection until the client leaves or the socket fails.
    pub async fn run(mut self) {
        let _metrics_guard = ConnectionMetricsGuard::new();
        let (mut conn, mut outbox) = self.router.connect();

        debug!(
            connection = %conn.id(),
            transport = self.socket.name(),
            remote = ?self.socket.remote_addr(),
            "Session started"
        );

        let connected = ServerEvent::connected(conn.id().as_str());
        if let Err(e) = self.socket.send(&connected).await {
            warn!(connection = %conn.id(), error = %e, "Failed to send connected event");
            self.finish(&mut conn).await;
            return;
        }

        loop {
            tokio::select! {
                biased;

                Some(delivery) = outbox.recv() => {
                    let event = encode_delivery(&delivery);
                    if let Err(e) = self.socket.send(&event).await {
                        debug!(connection = %conn.id(), error = %e, "Send failed");
                        break;
                    }
                    metrics::record_event(event.kind().as_str(), metrics::OUTBOUND);
                }

                inbound = self.socket.recv() => {
                    match inbound {
                        Ok(Some(event)) => {
                            if self.dispatch(&mut conn, event).is_break() {
                                break;
                            }
                        }
                        Ok(None) => {
                            debug!(connection = %conn.id(), "Client closed connection");
                            break;
                        }
                        Err(e) if !e.is_fatal() => {
                            Self::reject(&conn, ErrorKind::Malformed, e.to_string());
                        }
                        Err(e) => {
                            warn!(connection = %conn.id(), error = %e, "Transport error");
                            break;
                        }
                    }
                }
            }
        }

        self.finish(&mut conn).await;
    }

    fn dispatch(&self, conn: &mut Connection, event: ClientEvent) -> ControlFlow<()> {
        let start = Instant::now();
        metrics::record_event(event.kind().as_str(), metrics::INBOUND);

        let command = match decode_command(event) {
            Ok(Inbound::Command(command)) => command,
            Ok(Inbound::Disconnect) => {
                debug!(connection = %conn.id(), "Client requested disconnect");
                return ControlFlow::Break(());
            }
            Err(e) => {
                Self::reject(conn, ErrorKind::Malformed, e.to_string());
                return ControlFlow::Continue(());
            }
        };

        let changes_membership = matches!(command, Command::Join { .. } | Command::Leave { .. });
        match self.router.handle(conn, command) {
            Ok(()) if changes_membership => self.update_gauges(),
            Ok(()) => {}
            Err(e) => Self::reject(conn, e.kind(), e.to_string()),
        }

        metrics::record_handle_latency(start.elapsed().as_secs_f64());
        ControlFlow::Continue(())
    }

    /// Queue an error for this connection only.
    fn reject(conn: &Connection, kind: ErrorKind, message: String) {
        debug!(connection = %conn.id(), kind = ?kind, error = %message, "Rejected event");
        metrics::record_error(kind);
        Broadcaster::deliver(conn.outbox(), Delivery::Error { kind, message });
    }

    async fn finish(&mut self, conn: &mut Connection) {
        self.router.disconnect(conn);
        metrics::record_outbox_dropped(conn.outbox().dropped());
        self.update_gauges();

        if let Err(e) = self.socket.close().await {
            debug!(connection = %conn.id(), error = %e, "Close failed");
        }
        debug!(connection = %conn.id(), "Session ended");
    }

    fn update_gauges(&self) {
        let stats = self.router.registry().stats();
        metrics::set_registry_gauges(stats.room_count, stats.online_users);
    }
}
