//! Transport abstraction for Huddle.
//!
//! A session talks to its client through an [`EventSocket`], which yields
//! decoded [`ClientEvent`]s and accepts [`ServerEvent`]s. The session does not
//! know whether the events travel over a WebSocket or an in-process channel.

use async_trait::async_trait;
use huddle_protocol::{ClientEvent, ProtocolError, ServerEvent};
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Inbound message exceeds the configured size limit.
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge {
        /// Size of the rejected message.
        size: usize,
        /// Configured limit.
        max: usize,
    },

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// The client sent something that is not a valid event.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl TransportError {
    /// Whether the connection cannot continue after this error.
    ///
    /// Malformed and oversized inbound messages are dropped and reported to
    /// the client; everything else ends the session.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            TransportError::Protocol(_) | TransportError::MessageTooLarge { .. }
        )
    }
}

/// A bidirectional, event-level connection to one client.
#[async_trait]
pub trait EventSocket: Send {
    /// Receive the next event from the client.
    ///
    /// Returns `None` when the client closed the connection. Must be
    /// cancel-safe: the session polls it inside `select!`.
    async fn recv(&mut self) -> Result<Option<ClientEvent>, TransportError>;

    /// Send an event to the client.
    async fn send(&mut self, event: &ServerEvent) -> Result<(), TransportError>;

    /// Close the connection.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Get the transport name (e.g., "websocket", "memory").
    fn name(&self) -> &'static str;

    /// Get the remote address of the connection, if available.
    fn remote_addr(&self) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(TransportError::ConnectionClosed.is_fatal());
        assert!(TransportError::ReceiveFailed("reset".into()).is_fatal());
        assert!(!TransportError::Protocol(ProtocolError::Incomplete(2)).is_fatal());
        assert!(!TransportError::MessageTooLarge { size: 10, max: 5 }.is_fatal());
    }
}
