//! In-process transport.
//!
//! [`pair`] returns a server-side [`MemorySocket`] and the [`MemoryClient`]
//! that drives it. Inbound traffic goes through the JSON codec like a text
//! WebSocket frame would, so malformed input can be exercised too.

use crate::traits::{EventSocket, TransportError};
use async_trait::async_trait;
use huddle_protocol::{codec, ClientEvent, ServerEvent};
use tokio::sync::mpsc;

/// Create a connected socket/client pair.
#[must_use]
pub fn pair() -> (MemorySocket, MemoryClient) {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    (
        MemorySocket {
            inbound: inbound_rx,
            outbound: Some(outbound_tx),
        },
        MemoryClient {
            sender: Some(inbound_tx),
            receiver: outbound_rx,
        },
    )
}

/// Server side of an in-process connection.
#[derive(Debug)]
pub struct MemorySocket {
    inbound: mpsc::UnboundedReceiver<String>,
    outbound: Option<mpsc::UnboundedSender<ServerEvent>>,
}

#[async_trait]
impl EventSocket for MemorySocket {
    async fn recv(&mut self) -> Result<Option<ClientEvent>, TransportError> {
        match self.inbound.recv().await {
            Some(text) => Ok(Some(codec::decode_json(&text)?)),
            None => Ok(None),
        }
    }

    async fn send(&mut self, event: &ServerEvent) -> Result<(), TransportError> {
        let outbound = self
            .outbound
            .as_ref()
            .ok_or(TransportError::ConnectionClosed)?;
        outbound
            .send(event.clone())
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.outbound = None;
        self.inbound.close();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Client side of an in-process connection.
#[derive(Debug)]
pub struct MemoryClient {
    sender: Option<mpsc::UnboundedSender<String>>,
    receiver: mpsc::UnboundedReceiver<ServerEvent>,
}

impl MemoryClient {
    /// Send an event as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the event cannot be encoded or the server side is
    /// gone.
    pub fn send(&self, event: &ClientEvent) -> Result<(), TransportError> {
        let text = codec::encode_json(event)?;
        self.send_raw(text)
    }

    /// Send raw text, valid or not.
    ///
    /// # Errors
    ///
    /// Returns an error if the server side is gone.
    pub fn send_raw(&self, text: impl Into<String>) -> Result<(), TransportError> {
        self.sender
            .as_ref()
            .ok_or(TransportError::ConnectionClosed)?
            .send(text.into())
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Receive the next event, or `None` once the server side closed.
    pub async fn recv(&mut self) -> Option<ServerEvent> {
        self.receiver.recv().await
    }

    /// Receive an event if one is already waiting.
    pub fn try_recv(&mut self) -> Option<ServerEvent> {
        self.receiver.try_recv().ok()
    }

    /// Close the client side. The server sees end of stream.
    pub fn close(&mut self) {
        self.sender = None;
    }
}
