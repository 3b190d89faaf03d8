//! WebSocket transport.
//!
//! Adapts an upgraded axum [`WebSocket`] to [`EventSocket`]. Text frames
//! carry JSON; binary frames carry length-prefixed MessagePack and may split
//! or batch events across frames. Outbound events use the format the client
//! picked when connecting.
//!
//! The inbound size limit applies to every frame and to every assembled
//! binary event.

use crate::metrics;
use crate::traits::{EventSocket, TransportError};
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::{Buf, BytesMut};
use huddle_protocol::codec::{self, LENGTH_PREFIX_SIZE};
use huddle_protocol::{ClientEvent, ServerEvent, WireFormat};
use tracing::{debug, warn};

/// Default maximum inbound message size.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Reassembles length-prefixed events from binary frames.
///
/// An event whose declared size exceeds the limit is rejected as soon as its
/// prefix arrives; the rest of it is skipped as later frames come in.
struct FrameAssembler {
    buffer: BytesMut,
    max_message_size: usize,
    skip: usize,
}

impl FrameAssembler {
    fn new(max_message_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            max_message_size,
            skip: 0,
        }
    }

    fn push(&mut self, data: &[u8]) {
        let skipped = self.skip.min(data.len());
        self.skip -= skipped;
        self.buffer.extend_from_slice(&data[skipped..]);
    }

    fn next_event(&mut self) -> Result<Option<ClientEvent>, TransportError> {
        if self.buffer.len() >= LENGTH_PREFIX_SIZE {
            let length = u32::from_be_bytes([
                self.buffer[0],
                self.buffer[1],
                self.buffer[2],
                self.buffer[3],
            ]) as usize;
            let size = LENGTH_PREFIX_SIZE + length;

            if size > self.max_message_size {
                let held = self.buffer.len().min(size);
                self.buffer.advance(held);
                self.skip = size - held;
                warn!(size, max = self.max_message_size, "Binary event too large");
                return Err(TransportError::MessageTooLarge {
                    size,
                    max: self.max_message_size,
                });
            }
        }

        Ok(codec::decode_from(&mut self.buffer)?)
    }
}

/// An axum WebSocket speaking Huddle events.
pub struct WsSocket {
    socket: WebSocket,
    format: WireFormat,
    max_message_size: usize,
    frames: FrameAssembler,
    remote_addr: Option<String>,
    open: bool,
}

impl WsSocket {
    /// Wrap an upgraded WebSocket.
    #[must_use]
    pub fn new(socket: WebSocket, format: WireFormat) -> Self {
        Self {
            socket,
            format,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            frames: FrameAssembler::new(DEFAULT_MAX_MESSAGE_SIZE),
            remote_addr: None,
            open: true,
        }
    }

    /// Set the maximum inbound message size.
    #[must_use]
    pub fn with_max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = max;
        self.frames.max_message_size = max;
        self
    }

    /// Record the peer address for logging.
    #[must_use]
    pub fn with_remote_addr(mut self, addr: impl Into<String>) -> Self {
        self.remote_addr = Some(addr.into());
        self
    }

    /// Outbound wire format.
    #[must_use]
    pub fn format(&self) -> WireFormat {
        self.format
    }

    fn check_size(&self, size: usize) -> Result<(), TransportError> {
        if size > self.max_message_size {
            warn!(size, max = self.max_message_size, "Message too large");
            return Err(TransportError::MessageTooLarge {
                size,
                max: self.max_message_size,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl EventSocket for WsSocket {
    async fn recv(&mut self) -> Result<Option<ClientEvent>, TransportError> {
        // Events left over from an earlier binary frame come first
        if let Some(event) = self.frames.next_event()? {
            return Ok(Some(event));
        }

        loop {
            match self.socket.recv().await {
                Some(Ok(Message::Text(text))) => {
                    self.check_size(text.len())?;
                    metrics::record_bytes(text.len(), metrics::INBOUND);
                    return Ok(Some(codec::decode_json(&text)?));
                }
                Some(Ok(Message::Binary(data))) => {
                    self.check_size(data.len())?;
                    metrics::record_bytes(data.len(), metrics::INBOUND);
                    self.frames.push(&data);

                    if let Some(event) = self.frames.next_event()? {
                        return Ok(Some(event));
                    }
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) => {
                    debug!("Received close frame");
                    self.open = false;
                    return Ok(None);
                }
                Some(Err(e)) => {
                    self.open = false;
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
                None => {
                    debug!("WebSocket stream ended");
                    self.open = false;
                    return Ok(None);
                }
            }
        }
    }

    async fn send(&mut self, event: &ServerEvent) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::ConnectionClosed);
        }

        let message = match self.format {
            WireFormat::Json => Message::Text(codec::encode_json(event)?),
            WireFormat::MessagePack => Message::Binary(codec::encode(event)?.to_vec()),
        };
        let size = match &message {
            Message::Text(text) => text.len(),
            Message::Binary(data) => data.len(),
            _ => 0,
        };

        self.socket
            .send(message)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        metrics::record_bytes(size, metrics::OUTBOUND);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !std::mem::replace(&mut self.open, false) {
            return Ok(());
        }

        self.socket
            .send(Message::Close(None))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    fn name(&self) -> &'static str {
        "websocket"
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.clone()
    }
}
