//! # huddle-gateway
//!
//! The edge between clients and the Huddle router.
//!
//! - **Transports** - [`EventSocket`] over an axum WebSocket, or an in-process
//!   pair for tests (`test-util` feature)
//! - **Translation** - wire events to router commands and deliveries back to wire events
//! - **Sessions** - one task per connection pumping both directions
//!
//! ## Serving a connection
//!
//! Every transport implements [`EventSocket`], so the session loop is the
//! same for all of them:
//!
//! ```rust,ignore
//! use huddle_gateway::{Session, WsSocket};
//! use huddle_protocol::WireFormat;
//!
//! async fn serve(router: Arc<Router>, ws: WebSocket) {
//!     Session::new(router, WsSocket::new(ws, WireFormat::Json)).run().await;
//! }
//! ```

pub mod gateway;
pub mod metrics;
pub mod session;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

#[cfg(any(test, feature = "test-util"))]
pub mod memory;

pub use gateway::{decode_command, encode_delivery, GatewayError, Inbound};
pub use session::Session;
pub use traits::{EventSocket, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::WsSocket;

#[cfg(any(test, feature = "test-util"))]
pub use memory::{MemoryClient, MemorySocket};
