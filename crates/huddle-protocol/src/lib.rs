//! # huddle-protocol
//!
//! Wire protocol definitions for the Huddle chat relay.
//!
//! Clients and the server exchange tagged events over WebSocket, either as
//! JSON text frames or as length-prefixed MessagePack binary frames.
//!
//! ## Events
//!
//! - `join_room` / `leave_room` - Room membership
//! - `send_message` / `send_file` - Room broadcast
//! - `typing` / `message_seen` - Signals relayed to a room
//! - `private_message` - Direct messages routed by username
//!
//! ## Example
//!
//! ```rust
//! use huddle_protocol::{codec, ClientEvent};
//!
//! let event = ClientEvent::send_message("alice", "general", "Hello, world!");
//!
//! let text = codec::encode_json(&event).unwrap();
//! let decoded: ClientEvent = codec::decode_json(&text).unwrap();
//! assert_eq!(event, decoded);
//! ```

pub mod codec;
pub mod events;
pub mod version;

pub use codec::{decode, decode_json, encode, encode_json, ProtocolError, WireFormat};
pub use events::{codes, ClientEvent, EventKind, ServerEvent};
pub use version::{Version, PROTOCOL_VERSION};
