//! # huddle-core
//!
//! Presence, room fan-out, and message routing for the Huddle chat relay.
//!
//! This crate knows nothing about sockets or wire formats. It provides:
//!
//! - **Connection** - Per-client state and its bounded outbox
//! - **Registry** - Who is online, which rooms exist, and who is in them
//! - **Broadcaster** - Non-blocking fan-out to a room or a set of connections
//! - **Router** - The per-connection state machine that handles commands
//! - **Persistence** - Write-behind message log behind a [`MessageSink`]
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Connection │────▶│   Router    │────▶│ Broadcaster │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        ▲                  │   │                │
//!        │ outbox           │   ▼                ▼
//!        │                  │  ┌─────────────┐   │
//!        └──────────────────┼──│  Registry   │◀──┘
//!                           ▼  └─────────────┘
//!                    ┌─────────────┐
//!                    │ WriteBehind │──▶ MessageSink
//!                    └─────────────┘
//! ```

pub mod broadcaster;
pub mod connection;
pub mod message;
pub mod persistence;
pub mod registry;
pub mod router;

pub use broadcaster::{Broadcaster, FanOut};
pub use connection::{
    Connection, ConnectionId, ConnectionState, DeliveryOutcome, Outbox, OutboxReceiver,
    DEFAULT_OUTBOX_CAPACITY,
};
pub use message::{Delivery, ErrorKind, Message, MessageBody, MessageId, MessageTarget};
pub use persistence::{
    JsonLinesSink, LogSink, MessageSink, PersistenceStats, SinkError, WriteBehind,
    DEFAULT_QUEUE_CAPACITY,
};
pub use registry::{Departure, JoinOutcome, Registry, RegistryStats, RoomDeparture};
pub use router::{Command, Router, RouterConfig, RouterError};
