//! Connections and their outbound delivery path.
//!
//! Every live client owns one [`Connection`]. Deliveries reach it through its
//! [`Outbox`], a bounded queue drained by the connection's own task. Pushing
//! into an outbox never waits: when the queue is full the new delivery is
//! dropped and counted, so a stalled client cannot hold up a room.

use crate::message::Delivery;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{trace, warn};

/// Default outbound queue capacity per connection.
pub const DEFAULT_OUTBOX_CAPACITY: usize = 256;

static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Create a connection ID from an existing string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a process-unique connection ID.
    #[must_use]
    pub fn generate() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let counter = CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}_{:x}", timestamp, counter))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Connected, no username bound yet.
    Unjoined,
    /// Bound to a username; member of zero or more rooms.
    Joined,
    /// Terminal.
    Closed,
}

/// Result of pushing a delivery into an outbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Queued for the connection.
    Queued,
    /// The queue was full; the delivery was dropped.
    Dropped,
    /// The connection's receiver is gone.
    Closed,
}

/// Receiving half of an outbox, owned by the connection's task.
pub type OutboxReceiver = mpsc::Receiver<Arc<Delivery>>;

/// Sending half of a connection's bounded delivery queue.
///
/// Cloning an outbox is cheap; clones share the queue and the drop counter.
#[derive(Debug, Clone)]
pub struct Outbox {
    connection_id: ConnectionId,
    sender: mpsc::Sender<Arc<Delivery>>,
    dropped: Arc<AtomicU64>,
}

impl Outbox {
    /// Create an outbox with the given capacity.
    ///
    /// A capacity of zero is raised to one.
    #[must_use]
    pub fn channel(connection_id: ConnectionId, capacity: usize) -> (Self, OutboxReceiver) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let outbox = Self {
            connection_id,
            sender,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (outbox, receiver)
    }

    /// The connection this outbox belongs to.
    #[must_use]
    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    /// Push a delivery without waiting.
    pub fn deliver(&self, delivery: Arc<Delivery>) -> DeliveryOutcome {
        match self.sender.try_send(delivery) {
            Ok(()) => {
                trace!(connection = %self.connection_id, "Delivery queued");
                DeliveryOutcome::Queued
            }
            Err(TrySendError::Full(_)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    connection = %self.connection_id,
                    dropped_total = total,
                    "Outbox full, dropping delivery"
                );
                DeliveryOutcome::Dropped
            }
            Err(TrySendError::Closed(_)) => DeliveryOutcome::Closed,
        }
    }

    /// Number of deliveries dropped because the queue was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Configured queue capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.sender.max_capacity()
    }
}

/// A client connection as seen by the router.
///
/// Owned by the task serving the client; the router mutates it as events are
/// handled.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    state: ConnectionState,
    username: Option<String>,
    outbox: Outbox,
}

impl Connection {
    /// Open a new connection in the `Unjoined` state.
    #[must_use]
    pub fn open(outbox_capacity: usize) -> (Self, OutboxReceiver) {
        let id = ConnectionId::generate();
        let (outbox, receiver) = Outbox::channel(id.clone(), outbox_capacity);
        let conn = Self {
            id,
            state: ConnectionState::Unjoined,
            username: None,
            outbox,
        };
        (conn, receiver)
    }

    /// Get the connection ID.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Get the lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Username bound by the first join, if any.
    #[must_use]
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// The connection's own outbox.
    #[must_use]
    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    /// Check if the connection is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    /// Bind a username and move to `Joined`. A bound username never changes.
    pub(crate) fn bind(&mut self, username: &str) {
        if self.username.is_none() {
            self.username = Some(username.to_string());
        }
        if self.state == ConnectionState::Unjoined {
            self.state = ConnectionState::Joined;
        }
    }

    /// Move to `Closed`. Returns `false` if it already was.
    pub(crate) fn close(&mut self) -> bool {
        let was_open = self.state != ConnectionState::Closed;
        self.state = ConnectionState::Closed;
        was_open
    }
}
