//! Message and delivery types for Huddle.
//!
//! A [`Message`] is a chat-bearing event as the relay records it. A
//! [`Delivery`] is a typed payload queued for a single connection.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A unique message identifier.
pub type MessageId = u64;

/// Low bits of an id taken by the process-wide counter.
const COUNTER_BITS: u32 = 20;

/// Atomic counter for ensuring unique IDs within the same millisecond.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a unique message ID.
///
/// Unix milliseconds in the high bits, a process-wide counter in the low
/// [`COUNTER_BITS`], so ids are unique unless one process issues more than
/// 2^20 of them within a single millisecond.
#[must_use]
pub fn generate_message_id() -> MessageId {
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed) & ((1 << COUNTER_BITS) - 1);
    (now_millis() << COUNTER_BITS) | counter
}

/// Current wall-clock time in unix milliseconds.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Message content. The relay never interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageBody {
    /// Plain text.
    Text { text: String },
    /// A reference to a file hosted elsewhere.
    File { url: String, filename: String },
}

impl MessageBody {
    /// Create a text body.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        MessageBody::Text { text: text.into() }
    }

    /// Create a file reference body.
    #[must_use]
    pub fn file(url: impl Into<String>, filename: impl Into<String>) -> Self {
        MessageBody::File {
            url: url.into(),
            filename: filename.into(),
        }
    }

    /// Size of the body in bytes, used for limit checks.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            MessageBody::Text { text } => text.len(),
            MessageBody::File { url, filename } => url.len() + filename.len(),
        }
    }

    /// Check if the body is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Where a message is addressed. Exactly one target per message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageTarget {
    /// Broadcast to a room.
    Room(String),
    /// Private delivery to a username.
    Recipient(String),
}

/// A chat message as handed to persistence and delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message identifier.
    pub id: MessageId,
    /// Sender username.
    pub sender: String,
    /// Message content.
    pub body: MessageBody,
    /// Room or recipient.
    pub target: MessageTarget,
    /// Server-assigned timestamp (unix milliseconds).
    pub timestamp: u64,
}

impl Message {
    /// Create a message addressed to a room.
    #[must_use]
    pub fn in_room(sender: impl Into<String>, room: impl Into<String>, body: MessageBody) -> Self {
        Self::new(sender.into(), MessageTarget::Room(room.into()), body)
    }

    /// Create a private message addressed to a username.
    #[must_use]
    pub fn private(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        body: MessageBody,
    ) -> Self {
        Self::new(sender.into(), MessageTarget::Recipient(recipient.into()), body)
    }

    fn new(sender: String, target: MessageTarget, body: MessageBody) -> Self {
        Self {
            id: generate_message_id(),
            sender,
            body,
            target,
            timestamp: now_millis(),
        }
    }

    /// Whether this is a private message.
    #[must_use]
    pub fn is_private(&self) -> bool {
        matches!(self.target, MessageTarget::Recipient(_))
    }

    /// Target room, for room messages.
    #[must_use]
    pub fn room(&self) -> Option<&str> {
        match &self.target {
            MessageTarget::Room(room) => Some(room),
            MessageTarget::Recipient(_) => None,
        }
    }

    /// Target recipient, for private messages.
    #[must_use]
    pub fn recipient(&self) -> Option<&str> {
        match &self.target {
            MessageTarget::Recipient(recipient) => Some(recipient),
            MessageTarget::Room(_) => None,
        }
    }
}

/// Classification of errors reported back to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The inbound event was malformed.
    Malformed,
    /// The connection has not joined yet.
    NotJoined,
    /// The connection is not in the room it addressed.
    NotAMember,
    /// The event claims a different username than the bound one.
    UsernameMismatch,
    /// A name or body failed validation.
    InvalidInput,
    /// A per-connection limit was reached.
    LimitReached,
    /// The connection is closed.
    Closed,
}

/// A payload queued for delivery to one connection.
///
/// Deliveries are shared across all recipients of a fan-out as `Arc<Delivery>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Current member list of a room.
    UserList { room: String, users: Vec<String> },
    /// A room message.
    Message {
        room: String,
        username: String,
        body: MessageBody,
        timestamp: u64,
    },
    /// Typing state of a room member.
    Typing {
        room: String,
        username: String,
        typing: bool,
    },
    /// A private message.
    PrivateMessage {
        sender: String,
        recipient: String,
        body: MessageBody,
        timestamp: u64,
    },
    /// A seen acknowledgement. The timestamp is relayed as the client sent it.
    SeenAck {
        room: String,
        sender: String,
        timestamp: String,
    },
    /// An error for the originating connection only.
    Error { kind: ErrorKind, message: String },
}

impl Delivery {
    /// Build the room delivery for a room message.
    ///
    /// Returns `None` for private messages.
    #[must_use]
    pub fn for_room(message: &Message) -> Option<Self> {
        let room = message.room()?;
        Some(Delivery::Message {
            room: room.to_string(),
            username: message.sender.clone(),
            body: message.body.clone(),
            timestamp: message.timestamp,
        })
    }

    /// Build the direct delivery for a private message.
    ///
    /// Returns `None` for room messages.
    #[must_use]
    pub fn for_recipient(message: &Message) -> Option<Self> {
        let recipient = message.recipient()?;
        Some(Delivery::PrivateMessage {
            sender: message.sender.clone(),
            recipient: recipient.to_string(),
            body: message.body.clone(),
            timestamp: message.timestamp,
        })
    }
}
