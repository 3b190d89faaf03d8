//! Event types for the Huddle protocol.
//!
//! Every event is an object tagged by its `event` field, with the payload
//! fields alongside the tag:
//!
//! ```json
//! {"event": "join_room", "username": "alice", "room": "general"}
//! ```
//!
//! Inbound payload fields are all optional at the wire level. Checking that a
//! required field is present is the gateway's job, so a frame with a missing
//! field still decodes and can be rejected with a precise error.

use serde::{Deserialize, Serialize};

use crate::version::Version;

/// Error codes carried by [`ServerEvent::Error`].
pub mod codes {
    /// The inbound frame could not be decoded or lacks a required field.
    pub const MALFORMED: u16 = 1001;
    /// The connection has not joined with a username yet.
    pub const NOT_JOINED: u16 = 1002;
    /// The connection is not a member of the target room.
    pub const NOT_A_MEMBER: u16 = 1003;
    /// The event names a different username than the one bound to the connection.
    pub const USERNAME_MISMATCH: u16 = 1004;
    /// A room name, username or body failed validation.
    pub const INVALID_INPUT: u16 = 1005;
    /// A per-connection limit was reached.
    pub const LIMIT_REACHED: u16 = 1006;
    /// The connection is closed.
    pub const CLOSED: u16 = 1007;
}

/// Event kind identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    JoinRoom,
    LeaveRoom,
    SendMessage,
    SendFile,
    Typing,
    PrivateMessage,
    MessageSeen,
    Disconnect,
    Connected,
    UserList,
    ReceiveMessage,
    UserTyping,
    ReceivePrivateMessage,
    MessageSeenAck,
    Error,
}

impl EventKind {
    /// Wire name of the event.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::JoinRoom => "join_room",
            EventKind::LeaveRoom => "leave_room",
            EventKind::SendMessage => "send_message",
            EventKind::SendFile => "send_file",
            EventKind::Typing => "typing",
            EventKind::PrivateMessage => "private_message",
            EventKind::MessageSeen => "message_seen",
            EventKind::Disconnect => "disconnect",
            EventKind::Connected => "connected",
            EventKind::UserList => "user_list",
            EventKind::ReceiveMessage => "receive_message",
            EventKind::UserTyping => "user_typing",
            EventKind::ReceivePrivateMessage => "receive_private_message",
            EventKind::MessageSeenAck => "message_seen_ack",
            EventKind::Error => "error",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Join a room under a username.
    JoinRoom {
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        room: Option<String>,
    },

    /// Leave a previously joined room.
    LeaveRoom {
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        room: Option<String>,
    },

    /// Broadcast a text message to a room.
    SendMessage {
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        room: Option<String>,
        #[serde(default)]
        message: Option<String>,
    },

    /// Broadcast a file reference to a room.
    SendFile {
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        room: Option<String>,
        /// File location (URL or data URI).
        #[serde(default)]
        file: Option<String>,
        #[serde(default)]
        filename: Option<String>,
    },

    /// Typing indicator for a room.
    Typing {
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        room: Option<String>,
        #[serde(default)]
        typing: Option<bool>,
    },

    /// Direct message routed by username.
    PrivateMessage {
        #[serde(default)]
        sender: Option<String>,
        #[serde(default)]
        recipient: Option<String>,
        #[serde(default)]
        message: Option<String>,
    },

    /// Acknowledge that a message was seen.
    MessageSeen {
        /// Sender of the message being acknowledged.
        #[serde(default)]
        sender: Option<String>,
        /// Timestamp of the message being acknowledged, as the client saw it.
        #[serde(default)]
        timestamp: Option<String>,
        #[serde(default)]
        room: Option<String>,
    },

    /// Client-initiated close.
    Disconnect {
        #[serde(default)]
        username: Option<String>,
    },
}

impl ClientEvent {
    /// Get the event kind.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            ClientEvent::JoinRoom { .. } => EventKind::JoinRoom,
            ClientEvent::LeaveRoom { .. } => EventKind::LeaveRoom,
            ClientEvent::SendMessage { .. } => EventKind::SendMessage,
            ClientEvent::SendFile { .. } => EventKind::SendFile,
            ClientEvent::Typing { .. } => EventKind::Typing,
            ClientEvent::PrivateMessage { .. } => EventKind::PrivateMessage,
            ClientEvent::MessageSeen { .. } => EventKind::MessageSeen,
            ClientEvent::Disconnect { .. } => EventKind::Disconnect,
        }
    }

    /// Create a `join_room` event.
    #[must_use]
    pub fn join_room(username: impl Into<String>, room: impl Into<String>) -> Self {
        ClientEvent::JoinRoom {
            username: Some(username.into()),
            room: Some(room.into()),
        }
    }

    /// Create a `leave_room` event.
    #[must_use]
    pub fn leave_room(username: impl Into<String>, room: impl Into<String>) -> Self {
        ClientEvent::LeaveRoom {
            username: Some(username.into()),
            room: Some(room.into()),
        }
    }

    /// Create a `send_message` event.
    #[must_use]
    pub fn send_message(
        username: impl Into<String>,
        room: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        ClientEvent::SendMessage {
            username: Some(username.into()),
            room: Some(room.into()),
            message: Some(message.into()),
        }
    }

    /// Create a `send_file` event.
    #[must_use]
    pub fn send_file(
        username: impl Into<String>,
        room: impl Into<String>,
        file: impl Into<String>,
        filename: impl Into<String>,
    ) -> Self {
        ClientEvent::SendFile {
            username: Some(username.into()),
            room: Some(room.into()),
            file: Some(file.into()),
            filename: Some(filename.into()),
        }
    }

    /// Create a `typing` event.
    #[must_use]
    pub fn typing(username: impl Into<String>, room: impl Into<String>, typing: bool) -> Self {
        ClientEvent::Typing {
            username: Some(username.into()),
            room: Some(room.into()),
            typing: Some(typing),
        }
    }

    /// Create a `private_message` event.
    #[must_use]
    pub fn private_message(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        ClientEvent::PrivateMessage {
            sender: Some(sender.into()),
            recipient: Some(recipient.into()),
            message: Some(message.into()),
        }
    }

    /// Create a `message_seen` event.
    #[must_use]
    pub fn message_seen(
        sender: impl Into<String>,
        timestamp: impl Into<String>,
        room: impl Into<String>,
    ) -> Self {
        ClientEvent::MessageSeen {
            sender: Some(sender.into()),
            timestamp: Some(timestamp.into()),
            room: Some(room.into()),
        }
    }
}

/// An event sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Sent once after the transport is established.
    Connected {
        /// Unique connection identifier.
        connection_id: String,
        /// Protocol version spoken by the server.
        version: Version,
    },

    /// Current members of a room.
    UserList { room: String, users: Vec<String> },

    /// A message broadcast to a room.
    ReceiveMessage {
        room: String,
        username: String,
        message: String,
        timestamp: String,
    },

    /// Typing state of a room member.
    UserTyping {
        room: String,
        username: String,
        typing: bool,
    },

    /// A direct message, delivered to the recipient and echoed to the sender.
    ReceivePrivateMessage {
        sender: String,
        recipient: String,
        message: String,
        timestamp: String,
    },

    /// A seen acknowledgement relayed to a room.
    MessageSeenAck {
        room: String,
        sender: String,
        timestamp: String,
    },

    /// Error response for the originating connection.
    Error {
        /// Error code, see [`codes`].
        code: u16,
        /// Human-readable error message.
        message: String,
    },
}

impl ServerEvent {
    /// Get the event kind.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            ServerEvent::Connected { .. } => EventKind::Connected,
            ServerEvent::UserList { .. } => EventKind::UserList,
            ServerEvent::ReceiveMessage { .. } => EventKind::ReceiveMessage,
            ServerEvent::UserTyping { .. } => EventKind::UserTyping,
            ServerEvent::ReceivePrivateMessage { .. } => EventKind::ReceivePrivateMessage,
            ServerEvent::MessageSeenAck { .. } => EventKind::MessageSeenAck,
            ServerEvent::Error { .. } => EventKind::Error,
        }
    }

    /// Create a `connected` event for the current protocol version.
    #[must_use]
    pub fn connected(connection_id: impl Into<String>) -> Self {
        ServerEvent::Connected {
            connection_id: connection_id.into(),
            version: Version::default(),
        }
    }

    /// Create an `error` event.
    #[must_use]
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        ServerEvent::Error {
            code,
            message: message.into(),
        }
    }
}
