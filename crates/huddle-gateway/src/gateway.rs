//! Translation between wire events and router types.
//!
//! Inbound, a [`ClientEvent`] becomes a router [`Command`] once its required
//! fields are present. Outbound, a [`Delivery`] becomes the [`ServerEvent`]
//! the client expects: file bodies turn into download links, unix-millisecond
//! timestamps into `HH:MM:SS` (UTC), error kinds into numeric codes.

use chrono::{DateTime, Utc};
use huddle_core::{Command, Delivery, ErrorKind, MessageBody};
use huddle_protocol::{codes, ClientEvent, EventKind, ServerEvent};
use thiserror::Error;

/// Gateway errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// A required field is absent or empty.
    #[error("Missing field '{field}' in {event}")]
    MissingField {
        /// Event that was rejected.
        event: EventKind,
        /// Name of the missing field.
        field: &'static str,
    },
}

/// What an inbound event asks the session to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Hand a command to the router.
    Command(Command),
    /// Close the connection.
    Disconnect,
}

/// Turn a client event into a router command.
///
/// # Errors
///
/// Returns [`GatewayError::MissingField`] if a required field is absent or
/// empty.
pub fn decode_command(event: ClientEvent) -> Result<Inbound, GatewayError> {
    let kind = event.kind();
    let field = |value: Option<String>, name: &'static str| required(value, kind, name);

    let command = match event {
        ClientEvent::JoinRoom { username, room } => Command::Join {
            username: field(username, "username")?,
            room: field(room, "room")?,
        },
        ClientEvent::LeaveRoom { username, room } => Command::Leave {
            username: field(username, "username")?,
            room: field(room, "room")?,
        },
        ClientEvent::SendMessage {
            username,
            room,
            message,
        } => Command::Send {
            username: field(username, "username")?,
            room: field(room, "room")?,
            body: MessageBody::text(field(message, "message")?),
        },
        ClientEvent::SendFile {
            username,
            room,
            file,
            filename,
        } => Command::Send {
            username: field(username, "username")?,
            room: field(room, "room")?,
            body: MessageBody::file(field(file, "file")?, field(filename, "filename")?),
        },
        ClientEvent::Typing {
            username,
            room,
            typing,
        } => Command::Typing {
            username: field(username, "username")?,
            room: field(room, "room")?,
            typing: typing.unwrap_or(false),
        },
        ClientEvent::PrivateMessage {
            sender,
            recipient,
            message,
        } => Command::PrivateMessage {
            sender: field(sender, "sender")?,
            recipient: field(recipient, "recipient")?,
            body: field(message, "message")?,
        },
        ClientEvent::MessageSeen {
            sender,
            timestamp,
            room,
        } => Command::MessageSeen {
            sender: field(sender, "sender")?,
            timestamp: field(timestamp, "timestamp")?,
            room: field(room, "room")?,
        },
        ClientEvent::Disconnect { .. } => return Ok(Inbound::Disconnect),
    };

    Ok(Inbound::Command(command))
}

fn required(
    value: Option<String>,
    event: EventKind,
    field: &'static str,
) -> Result<String, GatewayError> {
    match value {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(GatewayError::MissingField { event, field }),
    }
}

/// Render a delivery as the event sent to the client.
#[must_use]
pub fn encode_delivery(delivery: &Delivery) -> ServerEvent {
    match delivery {
        Delivery::UserList { room, users } => ServerEvent::UserList {
            room: room.clone(),
            users: users.clone(),
        },
        Delivery::Message {
            room,
            username,
            body,
            timestamp,
        } => ServerEvent::ReceiveMessage {
            room: room.clone(),
            username: username.clone(),
            message: render_body(body),
            timestamp: format_clock(*timestamp),
        },
        Delivery::Typing {
            room,
            username,
            typing,
        } => ServerEvent::UserTyping {
            room: room.clone(),
            username: username.clone(),
            typing: *typing,
        },
        Delivery::PrivateMessage {
            sender,
            recipient,
            body,
            timestamp,
        } => ServerEvent::ReceivePrivateMessage {
            sender: sender.clone(),
            recipient: recipient.clone(),
            message: render_body(body),
            timestamp: format_clock(*timestamp),
        },
        Delivery::SeenAck {
            room,
            sender,
            timestamp,
        } => ServerEvent::MessageSeenAck {
            room: room.clone(),
            sender: sender.clone(),
            timestamp: timestamp.clone(),
        },
        Delivery::Error { kind, message } => ServerEvent::error(error_code(*kind), message.clone()),
    }
}

/// Numeric code for an error kind.
#[must_use]
pub fn error_code(kind: ErrorKind) -> u16 {
    match kind {
        ErrorKind::Malformed => codes::MALFORMED,
        ErrorKind::NotJoined => codes::NOT_JOINED,
        ErrorKind::NotAMember => codes::NOT_A_MEMBER,
        ErrorKind::UsernameMismatch => codes::USERNAME_MISMATCH,
        ErrorKind::InvalidInput => codes::INVALID_INPUT,
        ErrorKind::LimitReached => codes::LIMIT_REACHED,
        ErrorKind::Closed => codes::CLOSED,
    }
}

/// Message text as shown to clients. Files become a download link.
#[must_use]
pub fn render_body(body: &MessageBody) -> String {
    match body {
        MessageBody::Text { text } => text.clone(),
        MessageBody::File { url, filename } => {
            let url = escape_html(url);
            let filename = escape_html(filename);
            format!("<a href='{url}' download='{filename}' target='_blank'>📎 {filename}</a>")
        }
    }
}

/// Format unix milliseconds as a UTC wall-clock time, `HH:MM:SS`.
///
/// Timestamps outside chrono's range render as an empty string.
#[must_use]
pub fn format_clock(millis: u64) -> String {
    i64::try_from(millis)
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .map(|t| t.format("%H:%M:%S").to_string())
        .unwrap_or_default()
}

fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            c => out.push(c),
        }
    }
    out
}
