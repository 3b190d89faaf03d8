//! Message router for Huddle.
//!
//! The router drives each connection through its lifecycle
//! (`Unjoined` → `Joined` → `Closed`) and turns commands into registry
//! updates and deliveries. Every command is handled synchronously: registry
//! changes are complete and deliveries queued before `handle` returns. Only
//! persistence happens later, on the write-behind task.

use crate::broadcaster::Broadcaster;
use crate::connection::{Connection, OutboxReceiver, DEFAULT_OUTBOX_CAPACITY};
use crate::message::{Delivery, ErrorKind, Message, MessageBody};
use crate::persistence::WriteBehind;
use crate::registry::{validate_room_name, validate_username, Registry, RoomDeparture};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, trace};

/// Router errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouterError {
    /// Invalid room name.
    #[error("Invalid room name: {0}")]
    InvalidRoom(&'static str),

    /// Invalid username.
    #[error("Invalid username: {0}")]
    InvalidUsername(&'static str),

    /// The connection has not joined any room yet.
    #[error("Join a room before sending")]
    NotJoined,

    /// The connection is not in the room.
    #[error("Not a member of room: {0}")]
    NotAMember(String),

    /// The event names a different user than the connection is bound to.
    #[error("Connection is bound to '{bound}', not '{claimed}'")]
    UsernameMismatch {
        /// Username bound to the connection.
        bound: String,
        /// Username named by the event.
        claimed: String,
    },

    /// Maximum rooms per connection reached.
    #[error("Maximum rooms per connection reached")]
    MaxRoomsReached,

    /// Message body too long.
    #[error("Message body of {0} bytes exceeds the limit")]
    BodyTooLong(usize),

    /// The connection is closed.
    #[error("Connection is closed")]
    Closed,
}

impl RouterError {
    /// Classify the error for the client.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            RouterError::InvalidRoom(_)
            | RouterError::InvalidUsername(_)
            | RouterError::BodyTooLong(_) => ErrorKind::InvalidInput,
            RouterError::NotJoined => ErrorKind::NotJoined,
            RouterError::NotAMember(_) => ErrorKind::NotAMember,
            RouterError::UsernameMismatch { .. } => ErrorKind::UsernameMismatch,
            RouterError::MaxRoomsReached => ErrorKind::LimitReached,
            RouterError::Closed => ErrorKind::Closed,
        }
    }
}

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Maximum rooms a single connection may be in.
    pub max_rooms_per_connection: usize,
    /// Maximum message body size in bytes.
    pub max_body_len: usize,
    /// Outbound queue capacity for each connection.
    pub outbox_capacity: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_rooms_per_connection: 100,
            max_body_len: 16 * 1024,
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
        }
    }
}

/// A validated request from a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Join a room, binding the username on first join.
    Join { username: String, room: String },
    /// Leave a room.
    Leave { username: String, room: String },
    /// Broadcast a message (text or file reference) to a room.
    Send {
        username: String,
        room: String,
        body: MessageBody,
    },
    /// Broadcast a typing indicator to the rest of a room.
    Typing {
        username: String,
        room: String,
        typing: bool,
    },
    /// Send a direct message to a username.
    PrivateMessage {
        sender: String,
        recipient: String,
        body: String,
    },
    /// Relay a seen acknowledgement to a room.
    MessageSeen {
        sender: String,
        timestamp: String,
        room: String,
    },
}

/// The central message router.
#[derive(Debug)]
pub struct Router {
    registry: Arc<Registry>,
    broadcaster: Broadcaster,
    persistence: WriteBehind,
    config: RouterConfig,
}

impl Router {
    /// Create a router with default configuration.
    #[must_use]
    pub fn new(persistence: WriteBehind) -> Self {
        Self::with_config(RouterConfig::default(), persistence)
    }

    /// Create a router with custom configuration.
    #[must_use]
    pub fn with_config(config: RouterConfig, persistence: WriteBehind) -> Self {
        info!(
            persistence = persistence.is_enabled(),
            "Creating router with config: {:?}", config
        );
        let registry = Arc::new(Registry::new());
        Self {
            broadcaster: Broadcaster::new(Arc::clone(&registry)),
            registry,
            persistence,
            config,
        }
    }

    /// The presence registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// The room broadcaster.
    #[must_use]
    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    /// The persistence handle.
    #[must_use]
    pub fn persistence(&self) -> &WriteBehind {
        &self.persistence
    }

    /// Router configuration.
    #[must_use]
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Open a connection in the `Unjoined` state.
    ///
    /// The receiver yields every delivery addressed to the connection.
    #[must_use]
    pub fn connect(&self) -> (Connection, OutboxReceiver) {
        let (conn, receiver) = Connection::open(self.config.outbox_capacity);
        debug!(connection = %conn.id(), "Connection opened");
        (conn, receiver)
    }

    /// Handle one command for a connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the command is not valid in the connection's
    /// current state. A failed command changes nothing and delivers nothing.
    pub fn handle(&self, conn: &mut Connection, command: Command) -> Result<(), RouterError> {
        if conn.is_closed() {
            return Err(RouterError::Closed);
        }

        match command {
            Command::Join { username, room } => self.join(conn, &username, &room),
            Command::Leave { username, room } => self.leave(conn, &username, &room),
            Command::Send {
                username,
                room,
                body,
            } => self.send(conn, &username, room, body),
            Command::Typing {
                username,
                room,
                typing,
            } => self.typing(conn, &username, room, typing),
            Command::PrivateMessage {
                sender,
                recipient,
                body,
            } => self.private_message(conn, &sender, recipient, body),
            Command::MessageSeen {
                sender,
                timestamp,
                room,
            } => self.message_seen(conn, sender, timestamp, room),
        }
    }

    /// Close a connection and remove it from the registry.
    ///
    /// Every room the connection was in gets the updated member list and, if
    /// the user is gone from it, a typing-stopped signal. Safe to call more
    /// than once.
    pub fn disconnect(&self, conn: &mut Connection) {
        if !conn.close() {
            return;
        }

        let Some(departure) = self.registry.disconnect(conn.id()) else {
            debug!(connection = %conn.id(), "Connection closed before joining");
            return;
        };

        for room in &departure.rooms {
            self.announce_departure(room);
        }

        debug!(
            connection = %conn.id(),
            username = %departure.username,
            rooms = departure.rooms.len(),
            went_offline = departure.went_offline,
            "Connection closed"
        );
    }

    fn join(&self, conn: &mut Connection, username: &str, room: &str) -> Result<(), RouterError> {
        validate_username(username).map_err(RouterError::InvalidUsername)?;
        validate_room_name(room).map_err(RouterError::InvalidRoom)?;

        if let Some(bound) = conn.username() {
            if bound != username {
                return Err(RouterError::UsernameMismatch {
                    bound: bound.to_string(),
                    claimed: username.to_string(),
                });
            }
        }

        if !self.registry.is_member(conn.id(), room)
            && self.registry.room_count(conn.id()) >= self.config.max_rooms_per_connection
        {
            return Err(RouterError::MaxRoomsReached);
        }

        let outcome = self.registry.join(conn.outbox(), username, room);
        conn.bind(username);

        if outcome.newly_online {
            info!(connection = %conn.id(), username = %username, "User online");
        }

        self.broadcaster.broadcast_members(room);
        Ok(())
    }

    fn leave(&self, conn: &Connection, username: &str, room: &str) -> Result<(), RouterError> {
        if conn.username().is_none() {
            return Ok(());
        }
        Self::bound_username(conn, username)?;

        if let Some(departure) = self.registry.leave(conn.id(), room) {
            self.announce_departure(&departure);
        }
        Ok(())
    }

    fn send(
        &self,
        conn: &Connection,
        username: &str,
        room: String,
        body: MessageBody,
    ) -> Result<(), RouterError> {
        let username = Self::bound_username(conn, username)?;
        self.require_member(conn, &room)?;
        self.check_body(body.len())?;

        let message = Arc::new(Message::in_room(username, room.as_str(), body));
        self.persistence.submit(Arc::clone(&message));

        if let Some(delivery) = Delivery::for_room(&message) {
            let fan_out = self.broadcaster.broadcast(&room, delivery, None);
            trace!(
                connection = %conn.id(),
                message_id = message.id,
                recipients = fan_out.delivered,
                "Room message"
            );
        }
        Ok(())
    }

    fn typing(
        &self,
        conn: &Connection,
        username: &str,
        room: String,
        typing: bool,
    ) -> Result<(), RouterError> {
        let username = Self::bound_username(conn, username)?.to_string();
        self.require_member(conn, &room)?;

        let delivery = Delivery::Typing {
            room: room.clone(),
            username,
            typing,
        };
        self.broadcaster.broadcast(&room, delivery, Some(conn.id()));
        Ok(())
    }

    fn private_message(
        &self,
        conn: &Connection,
        sender: &str,
        recipient: String,
        body: String,
    ) -> Result<(), RouterError> {
        let sender = Self::bound_username(conn, sender)?;
        validate_username(&recipient).map_err(RouterError::InvalidUsername)?;
        self.check_body(body.len())?;

        let message = Arc::new(Message::private(
            sender,
            recipient.as_str(),
            MessageBody::text(body),
        ));
        self.persistence.submit(Arc::clone(&message));

        let Some(delivery) = Delivery::for_recipient(&message) else {
            return Ok(());
        };
        let delivery = Arc::new(delivery);

        let recipients = self.registry.resolve(&recipient);
        if recipients.is_empty() {
            debug!(
                connection = %conn.id(),
                recipient = %recipient,
                "Recipient offline, echoing to sender only"
            );
        }

        let others = recipients
            .iter()
            .filter(|outbox| outbox.connection_id() != conn.id());
        let fan_out = Broadcaster::deliver_all(others, &delivery);
        conn.outbox().deliver(delivery);

        trace!(
            connection = %conn.id(),
            message_id = message.id,
            recipients = fan_out.delivered,
            "Private message"
        );
        Ok(())
    }

    fn message_seen(
        &self,
        conn: &Connection,
        sender: String,
        timestamp: String,
        room: String,
    ) -> Result<(), RouterError> {
        validate_room_name(&room).map_err(RouterError::InvalidRoom)?;

        let fan_out = self.broadcaster.broadcast(
            &room,
            Delivery::SeenAck {
                room: room.clone(),
                sender,
                timestamp,
            },
            None,
        );
        trace!(connection = %conn.id(), room = %room, recipients = fan_out.delivered, "Seen ack");
        Ok(())
    }

    fn announce_departure(&self, departure: &RoomDeparture) {
        self.broadcaster.broadcast_members(&departure.room);
        if !departure.still_present {
            self.broadcaster.broadcast(
                &departure.room,
                Delivery::Typing {
                    room: departure.room.clone(),
                    username: departure.username.clone(),
                    typing: false,
                },
                None,
            );
        }
    }

    /// The connection's bound username, checked against the one the event names.
    fn bound_username<'c>(conn: &'c Connection, claimed: &str) -> Result<&'c str, RouterError> {
        let bound = conn.username().ok_or(RouterError::NotJoined)?;
        if bound != claimed {
            return Err(RouterError::UsernameMismatch {
                bound: bound.to_string(),
                claimed: claimed.to_string(),
            });
        }
        Ok(bound)
    }

    fn require_member(&self, conn: &Connection, room: &str) -> Result<(), RouterError> {
        if self.registry.is_member(conn.id(), room) {
            Ok(())
        } else {
            Err(RouterError::NotAMember(room.to_string()))
        }
    }

    fn check_body(&self, len: usize) -> Result<(), RouterError> {
        if len > self.config.max_body_len {
            return Err(RouterError::BodyTooLong(len));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionState, OutboxReceiver};
    use crate::registry::RegistryStats;

    fn router() -> Router {
        Router::new(WriteBehind::disabled())
    }

    fn join(router: &Router, username: &str, room: &str) -> (Connection, OutboxReceiver) {
        let (mut conn, rx) = router.connect();
        router
            .handle(
                &mut conn,
                Command::Join {
                    username: username.to_string(),
                    room: room.to_string(),
                },
            )
            .unwrap();
        (conn, rx)
    }

    fn drain(rx: &mut OutboxReceiver) -> Vec<Delivery> {
        let mut out = Vec::new();
        while let Ok(delivery) = rx.try_recv() {
            out.push((*delivery).clone());
        }
        out
    }

    fn send(username: &str, room: &str, text: &str) -> Command {
        Command::Send {
            username: username.to_string(),
            room: room.to_string(),
            body: MessageBody::text(text),
        }
    }

    fn user_list(room: &str, users: &[&str]) -> Delivery {
        Delivery::UserList {
            room: room.to_string(),
            users: users.iter().map(|u| u.to_string()).collect(),
        }
    }

    #[test]
    fn test_join_broadcasts_member_list() {
        let router = router();
        let (conn_a, mut rx_a) = join(&router, "A", "general");
        assert_eq!(conn_a.state(), ConnectionState::Joined);
        assert_eq!(drain(&mut rx_a), vec![user_list("general", &["A"])]);

        let (_conn_b, mut rx_b) = join(&router, "B", "general");
        assert_eq!(drain(&mut rx_a), vec![user_list("general", &["A", "B"])]);
        assert_eq!(drain(&mut rx_b), vec![user_list("general", &["A", "B"])]);
    }

    #[test]
    fn test_send_reaches_room_including_sender() {
        let router = router();
        let (mut conn_a, mut rx_a) = join(&router, "A", "general");
        let (_conn_b, mut rx_b) = join(&router, "B", "general");
        drain(&mut rx_a);
        drain(&mut rx_b);

        router.handle(&mut conn_a, send("A", "general", "hello")).unwrap();

        for rx in [&mut rx_a, &mut rx_b] {
            match drain(rx).as_slice() {
                [Delivery::Message {
                    room,
                    username,
                    body,
                    timestamp,
                }] => {
                    assert_eq!(room, "general");
                    assert_eq!(username, "A");
                    assert_eq!(body, &MessageBody::text("hello"));
                    assert!(*timestamp > 0);
                }
                other => panic!("Expected one message, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_disconnect_rebroadcasts_member_list() {
        let router = router();
        let (_conn_a, mut rx_a) = join(&router, "A", "general");
        let (mut conn_b, _rx_b) = join(&router, "B", "general");
        drain(&mut rx_a);

        router.disconnect(&mut conn_b);
        assert!(conn_b.is_closed());

        let deliveries = drain(&mut rx_a);
        assert_eq!(deliveries[0], user_list("general", &["A"]));
        assert_eq!(
            deliveries[1],
            Delivery::Typing {
                room: "general".to_string(),
                username: "B".to_string(),
                typing: false,
            }
        );
        assert_eq!(router.registry().members("general"), vec!["A"]);

        // Second disconnect is a no-op
        router.disconnect(&mut conn_b);
        assert!(drain(&mut rx_a).is_empty());
    }

    #[test]
    fn test_send_requires_membership() {
        let router = router();
        let (mut conn_a, mut rx_a) = join(&router, "A", "general");
        let (_conn_b, mut rx_b) = join(&router, "B", "random");
        drain(&mut rx_a);
        drain(&mut rx_b);

        assert_eq!(
            router.handle(&mut conn_a, send("A", "random", "sneaky")),
            Err(RouterError::NotAMember("random".to_string()))
        );
        assert!(drain(&mut rx_b).is_empty());
        assert!(drain(&mut rx_a).is_empty());
    }

    #[test]
    fn test_send_before_join_rejected() {
        let router = router();
        let (mut conn, mut rx) = router.connect();

        assert_eq!(
            router.handle(&mut conn, send("A", "general", "hi")),
            Err(RouterError::NotJoined)
        );
        assert_eq!(conn.state(), ConnectionState::Unjoined);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_username_is_bound_on_first_join() {
        let router = router();
        let (mut conn, _rx) = join(&router, "A", "general");

        let err = router
            .handle(
                &mut conn,
                Command::Join {
                    username: "B".to_string(),
                    room: "random".to_string(),
                },
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UsernameMismatch);

        assert!(matches!(
            router.handle(&mut conn, send("B", "general", "spoof")),
            Err(RouterError::UsernameMismatch { .. })
        ));
        assert!(!router.registry().room_exists("random"));
    }

    #[test]
    fn test_typing_excludes_sender() {
        let router = router();
        let (mut conn_a, mut rx_a) = join(&router, "A", "general");
        let (_conn_b, mut rx_b) = join(&router, "B", "general");
        let (_conn_c, mut rx_c) = join(&router, "C", "general");
        drain(&mut rx_a);
        drain(&mut rx_b);
        drain(&mut rx_c);

        router
            .handle(
                &mut conn_a,
                Command::Typing {
                    username: "A".to_string(),
                    room: "general".to_string(),
                    typing: true,
                },
            )
            .unwrap();

        let expected = Delivery::Typing {
            room: "general".to_string(),
            username: "A".to_string(),
            typing: true,
        };
        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(drain(&mut rx_b), vec![expected.clone()]);
        assert_eq!(drain(&mut rx_c), vec![expected]);
    }

    #[test]
    fn test_private_message_to_online_user() {
        let router = router();
        let (mut conn_a, mut rx_a) = join(&router, "A", "general");
        let (_conn_b, mut rx_b) = join(&router, "B", "random");
        let (_conn_c, mut rx_c) = join(&router, "C", "general");
        drain(&mut rx_a);
        drain(&mut rx_b);
        drain(&mut rx_c);

        router
            .handle(
                &mut conn_a,
                Command::PrivateMessage {
                    sender: "A".to_string(),
                    recipient: "B".to_string(),
                    body: "hi".to_string(),
                },
            )
            .unwrap();

        let to_b = drain(&mut rx_b);
        let to_a = drain(&mut rx_a);
        assert_eq!(to_b.len(), 1);
        assert_eq!(to_a, to_b);
        assert!(matches!(
            &to_b[0],
            Delivery::PrivateMessage { sender, recipient, .. } if sender == "A" && recipient == "B"
        ));
        assert!(drain(&mut rx_c).is_empty());
    }

    #[test]
    fn test_private_message_to_offline_user_echoes_once() {
        let router = router();
        let (mut conn_a, mut rx_a) = join(&router, "A", "general");
        let (_conn_c, mut rx_c) = join(&router, "C", "general");
        drain(&mut rx_a);
        drain(&mut rx_c);

        router
            .handle(
                &mut conn_a,
                Command::PrivateMessage {
                    sender: "A".to_string(),
                    recipient: "B".to_string(),
                    body: "hi".to_string(),
                },
            )
            .unwrap();

        let to_a = drain(&mut rx_a);
        assert_eq!(to_a.len(), 1);
        assert!(matches!(
            &to_a[0],
            Delivery::PrivateMessage { sender, body, .. }
                if sender == "A" && body == &MessageBody::text("hi")
        ));
        assert!(drain(&mut rx_c).is_empty());
    }

    #[test]
    fn test_private_message_to_self_echoes_once() {
        let router = router();
        let (mut conn_a, mut rx_a) = join(&router, "A", "general");
        drain(&mut rx_a);

        router
            .handle(
                &mut conn_a,
                Command::PrivateMessage {
                    sender: "A".to_string(),
                    recipient: "A".to_string(),
                    body: "note to self".to_string(),
                },
            )
            .unwrap();

        assert_eq!(drain(&mut rx_a).len(), 1);
    }

    #[test]
    fn test_private_message_reaches_every_recipient_connection() {
        let router = router();
        let (mut conn_a, mut rx_a) = join(&router, "A", "general");
        let (_phone, mut rx_phone) = join(&router, "B", "general");
        let (_laptop, mut rx_laptop) = join(&router, "B", "random");
        drain(&mut rx_a);
        drain(&mut rx_phone);
        drain(&mut rx_laptop);

        router
            .handle(
                &mut conn_a,
                Command::PrivateMessage {
                    sender: "A".to_string(),
                    recipient: "B".to_string(),
                    body: "hi".to_string(),
                },
            )
            .unwrap();

        assert_eq!(drain(&mut rx_phone).len(), 1);
        assert_eq!(drain(&mut rx_laptop).len(), 1);
        assert_eq!(drain(&mut rx_a).len(), 1);
    }

    #[test]
    fn test_message_seen_reaches_whole_room() {
        let router = router();
        let (mut conn_a, mut rx_a) = join(&router, "A", "general");
        let (_conn_b, mut rx_b) = join(&router, "B", "general");
        drain(&mut rx_a);
        drain(&mut rx_b);

        router
            .handle(
                &mut conn_a,
                Command::MessageSeen {
                    sender: "B".to_string(),
                    timestamp: "12:00:01".to_string(),
                    room: "general".to_string(),
                },
            )
            .unwrap();

        let expected = Delivery::SeenAck {
            room: "general".to_string(),
            sender: "B".to_string(),
            timestamp: "12:00:01".to_string(),
        };
        assert_eq!(drain(&mut rx_a), vec![expected.clone()]);
        assert_eq!(drain(&mut rx_b), vec![expected]);
    }

    #[test]
    fn test_leave_is_idempotent() {
        let router = router();
        let (mut conn_a, mut rx_a) = join(&router, "A", "general");
        let (_conn_b, mut rx_b) = join(&router, "B", "general");
        drain(&mut rx_a);
        drain(&mut rx_b);

        let leave = Command::Leave {
            username: "A".to_string(),
            room: "general".to_string(),
        };
        router.handle(&mut conn_a, leave.clone()).unwrap();
        let after_first = drain(&mut rx_b);
        assert_eq!(after_first[0], user_list("general", &["B"]));

        router.handle(&mut conn_a, leave).unwrap();
        assert!(drain(&mut rx_b).is_empty());
        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(router.registry().members("general"), vec!["B"]);
        assert_eq!(conn_a.state(), ConnectionState::Joined);
    }

    #[test]
    fn test_double_join_keeps_single_member() {
        let router = router();
        let (mut conn_a, _rx_a) = join(&router, "A", "general");
        router
            .handle(
                &mut conn_a,
                Command::Join {
                    username: "A".to_string(),
                    room: "general".to_string(),
                },
            )
            .unwrap();
        assert_eq!(router.registry().members("general"), vec!["A"]);
    }

    #[test]
    fn test_join_then_disconnect_clears_membership() {
        let router = router();
        let (mut conn, _rx) = join(&router, "A", "one");
        router
            .handle(
                &mut conn,
                Command::Join {
                    username: "A".to_string(),
                    room: "two".to_string(),
                },
            )
            .unwrap();

        router.disconnect(&mut conn);
        assert!(router.registry().members("one").is_empty());
        assert!(router.registry().members("two").is_empty());
        assert!(!router.registry().is_online("A"));
    }

    #[test]
    fn test_closed_connection_rejects_commands() {
        let router = router();
        let (mut conn, _rx) = join(&router, "A", "general");
        router.disconnect(&mut conn);

        assert_eq!(
            router.handle(&mut conn, send("A", "general", "late")),
            Err(RouterError::Closed)
        );
    }

    #[test]
    fn test_limits() {
        let config = RouterConfig {
            max_rooms_per_connection: 1,
            max_body_len: 4,
            ..Default::default()
        };
        let router = Router::with_config(config, WriteBehind::disabled());
        let (mut conn, _rx) = join(&router, "A", "one");

        assert_eq!(
            router.handle(
                &mut conn,
                Command::Join {
                    username: "A".to_string(),
                    room: "two".to_string(),
                },
            ),
            Err(RouterError::MaxRoomsReached)
        );
        // Re-joining a room already joined is not a new room
        assert!(router
            .handle(
                &mut conn,
                Command::Join {
                    username: "A".to_string(),
                    room: "one".to_string(),
                },
            )
            .is_ok());
        assert_eq!(
            router.handle(&mut conn, send("A", "one", "too long")),
            Err(RouterError::BodyTooLong(8))
        );
    }

    #[test]
    fn test_invalid_names_rejected() {
        let router = router();
        let (mut conn, _rx) = router.connect();

        assert!(matches!(
            router.handle(
                &mut conn,
                Command::Join {
                    username: "A".to_string(),
                    room: String::new(),
                },
            ),
            Err(RouterError::InvalidRoom(_))
        ));
        assert_eq!(conn.state(), ConnectionState::Unjoined);
    }

    #[tokio::test]
    async fn test_chat_messages_are_persisted() {
        use crate::persistence::{MessageSink, SinkError};
        use async_trait::async_trait;
        use std::sync::Mutex;

        #[derive(Default)]
        struct Recorder(Mutex<Vec<Message>>);

        #[async_trait]
        impl MessageSink for Recorder {
            async fn append(&self, message: &Message) -> Result<(), SinkError> {
                self.0.lock().unwrap().push(message.clone());
                Ok(())
            }

            fn name(&self) -> &'static str {
                "recorder"
            }
        }

        let sink = Arc::new(Recorder::default());
        let (persistence, handle) = WriteBehind::spawn(sink.clone(), 16);
        let router = Router::new(persistence);

        let (mut conn, _rx) = join(&router, "A", "general");
        router.handle(&mut conn, send("A", "general", "hello")).unwrap();
        router
            .handle(
                &mut conn,
                Command::PrivateMessage {
                    sender: "A".to_string(),
                    recipient: "B".to_string(),
                    body: "hi".to_string(),
                },
            )
            .unwrap();
        router
            .handle(
                &mut conn,
                Command::Typing {
                    username: "A".to_string(),
                    room: "general".to_string(),
                    typing: true,
                },
            )
            .unwrap();

        drop(router);
        handle.await.unwrap();

        let stored = sink.0.lock().unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].room(), Some("general"));
        assert!(stored[1].is_private());
        assert_eq!(stored[1].recipient(), Some("B"));
    }

    #[test]
    fn test_concurrent_presence_stays_consistent() {
        const THREADS: usize = 8;
        const ITERATIONS: usize = 200;
        const ROOMS: [&str; 4] = ["room-0", "room-1", "room-2", "room-3"];

        let router = Router::with_config(
            RouterConfig {
                outbox_capacity: 1 << 16,
                ..RouterConfig::default()
            },
            WriteBehind::disabled(),
        );

        // One long-lived member sees every member list of every room
        let (mut watcher, mut watcher_rx) = router.connect();
        for room in ROOMS {
            router
                .handle(
                    &mut watcher,
                    Command::Join {
                        username: "watcher".to_string(),
                        room: room.to_string(),
                    },
                )
                .unwrap();
        }
        drain(&mut watcher_rx);

        std::thread::scope(|scope| {
            for t in 0..THREADS {
                let router = &router;
                scope.spawn(move || {
                    // Threads share usernames, so users hold several connections
                    let username = format!("user-{}", t % 3);
                    for i in 0..ITERATIONS {
                        let (mut conn, _rx) = router.connect();
                        for k in 0..3 {
                            router
                                .handle(
                                    &mut conn,
                                    Command::Join {
                                        username: username.clone(),
                                        room: ROOMS[(i + k) % ROOMS.len()].to_string(),
                                    },
                                )
                                .unwrap();
                        }
                        router
                            .handle(
                                &mut conn,
                                Command::Leave {
                                    username: username.clone(),
                                    room: ROOMS[i % ROOMS.len()].to_string(),
                                },
                            )
                            .unwrap();
                        router.disconnect(&mut conn);
                    }
                });
            }
        });

        let stats = router.registry().stats();
        assert_eq!(stats.connection_count, 1);
        assert_eq!(stats.online_users, 1);
        assert_eq!(stats.room_count, ROOMS.len());
        assert_eq!(stats.total_memberships, ROOMS.len());
        assert_eq!(watcher.outbox().dropped(), 0);

        // Every list is a consistent snapshot, and the last one per room
        // shows that everyone else has left
        let mut last = std::collections::HashMap::new();
        for delivery in drain(&mut watcher_rx) {
            if let Delivery::UserList { room, users } = delivery {
                assert!(users.contains(&"watcher".to_string()));
                assert!(users.windows(2).all(|w| w[0] < w[1]), "{users:?}");
                last.insert(room, users);
            }
        }
        assert_eq!(last.len(), ROOMS.len());
        for users in last.values() {
            assert_eq!(users, &vec!["watcher".to_string()]);
        }

        router.disconnect(&mut watcher);
        assert_eq!(
            router.registry().stats(),
            RegistryStats {
                room_count: 0,
                online_users: 0,
                connection_count: 0,
                total_memberships: 0,
            }
        );
    }
}
