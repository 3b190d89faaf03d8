//! Presence registry for Huddle.
//!
//! The registry is the single source of truth for who is online and who is in
//! which room. It tracks three maps behind one mutex:
//!
//! - room name to the connections that joined it
//! - username to the user's live connections
//! - connection to its binding (username, joined rooms, outbox)
//!
//! A username may hold several connections at once. Room membership is per
//! connection; a username is a member of a room while at least one of its
//! connections is.

use crate::connection::{ConnectionId, Outbox};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Maximum room name length.
pub const MAX_ROOM_NAME_LENGTH: usize = 100;

/// Maximum username length.
pub const MAX_USERNAME_LENGTH: usize = 100;

/// Validate a room name.
///
/// # Errors
///
/// Returns an error message if the room name is invalid.
pub fn validate_room_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Room name cannot be empty");
    }
    if name.len() > MAX_ROOM_NAME_LENGTH {
        return Err("Room name too long");
    }
    if name.chars().any(char::is_control) {
        return Err("Room name contains control characters");
    }
    Ok(())
}

/// Validate a username.
///
/// # Errors
///
/// Returns an error message if the username is invalid.
pub fn validate_username(name: &str) -> Result<(), &'static str> {
    if name.trim().is_empty() {
        return Err("Username cannot be empty");
    }
    if name.len() > MAX_USERNAME_LENGTH {
        return Err("Username too long");
    }
    if name.chars().any(char::is_control) {
        return Err("Username contains control characters");
    }
    Ok(())
}

/// What a connection is bound to.
#[derive(Debug)]
struct Binding {
    username: String,
    rooms: HashSet<String>,
    outbox: Outbox,
}

#[derive(Debug, Default)]
struct RegistryInner {
    rooms: HashMap<String, HashSet<ConnectionId>>,
    users: HashMap<String, HashSet<ConnectionId>>,
    connections: HashMap<ConnectionId, Binding>,
}

impl RegistryInner {
    fn members(&self, room: &str) -> Vec<String> {
        let Some(ids) = self.rooms.get(room) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| self.connections.get(id))
            .map(|b| b.username.as_str())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    fn user_in_room(&self, username: &str, room: &str) -> bool {
        self.rooms.get(room).is_some_and(|ids| {
            ids.iter()
                .filter_map(|id| self.connections.get(id))
                .any(|b| b.username == username)
        })
    }

    /// Remove a connection from a room's set, pruning the room when empty.
    fn remove_from_room(&mut self, id: &ConnectionId, room: &str) {
        if let Some(ids) = self.rooms.get_mut(room) {
            ids.remove(id);
            if ids.is_empty() {
                self.rooms.remove(room);
                debug!(room = %room, "Pruned empty room");
            }
        }
    }
}

/// Result of a join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    /// `false` when the connection was already in the room.
    pub newly_joined: bool,
    /// `true` when this join brought the username online.
    pub newly_online: bool,
    /// Room members after the join, sorted.
    pub members: Vec<String>,
}

/// A connection leaving one room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomDeparture {
    /// The room that was left.
    pub room: String,
    /// Username of the departing connection.
    pub username: String,
    /// Whether the username is still in the room through another connection.
    pub still_present: bool,
}

/// A connection leaving the registry entirely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    /// The departed connection.
    pub connection_id: ConnectionId,
    /// Username the connection was bound to.
    pub username: String,
    /// Every room the connection was in, sorted by name.
    pub rooms: Vec<RoomDeparture>,
    /// `true` when this was the username's last connection.
    pub went_offline: bool,
}

/// Registry statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    /// Number of non-empty rooms.
    pub room_count: usize,
    /// Number of distinct online usernames.
    pub online_users: usize,
    /// Number of bound connections.
    pub connection_count: usize,
    /// Sum of room memberships over all connections.
    pub total_memberships: usize,
}

/// Read access to one room while the registry lock is held.
pub struct RoomView<'a> {
    inner: &'a RegistryInner,
    room: &'a str,
    exclude: Option<&'a ConnectionId>,
}

impl<'a> RoomView<'a> {
    /// The room name.
    #[must_use]
    pub fn room(&self) -> &'a str {
        self.room
    }

    /// Sorted member usernames (the excluded connection still counts).
    #[must_use]
    pub fn members(&self) -> Vec<String> {
        self.inner.members(self.room)
    }

    /// Outboxes of every connection in the room, minus the excluded one.
    pub fn outboxes(&self) -> impl Iterator<Item = &'a Outbox> + 'a {
        let inner = self.inner;
        let exclude = self.exclude;
        inner
            .rooms
            .get(self.room)
            .into_iter()
            .flatten()
            .filter(move |id| Some(*id) != exclude)
            .filter_map(move |id| inner.connections.get(id))
            .map(|binding| &binding.outbox)
    }
}

/// The process-wide presence registry.
#[derive(Debug, Default)]
pub struct Registry {
    inner: Mutex<RegistryInner>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `username` as online through the outbox's connection and add
    /// that connection to `room`.
    ///
    /// Joining a room the connection is already in only returns the current
    /// member list. A connection that is already bound keeps its username.
    pub fn join(&self, outbox: &Outbox, username: &str, room: &str) -> JoinOutcome {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let id = outbox.connection_id();

        let binding = inner
            .connections
            .entry(id.clone())
            .or_insert_with(|| Binding {
                username: username.to_string(),
                rooms: HashSet::new(),
                outbox: outbox.clone(),
            });
        let newly_joined = binding.rooms.insert(room.to_string());

        let online = inner.users.entry(binding.username.clone()).or_default();
        let newly_online = online.is_empty();
        online.insert(id.clone());

        inner
            .rooms
            .entry(room.to_string())
            .or_default()
            .insert(id.clone());

        let members = inner.members(room);
        debug!(
            connection = %id,
            username = %username,
            room = %room,
            newly_joined,
            members = members.len(),
            "Joined room"
        );

        JoinOutcome {
            newly_joined,
            newly_online,
            members,
        }
    }

    /// Remove a connection from one room.
    ///
    /// Returns `None` when the connection was not in the room.
    pub fn leave(&self, id: &ConnectionId, room: &str) -> Option<RoomDeparture> {
        let mut guard = self.lock();
        let inner = &mut *guard;

        let binding = inner.connections.get_mut(id)?;
        if !binding.rooms.remove(room) {
            return None;
        }
        let username = binding.username.clone();

        inner.remove_from_room(id, room);
        let still_present = inner.user_in_room(&username, room);
        debug!(connection = %id, username = %username, room = %room, "Left room");

        Some(RoomDeparture {
            room: room.to_string(),
            username,
            still_present,
        })
    }

    /// Remove a connection from every room and from the online map.
    ///
    /// Returns `None` when the connection was never registered.
    pub fn disconnect(&self, id: &ConnectionId) -> Option<Departure> {
        let mut guard = self.lock();
        let inner = &mut *guard;

        let binding = inner.connections.remove(id)?;

        let mut went_offline = false;
        if let Some(ids) = inner.users.get_mut(&binding.username) {
            ids.remove(id);
            if ids.is_empty() {
                inner.users.remove(&binding.username);
                went_offline = true;
            }
        }

        let mut rooms: Vec<String> = binding.rooms.into_iter().collect();
        rooms.sort();

        let rooms = rooms
            .into_iter()
            .map(|room| {
                inner.remove_from_room(id, &room);
                let still_present = inner.user_in_room(&binding.username, &room);
                RoomDeparture {
                    room,
                    username: binding.username.clone(),
                    still_present,
                }
            })
            .collect();

        debug!(
            connection = %id,
            username = %binding.username,
            went_offline,
            "Disconnected"
        );

        Some(Departure {
            connection_id: id.clone(),
            username: binding.username,
            rooms,
            went_offline,
        })
    }

    /// Outboxes of every live connection bound to `username`.
    ///
    /// An empty result means the user is offline.
    #[must_use]
    pub fn resolve(&self, username: &str) -> Vec<Outbox> {
        let inner = self.lock();
        inner
            .users
            .get(username)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.connections.get(id))
            .map(|binding| binding.outbox.clone())
            .collect()
    }

    /// Sorted snapshot of a room's member usernames.
    ///
    /// Unknown rooms have no members.
    #[must_use]
    pub fn members(&self, room: &str) -> Vec<String> {
        self.lock().members(room)
    }

    /// Run `f` against a room with the lock held.
    ///
    /// Membership cannot change while `f` runs, so `f` must not block.
    pub fn with_room<R>(
        &self,
        room: &str,
        exclude: Option<&ConnectionId>,
        f: impl FnOnce(RoomView<'_>) -> R,
    ) -> R {
        let inner = self.lock();
        f(RoomView {
            inner: &*inner,
            room,
            exclude,
        })
    }

    /// Check if a connection is in a room.
    #[must_use]
    pub fn is_member(&self, id: &ConnectionId, room: &str) -> bool {
        self.lock()
            .connections
            .get(id)
            .is_some_and(|b| b.rooms.contains(room))
    }

    /// Number of rooms a connection is in.
    #[must_use]
    pub fn room_count(&self, id: &ConnectionId) -> usize {
        self.lock()
            .connections
            .get(id)
            .map(|b| b.rooms.len())
            .unwrap_or(0)
    }

    /// Rooms a connection is in, sorted.
    #[must_use]
    pub fn rooms_of(&self, id: &ConnectionId) -> Vec<String> {
        let mut rooms: Vec<String> = self
            .lock()
            .connections
            .get(id)
            .map(|b| b.rooms.iter().cloned().collect())
            .unwrap_or_default();
        rooms.sort();
        rooms
    }

    /// Username bound to a connection.
    #[must_use]
    pub fn username_of(&self, id: &ConnectionId) -> Option<String> {
        self.lock().connections.get(id).map(|b| b.username.clone())
    }

    /// Check if a username has at least one live connection.
    #[must_use]
    pub fn is_online(&self, username: &str) -> bool {
        self.lock().users.contains_key(username)
    }

    /// Check if a room has any members.
    #[must_use]
    pub fn room_exists(&self, room: &str) -> bool {
        self.lock().rooms.contains_key(room)
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let inner = self.lock();
        RegistryStats {
            room_count: inner.rooms.len(),
            online_users: inner.users.len(),
            connection_count: inner.connections.len(),
            total_memberships: inner.connections.values().map(|b| b.rooms.len()).sum(),
        }
    }
}
