//! Connection and room bookkeeping owned by the hub.
//!
//! Only the hub task mutates a [`Registry`]; everyone else reads through the
//! hub's `RwLock`. Invariants kept here:
//! - a client is in at most one room, and `room_id` always names a live room
//! - a user is present in a room while at least one of their connections is
//! - the per-user index lists exactly the registered connections

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::events::{Cursor, Message, Position, User};
use super::room::{Room, RoomFullError};
use crate::error::CollabError;
use crate::store::ConnectionRecord;

/// What travels on a client's outbound queue. Shared so a room broadcast
/// serializes one message for every recipient.
pub type Outgoing = Arc<Message>;

/// The hub's record of one open connection.
#[derive(Debug)]
pub struct ClientEntry {
    pub id: String,
    pub user: User,
    pub room_id: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub last_ping: DateTime<Utc>,
    pub is_active: bool,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
    outbound: mpsc::Sender<Outgoing>,
    cancel: CancellationToken,
}

impl ClientEntry {
    pub fn new(
        id: impl Into<String>,
        user: User,
        outbound: mpsc::Sender<Outgoing>,
        cancel: CancellationToken,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            user,
            room_id: None,
            connected_at: now,
            last_ping: now,
            is_active: true,
            user_agent: None,
            ip_address: None,
            outbound,
            cancel,
        }
    }

    pub fn with_user_agent(mut self, user_agent: Option<String>) -> Self {
        self.user_agent = user_agent;
        self
    }

    pub fn with_ip_address(mut self, ip_address: Option<String>) -> Self {
        self.ip_address = ip_address;
        self
    }

    pub fn record(&self) -> ConnectionRecord {
        ConnectionRecord {
            id: self.id.clone(),
            user_id: self.user.id.clone(),
            form_id: self.room_id.clone(),
            connected: self.connected_at,
            last_ping: self.last_ping,
            is_active: self.is_active,
            user_agent: self.user_agent.clone(),
            ip_address: self.ip_address.clone(),
        }
    }

    /// Stop both socket actors of this connection.
    pub fn close(&mut self) {
        self.is_active = false;
        self.cancel.cancel();
    }
}

/// Who a message is delivered to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Room(String),
    User(String),
    All,
}

impl Target {
    /// Room scope wins over user scope; a message with neither goes to
    /// everyone.
    pub fn of(message: &Message) -> Self {
        match (&message.form_id, &message.user_id) {
            (Some(form_id), _) => Self::Room(form_id.clone()),
            (None, Some(user_id)) => Self::User(user_id.clone()),
            (None, None) => Self::All,
        }
    }
}

/// A connection leaving a room.
#[derive(Debug, Clone)]
pub struct Departure {
    pub form_id: String,
    pub user_id: String,
    /// The user has no other connection left in the room and was removed
    /// from its presence list.
    pub presence_ended: bool,
    /// The room after the departure.
    pub room: Option<Room>,
}

#[derive(Debug, Clone)]
pub struct JoinOutcome {
    /// The room after the join.
    pub room: Room,
    /// The user was not present before this join.
    pub newly_present: bool,
    /// The room was created by this join.
    pub created: bool,
    /// The room this connection had to leave first.
    pub left: Option<Departure>,
}

#[derive(Debug, Default)]
pub struct Registry {
    clients: HashMap<String, ClientEntry>,
    by_user: HashMap<String, HashSet<String>>,
    rooms: HashMap<String, Room>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    // -----------------------------------------------------------------------
    // Connections
    // -----------------------------------------------------------------------

    /// Add a connection. A duplicate id replaces the old entry.
    pub fn insert(&mut self, client: ClientEntry) -> Option<ClientEntry> {
        let user_id = client.user.id.clone();
        let client_id = client.id.clone();
        let replaced = self.clients.insert(client_id.clone(), client);
        if let Some(old) = &replaced {
            self.unindex(&old.user.id, &old.id);
        }
        self.by_user.entry(user_id).or_default().insert(client_id);
        replaced
    }

    /// Drop a connection, leaving its room first. `None` if it was unknown.
    pub fn remove(&mut self, client_id: &str) -> Option<(ClientEntry, Option<Departure>)> {
        let departure = self.depart(client_id);
        let client = self.clients.remove(client_id)?;
        self.unindex(&client.user.id, client_id);
        Some((client, departure))
    }

    pub fn get(&self, client_id: &str) -> Option<&ClientEntry> {
        self.clients.get(client_id)
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.clients.contains_key(client_id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn connections_for_user(&self, user_id: &str) -> usize {
        self.by_user.get(user_id).map_or(0, HashSet::len)
    }

    pub fn client_room(&self, client_id: &str) -> Option<&str> {
        self.clients.get(client_id)?.room_id.as_deref()
    }

    /// Refresh a connection's keepalive timestamp.
    pub fn touch(&mut self, client_id: &str, now: DateTime<Utc>) -> Option<ConnectionRecord> {
        let client = self.clients.get_mut(client_id)?;
        client.last_ping = now;
        client.user.last_seen = now;
        Some(client.record())
    }

    /// Remove every connection, e.g. on shutdown.
    pub fn drain(&mut self) -> Vec<ClientEntry> {
        self.by_user.clear();
        self.rooms.clear();
        self.clients.drain().map(|(_, client)| client).collect()
    }

    /// Outbound queues a message for `target` should be pushed to.
    pub fn targets(
        &self,
        target: &Target,
        exclude: Option<&str>,
    ) -> Vec<(String, mpsc::Sender<Outgoing>)> {
        let pick = |client: &ClientEntry| (client.id.clone(), client.outbound.clone());
        let included = |client: &&ClientEntry| exclude != Some(client.id.as_str());

        match target {
            Target::Room(form_id) => self
                .clients
                .values()
                .filter(|c| c.room_id.as_deref() == Some(form_id.as_str()))
                .filter(included)
                .map(pick)
                .collect(),
            Target::User(user_id) => self
                .by_user
                .get(user_id)
                .into_iter()
                .flatten()
                .filter_map(|id| self.clients.get(id))
                .filter(included)
                .map(pick)
                .collect(),
            Target::All => self
                .clients
                .values()
                .filter(included)
                .map(pick)
                .collect(),
        }
    }

    fn unindex(&mut self, user_id: &str, client_id: &str) {
        if let Some(ids) = self.by_user.get_mut(user_id) {
            ids.remove(client_id);
            if ids.is_empty() {
                self.by_user.remove(user_id);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Rooms
    // -----------------------------------------------------------------------

    pub fn room(&self, form_id: &str) -> Option<&Room> {
        self.rooms.get(form_id)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Rooms with at least one user. Empty rooms in their grace period are
    /// not counted.
    pub fn occupied_rooms(&self) -> impl Iterator<Item = &Room> {
        self.rooms.values().filter(|room| !room.is_empty())
    }

    /// Put a connection in a room, leaving its previous room first.
    ///
    /// A full room is rejected before anything changes.
    pub fn join(
        &mut self,
        client_id: &str,
        form_id: &str,
        max_users: usize,
    ) -> Result<JoinOutcome, CollabError> {
        let client = self
            .clients
            .get(client_id)
            .ok_or(CollabError::HubUnavailable)?;
        let mut user = client.user.clone();

        if client.room_id.as_deref() == Some(form_id) {
            if let Some(room) = self.rooms.get(form_id) {
                return Ok(JoinOutcome {
                    room: room.clone(),
                    newly_present: false,
                    created: false,
                    left: None,
                });
            }
        }

        if let Some(room) = self.rooms.get(form_id) {
            if room.is_full() && !room.has_user(&user.id) {
                return Err(RoomFullError {
                    form_id: form_id.to_string(),
                    max_users: room.max_users,
                }
                .into());
            }
        }

        let left = self.depart(client_id);

        let created = !self.rooms.contains_key(form_id);
        let room = self
            .rooms
            .entry(form_id.to_string())
            .or_insert_with(|| Room::new(form_id, max_users));
        user.last_seen = Utc::now();
        let newly_present = room.join(user)?;
        let room = room.clone();

        if let Some(client) = self.clients.get_mut(client_id) {
            client.room_id = Some(form_id.to_string());
        }

        Ok(JoinOutcome {
            room,
            newly_present,
            created,
            left,
        })
    }

    /// Take a connection out of `form_id`, or out of its current room when
    /// no id is given.
    pub fn leave(
        &mut self,
        client_id: &str,
        form_id: Option<&str>,
    ) -> Result<Departure, CollabError> {
        let current = self
            .clients
            .get(client_id)
            .ok_or(CollabError::HubUnavailable)?
            .room_id
            .clone();

        match (current, form_id) {
            (Some(current), Some(requested)) if current != requested => {
                Err(CollabError::NotInRoom(requested.to_string()))
            }
            (None, requested) => Err(CollabError::NotInRoom(
                requested.unwrap_or_default().to_string(),
            )),
            (Some(_), _) => self
                .depart(client_id)
                .ok_or_else(|| CollabError::NotInRoom(form_id.unwrap_or_default().to_string())),
        }
    }

    /// Record a cursor move for a connection that is in `form_id`.
    ///
    /// Returns the stored cursor and the mover's presence entry.
    pub fn update_cursor(
        &mut self,
        client_id: &str,
        form_id: &str,
        position: Position,
        color: Option<String>,
    ) -> Result<(Cursor, User), CollabError> {
        let client = self
            .clients
            .get(client_id)
            .ok_or(CollabError::HubUnavailable)?;
        if client.room_id.as_deref() != Some(form_id) {
            return Err(CollabError::NotInRoom(form_id.to_string()));
        }
        let user_id = client.user.id.clone();

        let room = self
            .rooms
            .get_mut(form_id)
            .ok_or_else(|| CollabError::NotInRoom(form_id.to_string()))?;
        let cursor = room
            .update_cursor(&user_id, position, color)
            .cloned()
            .ok_or_else(|| CollabError::NotInRoom(form_id.to_string()))?;
        let user = room
            .user(&user_id)
            .cloned()
            .ok_or_else(|| CollabError::NotInRoom(form_id.to_string()))?;
        Ok((cursor, user))
    }

    /// Evict a room now, detaching every connection that was in it.
    ///
    /// Returns the room and the updated records of the detached connections.
    pub fn close_room(&mut self, form_id: &str) -> Option<(Room, Vec<ConnectionRecord>)> {
        let room = self.rooms.remove(form_id)?;
        let detached = self
            .clients
            .values_mut()
            .filter(|client| client.room_id.as_deref() == Some(form_id))
            .map(|client| {
                client.room_id = None;
                client.record()
            })
            .collect();
        Some((room, detached))
    }

    /// Evict rooms that have been empty for longer than `grace`.
    pub fn sweep(&mut self, now: DateTime<Utc>, grace: Duration) -> Vec<String> {
        let expired: Vec<String> = self
            .rooms
            .values()
            .filter(|room| room.is_expired(now, grace))
            .map(|room| room.form_id.clone())
            .collect();
        for form_id in &expired {
            self.rooms.remove(form_id);
        }
        expired
    }

    /// Detach a connection from its room, dropping the user's presence when
    /// no other connection of theirs remains there.
    fn depart(&mut self, client_id: &str) -> Option<Departure> {
        let client = self.clients.get_mut(client_id)?;
        let form_id = client.room_id.take()?;
        let user_id = client.user.id.clone();

        let still_present = self
            .by_user
            .get(&user_id)
            .into_iter()
            .flatten()
            .filter(|id| id.as_str() != client_id)
            .filter_map(|id| self.clients.get(id))
            .any(|c| c.room_id.as_deref() == Some(form_id.as_str()));

        let room = self.rooms.get_mut(&form_id);
        let presence_ended = match room {
            Some(room) if !still_present => room.leave(&user_id),
            _ => false,
        };

        Some(Departure {
            room: self.rooms.get(&form_id).cloned(),
            form_id,
            user_id,
            presence_ended,
        })
    }
}
