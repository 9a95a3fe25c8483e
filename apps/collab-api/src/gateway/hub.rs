//! The hub: a single task that owns every connection and room.
//!
//! Sessions talk to it over channels. Register, unregister, broadcast and
//! room commands are applied one at a time by [`Hub::run`], which is the
//! only writer of the [`Registry`]. Reads (dashboards, handler checks) take
//! the registry's read lock through a [`HubHandle`].
//!
//! Delivery never waits on a client: a full or closed outbound queue gets
//! that client disconnected.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::events::{Cursor, Message, Position, User};
use super::metrics::{HubMetrics, MetricsSnapshot};
use super::mirror::{Mirror, MirrorOp};
use super::registry::{ClientEntry, Departure, JoinOutcome, Registry, Target};
use super::room::{Room, RoomSummary};
use crate::bus::{BusEvent, BusEventType, EventBus};
use crate::config::Config;
use crate::error::CollabError;
use crate::store::SharedStore;

const REGISTER_BUFFER: usize = 256;
const BROADCAST_BUFFER: usize = 1024;
const COMMAND_BUFFER: usize = 1024;

/// Hub tunables, taken from [`Config`].
#[derive(Debug, Clone)]
pub struct HubSettings {
    pub max_users_per_room: usize,
    pub room_grace: Duration,
    pub maintenance_interval: Duration,
    pub mirror_queue_size: usize,
    pub service_name: String,
}

impl From<&Config> for HubSettings {
    fn from(config: &Config) -> Self {
        Self {
            max_users_per_room: config.max_users_per_room,
            room_grace: config.room_grace,
            maintenance_interval: config.maintenance_interval,
            mirror_queue_size: config.mirror_queue_size,
            service_name: config.service_name.clone(),
        }
    }
}

/// A message queued for delivery.
#[derive(Debug)]
pub struct Outbound {
    pub message: Message,
    /// Connection that should not receive its own message back.
    pub exclude: Option<String>,
}

enum HubCommand {
    Join {
        client_id: String,
        form_id: String,
        reply: oneshot::Sender<Result<JoinOutcome, CollabError>>,
    },
    Leave {
        client_id: String,
        form_id: Option<String>,
        reply: oneshot::Sender<Result<Departure, CollabError>>,
    },
    UpdateCursor {
        client_id: String,
        form_id: String,
        position: Position,
        color: Option<String>,
        reply: oneshot::Sender<Result<(Cursor, User), CollabError>>,
    },
    Touch {
        client_id: String,
    },
    CloseRoom {
        form_id: String,
        farewell: Message,
        reply: oneshot::Sender<()>,
    },
}

pub struct Hub {
    registry: Arc<RwLock<Registry>>,
    register_rx: mpsc::Receiver<ClientEntry>,
    unregister_rx: mpsc::UnboundedReceiver<String>,
    broadcast_rx: mpsc::Receiver<Outbound>,
    command_rx: mpsc::Receiver<HubCommand>,
    mirror: Mirror,
    bus: Arc<dyn EventBus>,
    metrics: Arc<HubMetrics>,
    settings: HubSettings,
    shutdown: CancellationToken,
}

/// Cloneable front door to the hub task.
#[derive(Clone)]
pub struct HubHandle {
    register_tx: mpsc::Sender<ClientEntry>,
    unregister_tx: mpsc::UnboundedSender<String>,
    broadcast_tx: mpsc::Sender<Outbound>,
    command_tx: mpsc::Sender<HubCommand>,
    registry: Arc<RwLock<Registry>>,
    metrics: Arc<HubMetrics>,
    shutdown: CancellationToken,
}

impl Hub {
    /// Build a hub and its handle. Nothing runs until [`Hub::run`] is
    /// spawned; the mirror writer starts immediately.
    pub fn new(
        settings: HubSettings,
        store: Arc<dyn SharedStore>,
        bus: Arc<dyn EventBus>,
        shutdown: CancellationToken,
    ) -> (Self, HubHandle) {
        let (register_tx, register_rx) = mpsc::channel(REGISTER_BUFFER);
        let (unregister_tx, unregister_rx) = mpsc::unbounded_channel();
        let (broadcast_tx, broadcast_rx) = mpsc::channel(BROADCAST_BUFFER);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);

        let registry = Arc::new(RwLock::new(Registry::new()));
        let metrics = Arc::new(HubMetrics::default());
        let mirror = Mirror::spawn(store, settings.mirror_queue_size);

        let hub = Self {
            registry: registry.clone(),
            register_rx,
            unregister_rx,
            broadcast_rx,
            command_rx,
            mirror,
            bus,
            metrics: metrics.clone(),
            settings,
            shutdown: shutdown.clone(),
        };
        let handle = HubHandle {
            register_tx,
            unregister_tx,
            broadcast_tx,
            command_tx,
            registry,
            metrics,
            shutdown,
        };
        (hub, handle)
    }

    /// Process events until the shutdown token is cancelled.
    pub async fn run(mut self) {
        let mut maintenance = time::interval(self.settings.maintenance_interval);
        maintenance.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        maintenance.tick().await;

        tracing::info!(
            max_users_per_room = self.settings.max_users_per_room,
            "collaboration hub started"
        );

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                Some(client_id) = self.unregister_rx.recv() => {
                    self.unregister(&client_id, "connection closed");
                }
                Some(client) = self.register_rx.recv() => self.register(client),
                Some(command) = self.command_rx.recv() => self.handle_command(command),
                Some(outbound) = self.broadcast_rx.recv() => self.deliver(outbound),
                _ = maintenance.tick() => self.maintain(Utc::now()),
            }
        }

        self.close_all();
        tracing::info!("collaboration hub stopped");
    }

    // -----------------------------------------------------------------------
    // Connections
    // -----------------------------------------------------------------------

    fn register(&mut self, client: ClientEntry) {
        let record = client.record();
        let (client_id, user_id) = (client.id.clone(), client.user.id.clone());

        let (replaced, active) = {
            let mut registry = self.registry.write();
            let replaced = registry.insert(client);
            (replaced, registry.len())
        };

        if let Some(mut stale) = replaced {
            tracing::warn!(%client_id, "duplicate connection id, closing the old connection");
            stale.close();
        }
        self.metrics.connection_opened(active);
        self.mirror.submit(MirrorOp::SaveConnection(record));
        tracing::info!(%client_id, %user_id, active, "client registered");
    }

    fn unregister(&mut self, client_id: &str, reason: &str) {
        if let Some(left) = self.remove_client(client_id, reason) {
            self.deliver(left);
        }
    }

    /// Remove a client and return the `user:left` notice its departure
    /// produced, if any. Unknown ids are a no-op.
    fn remove_client(&mut self, client_id: &str, reason: &str) -> Option<Outbound> {
        let (mut client, departure, active) = {
            let mut registry = self.registry.write();
            let (client, departure) = registry.remove(client_id)?;
            (client, departure, registry.len())
        };

        client.close();
        self.metrics.set_active_connections(active);
        self.mirror
            .submit(MirrorOp::DeleteConnection(client_id.to_string()));
        tracing::info!(
            %client_id,
            user_id = %client.user.id,
            reason,
            active,
            "client unregistered"
        );

        departure.and_then(|departure| self.after_departure(departure))
    }

    /// Mirror a departure and, when the user is gone from the room, build
    /// the `user:left` notice for the remaining occupants.
    fn after_departure(&mut self, departure: Departure) -> Option<Outbound> {
        if let Some(room) = departure.room {
            self.mirror.submit(MirrorOp::SaveRoom(Box::new(room)));
        }
        self.refresh_room_metrics();
        if !departure.presence_ended {
            return None;
        }

        self.mirror.submit(MirrorOp::RemoveUserFromRoom {
            form_id: departure.form_id.clone(),
            user_id: departure.user_id.clone(),
        });
        self.bus.publish(BusEvent::new(
            BusEventType::USER_LEFT,
            departure.form_id.clone(),
            departure.user_id.clone(),
            json!({ "formId": departure.form_id, "userId": departure.user_id }),
            self.settings.service_name.clone(),
        ));
        tracing::debug!(
            form_id = %departure.form_id,
            user_id = %departure.user_id,
            "user left room"
        );

        Some(Outbound {
            message: Message::user_left(&departure.form_id, &departure.user_id),
            exclude: None,
        })
    }

    fn refresh_room_metrics(&self) {
        let occupied = self.registry.read().occupied_rooms().count();
        self.metrics.set_active_rooms(occupied);
    }

    fn close_all(&mut self) {
        let clients = self.registry.write().drain();
        for mut client in clients {
            client.close();
            self.mirror.submit(MirrorOp::DeleteConnection(client.id));
        }
        self.metrics.set_active_connections(0);
        self.metrics.set_active_rooms(0);
    }

    // -----------------------------------------------------------------------
    // Delivery
    // -----------------------------------------------------------------------

    /// Push a message onto every targeted outbound queue without waiting.
    ///
    /// Clients whose queue is full or closed are unregistered; the notices
    /// their departures produce are delivered in turn.
    fn deliver(&mut self, first: Outbound) {
        let mut pending = VecDeque::from([first]);

        while let Some(outbound) = pending.pop_front() {
            let target = Target::of(&outbound.message);
            let recipients = self
                .registry
                .read()
                .targets(&target, outbound.exclude.as_deref());
            let message = Arc::new(outbound.message);

            let mut dead = Vec::new();
            for (client_id, tx) in recipients {
                match tx.try_send(message.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::warn!(%client_id, event = %message.event_type, "send queue full, dropping client");
                        self.metrics.client_dropped();
                        dead.push(client_id);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => dead.push(client_id),
                }
            }

            for client_id in dead {
                if let Some(left) = self.remove_client(&client_id, "send queue unavailable") {
                    pending.push_back(left);
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Room commands
    // -----------------------------------------------------------------------

    fn handle_command(&mut self, command: HubCommand) {
        match command {
            HubCommand::Join {
                client_id,
                form_id,
                reply,
            } => {
                let result = self.join(&client_id, &form_id);
                let _ = reply.send(result);
            }
            HubCommand::Leave {
                client_id,
                form_id,
                reply,
            } => {
                let result = self.leave(&client_id, form_id.as_deref());
                let _ = reply.send(result);
            }
            HubCommand::UpdateCursor {
                client_id,
                form_id,
                position,
                color,
                reply,
            } => {
                let result =
                    self.registry
                        .write()
                        .update_cursor(&client_id, &form_id, position, color);
                let _ = reply.send(result);
            }
            HubCommand::Touch { client_id } => {
                let record = self.registry.write().touch(&client_id, Utc::now());
                if let Some(record) = record {
                    self.mirror.submit(MirrorOp::SaveConnection(record));
                }
            }
            HubCommand::CloseRoom {
                form_id,
                farewell,
                reply,
            } => {
                self.deliver(Outbound {
                    message: farewell,
                    exclude: None,
                });
                self.close_room(&form_id);
                let _ = reply.send(());
            }
        }
    }

    fn join(&mut self, client_id: &str, form_id: &str) -> Result<JoinOutcome, CollabError> {
        let max_users = self.settings.max_users_per_room;
        let (outcome, record) = {
            let mut registry = self.registry.write();
            let outcome = registry.join(client_id, form_id, max_users)?;
            let record = registry.get(client_id).map(ClientEntry::record);
            (outcome, record)
        };

        if let Some(departure) = outcome.left.clone() {
            if let Some(left) = self.after_departure(departure) {
                self.deliver(left);
            }
        }

        if outcome.created {
            self.metrics.room_created();
        }
        self.refresh_room_metrics();

        if outcome.newly_present {
            if let Some(user_id) = record.as_ref().map(|r| r.user_id.clone()) {
                self.mirror.submit(MirrorOp::AddUserToRoom {
                    form_id: form_id.to_string(),
                    user_id,
                });
            }
            self.mirror
                .submit(MirrorOp::SaveRoom(Box::new(outcome.room.clone())));
        }
        if let Some(record) = record {
            self.mirror.submit(MirrorOp::SaveConnection(record));
        }

        tracing::debug!(%client_id, %form_id, occupancy = outcome.room.occupancy(), "client joined room");
        Ok(outcome)
    }

    fn leave(&mut self, client_id: &str, form_id: Option<&str>) -> Result<Departure, CollabError> {
        let (departure, record) = {
            let mut registry = self.registry.write();
            let departure = registry.leave(client_id, form_id)?;
            (departure, registry.get(client_id).map(ClientEntry::record))
        };

        if let Some(record) = record {
            self.mirror.submit(MirrorOp::SaveConnection(record));
        }
        if let Some(room) = departure.room.clone() {
            self.mirror.submit(MirrorOp::SaveRoom(Box::new(room)));
        }
        self.refresh_room_metrics();
        if departure.presence_ended {
            self.mirror.submit(MirrorOp::RemoveUserFromRoom {
                form_id: departure.form_id.clone(),
                user_id: departure.user_id.clone(),
            });
        }
        Ok(departure)
    }

    fn close_room(&mut self, form_id: &str) {
        let Some((_, detached)) = self.registry.write().close_room(form_id) else {
            return;
        };
        self.mirror.submit(MirrorOp::DeleteRoom(form_id.to_string()));
        for record in detached {
            self.mirror.submit(MirrorOp::SaveConnection(record));
        }
        self.refresh_room_metrics();
        tracing::info!(%form_id, "room closed");
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    /// Evict stale empty rooms and ask the store to do the same.
    fn maintain(&mut self, now: DateTime<Utc>) {
        let grace = self.settings.room_grace;
        let (evicted, rooms, clients) = {
            let mut registry = self.registry.write();
            let evicted = registry.sweep(now, grace);
            (evicted, registry.room_count(), registry.len())
        };

        for form_id in &evicted {
            self.mirror.submit(MirrorOp::DeleteRoom(form_id.clone()));
        }
        self.mirror.submit(MirrorOp::Cleanup { grace });
        self.refresh_room_metrics();
        self.metrics.set_active_connections(clients);

        if !evicted.is_empty() {
            tracing::info!(evicted = evicted.len(), rooms, "evicted idle rooms");
        }
    }
}

impl HubHandle {
    /// Hand a new connection to the hub.
    pub async fn register(&self, client: ClientEntry) -> Result<(), CollabError> {
        self.register_tx
            .send(client)
            .await
            .map_err(|_| CollabError::HubUnavailable)
    }

    /// Ask the hub to drop a connection. Safe to call more than once.
    pub fn unregister(&self, client_id: &str) {
        let _ = self.unregister_tx.send(client_id.to_string());
    }

    /// Queue a message for delivery to its target.
    pub async fn broadcast(&self, message: Message) -> Result<(), CollabError> {
        self.send_outbound(Outbound {
            message,
            exclude: None,
        })
        .await
    }

    /// Like [`HubHandle::broadcast`] but skips the sending connection.
    pub async fn broadcast_except(
        &self,
        message: Message,
        exclude_client: &str,
    ) -> Result<(), CollabError> {
        self.send_outbound(Outbound {
            message,
            exclude: Some(exclude_client.to_string()),
        })
        .await
    }

    async fn send_outbound(&self, outbound: Outbound) -> Result<(), CollabError> {
        self.broadcast_tx
            .send(outbound)
            .await
            .map_err(|_| CollabError::HubUnavailable)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> HubCommand,
    ) -> Result<T, CollabError> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(build(reply))
            .await
            .map_err(|_| CollabError::HubUnavailable)?;
        rx.await.map_err(|_| CollabError::HubUnavailable)
    }

    pub async fn join(&self, client_id: &str, form_id: &str) -> Result<JoinOutcome, CollabError> {
        self.request(|reply| HubCommand::Join {
            client_id: client_id.to_string(),
            form_id: form_id.to_string(),
            reply,
        })
        .await?
    }

    pub async fn leave(
        &self,
        client_id: &str,
        form_id: Option<&str>,
    ) -> Result<Departure, CollabError> {
        self.request(|reply| HubCommand::Leave {
            client_id: client_id.to_string(),
            form_id: form_id.map(str::to_string),
            reply,
        })
        .await?
    }

    pub async fn update_cursor(
        &self,
        client_id: &str,
        form_id: &str,
        position: Position,
        color: Option<String>,
    ) -> Result<(Cursor, User), CollabError> {
        self.request(|reply| HubCommand::UpdateCursor {
            client_id: client_id.to_string(),
            form_id: form_id.to_string(),
            position,
            color,
            reply,
        })
        .await?
    }

    /// Record a keepalive. Dropped if the hub is busy.
    pub fn touch(&self, client_id: &str) {
        let _ = self.command_tx.try_send(HubCommand::Touch {
            client_id: client_id.to_string(),
        });
    }

    /// Deliver `farewell` to the room, then evict it.
    pub async fn close_room(&self, form_id: &str, farewell: Message) -> Result<(), CollabError> {
        self.request(|reply| HubCommand::CloseRoom {
            form_id: form_id.to_string(),
            farewell,
            reply,
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Read-only views
    // -----------------------------------------------------------------------

    pub fn room(&self, form_id: &str) -> Option<Room> {
        self.registry.read().room(form_id).cloned()
    }

    /// Summaries of rooms with at least one user, ordered by form id.
    pub fn active_rooms(&self) -> Vec<RoomSummary> {
        let mut rooms: Vec<RoomSummary> = self
            .registry
            .read()
            .occupied_rooms()
            .map(Room::summary)
            .collect();
        rooms.sort_by(|a, b| a.form_id.cmp(&b.form_id));
        rooms
    }

    pub fn client_room(&self, client_id: &str) -> Option<String> {
        self.registry.read().client_room(client_id).map(str::to_string)
    }

    pub fn is_registered(&self, client_id: &str) -> bool {
        self.registry.read().contains(client_id)
    }

    pub fn connection_count(&self) -> usize {
        self.registry.read().len()
    }

    pub fn metrics(&self) -> &HubMetrics {
        &self.metrics
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// A token cancelled when the hub shuts down.
    pub fn child_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BroadcastBus;
    use crate::gateway::events::EventType;
    use crate::gateway::registry::Outgoing;
    use crate::store::MemoryStore;
    use serde_json::Value;

    fn settings() -> HubSettings {
        HubSettings {
            max_users_per_room: 2,
            room_grace: Duration::from_secs(3600),
            maintenance_interval: Duration::from_secs(30),
            mirror_queue_size: 64,
            service_name: "test".into(),
        }
    }

    fn hub() -> (Hub, HubHandle, BroadcastBus) {
        let bus = BroadcastBus::new();
        let (hub, handle) = Hub::new(
            settings(),
            Arc::new(MemoryStore::new()),
            Arc::new(bus.clone()),
            CancellationToken::new(),
        );
        (hub, handle, bus)
    }

    fn connect(
        hub: &mut Hub,
        id: &str,
        user_id: &str,
        capacity: usize,
    ) -> (mpsc::Receiver<Outgoing>, CancellationToken) {
        let (tx, rx) = mpsc::channel(capacity);
        let cancel = CancellationToken::new();
        hub.register(ClientEntry::new(
            id,
            User::new(user_id, user_id),
            tx,
            cancel.clone(),
        ));
        (rx, cancel)
    }

    fn drain(rx: &mut mpsc::Receiver<Outgoing>) -> Vec<EventType> {
        let mut types = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            types.push(msg.event_type);
        }
        types
    }

    fn room_message() -> Message {
        Message::new(EventType::FormUpdate, Value::Null).in_room("f1")
    }

    #[tokio::test]
    async fn register_and_unregister_update_counts() {
        let (mut hub, handle, _bus) = hub();
        let (_rx, cancel) = connect(&mut hub, "c1", "alice", 8);
        assert!(handle.is_registered("c1"));
        assert_eq!(handle.metrics_snapshot().active_connections, 1);

        hub.unregister("c1", "test");
        assert!(!handle.is_registered("c1"));
        assert!(cancel.is_cancelled());

        // Second unregister is a no-op.
        hub.unregister("c1", "test");
        let snap = handle.metrics_snapshot();
        assert_eq!(snap.total_connections, 1);
        assert_eq!(snap.active_connections, 0);
    }

    #[tokio::test]
    async fn room_broadcast_reaches_only_occupants() {
        let (mut hub, _handle, _bus) = hub();
        let (mut a, _) = connect(&mut hub, "c1", "alice", 8);
        let (mut b, _) = connect(&mut hub, "c2", "bob", 8);
        let (mut outsider, _) = connect(&mut hub, "c3", "carol", 8);
        hub.join("c1", "f1").unwrap();
        hub.join("c2", "f1").unwrap();

        hub.deliver(Outbound {
            message: room_message(),
            exclude: Some("c1".into()),
        });

        assert!(drain(&mut a).is_empty());
        assert_eq!(drain(&mut b), vec![EventType::FormUpdate]);
        assert!(drain(&mut outsider).is_empty());
    }

    #[tokio::test]
    async fn full_queue_drops_only_that_client() {
        let (mut hub, handle, _bus) = hub();
        let (mut fast, _) = connect(&mut hub, "fast", "alice", 8);
        let (_slow, slow_cancel) = connect(&mut hub, "slow", "bob", 1);
        hub.join("fast", "f1").unwrap();
        hub.join("slow", "f1").unwrap();

        hub.deliver(Outbound {
            message: room_message(),
            exclude: None,
        });
        hub.deliver(Outbound {
            message: room_message(),
            exclude: None,
        });

        assert!(!handle.is_registered("slow"));
        assert!(slow_cancel.is_cancelled());
        assert!(handle.is_registered("fast"));
        assert_eq!(handle.metrics_snapshot().dropped_clients, 1);

        // The fast client saw both updates and then bob leaving.
        assert_eq!(
            drain(&mut fast),
            vec![EventType::FormUpdate, EventType::FormUpdate, EventType::UserLeft]
        );
    }

    #[tokio::test]
    async fn unregister_announces_departure_and_publishes() {
        let (mut hub, handle, bus) = hub();
        let mut events = bus.subscribe();
        let (mut a, _) = connect(&mut hub, "c1", "alice", 8);
        let (_b, _) = connect(&mut hub, "c2", "bob", 8);
        hub.join("c1", "f1").unwrap();
        hub.join("c2", "f1").unwrap();

        hub.unregister("c2", "test");

        let received = a.try_recv().unwrap();
        assert_eq!(received.event_type, EventType::UserLeft);
        assert_eq!(received.payload["userId"], "bob");
        assert_eq!(handle.room("f1").unwrap().occupancy(), 1);

        let event = events.try_recv().unwrap();
        assert_eq!(event.event_type, BusEventType::USER_LEFT);
        assert_eq!(event.user_id, "bob");
    }

    #[tokio::test]
    async fn join_respects_capacity() {
        let (mut hub, handle, _bus) = hub();
        for (id, user) in [("c1", "a"), ("c2", "b"), ("c3", "c")] {
            connect(&mut hub, id, user, 8);
        }
        hub.join("c1", "f1").unwrap();
        hub.join("c2", "f1").unwrap();

        let err = hub.join("c3", "f1").unwrap_err();
        assert_eq!(err.code(), "ROOM_FULL");
        assert_eq!(handle.room("f1").unwrap().occupancy(), 2);
        assert_eq!(handle.client_room("c3"), None);
    }

    #[tokio::test]
    async fn close_room_delivers_farewell_then_evicts() {
        let (mut hub, handle, _bus) = hub();
        let (mut a, _) = connect(&mut hub, "c1", "alice", 8);
        hub.join("c1", "f1").unwrap();

        let (reply, _rx) = oneshot::channel();
        hub.handle_command(HubCommand::CloseRoom {
            form_id: "f1".into(),
            farewell: Message::new(EventType::FormDelete, Value::Null).in_room("f1"),
            reply,
        });

        assert_eq!(drain(&mut a), vec![EventType::FormDelete]);
        assert!(handle.room("f1").is_none());
        assert_eq!(handle.client_room("c1"), None);
    }

    #[tokio::test]
    async fn maintenance_evicts_idle_empty_rooms() {
        let (mut hub, handle, _bus) = hub();
        connect(&mut hub, "c1", "alice", 8);
        hub.join("c1", "f1").unwrap();
        hub.leave("c1", None).unwrap();

        hub.maintain(Utc::now());
        assert!(handle.room("f1").is_some());

        hub.maintain(Utc::now() + chrono::Duration::hours(2));
        assert!(handle.room("f1").is_none());
        assert_eq!(handle.metrics_snapshot().active_rooms, 0);
    }

    #[tokio::test]
    async fn empty_rooms_in_grace_are_not_active() {
        let (mut hub, handle, _bus) = hub();
        connect(&mut hub, "c1", "alice", 8);
        connect(&mut hub, "c2", "bob", 8);
        hub.join("c1", "f1").unwrap();
        hub.join("c2", "f2").unwrap();
        hub.leave("c1", None).unwrap();
        assert_eq!(handle.metrics_snapshot().active_rooms, 1);

        hub.maintain(Utc::now());
        assert!(handle.room("f1").is_some());
        assert_eq!(handle.metrics_snapshot().active_rooms, 1);
        let active: Vec<String> = handle.active_rooms().into_iter().map(|r| r.form_id).collect();
        assert_eq!(active, vec!["f2".to_string()]);

        hub.unregister("c2", "test");
        assert_eq!(handle.metrics_snapshot().active_rooms, 0);
        assert!(handle.active_rooms().is_empty());
    }

    #[tokio::test]
    async fn room_regained_before_grace_is_kept() {
        let (mut hub, handle, _bus) = hub();
        connect(&mut hub, "c1", "alice", 8);
        hub.join("c1", "f1").unwrap();
        hub.leave("c1", None).unwrap();
        hub.join("c1", "f1").unwrap();

        hub.maintain(Utc::now() + chrono::Duration::hours(2));
        assert_eq!(handle.room("f1").unwrap().occupancy(), 1);
        assert_eq!(handle.metrics_snapshot().active_rooms, 1);
    }

    #[tokio::test]
    async fn duplicate_id_closes_the_replaced_connection() {
        let (mut hub, handle, _bus) = hub();
        let (_old_rx, old_cancel) = connect(&mut hub, "c1", "alice", 8);
        let (_new_rx, new_cancel) = connect(&mut hub, "c1", "alice", 8);

        assert!(old_cancel.is_cancelled());
        assert!(!new_cancel.is_cancelled());
        assert!(handle.is_registered("c1"));
        assert_eq!(handle.connection_count(), 1);
    }

    #[tokio::test]
    async fn closing_a_room_remirrors_detached_connections() {
        let store = Arc::new(MemoryStore::new());
        let (mut hub, _handle) = Hub::new(
            settings(),
            store.clone(),
            Arc::new(BroadcastBus::new()),
            CancellationToken::new(),
        );
        connect(&mut hub, "c1", "alice", 8);
        hub.join("c1", "f1").unwrap();

        hub.close_room("f1");

        for _ in 0..100 {
            let record = store.load_connection("c1").await.unwrap();
            if record.is_some_and(|r| r.form_id.is_none()) {
                assert!(store.load_room("f1").await.unwrap().is_none());
                return;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        panic!("connection record still names the closed room");
    }

    #[tokio::test]
    async fn running_hub_serves_handle_requests() {
        let (hub, handle, _bus) = hub();
        let task = tokio::spawn(hub.run());

        let (tx, mut rx) = mpsc::channel(8);
        let cancel = handle.child_token();
        handle
            .register(ClientEntry::new("c1", User::new("alice", "Alice"), tx, cancel.clone()))
            .await
            .unwrap();

        let outcome = handle.join("c1", "f1").await.unwrap();
        assert!(outcome.newly_present);
        assert!(outcome.created);

        handle.broadcast(room_message()).await.unwrap();
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.event_type, EventType::FormUpdate);

        let err = handle.leave("c1", Some("other")).await.unwrap_err();
        assert_eq!(err.code(), "NOT_IN_ROOM");

        handle.shutdown();
        task.await.unwrap();
        assert!(cancel.is_cancelled());
        assert!(matches!(
            handle.join("c1", "f1").await,
            Err(CollabError::HubUnavailable)
        ));
    }
}
