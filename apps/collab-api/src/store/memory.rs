use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{keys, ConnectionRecord, SharedStore, StoreError, WindowCount, SNAPSHOT_TTL};
use crate::gateway::room::Room;

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    Set(HashSet<String>),
    Counter(u64),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// In-process [`SharedStore`] for single-node deployments and tests.
///
/// Expiry follows tokio's clock, so paused-time tests can advance it.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn set_text(&self, key: String, value: String, ttl: Duration) {
        self.entries.lock().insert(
            key,
            Entry {
                value: Value::Text(value),
                expires_at: Some(Instant::now() + ttl),
            },
        );
    }

    fn get_text(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if entries.get(key).is_some_and(|entry| !entry.is_live(now)) {
            entries.remove(key);
            return None;
        }
        match entries.get(key).map(|entry| &entry.value) {
            Some(Value::Text(text)) => Some(text.clone()),
            _ => None,
        }
    }

    fn delete(&self, key: &str) {
        self.entries.lock().remove(key);
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn save_connection(&self, record: &ConnectionRecord) -> Result<(), StoreError> {
        let json = serde_json::to_string(record)?;
        self.set_text(keys::connection(&record.id), json, SNAPSHOT_TTL);
        Ok(())
    }

    async fn load_connection(&self, id: &str) -> Result<Option<ConnectionRecord>, StoreError> {
        match self.get_text(&keys::connection(id)) {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn delete_connection(&self, id: &str) -> Result<(), StoreError> {
        self.delete(&keys::connection(id));
        Ok(())
    }

    async fn save_room(&self, room: &Room) -> Result<(), StoreError> {
        let json = serde_json::to_string(room)?;
        self.set_text(keys::room(&room.form_id), json, SNAPSHOT_TTL);
        Ok(())
    }

    async fn load_room(&self, form_id: &str) -> Result<Option<Room>, StoreError> {
        match self.get_text(&keys::room(form_id)) {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn delete_room(&self, form_id: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock();
        entries.remove(&keys::room(form_id));
        entries.remove(&keys::room_users(form_id));
        Ok(())
    }

    async fn add_user_to_room(&self, form_id: &str, user_id: &str) -> Result<(), StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let entry = entries
            .entry(keys::room_users(form_id))
            .or_insert_with(|| Entry {
                value: Value::Set(HashSet::new()),
                expires_at: None,
            });
        if !entry.is_live(now) || !matches!(entry.value, Value::Set(_)) {
            entry.value = Value::Set(HashSet::new());
        }
        if let Value::Set(members) = &mut entry.value {
            members.insert(user_id.to_string());
        }
        entry.expires_at = Some(now + SNAPSHOT_TTL);
        Ok(())
    }

    async fn remove_user_from_room(
        &self,
        form_id: &str,
        user_id: &str,
    ) -> Result<(), StoreError> {
        let mut entries = self.entries.lock();
        if let Some(Entry {
            value: Value::Set(members),
            ..
        }) = entries.get_mut(&keys::room_users(form_id))
        {
            members.remove(user_id);
        }
        Ok(())
    }

    async fn room_users(&self, form_id: &str) -> Result<Vec<String>, StoreError> {
        let now = Instant::now();
        let entries = self.entries.lock();
        let mut users: Vec<String> = match entries.get(&keys::room_users(form_id)) {
            Some(entry) if entry.is_live(now) => match &entry.value {
                Value::Set(members) => members.iter().cloned().collect(),
                _ => Vec::new(),
            },
            _ => Vec::new(),
        };
        users.sort();
        Ok(users)
    }

    async fn increment_window(
        &self,
        key: &str,
        window: Duration,
    ) -> Result<WindowCount, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Counter(0),
            expires_at: Some(now + window),
        });
        if !entry.is_live(now) || !matches!(entry.value, Value::Counter(_)) {
            *entry = Entry {
                value: Value::Counter(0),
                expires_at: Some(now + window),
            };
        }

        let count = match &mut entry.value {
            Value::Counter(n) => {
                *n += 1;
                *n
            }
            _ => 1,
        };
        let ttl = entry
            .expires_at
            .map(|at| at.saturating_duration_since(now))
            .unwrap_or(window);
        Ok(WindowCount { count, ttl })
    }

    async fn reset_counter(&self, key: &str) -> Result<(), StoreError> {
        self.delete(key);
        Ok(())
    }

    async fn cleanup_expired(&self, grace: Duration) -> Result<usize, StoreError> {
        let now = Instant::now();
        let wall = Utc::now();
        let prefix = keys::room("");
        let mut entries = self.entries.lock();

        entries.retain(|_, entry| entry.is_live(now));

        let stale: Vec<String> = entries
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(_, entry)| match &entry.value {
                Value::Text(json) => serde_json::from_str::<Room>(json).ok(),
                _ => None,
            })
            .filter(|room| room.is_expired(wall, grace))
            .map(|room| room.form_id)
            .collect();

        for form_id in &stale {
            entries.remove(&keys::room(form_id));
            entries.remove(&keys::room_users(form_id));
        }
        Ok(stale.len())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
