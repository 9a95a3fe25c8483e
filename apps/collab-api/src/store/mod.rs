//! Shared-store abstraction: room, connection and rate-limit state that must
//! be visible to every collaboration node.

pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::gateway::room::Room;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// How long mirrored room and connection snapshots live.
pub const SNAPSHOT_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store operation timed out")]
    Timeout,
}

/// Key layout shared by every store implementation.
pub mod keys {
    const NAMESPACE: &str = "collaboration";

    pub fn room(form_id: &str) -> String {
        format!("{NAMESPACE}:room:{form_id}")
    }

    pub fn room_pattern() -> String {
        format!("{NAMESPACE}:room:*")
    }

    pub fn room_users(form_id: &str) -> String {
        format!("{NAMESPACE}:room_users:{form_id}")
    }

    pub fn connection(connection_id: &str) -> String {
        format!("{NAMESPACE}:connection:{connection_id}")
    }

    pub fn rate_limit(user_id: &str) -> String {
        format!("{NAMESPACE}:ratelimit:{user_id}")
    }
}

/// A connection as mirrored to the shared store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRecord {
    pub id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub form_id: Option<String>,
    pub connected: DateTime<Utc>,
    pub last_ping: DateTime<Utc>,
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
}

/// Result of bumping a windowed counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Value after the increment.
    pub count: u64,
    /// Time left until the window resets.
    pub ttl: Duration,
}

/// Storage backend for cross-node collaboration state.
///
/// Everything except [`SharedStore::increment_window`] is best-effort
/// mirroring: callers log failures and carry on.
#[async_trait]
pub trait SharedStore: Send + Sync {
    async fn save_connection(&self, record: &ConnectionRecord) -> Result<(), StoreError>;

    async fn load_connection(&self, id: &str) -> Result<Option<ConnectionRecord>, StoreError>;

    async fn delete_connection(&self, id: &str) -> Result<(), StoreError>;

    async fn save_room(&self, room: &Room) -> Result<(), StoreError>;

    async fn load_room(&self, form_id: &str) -> Result<Option<Room>, StoreError>;

    /// Remove a room snapshot together with its user set.
    async fn delete_room(&self, form_id: &str) -> Result<(), StoreError>;

    async fn add_user_to_room(&self, form_id: &str, user_id: &str) -> Result<(), StoreError>;

    async fn remove_user_from_room(&self, form_id: &str, user_id: &str)
        -> Result<(), StoreError>;

    async fn room_users(&self, form_id: &str) -> Result<Vec<String>, StoreError>;

    /// Atomically increment `key`, starting a `window`-long expiry when the
    /// counter is created.
    async fn increment_window(&self, key: &str, window: Duration)
        -> Result<WindowCount, StoreError>;

    async fn reset_counter(&self, key: &str) -> Result<(), StoreError>;

    /// Delete room snapshots that have been empty for longer than `grace`.
    /// Returns how many were removed.
    async fn cleanup_expired(&self, grace: Duration) -> Result<usize, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}
