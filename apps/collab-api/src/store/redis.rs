use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::{keys, ConnectionRecord, SharedStore, StoreError, WindowCount, SNAPSHOT_TTL};
use crate::gateway::room::Room;

/// [`SharedStore`] backed by Redis, shared by every collaboration node.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    async fn set_json<T: serde::Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
    ) -> Result<(), StoreError> {
        let json = serde_json::to_string(value)?;
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, json, SNAPSHOT_TTL.as_secs())
            .await?;
        Ok(())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(key).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn save_connection(&self, record: &ConnectionRecord) -> Result<(), StoreError> {
        self.set_json(&keys::connection(&record.id), record).await
    }

    async fn load_connection(&self, id: &str) -> Result<Option<ConnectionRecord>, StoreError> {
        self.get_json(&keys::connection(id)).await
    }

    async fn delete_connection(&self, id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(keys::connection(id)).await?;
        Ok(())
    }

    async fn save_room(&self, room: &Room) -> Result<(), StoreError> {
        self.set_json(&keys::room(&room.form_id), room).await
    }

    async fn load_room(&self, form_id: &str) -> Result<Option<Room>, StoreError> {
        self.get_json(&keys::room(form_id)).await
    }

    async fn delete_room(&self, form_id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(vec![keys::room(form_id), keys::room_users(form_id)])
            .await?;
        Ok(())
    }

    async fn add_user_to_room(&self, form_id: &str, user_id: &str) -> Result<(), StoreError> {
        let key = keys::room_users(form_id);
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .sadd(&key, user_id)
            .ignore()
            .expire(&key, SNAPSHOT_TTL.as_secs() as i64)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn remove_user_from_room(
        &self,
        form_id: &str,
        user_id: &str,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.srem::<_, _, ()>(keys::room_users(form_id), user_id)
            .await?;
        Ok(())
    }

    async fn room_users(&self, form_id: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let mut users: Vec<String> = conn.smembers(keys::room_users(form_id)).await?;
        users.sort();
        Ok(users)
    }

    async fn increment_window(
        &self,
        key: &str,
        window: Duration,
    ) -> Result<WindowCount, StoreError> {
        let mut conn = self.conn.clone();
        let secs = window.as_secs().max(1);
        // SET NX starts the window once; INCR leaves the TTL alone.
        let (count, ttl): (u64, i64) = redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(key)
            .arg(0)
            .arg("EX")
            .arg(secs)
            .arg("NX")
            .ignore()
            .incr(key, 1)
            .ttl(key)
            .query_async(&mut conn)
            .await?;
        let ttl = if ttl > 0 {
            Duration::from_secs(ttl as u64)
        } else {
            window
        };
        Ok(WindowCount { count, ttl })
    }

    async fn reset_counter(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn cleanup_expired(&self, grace: Duration) -> Result<usize, StoreError> {
        let mut scan_conn = self.conn.clone();
        let room_keys: Vec<String> = {
            let mut iter: redis::AsyncIter<String> =
                scan_conn.scan_match(keys::room_pattern()).await?;
            let mut found = Vec::new();
            while let Some(key) = iter.next_item().await {
                found.push(key);
            }
            found
        };

        let now = Utc::now();
        let mut removed = 0;
        for key in room_keys {
            let room: Option<Room> = match self.get_json(&key).await {
                Ok(room) => room,
                Err(StoreError::Serialization(err)) => {
                    tracing::warn!(%key, ?err, "skipping unreadable room snapshot");
                    continue;
                }
                Err(err) => return Err(err),
            };
            if let Some(room) = room.filter(|room| room.is_expired(now, grace)) {
                self.delete_room(&room.form_id).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
