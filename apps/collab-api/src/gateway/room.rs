//! A collaboration room: the users editing one form and their cursors.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::events::{Cursor, Position, User};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("room {form_id} is full ({max_users} users)")]
pub struct RoomFullError {
    pub form_id: String,
    pub max_users: usize,
}

/// Users present on one form.
///
/// Cursors only exist for users that are present: leaving drops the cursor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub form_id: String,
    users: HashMap<String, User>,
    cursors: HashMap<String, Cursor>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub max_users: usize,
}

/// Read-only view of a room for dashboards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub form_id: String,
    pub user_count: usize,
    pub max_users: usize,
    pub users: Vec<User>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Room {
    pub fn new(form_id: impl Into<String>, max_users: usize) -> Self {
        let now = Utc::now();
        Self {
            form_id: form_id.into(),
            users: HashMap::new(),
            cursors: HashMap::new(),
            created_at: now,
            updated_at: now,
            max_users,
        }
    }

    /// Add a user. Returns `Ok(false)` when they were already present.
    ///
    /// A full room is left untouched.
    pub fn join(&mut self, user: User) -> Result<bool, RoomFullError> {
        if self.users.contains_key(&user.id) {
            return Ok(false);
        }
        if self.is_full() {
            return Err(RoomFullError {
                form_id: self.form_id.clone(),
                max_users: self.max_users,
            });
        }
        self.users.insert(user.id.clone(), user);
        self.touch();
        Ok(true)
    }

    /// Remove a user and their cursor. Returns whether they were present.
    pub fn leave(&mut self, user_id: &str) -> bool {
        self.cursors.remove(user_id);
        let removed = self.users.remove(user_id).is_some();
        if removed {
            self.touch();
        }
        removed
    }

    /// Upsert a present user's cursor. Returns `None` for an absent user.
    pub fn update_cursor(
        &mut self,
        user_id: &str,
        position: Position,
        color: Option<String>,
    ) -> Option<&Cursor> {
        if !self.users.contains_key(user_id) {
            return None;
        }
        let now = Utc::now();
        if let Some(user) = self.users.get_mut(user_id) {
            user.last_seen = now;
        }
        self.updated_at = now;
        let cursor = Cursor {
            user_id: user_id.to_string(),
            position,
            color,
            updated_at: now,
        };
        self.cursors.insert(user_id.to_string(), cursor);
        self.cursors.get(user_id)
    }

    pub fn has_user(&self, user_id: &str) -> bool {
        self.users.contains_key(user_id)
    }

    pub fn user(&self, user_id: &str) -> Option<&User> {
        self.users.get(user_id)
    }

    pub fn users(&self) -> Vec<User> {
        let mut users: Vec<User> = self.users.values().cloned().collect();
        users.sort_by(|a, b| a.id.cmp(&b.id));
        users
    }

    pub fn cursor(&self, user_id: &str) -> Option<&Cursor> {
        self.cursors.get(user_id)
    }

    pub fn cursors(&self) -> Vec<Cursor> {
        let mut cursors: Vec<Cursor> = self.cursors.values().cloned().collect();
        cursors.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        cursors
    }

    pub fn occupancy(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.users.len() >= self.max_users
    }

    /// Empty and untouched for longer than `grace`.
    pub fn is_expired(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        self.is_empty()
            && now
                .signed_duration_since(self.updated_at)
                .to_std()
                .map(|idle| idle > grace)
                .unwrap_or(false)
    }

    pub fn summary(&self) -> RoomSummary {
        RoomSummary {
            form_id: self.form_id.clone(),
            user_count: self.occupancy(),
            max_users: self.max_users,
            users: self.users(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(x: i64, y: i64) -> Position {
        Position {
            x,
            y,
            question_id: None,
            section: None,
        }
    }

    #[test]
    fn join_until_full() {
        let mut room = Room::new("f1", 2);
        assert!(room.join(User::new("a", "A")).unwrap());
        assert!(room.join(User::new("b", "B")).unwrap());

        let err = room.join(User::new("c", "C")).unwrap_err();
        assert_eq!(err.max_users, 2);
        assert_eq!(room.occupancy(), 2);
        assert!(!room.has_user("c"));
    }

    #[test]
    fn rejoin_is_idempotent_even_when_full() {
        let mut room = Room::new("f1", 1);
        assert!(room.join(User::new("a", "A")).unwrap());
        assert!(!room.join(User::new("a", "A")).unwrap());
        assert_eq!(room.occupancy(), 1);
    }

    #[test]
    fn cursor_requires_presence() {
        let mut room = Room::new("f1", 10);
        assert!(room.update_cursor("ghost", pos(1, 1), None).is_none());
        assert!(room.cursors().is_empty());

        room.join(User::new("a", "A")).unwrap();
        let cursor = room
            .update_cursor("a", pos(3, 4), Some("#ff0000".into()))
            .unwrap();
        assert_eq!(cursor.position.x, 3);
        assert_eq!(room.cursor("a").unwrap().color.as_deref(), Some("#ff0000"));
    }

    #[test]
    fn leave_drops_cursor() {
        let mut room = Room::new("f1", 10);
        room.join(User::new("a", "A")).unwrap();
        room.update_cursor("a", pos(0, 0), None);

        assert!(room.leave("a"));
        assert!(room.cursor("a").is_none());
        assert!(room.is_empty());
        assert!(!room.leave("a"));
    }

    #[test]
    fn expiry_requires_empty_and_idle() {
        let mut room = Room::new("f1", 10);
        let grace = Duration::from_secs(3600);
        let later = Utc::now() + chrono::Duration::hours(2);

        room.join(User::new("a", "A")).unwrap();
        assert!(!room.is_expired(later, grace));

        room.leave("a");
        assert!(!room.is_expired(Utc::now(), grace));
        assert!(room.is_expired(later, grace));
    }

    #[test]
    fn summary_lists_users_sorted() {
        let mut room = Room::new("f1", 10);
        room.join(User::new("b", "B")).unwrap();
        room.join(User::new("a", "A")).unwrap();

        let summary = room.summary();
        assert_eq!(summary.user_count, 2);
        assert_eq!(summary.users[0].id, "a");
    }
}
