//! Collaboration event types and wire-format messages.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use collab_common::id::{prefix, prefixed_ulid};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CollabError;

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// Every event type that can appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "join:form")]
    JoinForm,
    #[serde(rename = "leave:form")]
    LeaveForm,
    #[serde(rename = "user:joined")]
    UserJoined,
    #[serde(rename = "user:left")]
    UserLeft,
    #[serde(rename = "join:form:response")]
    JoinFormResponse,
    #[serde(rename = "leave:form:response")]
    LeaveFormResponse,
    #[serde(rename = "cursor:update")]
    CursorUpdate,
    #[serde(rename = "question:create")]
    QuestionCreate,
    #[serde(rename = "question:update")]
    QuestionUpdate,
    #[serde(rename = "question:delete")]
    QuestionDelete,
    #[serde(rename = "form:update")]
    FormUpdate,
    #[serde(rename = "form:delete")]
    FormDelete,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "heartbeat")]
    Heartbeat,
    #[serde(rename = "disconnect")]
    Disconnect,
    #[serde(rename = "rate:limit")]
    RateLimit,
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "pong")]
    Pong,
}

impl EventType {
    pub const ALL: [EventType; 18] = [
        Self::JoinForm,
        Self::LeaveForm,
        Self::UserJoined,
        Self::UserLeft,
        Self::JoinFormResponse,
        Self::LeaveFormResponse,
        Self::CursorUpdate,
        Self::QuestionCreate,
        Self::QuestionUpdate,
        Self::QuestionDelete,
        Self::FormUpdate,
        Self::FormDelete,
        Self::Error,
        Self::Heartbeat,
        Self::Disconnect,
        Self::RateLimit,
        Self::Ping,
        Self::Pong,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::JoinForm => "join:form",
            Self::LeaveForm => "leave:form",
            Self::UserJoined => "user:joined",
            Self::UserLeft => "user:left",
            Self::JoinFormResponse => "join:form:response",
            Self::LeaveFormResponse => "leave:form:response",
            Self::CursorUpdate => "cursor:update",
            Self::QuestionCreate => "question:create",
            Self::QuestionUpdate => "question:update",
            Self::QuestionDelete => "question:delete",
            Self::FormUpdate => "form:update",
            Self::FormDelete => "form:delete",
            Self::Error => "error",
            Self::Heartbeat => "heartbeat",
            Self::Disconnect => "disconnect",
            Self::RateLimit => "rate:limit",
            Self::Ping => "ping",
            Self::Pong => "pong",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = CollabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| CollabError::UnknownEvent(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The envelope every frame travels in, in both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default)]
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub form_id: Option<String>,
}

/// What a client is allowed to put on the wire. Everything else is
/// stamped by the server.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InboundFrame {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    form_id: Option<String>,
}

impl Message {
    /// Build a server-originated message with a fresh id and timestamp.
    pub fn new(event_type: EventType, payload: impl Serialize) -> Self {
        Self {
            event_type,
            payload: serde_json::to_value(payload).unwrap_or(Value::Null),
            timestamp: Utc::now(),
            message_id: prefixed_ulid(prefix::MESSAGE),
            user_id: None,
            form_id: None,
        }
    }

    /// Scope the message to a room. Room-scoped messages are routed to the
    /// room's occupants.
    pub fn in_room(mut self, form_id: impl Into<String>) -> Self {
        self.form_id = Some(form_id.into());
        self
    }

    /// Address the message to every connection of one user.
    pub fn for_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Decode a client frame.
    ///
    /// The sender id, timestamp and message id are always server-assigned;
    /// any client-supplied copies are discarded.
    pub fn decode(text: &str, sender_id: &str) -> Result<Self, CollabError> {
        let frame: InboundFrame =
            serde_json::from_str(text).map_err(|e| CollabError::InvalidMessage(e.to_string()))?;
        let event_type = frame.event_type.parse::<EventType>()?;

        let mut message = Self::new(event_type, Value::Null);
        message.payload = frame.payload;
        message.form_id = frame.form_id.filter(|f| !f.is_empty());
        message.user_id = Some(sender_id.to_string());
        Ok(message)
    }

    /// Deserialize the payload into a typed struct.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, CollabError> {
        serde_json::from_value(self.payload.clone()).map_err(CollabError::invalid_payload)
    }

    pub fn error(err: &CollabError) -> Self {
        Self::new(
            EventType::Error,
            ErrorPayload {
                code: err.code().to_string(),
                message: err.to_string(),
                details: None,
            },
        )
    }

    pub fn user_left(form_id: &str, user_id: &str) -> Self {
        Self::new(
            EventType::UserLeft,
            UserLeftPayload {
                form_id: form_id.to_string(),
                user_id: user_id.to_string(),
            },
        )
        .in_room(form_id)
    }
}

// ---------------------------------------------------------------------------
// Shared wire types
// ---------------------------------------------------------------------------

/// An authenticated user as seen by collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub is_online: bool,
}

impl User {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            email: String::new(),
            name: name.into(),
            avatar: None,
            role: String::new(),
            permissions: Vec::new(),
            session_id: None,
            connected_at: now,
            last_seen: now,
            is_online: true,
        }
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.iter().any(|p| p == permission)
    }

    /// Whether the user may change a form's structure.
    pub fn can_edit(&self) -> bool {
        matches!(self.role.as_str(), "owner" | "editor" | "admin")
            || ["edit", "admin", "super_admin"]
                .iter()
                .any(|p| self.has_permission(p))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub x: i64,
    pub y: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
}

/// A user's last reported pointer location inside a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cursor {
    pub user_id: String,
    pub position: Position,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Client → Server payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinFormPayload {
    pub form_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveFormPayload {
    #[serde(default)]
    pub form_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorUpdatePayload {
    pub form_id: String,
    pub position: Position,
    #[serde(default)]
    pub color: Option<String>,
}

/// The fields every structural edit must carry. The rest of the payload is
/// relayed untouched.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormEditPayload {
    pub form_id: String,
    #[serde(default)]
    pub question_id: Option<String>,
    #[serde(default)]
    pub question: Option<Value>,
}

// ---------------------------------------------------------------------------
// Server → Client payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinFormResponsePayload {
    pub form_id: String,
    pub user_id: String,
    pub success: bool,
    pub room_users: Vec<User>,
    pub cursors: Vec<Cursor>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveFormResponsePayload {
    pub form_id: String,
    pub user_id: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserJoinedPayload {
    pub form_id: String,
    pub user: User,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserLeftPayload {
    pub form_id: String,
    pub user_id: String,
}

/// A cursor move as relayed to the other occupants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorBroadcastPayload {
    pub form_id: String,
    pub user_id: String,
    pub position: Position,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    pub user: User,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PongPayload {
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    pub timestamp: DateTime<Utc>,
    pub server_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitPayload {
    pub limit: u32,
    pub remaining: u32,
    pub reset_time: DateTime<Utc>,
    /// Window length in seconds.
    pub window: u64,
}
