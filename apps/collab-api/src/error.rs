use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::gateway::room::RoomFullError;

/// Structured API error returned to HTTP clients.
#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ApiErrorDetail {
    pub code: String,
    pub message: String,
}

/// Application-level error type that converts into an HTTP response.
///
/// Used for everything that happens before a socket is upgraded.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "FORBIDDEN", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody {
            error: ApiErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Socket-level errors
// ---------------------------------------------------------------------------

/// Errors raised while handling a frame on an open connection.
///
/// None of these close the socket; each one becomes an `error` event sent
/// back to the originating client.
#[derive(Debug, thiserror::Error)]
pub enum CollabError {
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("unknown event type '{0}'")]
    UnknownEvent(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error(transparent)]
    RoomFull(#[from] RoomFullError),

    #[error("not in room {0}")]
    NotInRoom(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("hub is not running")]
    HubUnavailable,
}

impl CollabError {
    /// Machine-readable code placed in the error payload.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidMessage(_) => "INVALID_MESSAGE",
            Self::UnknownEvent(_) => "UNKNOWN_EVENT",
            Self::InvalidPayload(_) => "INVALID_PAYLOAD",
            Self::RoomFull(_) => "ROOM_FULL",
            Self::NotInRoom(_) => "NOT_IN_ROOM",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::HubUnavailable => "HUB_UNAVAILABLE",
        }
    }

    pub fn invalid_payload(err: impl std::fmt::Display) -> Self {
        Self::InvalidPayload(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(CollabError::UnknownEvent("x".into()).code(), "UNKNOWN_EVENT");
        assert_eq!(CollabError::NotInRoom("f1".into()).code(), "NOT_IN_ROOM");
        assert_eq!(CollabError::HubUnavailable.code(), "HUB_UNAVAILABLE");
    }

    #[test]
    fn room_full_converts_and_keeps_message() {
        let err: CollabError = RoomFullError {
            form_id: "f1".into(),
            max_users: 2,
        }
        .into();
        assert_eq!(err.code(), "ROOM_FULL");
        assert!(err.to_string().contains("f1"));
    }
}
