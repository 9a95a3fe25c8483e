//! Read-only views of live hub state.

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::error::ApiError;
use crate::gateway::metrics::MetricsSnapshot;
use crate::gateway::room::{Room, RoomSummary};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/rooms", get(list_rooms))
        .route("/rooms/{form_id}", get(get_room))
        .route("/metrics", get(metrics))
}

// ---------------------------------------------------------------------------
// GET /api/v1/rooms
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListRoomsResponse {
    pub rooms: Vec<RoomSummary>,
    pub connections: usize,
}

async fn list_rooms(State(state): State<AppState>) -> Json<ListRoomsResponse> {
    Json(ListRoomsResponse {
        rooms: state.hub.active_rooms(),
        connections: state.hub.connection_count(),
    })
}

// ---------------------------------------------------------------------------
// GET /api/v1/rooms/:form_id
// ---------------------------------------------------------------------------

async fn get_room(
    State(state): State<AppState>,
    Path(form_id): Path<String>,
) -> Result<Json<Room>, ApiError> {
    state
        .hub
        .room(&form_id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found("Room not found"))
}

// ---------------------------------------------------------------------------
// GET /api/v1/metrics
// ---------------------------------------------------------------------------

async fn metrics(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.hub.metrics_snapshot())
}
