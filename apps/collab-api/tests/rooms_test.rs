//! Integration tests for the read-only HTTP surface.

mod common;

use axum::http::StatusCode;
use axum_test::TestServer;
use tokio::sync::mpsc;

use collab_api::gateway::events::User;
use collab_api::gateway::registry::{ClientEntry, Outgoing};
use collab_api::AppState;

/// Register a connection straight through the hub and put it in `form_id`.
async fn seat(
    state: &AppState,
    client_id: &str,
    user_id: &str,
    form_id: &str,
) -> mpsc::Receiver<Outgoing> {
    let (tx, rx) = mpsc::channel(16);
    let user = User::new(user_id, user_id);
    let entry = ClientEntry::new(client_id, user, tx, state.hub.child_token());
    state.hub.register(entry).await.unwrap();
    common::eventually(|| state.hub.is_registered(client_id)).await;
    state.hub.join(client_id, form_id).await.unwrap();
    rx
}

// =========================================================================
// GET /health
// =========================================================================

#[tokio::test]
async fn health_reports_store_status() {
    let (state, _bus) = common::test_state(common::test_config());
    let server = TestServer::new(collab_api::app(state)).unwrap();

    let resp = server.get("/health").await;
    resp.assert_status_ok();

    let body: serde_json::Value = resp.json();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["store"], "ok");
    assert_eq!(body["connections"], 0);
}

// =========================================================================
// GET /api/v1/rooms
// =========================================================================

#[tokio::test]
async fn list_rooms_shows_occupied_rooms() {
    let (state, _bus) = common::test_state(common::test_config());
    let _a = seat(&state, "conn_a", "alice", "form-b").await;
    let _b = seat(&state, "conn_b", "bob", "form-a").await;
    let _c = seat(&state, "conn_c", "carol", "form-a").await;

    let server = TestServer::new(collab_api::app(state)).unwrap();
    let resp = server.get("/api/v1/rooms").await;
    resp.assert_status_ok();

    let body: serde_json::Value = resp.json();
    let rooms = body["rooms"].as_array().unwrap();
    assert_eq!(rooms.len(), 2);
    assert_eq!(rooms[0]["formId"], "form-a");
    assert_eq!(rooms[0]["userCount"], 2);
    assert_eq!(rooms[1]["formId"], "form-b");
    assert_eq!(body["connections"], 3);
}

// =========================================================================
// GET /api/v1/rooms/:form_id
// =========================================================================

#[tokio::test]
async fn get_room_returns_snapshot() {
    let (state, _bus) = common::test_state(common::test_config());
    let _a = seat(&state, "conn_a", "alice", "form-1").await;

    let server = TestServer::new(collab_api::app(state)).unwrap();
    let resp = server.get("/api/v1/rooms/form-1").await;
    resp.assert_status_ok();

    let body: serde_json::Value = resp.json();
    assert_eq!(body["formId"], "form-1");
    assert!(body["users"]["alice"].is_object());
}

#[tokio::test]
async fn get_unknown_room_is_not_found() {
    let (state, _bus) = common::test_state(common::test_config());
    let server = TestServer::new(collab_api::app(state)).unwrap();

    let resp = server.get("/api/v1/rooms/nope").await;
    resp.assert_status(StatusCode::NOT_FOUND);

    let body: serde_json::Value = resp.json();
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}

// =========================================================================
// GET /api/v1/metrics
// =========================================================================

#[tokio::test]
async fn metrics_count_connections_and_rooms() {
    let (state, _bus) = common::test_state(common::test_config());
    let _a = seat(&state, "conn_a", "alice", "form-1").await;
    let _b = seat(&state, "conn_b", "bob", "form-2").await;

    let server = TestServer::new(collab_api::app(state)).unwrap();
    let resp = server.get("/api/v1/metrics").await;
    resp.assert_status_ok();

    let body: serde_json::Value = resp.json();
    assert_eq!(body["totalConnections"], 2);
    assert_eq!(body["activeConnections"], 2);
    assert_eq!(body["totalRooms"], 2);
    assert_eq!(body["activeRooms"], 2);
}
