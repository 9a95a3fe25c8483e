use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health))
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub store: &'static str,
    pub connections: usize,
}

/// Liveness plus a shared-store round trip. A store outage degrades the
/// service but does not stop it, so the status code stays 200.
async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let store = match state.store.ping().await {
        Ok(()) => "ok",
        Err(err) => {
            tracing::warn!(?err, "health check: shared store unreachable");
            "unavailable"
        }
    };
    let status = if store == "ok" { "ok" } else { "degraded" };

    (
        StatusCode::OK,
        Json(HealthResponse {
            status,
            store,
            connections: state.hub.connection_count(),
        }),
    )
}
