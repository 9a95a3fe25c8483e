//! WebSocket upgrade: origin check, authentication, then hand-off to a
//! session.

use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::header::{ORIGIN, USER_AGENT};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;

use super::session::{self, ConnectionMeta};
use crate::auth::tokens::{extract_token, TokenQuery};
use crate::error::ApiError;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/ws", get(ws_upgrade))
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let origin = header_str(&headers, ORIGIN.as_str());
    if !state.config.origin_allowed(origin) {
        tracing::debug!(origin = origin.unwrap_or_default(), "rejected websocket origin");
        return Err(ApiError::forbidden("Origin not allowed"));
    }

    let token = extract_token(&query, &headers)
        .ok_or_else(|| ApiError::unauthorized("Missing bearer token"))?;
    let user = state.identity.verify(&token).await?;

    let meta = ConnectionMeta {
        user_agent: header_str(&headers, USER_AGENT.as_str()).map(str::to_string),
        ip_address: client_ip(&headers),
    };

    tracing::debug!(user_id = %user.id, "upgrading websocket");

    let config = state.config.clone();
    Ok(ws
        .max_message_size(config.max_message_size)
        .read_buffer_size(config.read_buffer_size)
        .write_buffer_size(config.write_buffer_size)
        .on_upgrade(move |socket| session::serve(socket, state, user, meta))
        .into_response())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// First hop of `X-Forwarded-For`, else `X-Real-IP`.
fn client_ip(headers: &HeaderMap) -> Option<String> {
    header_str(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .or_else(|| header_str(headers, "x-real-ip"))
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(str::to_string)
}
