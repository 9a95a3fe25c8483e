#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{EncodingKey, Header};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::time;
use tokio_tungstenite::{tungstenite, MaybeTlsStream, WebSocketStream};

use collab_api::auth::jwt::Claims;
use collab_api::auth::JwtVerifier;
use collab_api::bus::BroadcastBus;
use collab_api::config::Config;
use collab_api::store::MemoryStore;
use collab_api::AppState;

pub const SECRET: &str = "integration-test-secret";

pub type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Config with the test secret and defaults everywhere else.
pub fn test_config() -> Config {
    Config {
        jwt_secret: SECRET.to_string(),
        ..Config::default()
    }
}

/// Build state with in-memory collaborators and a running hub.
pub fn test_state(config: Config) -> (AppState, Arc<BroadcastBus>) {
    let bus = Arc::new(BroadcastBus::new());
    let identity = Arc::new(JwtVerifier::new(&config.jwt_secret));
    let (state, hub) = AppState::build(config, Arc::new(MemoryStore::new()), bus.clone(), identity);
    tokio::spawn(hub.run());
    (state, bus)
}

/// Start the real server on an ephemeral port.
pub async fn start_ws_server(config: Config) -> (SocketAddr, AppState, Arc<BroadcastBus>) {
    let (state, bus) = test_state(config);
    let app = collab_api::app(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, state, bus)
}

/// Mint an HS256 token for `user_id` with the given role.
pub fn mint_token(user_id: &str, role: &str) -> String {
    let claims = Claims {
        sub: user_id.to_string(),
        exp: (chrono::Utc::now() + chrono::Duration::seconds(300)).timestamp(),
        email: format!("{user_id}@example.com"),
        name: user_id.to_string(),
        avatar: None,
        role: role.to_string(),
        permissions: vec![],
        session_id: None,
    };
    jsonwebtoken::encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .expect("mint test token")
}

pub async fn connect(addr: SocketAddr, user_id: &str, role: &str) -> Socket {
    let url = format!("ws://{addr}/ws?token={}", mint_token(user_id, role));
    let (socket, _) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("ws connect");
    socket
}

pub async fn send(socket: &mut Socket, event_type: &str, payload: Value) {
    let frame = serde_json::json!({ "type": event_type, "payload": payload });
    socket
        .send(tungstenite::Message::Text(frame.to_string().into()))
        .await
        .expect("send frame");
}

/// Next JSON message from the server, skipping control frames.
pub async fn recv(socket: &mut Socket) -> Value {
    loop {
        let msg = time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timeout waiting for message")
            .expect("stream ended")
            .expect("ws read error");
        match msg {
            tungstenite::Message::Text(text) => {
                return serde_json::from_str(&text).expect("parse message")
            }
            tungstenite::Message::Close(frame) => panic!("connection closed: {frame:?}"),
            _ => continue,
        }
    }
}

/// Next message of the given type, skipping any others.
pub async fn recv_event(socket: &mut Socket, event_type: &str) -> Value {
    loop {
        let msg = recv(socket).await;
        if msg["type"] == event_type {
            return msg;
        }
    }
}

/// Assert nothing but control frames arrive within `wait`.
pub async fn expect_none(socket: &mut Socket, wait: Duration) {
    let deadline = time::Instant::now() + wait;
    loop {
        match time::timeout_at(deadline, socket.next()).await {
            Err(_) => return,
            Ok(Some(Ok(tungstenite::Message::Text(text)))) => {
                panic!("unexpected message: {}", text.as_str())
            }
            Ok(Some(Ok(_))) => continue,
            Ok(other) => panic!("connection ended: {other:?}"),
        }
    }
}

/// Join `form_id` and return the join response.
pub async fn join(socket: &mut Socket, form_id: &str) -> Value {
    send(socket, "join:form", serde_json::json!({ "formId": form_id })).await;
    recv_event(socket, "join:form:response").await
}

/// Poll until `check` passes or a second has gone by.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}
