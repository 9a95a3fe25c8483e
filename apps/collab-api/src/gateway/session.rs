//! One WebSocket connection: a read actor and a write actor.
//!
//! The read actor decodes frames, applies the rate limit and dispatches to
//! handlers. It owns teardown: when it exits, the connection is
//! unregistered and the write actor is cancelled. The write actor is the
//! only code that writes to the socket; it drains the outbound queue and
//! sends keepalive pings.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{close_code, CloseFrame, Message as WsMessage, WebSocket};
use chrono::Utc;
use collab_common::id::{prefix, prefixed_ulid};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use super::events::{EventType, HeartbeatPayload, Message, PongPayload, User};
use super::handler::{self, HandlerContext};
use super::registry::{ClientEntry, Outgoing};
use crate::error::CollabError;
use crate::AppState;

/// Handshake details recorded with the connection.
#[derive(Debug, Clone, Default)]
pub struct ConnectionMeta {
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
}

/// Direct line to one connection's outbound queue, for replies that bypass
/// the hub (acks, errors, pongs).
#[derive(Debug, Clone)]
pub struct Outbox {
    client_id: String,
    tx: mpsc::Sender<Outgoing>,
}

impl Outbox {
    pub fn new(client_id: impl Into<String>, tx: mpsc::Sender<Outgoing>) -> Self {
        Self {
            client_id: client_id.into(),
            tx,
        }
    }

    /// Queue a message without waiting. Returns `false` if it was dropped.
    pub fn send(&self, message: Message) -> bool {
        match self.tx.try_send(Arc::new(message)) {
            Ok(()) => true,
            Err(TrySendError::Full(message)) => {
                tracing::warn!(
                    client_id = %self.client_id,
                    event = %message.event_type,
                    "send queue full, dropping reply"
                );
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// Run a freshly upgraded, already authenticated socket until it closes.
pub async fn serve(socket: WebSocket, state: AppState, user: User, meta: ConnectionMeta) {
    let client_id = prefixed_ulid(prefix::CONNECTION);
    let (tx, rx) = mpsc::channel(state.config.send_queue_size);
    let cancel = state.hub.child_token();

    let entry = ClientEntry::new(&client_id, user.clone(), tx.clone(), cancel.clone())
        .with_user_agent(meta.user_agent)
        .with_ip_address(meta.ip_address);
    if let Err(err) = state.hub.register(entry).await {
        tracing::warn!(%client_id, user_id = %user.id, %err, "could not register client");
        return;
    }

    tracing::info!(%client_id, user_id = %user.id, "client connected");

    let (ws_tx, ws_rx) = socket.split();
    let writer = tokio::spawn(write_loop(
        ws_tx,
        rx,
        cancel.clone(),
        state.config.ping_period,
        state.config.write_wait,
        client_id.clone(),
    ));

    let client = Client {
        outbox: Outbox::new(&client_id, tx),
        id: client_id,
        user,
        cancel,
        state,
    };
    client.read_loop(ws_rx).await;

    client.state.hub.unregister(&client.id);
    client.cancel.cancel();
    let _ = writer.await;

    tracing::info!(client_id = %client.id, user_id = %client.user.id, "client disconnected");
}

struct Client {
    id: String,
    user: User,
    outbox: Outbox,
    cancel: CancellationToken,
    state: AppState,
}

impl Client {
    async fn read_loop(&self, mut ws_rx: SplitStream<WebSocket>) {
        let pong_wait = self.state.config.pong_wait;
        let mut deadline = Instant::now() + pong_wait;

        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => break,
                frame = time::timeout_at(deadline, ws_rx.next()) => frame,
            };

            let frame = match frame {
                Err(_elapsed) => {
                    tracing::debug!(client_id = %self.id, "no traffic within pong wait, closing");
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    tracing::debug!(?e, client_id = %self.id, "ws read error");
                    break;
                }
                Ok(Some(Ok(frame))) => frame,
            };
            deadline = Instant::now() + pong_wait;

            match frame {
                WsMessage::Text(text) => self.on_text(&text).await,
                WsMessage::Binary(_) => self.send_error(&CollabError::InvalidMessage(
                    "binary frames are not supported".into(),
                )),
                WsMessage::Pong(_) => self.state.hub.touch(&self.id),
                // axum answers pings itself.
                WsMessage::Ping(_) => {}
                WsMessage::Close(_) => break,
            }
        }
    }

    async fn on_text(&self, text: &str) {
        let message = match Message::decode(text, &self.user.id) {
            Ok(message) => message,
            Err(err) => {
                tracing::debug!(client_id = %self.id, %err, "rejected client frame");
                self.send_error(&err);
                return;
            }
        };

        let config = &self.state.config;
        let metrics = self.state.hub.metrics();

        let limit = self
            .state
            .rate_limiter
            .check(&self.user.id, config.message_rate_limit, config.rate_limit_window)
            .await;
        if limit.degraded {
            metrics.rate_limit_degraded();
        }
        if limit.is_blocked() {
            metrics.rate_limited();
            tracing::debug!(
                client_id = %self.id,
                user_id = %self.user.id,
                event = %message.event_type,
                count = limit.count,
                "rate limit exceeded"
            );
            self.outbox
                .send(Message::new(EventType::RateLimit, limit.payload()));
            return;
        }

        metrics.message_handled();
        tracing::debug!(
            client_id = %self.id,
            user_id = %self.user.id,
            event = %message.event_type,
            form_id = message.form_id.as_deref().unwrap_or_default(),
            "handling message"
        );

        match message.event_type {
            EventType::Ping => {
                self.state.hub.touch(&self.id);
                self.outbox.send(Message::new(
                    EventType::Pong,
                    PongPayload {
                        timestamp: Utc::now(),
                    },
                ));
            }
            EventType::Heartbeat => {
                self.outbox.send(Message::new(
                    EventType::Heartbeat,
                    HeartbeatPayload {
                        timestamp: Utc::now(),
                        server_id: config.service_name.clone(),
                    },
                ));
            }
            _ => {
                let ctx = HandlerContext {
                    hub: &self.state.hub,
                    bus: self.state.bus.as_ref(),
                    outbox: &self.outbox,
                    client_id: &self.id,
                    user: &self.user,
                    service_name: &config.service_name,
                };
                if let Err(err) = handler::dispatch(&ctx, &message).await {
                    tracing::warn!(
                        client_id = %self.id,
                        user_id = %self.user.id,
                        event = %message.event_type,
                        %err,
                        "handler failed"
                    );
                    self.send_error(&err);
                }
            }
        }
    }

    fn send_error(&self, err: &CollabError) {
        if self.outbox.send(Message::error(err)) {
            self.state.hub.metrics().error_sent();
        }
    }
}

async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, WsMessage>,
    mut outbound: mpsc::Receiver<Outgoing>,
    cancel: CancellationToken,
    ping_period: Duration,
    write_wait: Duration,
    client_id: String,
) {
    let mut ping = time::interval_at(Instant::now() + ping_period, ping_period);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = send_close(&mut ws_tx, write_wait).await;
                break;
            }
            next = outbound.recv() => {
                let Some(message) = next else {
                    let _ = send_close(&mut ws_tx, write_wait).await;
                    break;
                };
                let json = match serde_json::to_string(message.as_ref()) {
                    Ok(json) => json,
                    Err(err) => {
                        tracing::error!(%client_id, ?err, "failed to encode outbound message");
                        continue;
                    }
                };
                if let Err(reason) = send_frame(&mut ws_tx, WsMessage::Text(json.into()), write_wait).await {
                    tracing::debug!(%client_id, reason, "write failed");
                    break;
                }
            }
            _ = ping.tick() => {
                if let Err(reason) = send_frame(&mut ws_tx, WsMessage::Ping(Bytes::new()), write_wait).await {
                    tracing::debug!(%client_id, reason, "keepalive ping failed");
                    break;
                }
            }
        }
    }

    // A dead writer takes the reader down with it.
    cancel.cancel();
}

async fn send_frame(
    ws_tx: &mut SplitSink<WebSocket, WsMessage>,
    frame: WsMessage,
    write_wait: Duration,
) -> Result<(), &'static str> {
    match time::timeout(write_wait, ws_tx.send(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => Err("socket closed"),
        Err(_) => Err("write deadline exceeded"),
    }
}

async fn send_close(
    ws_tx: &mut SplitSink<WebSocket, WsMessage>,
    write_wait: Duration,
) -> Result<(), &'static str> {
    let frame = WsMessage::Close(Some(CloseFrame {
        code: close_code::NORMAL,
        reason: "connection closed".into(),
    }));
    send_frame(ws_tx, frame, write_wait).await
}
