//! Domain events published for downstream consumers.
//!
//! Publishing is fire-and-forget: a bus with no subscribers, or one whose
//! subscribers lag, never slows the gateway down.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use collab_common::id::{prefix, prefixed_ulid};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// Capacity of the bus channel. Lagging subscribers skip events.
const BUS_CAPACITY: usize = 4096;

const EVENT_VERSION: &str = "1.0";

/// Well-known bus event types.
pub struct BusEventType;

impl BusEventType {
    pub const USER_JOINED: &str = "user.joined";
    pub const USER_LEFT: &str = "user.left";
    pub const QUESTION_CREATED: &str = "question.created";
    pub const QUESTION_UPDATED: &str = "question.updated";
    pub const QUESTION_DELETED: &str = "question.deleted";
    pub const FORM_UPDATED: &str = "form.updated";
    pub const FORM_DELETED: &str = "form.deleted";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusEvent {
    pub event_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub form_id: String,
    pub user_id: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub version: String,
}

impl BusEvent {
    pub fn new(
        event_type: &str,
        form_id: impl Into<String>,
        user_id: impl Into<String>,
        data: Value,
        source: impl Into<String>,
    ) -> Self {
        Self {
            event_id: prefixed_ulid(prefix::EVENT),
            event_type: event_type.to_string(),
            form_id: form_id.into(),
            user_id: user_id.into(),
            data,
            timestamp: Utc::now(),
            source: source.into(),
            version: EVENT_VERSION.to_string(),
        }
    }
}

pub trait EventBus: Send + Sync {
    fn publish(&self, event: BusEvent);
}

/// In-process bus. Downstream consumers call [`BroadcastBus::subscribe`].
#[derive(Clone)]
pub struct BroadcastBus {
    sender: broadcast::Sender<Arc<BusEvent>>,
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<BusEvent>> {
        self.sender.subscribe()
    }
}

impl EventBus for BroadcastBus {
    fn publish(&self, event: BusEvent) {
        tracing::debug!(
            event = %event.event_type,
            form_id = %event.form_id,
            user_id = %event.user_id,
            "publishing bus event"
        );
        // Err only means nobody is subscribed.
        let _ = self.sender.send(Arc::new(event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = BroadcastBus::new();
        let mut rx = bus.subscribe();

        bus.publish(BusEvent::new(
            BusEventType::FORM_UPDATED,
            "f1",
            "u1",
            json!({ "title": "New" }),
            "collaboration-service",
        ));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, "form.updated");
        assert_eq!(event.version, "1.0");
        assert!(event.event_id.starts_with("evt_"));
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        let bus = BroadcastBus::new();
        bus.publish(BusEvent::new(
            BusEventType::USER_LEFT,
            "f1",
            "u1",
            Value::Null,
            "test",
        ));
    }

    #[test]
    fn wire_shape_is_camel_case() {
        let event = BusEvent::new(BusEventType::USER_JOINED, "f1", "u1", Value::Null, "svc");
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "user.joined");
        assert_eq!(value["formId"], "f1");
        assert!(value.get("eventId").is_some());
    }
}
