//! Lock-free hub counters, snapshotted for the metrics endpoint.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;

#[derive(Debug, Default)]
pub struct HubMetrics {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_rooms: AtomicU64,
    active_rooms: AtomicU64,
    messages_handled: AtomicU64,
    errors_sent: AtomicU64,
    rate_limited: AtomicU64,
    rate_limit_degraded: AtomicU64,
    dropped_clients: AtomicU64,
    last_updated_ms: AtomicI64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_rooms: u64,
    pub active_rooms: u64,
    pub messages_handled: u64,
    pub errors_sent: u64,
    pub rate_limited: u64,
    pub rate_limit_degraded: u64,
    pub dropped_clients: u64,
    pub last_updated: Option<DateTime<Utc>>,
}

impl HubMetrics {
    pub fn connection_opened(&self, active: usize) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.set_active_connections(active);
    }

    pub fn set_active_connections(&self, active: usize) {
        self.active_connections.store(active as u64, Ordering::Relaxed);
        self.stamp();
    }

    pub fn room_created(&self) {
        self.total_rooms.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_active_rooms(&self, active: usize) {
        self.active_rooms.store(active as u64, Ordering::Relaxed);
        self.stamp();
    }

    pub fn message_handled(&self) {
        self.messages_handled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn error_sent(&self) {
        self.errors_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    /// A rate-limit decision was made without the shared store.
    pub fn rate_limit_degraded(&self) {
        self.rate_limit_degraded.fetch_add(1, Ordering::Relaxed);
    }

    /// A client was disconnected because its outbound queue was full.
    pub fn client_dropped(&self) {
        self.dropped_clients.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let last_updated_ms = self.last_updated_ms.load(Ordering::Relaxed);
        MetricsSnapshot {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            total_rooms: self.total_rooms.load(Ordering::Relaxed),
            active_rooms: self.active_rooms.load(Ordering::Relaxed),
            messages_handled: self.messages_handled.load(Ordering::Relaxed),
            errors_sent: self.errors_sent.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            rate_limit_degraded: self.rate_limit_degraded.load(Ordering::Relaxed),
            dropped_clients: self.dropped_clients.load(Ordering::Relaxed),
            last_updated: (last_updated_ms > 0)
                .then(|| Utc.timestamp_millis_opt(last_updated_ms).single())
                .flatten(),
        }
    }

    fn stamp(&self) {
        self.last_updated_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = HubMetrics::default();
        assert!(metrics.snapshot().last_updated.is_none());

        metrics.connection_opened(1);
        metrics.connection_opened(2);
        metrics.set_active_connections(1);
        metrics.room_created();
        metrics.set_active_rooms(1);
        metrics.message_handled();
        metrics.error_sent();
        metrics.rate_limit_degraded();

        let snap = metrics.snapshot();
        assert_eq!(snap.total_connections, 2);
        assert_eq!(snap.active_connections, 1);
        assert_eq!(snap.total_rooms, 1);
        assert_eq!(snap.active_rooms, 1);
        assert_eq!(snap.messages_handled, 1);
        assert_eq!(snap.errors_sent, 1);
        assert_eq!(snap.rate_limit_degraded, 1);
        assert!(snap.last_updated.is_some());
    }
}
