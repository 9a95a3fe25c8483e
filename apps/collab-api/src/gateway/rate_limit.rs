//! Per-user fixed-window message limits, counted in the shared store so
//! every node sees the same budget.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::time::Instant;

use super::events::RateLimitPayload;
use crate::config::RateLimitFailurePolicy;
use crate::store::{keys, SharedStore, StoreError, WindowCount};

/// Outcome of counting one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitInfo {
    pub user_id: String,
    pub key: String,
    pub limit: u32,
    /// Messages counted in the current window, this one included.
    pub count: u64,
    pub window: Duration,
    pub reset_time: DateTime<Utc>,
    /// The decision was made without the shared store.
    pub degraded: bool,
    /// Set when the store was unreachable and policy is closed.
    forced_block: bool,
}

impl RateLimitInfo {
    pub fn is_blocked(&self) -> bool {
        self.forced_block || self.count > u64::from(self.limit)
    }

    pub fn is_allowed(&self) -> bool {
        !self.is_blocked()
    }

    pub fn remaining(&self) -> u32 {
        u64::from(self.limit).saturating_sub(self.count) as u32
    }

    pub fn payload(&self) -> RateLimitPayload {
        RateLimitPayload {
            limit: self.limit,
            remaining: self.remaining(),
            reset_time: self.reset_time,
            window: self.window.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LocalWindow {
    count: u64,
    expires_at: Instant,
}

/// Counts messages per user per window.
///
/// Store failures and timeouts are handled by the configured
/// [`RateLimitFailurePolicy`]; they are never surfaced to the caller.
pub struct RateLimiter {
    store: Arc<dyn SharedStore>,
    timeout: Duration,
    policy: RateLimitFailurePolicy,
    local: DashMap<String, LocalWindow>,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn SharedStore>,
        timeout: Duration,
        policy: RateLimitFailurePolicy,
    ) -> Self {
        Self {
            store,
            timeout,
            policy,
            local: DashMap::new(),
        }
    }

    /// Count one message from `user_id` against `limit` per `window`.
    pub async fn check(&self, user_id: &str, limit: u32, window: Duration) -> RateLimitInfo {
        let key = keys::rate_limit(user_id);

        let counted = tokio::time::timeout(self.timeout, self.store.increment_window(&key, window))
            .await
            .unwrap_or(Err(StoreError::Timeout));

        match counted {
            Ok(WindowCount { count, ttl }) => {
                self.info(user_id, key, limit, window, count, ttl, false)
            }
            Err(err) => self.on_store_failure(user_id, key, limit, window, err),
        }
    }

    /// Forget a user's current window.
    pub async fn reset(&self, user_id: &str) -> Result<(), StoreError> {
        self.local.remove(user_id);
        self.store.reset_counter(&keys::rate_limit(user_id)).await
    }

    fn on_store_failure(
        &self,
        user_id: &str,
        key: String,
        limit: u32,
        window: Duration,
        err: StoreError,
    ) -> RateLimitInfo {
        tracing::warn!(
            %user_id,
            ?err,
            policy = ?self.policy,
            "rate limit store unavailable"
        );

        match self.policy {
            RateLimitFailurePolicy::Open => self.info(user_id, key, limit, window, 0, window, true),
            RateLimitFailurePolicy::Closed => {
                let mut info = self.info(user_id, key, limit, window, 0, window, true);
                info.forced_block = true;
                info
            }
            RateLimitFailurePolicy::Local => {
                let WindowCount { count, ttl } = self.count_locally(user_id, window);
                self.info(user_id, key, limit, window, count, ttl, true)
            }
        }
    }

    fn count_locally(&self, user_id: &str, window: Duration) -> WindowCount {
        let now = Instant::now();
        let mut entry = self
            .local
            .entry(user_id.to_string())
            .or_insert(LocalWindow {
                count: 0,
                expires_at: now + window,
            });
        if entry.expires_at <= now {
            *entry = LocalWindow {
                count: 0,
                expires_at: now + window,
            };
        }
        entry.count += 1;
        WindowCount {
            count: entry.count,
            ttl: entry.expires_at.saturating_duration_since(now),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn info(
        &self,
        user_id: &str,
        key: String,
        limit: u32,
        window: Duration,
        count: u64,
        ttl: Duration,
        degraded: bool,
    ) -> RateLimitInfo {
        let reset_time = Utc::now()
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
        RateLimitInfo {
            user_id: user_id.to_string(),
            key,
            limit,
            count,
            window,
            reset_time,
            degraded,
            forced_block: false,
        }
    }
}
