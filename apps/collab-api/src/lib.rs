pub mod auth;
pub mod bus;
pub mod config;
pub mod error;
pub mod gateway;
pub mod routes;
pub mod store;

use std::sync::Arc;

use axum::Router;
use tokio_util::sync::CancellationToken;

use auth::IdentityVerifier;
use bus::EventBus;
use config::Config;
use gateway::hub::{Hub, HubHandle, HubSettings};
use gateway::rate_limit::RateLimiter;
use store::SharedStore;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub hub: HubHandle,
    pub store: Arc<dyn SharedStore>,
    pub bus: Arc<dyn EventBus>,
    pub identity: Arc<dyn IdentityVerifier>,
    pub rate_limiter: Arc<RateLimiter>,
}

impl AppState {
    /// Wire the collaborators together. The returned [`Hub`] must be spawned
    /// with [`Hub::run`] before connections are accepted.
    pub fn build(
        config: Config,
        store: Arc<dyn SharedStore>,
        bus: Arc<dyn EventBus>,
        identity: Arc<dyn IdentityVerifier>,
    ) -> (Self, Hub) {
        let (hub, handle) = Hub::new(
            HubSettings::from(&config),
            store.clone(),
            bus.clone(),
            CancellationToken::new(),
        );
        let rate_limiter = Arc::new(RateLimiter::new(
            store.clone(),
            config.rate_limit_timeout,
            config.rate_limit_failure_policy,
        ));

        let state = Self {
            config: Arc::new(config),
            hub: handle,
            store,
            bus,
            identity,
            rate_limiter,
        };
        (state, hub)
    }
}

/// The full HTTP surface, without transport layers.
pub fn app(state: AppState) -> Router {
    routes::router().with_state(state)
}
