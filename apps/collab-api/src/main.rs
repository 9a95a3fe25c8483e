use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use collab_api::auth::{IdentityVerifier, JwtVerifier};
use collab_api::bus::{BroadcastBus, EventBus};
use collab_api::config::Config;
use collab_api::gateway::hub::HubHandle;
use collab_api::store::{MemoryStore, RedisStore, SharedStore};
use collab_api::AppState;

#[tokio::main]
async fn main() {
    // Load .env file (silently skip if missing, env vars may be set externally)
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    let port = config.port;

    let store = connect_store(config.redis_url.as_deref()).await;
    let bus: Arc<dyn EventBus> = Arc::new(BroadcastBus::new());
    let identity: Arc<dyn IdentityVerifier> = Arc::new(JwtVerifier::new(&config.jwt_secret));

    tracing::info!(
        service = %config.service_name,
        max_users_per_room = config.max_users_per_room,
        rate_limit = config.message_rate_limit,
        policy = ?config.rate_limit_failure_policy,
        "collab-api configured"
    );

    let (state, hub) = AppState::build(config, store, bus, identity);
    let hub_task = tokio::spawn(hub.run());
    let handle = state.hub.clone();

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = collab_api::app(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "collab-api listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(handle))
        .await
        .expect("server error");

    let _ = hub_task.await;
    tracing::info!("collab-api shut down");
}

/// Redis when configured and reachable, otherwise the in-process store.
async fn connect_store(redis_url: Option<&str>) -> Arc<dyn SharedStore> {
    let Some(url) = redis_url else {
        tracing::info!("REDIS_URL not set, using in-memory shared store");
        return Arc::new(MemoryStore::new());
    };

    match RedisStore::connect(url).await {
        Ok(store) => {
            tracing::info!("connected to redis");
            Arc::new(store)
        }
        Err(err) => {
            tracing::warn!(?err, "redis unreachable, falling back to in-memory shared store");
            Arc::new(MemoryStore::new())
        }
    }
}

async fn shutdown_signal(hub: HubHandle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
    hub.shutdown();
}
