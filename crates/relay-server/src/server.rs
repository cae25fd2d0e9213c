use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::routing::{get, post};
use axum::Router;
use relay_auth::IdentityGate;
use relay_core::{AccountStore, ChatStore};
use relay_telemetry::RelayMetrics;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::{RelayConfig, ServerConfig};
use crate::handlers;
use crate::hub::Hub;

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: Hub,
    pub gate: Arc<IdentityGate>,
    pub chat: Arc<dyn ChatStore>,
    pub accounts: Arc<dyn AccountStore>,
    pub metrics: Arc<RelayMetrics>,
    pub config: Arc<ServerConfig>,
    pub start_time: Instant,
}

/// External collaborators the server is wired to.
pub struct RelayServices {
    pub chat: Arc<dyn ChatStore>,
    pub accounts: Arc<dyn AccountStore>,
    pub metrics: Arc<RelayMetrics>,
}

impl RelayServices {
    /// Use one store for both chat and accounts.
    pub fn new<S>(store: Arc<S>) -> Self
    where
        S: ChatStore + AccountStore + 'static,
    {
        Self {
            chat: store.clone(),
            accounts: store,
            metrics: Arc::new(RelayMetrics::new()),
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(handlers::ws_handler))
        .route("/register", post(handlers::register))
        .route("/login", post(handlers::login))
        .route("/logout", post(handlers::logout))
        .route("/whoami", get(handlers::whoami))
        .route("/refresh-token", post(handlers::refresh_token))
        .route("/messages", get(handlers::messages))
        .route("/health", get(handlers::health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind the listener, spawn the hub and serve. Port `0` picks a free port.
pub async fn start(config: RelayConfig, services: RelayServices) -> Result<ServerHandle, std::io::Error> {
    let shutdown = CancellationToken::new();
    let (hub, hub_task) = Hub::spawn(
        services.chat.clone(),
        services.metrics.clone(),
        config.server.hub_queue_capacity,
        shutdown.child_token(),
    );

    let state = AppState {
        hub,
        gate: Arc::new(IdentityGate::new(&config.auth)),
        chat: services.chat,
        accounts: services.accounts,
        metrics: services.metrics,
        config: Arc::new(config.server.clone()),
        start_time: Instant::now(),
    };
    let router = build_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    info!(%local_addr, "relay server started");

    let token = shutdown.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await;
        if let Err(e) = result {
            error!(error = %e, "server error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        shutdown,
        server,
        hub: hub_task,
        shutdown_timeout: Duration::from_secs(config.server.shutdown_timeout_secs),
    })
}

/// Handle returned by `start()`; keeps the server and hub tasks alive.
pub struct ServerHandle {
    pub port: u16,
    shutdown: CancellationToken,
    server: JoinHandle<()>,
    hub: JoinHandle<()>,
    shutdown_timeout: Duration,
}

impl ServerHandle {
    /// Stop accepting, close every live connection's queue and wait for the
    /// server and hub tasks, up to the configured timeout.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let drain = async {
            let _ = self.hub.await;
            let _ = self.server.await;
        };
        if tokio::time::timeout(self.shutdown_timeout, drain).await.is_err() {
            warn!(timeout = ?self.shutdown_timeout, "shutdown timed out");
        } else {
            info!("relay server stopped");
        }
    }
}
