mod collaborators;
mod config;
mod hub;
mod protocol;
mod session;
mod signaling;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::{Path, State, ws::WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::fmt::time::ChronoLocal;

use parley_core::gateway::HttpAiGateway;
use parley_core::health::{HttpHealthProbe, RuntimeHealthCache, SystemClock};
use parley_core::resolver::CredentialResolver;

use crate::collaborators::BackendClient;
use crate::config::Config;
use crate::hub::{Role, SessionHub, handle_socket};
use crate::session::SessionDeps;

#[derive(Clone)]
struct AppState {
    hub: Arc<SessionHub>,
}

/// Upgrades `/ws/{role}/{token}` connections and hands them to the hub.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Path((role, token)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Response {
    let Some(role) = Role::parse(&role) else {
        return (StatusCode::BAD_REQUEST, "unknown role").into_response();
    };
    tracing::info!(?role, %token, "WebSocket upgrade request received");
    ws.on_upgrade(move |socket| handle_socket(state.hub, socket, role, token))
}

async fn health_handler() -> &'static str {
    "ok"
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("Failed to load application configuration")?;

    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(ChronoLocal::rfc_3339())
        .init();

    tracing::info!("Configuration loaded successfully. Starting interview gateway...");

    let backend = Arc::new(BackendClient::new(config.backend_base_url.clone()));
    let resolver = Arc::new(CredentialResolver::new(
        backend.clone(),
        Arc::new(HttpAiGateway::new()),
        config.env_fallback.clone(),
    ));
    let health = Arc::new(RuntimeHealthCache::new(
        Arc::new(HttpHealthProbe::new()),
        Arc::new(SystemClock),
        config.health.clone(),
    ));
    let deps = Arc::new(SessionDeps {
        resolver,
        store: backend,
        stt: config.stt.clone(),
        monitor_cap: config.monitor_cap,
        temperature: config.generation_temperature,
        max_tokens: config.generation_max_tokens,
    });
    let state = AppState {
        hub: Arc::new(SessionHub::new(deps, health, config.default_min_user_turns)),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/ws/{role}/{token}", get(ws_handler))
        .route("/healthz", get(health_handler))
        .layer(cors)
        .with_state(state);

    tracing::info!("Starting WebSocket server, listening on {}", config.bind_addr);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await
        .context("Server error")?;

    Ok(())
}
