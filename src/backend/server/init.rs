/**
 * Server Initialization
 *
 * Sets up the Axum application: application state, routes, middleware and
 * background sweep task.
 *
 * # Initialization Steps
 *
 * 1. Build the `SessionRegistry` from the loaded configuration
 * 2. Configure the router (`/sync` WebSocket endpoint, `/health`)
 * 3. Spawn the periodic lifecycle sweep (leader demotion, session reaping)
 */
use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

use crate::backend::realtime::ws_handler;
use crate::backend::server::config::ServerConfig;
use crate::backend::server::state::AppState;
use crate::backend::session::registry::run_sweeper;

/// Create and configure the Axum application
///
/// Also spawns the registry sweeper; the task runs for the lifetime of the
/// process and needs no explicit shutdown.
pub fn create_app(config: ServerConfig) -> Router {
    tracing::info!(?config, "initializing coread sync server");

    let state = AppState::new(config);
    tokio::spawn(run_sweeper(state.registry.clone()));

    Router::new()
        .route("/sync", get(ws_handler))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Liveness probe
async fn health() -> &'static str {
    "ok"
}
