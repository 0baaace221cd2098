/**
 * Application State
 *
 * The central state container for the Axum application. It holds the
 * session registry (the only shared mutable resource) and the server
 * configuration; handlers extract what they need via `FromRef`.
 *
 * # Thread Safety
 *
 * The registry is internally synchronized (mutex-per-session); `AppState`
 * itself is a cheap `Clone` of `Arc`s.
 */
use axum::extract::FromRef;
use std::sync::Arc;

use crate::backend::server::config::ServerConfig;
use crate::backend::session::SessionRegistry;

/// Shared application state for all handlers
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            registry: Arc::new(SessionRegistry::new(config)),
        }
    }
}

impl FromRef<AppState> for Arc<SessionRegistry> {
    fn from_ref(state: &AppState) -> Self {
        state.registry.clone()
    }
}
