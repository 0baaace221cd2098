//! Server Module
//!
//! Axum application assembly: configuration loading, shared state, router
//! and startup.

/// Environment-driven server configuration
pub mod config;

/// Router and background-task assembly
pub mod init;

/// Shared application state for handlers
pub mod state;

pub use config::ServerConfig;
pub use init::create_app;
pub use state::AppState;
