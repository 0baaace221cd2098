/**
 * Server Configuration
 *
 * This module handles loading and validation of server configuration from
 * environment variables, with sensible defaults for local development.
 *
 * # Error Handling
 *
 * Malformed values are logged and replaced by their defaults; configuration
 * problems never prevent server startup.
 */
use std::time::Duration;

/// Tunables for the sync server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP port the server binds to
    pub port: u16,
    /// Interval between server-originated WebSocket pings
    pub keepalive_interval: Duration,
    /// A connection with no inbound traffic for this long is closed
    pub idle_timeout: Duration,
    /// A leader silent for longer than this is demoted by the sweep
    pub leader_grace: Duration,
    /// A session with every participant offline for this long is released
    pub session_reap_timeout: Duration,
    /// How often the background sweep runs
    pub sweep_interval: Duration,
    /// Upper bound on a single inbound frame, caps annotation payload abuse
    pub max_frame_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            keepalive_interval: Duration::from_secs(25),
            idle_timeout: Duration::from_secs(60),
            leader_grace: Duration::from_secs(10),
            session_reap_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(2),
            max_frame_bytes: 4 * 1024 * 1024,
        }
    }
}

impl ServerConfig {
    /// Load configuration from the environment, falling back to defaults
    ///
    /// Recognized variables: `SERVER_PORT`, `KEEPALIVE_SECS`,
    /// `IDLE_TIMEOUT_SECS`, `LEADER_GRACE_SECS`, `SESSION_REAP_SECS`,
    /// `MAX_FRAME_BYTES`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: env_parse("SERVER_PORT", defaults.port),
            keepalive_interval: env_secs("KEEPALIVE_SECS", defaults.keepalive_interval),
            idle_timeout: env_secs("IDLE_TIMEOUT_SECS", defaults.idle_timeout),
            leader_grace: env_secs("LEADER_GRACE_SECS", defaults.leader_grace),
            session_reap_timeout: env_secs("SESSION_REAP_SECS", defaults.session_reap_timeout),
            sweep_interval: defaults.sweep_interval,
            max_frame_bytes: env_parse("MAX_FRAME_BYTES", defaults.max_frame_bytes),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!("ignoring malformed {}={:?}", name, raw);
            default
        }),
        Err(_) => default,
    }
}

fn env_secs(name: &str, default: Duration) -> Duration {
    Duration::from_secs(env_parse(name, default.as_secs()))
}
