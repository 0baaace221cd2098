//! Backend Module
//!
//! The authoritative side of the synchronization protocol: the Axum server,
//! the per-session registry, and the WebSocket stream handler.
//!
//! # Architecture
//!
//! ```text
//! backend/
//! ├── server/   - config, app state, router assembly, binary entry point
//! ├── session/  - authoritative session state, registry, leadership rules
//! └── realtime/ - WebSocket stream protocol handler
//! ```
//!
//! A participant's stream sends a JOIN on connect, receives the full
//! snapshot, and from then on all state-producing actions flow through the
//! `SessionRegistry` and back out to every open stream of the session in a
//! single agreed order.

/// Axum server assembly
pub mod server;

/// Authoritative session state and leadership
pub mod session;

/// WebSocket stream handling
pub mod realtime;
