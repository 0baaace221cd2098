//! Real-time Stream Module
//!
//! The stream protocol handler: one duplex WebSocket per participant per
//! session, validated inbound actions, ordered outbound broadcasts.
//!
//! # Module Structure
//!
//! ```text
//! realtime/
//! ├── mod.rs - module exports
//! └── ws.rs  - WebSocket upgrade and per-connection loops
//! ```

/// WebSocket upgrade handler and per-connection tasks
pub mod ws;

pub use ws::{ws_handler, WsQuery};
