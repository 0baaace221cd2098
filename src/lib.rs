//! Coread - Collaborative Reading Session Sync
//!
//! Coread lets several participants read the same document together and see
//! each other's page position, highlights, comments and reading progress
//! update live. Exactly one participant at a time acts as leader: in FOLLOW
//! mode the leader's page position is pushed to everyone, while FREE mode
//! leaves each participant scrolling independently with progress still
//! shared.
//!
//! # Module Structure
//!
//! The library is organized into three main modules:
//!
//! - **`shared`** - Types shared between server and client
//!   - The `SyncMessage` wire envelope and its payloads
//!   - The session domain model (participants, annotations, reading modes)
//!   - Shared error types
//!
//! - **`backend`** - Server side
//!   - Axum server with one WebSocket stream per participant
//!   - Authoritative per-session state behind a single-writer lock
//!   - Leadership arbitration and lifecycle sweeps
//!
//! - **`client`** - Participant side
//!   - Connection lifecycle agent with backoff reconnect
//!   - Optimistic annotation inserts reconciled against server echoes
//!   - A typed event stream for UI layers
//!
//! # Protocol Flow
//!
//! A participant's agent opens a stream; the server applies a JOIN on its
//! behalf and replies with a full `PARTICIPANTS_SNAPSHOT`. Every subsequent
//! action (page move, annotation add/update/delete, progress update,
//! reading-mode change, leadership transfer) is validated, applied to the
//! session registry, and re-broadcast to all open streams of the session in
//! one agreed order, the sender included, because its echo carries the
//! authoritative annotation id the reconciler needs.
//!
//! # Example
//!
//! ```rust,no_run
//! use coread::client::{ClientConfig, SyncConnection};
//!
//! # async fn example() {
//! let config = ClientConfig::new("ws://127.0.0.1:3000", 1, "u1", "Alice");
//! let (connection, mut events) = SyncConnection::connect(config);
//! while let Some(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! # }
//! ```

/// Types shared between server and client
pub mod shared;

/// Server-side session registry and stream handling
pub mod backend;

/// Client-side connection, reconciliation and events
pub mod client;
