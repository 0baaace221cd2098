//! Client Module
//!
//! The participant-side runtime of the synchronization protocol:
//!
//! - **`connection`** - lifecycle agent: connect, heartbeat, backoff
//!   reconnect, deliberate leave
//! - **`state`** - the local materialized session view
//! - **`reconciler`** - optimistic-insert vs. authoritative-echo merging
//! - **`events`** - the typed event stream consumed by the UI layer
//!
//! A `SyncConnection` owns one stream to one session. A single dispatch
//! loop applies inbound messages to `ClientSessionState` and republishes
//! `SyncEvent`s; there are no callbacks on the connection itself.

/// Connection lifecycle agent and the public connection handle
pub mod connection;

/// Typed events published to listeners
pub mod events;

/// Optimistic-insert reconciliation
pub mod reconciler;

/// Local session view
pub mod state;

pub use connection::{Backoff, ClientConfig, ConnectionEvent, ConnectionState, SyncConnection};
pub use events::{ConnectionStatus, SyncEvent};
pub use reconciler::{EchoResolution, PendingOperationKey, Reconciler};
pub use state::ClientSessionState;
