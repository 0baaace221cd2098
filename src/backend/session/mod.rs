//! Session Module
//!
//! The authoritative side of the synchronization protocol:
//!
//! - **`state`** - the per-session state record and its action machine
//! - **`registry`** - the single-writer serialization point and fan-out
//! - **`leadership`** - transfer validation, claims, automatic demotion
//!
//! All mutation of one session goes through `SessionRegistry`, which locks
//! the session, applies the action, and broadcasts the result while still
//! holding the lock. That one rule gives every participant the same total
//! order of observed actions.

/// Authoritative per-session state and action application
pub mod state;

/// Session lookup, serialization and broadcast fan-out
pub mod registry;

/// Leadership transfer rules and automatic demotion
pub mod leadership;

pub use registry::{SessionHandle, SessionRegistry};
pub use state::{ApplyOutcome, SessionState};
