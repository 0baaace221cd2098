/**
 * Typed Client Events
 *
 * A single dispatch loop consumes the inbound `SyncMessage` stream, updates
 * the local session view, and republishes typed events on one channel.
 * Interested listeners consume `SyncEvent`s instead of registering
 * callbacks on the connection.
 */
use crate::shared::model::{AnnotationRecord, ReadingMode};

/// Connection status, surfaced alongside protocol events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// The stream is open and synchronized
    Connected,
    /// The stream dropped; the lifecycle agent is backing off and retrying
    Reconnecting,
    /// `leave_room` was called; no further reconnection will happen
    Closed,
}

/// A state change observed by the client
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// The leader moved the page (FOLLOW mode)
    PageChanged { page: i32, scale: Option<f64> },
    /// The session switched between FOLLOW and FREE
    ReadingModeChanged(ReadingMode),
    /// An annotation entered the local view; provisional inserts and
    /// authoritative replacements both surface here
    AnnotationAdded(AnnotationRecord),
    /// A comment's text changed
    AnnotationUpdated { id: i64, text: String },
    /// An annotation left the local view. `replaced_by` is set when a
    /// provisional record was reconciled to its authoritative id.
    AnnotationRemoved { id: i64, replaced_by: Option<i64> },
    /// Leadership moved; `None` means the session is leaderless
    LeadershipChanged { leader_id: Option<String> },
    /// A participant came online
    ParticipantJoined { user_id: String },
    /// A participant went offline (deliberate leave or connection loss)
    ParticipantLeft { user_id: String },
    /// A participant's max-read-page advanced
    ProgressChanged { user_id: String, page: i32 },
    /// A full snapshot replaced the local view (join or reconnect)
    SnapshotApplied,
    /// The connection lifecycle changed state
    Status(ConnectionStatus),
}
