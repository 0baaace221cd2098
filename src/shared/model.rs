/**
 * Session Data Model
 *
 * This module defines the domain vocabulary shared between the server-side
 * session registry and the client runtime: reading modes, participants,
 * annotation records and their normalized page geometry.
 *
 * All of these types are serialized to JSON for transmission inside a
 * `SyncMessage` envelope, so they derive `Serialize`/`Deserialize` and use
 * camelCase field names on the wire.
 */
use serde::{Deserialize, Serialize};

/// Reading mode of a session
///
/// In `Follow` mode the leader's page position is pushed to every other
/// participant. In `Free` mode each participant scrolls independently while
/// reading progress is still shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReadingMode {
    Follow,
    Free,
}

impl Default for ReadingMode {
    fn default() -> Self {
        ReadingMode::Free
    }
}

/// Normalized annotation geometry in page space
///
/// All four components are fractions of the page dimensions in `0..=1`,
/// so the same record renders correctly at any zoom level or viewport size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Coordinates {
    pub start_x: f64,
    pub start_y: f64,
    pub end_x: f64,
    pub end_y: f64,
}

impl Coordinates {
    pub fn new(start_x: f64, start_y: f64, end_x: f64, end_y: f64) -> Self {
        Self {
            start_x,
            start_y,
            end_x,
            end_y,
        }
    }

    /// Whether every component lies in the normalized `0..=1` range
    pub fn is_normalized(&self) -> bool {
        [self.start_x, self.start_y, self.end_x, self.end_y]
            .iter()
            .all(|v| (0.0..=1.0).contains(v))
    }
}

/// A member of a reading session
///
/// Created on first JOIN, updated on every action from that user, marked
/// offline (never deleted) on disconnect. `is_original_host` is immutable
/// and identifies the participant that created the session;
/// `is_current_leader` is derived from the session's `leader_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user_id: String,
    pub display_name: String,
    pub is_original_host: bool,
    pub is_current_leader: bool,
    pub is_online: bool,
    /// Highest page this participant has read; monotonically non-decreasing
    pub max_read_page: i32,
    /// Position in join order, used as the deterministic tie-break when a
    /// replacement leader must be selected
    pub join_order: u64,
}

impl Participant {
    pub fn new(user_id: String, display_name: String, is_original_host: bool, join_order: u64) -> Self {
        Self {
            user_id,
            display_name,
            is_original_host,
            is_current_leader: false,
            is_online: true,
            max_read_page: 0,
            join_order,
        }
    }
}

/// Variant-specific body of an annotation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnnotationBody {
    /// A colored text highlight
    Highlight { color: String },
    /// A text comment anchored to a page region
    Comment { text: String },
}

/// An annotation stored in the authoritative session state
///
/// The `id` is assigned by the session registry when the ADD action is
/// confirmed; a client's locally-created copy carries a provisional
/// (negative) id until the echo arrives and the reconciler swaps it out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationRecord {
    /// Authoritative id (positive) or a client-local provisional id (negative)
    pub id: i64,
    pub page: i32,
    /// The anchor text the annotation was attached to
    pub snippet: String,
    #[serde(flatten)]
    pub body: AnnotationBody,
    pub coordinates: Coordinates,
    pub author_id: String,
}

impl AnnotationRecord {
    /// Whether this record still carries a client-local provisional id
    pub fn is_provisional(&self) -> bool {
        self.id < 0
    }
}
