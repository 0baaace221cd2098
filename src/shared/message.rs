/**
 * Sync Message Envelope
 *
 * This module defines the wire-level message vocabulary for the session
 * synchronization stream. Every frame exchanged between a client and the
 * server is one `SyncMessage`, serialized as a JSON text frame.
 *
 * The envelope is shared between frontend and backend, allowing seamless
 * serialization on one end and deserialization on the other.
 *
 * # Envelope Layout
 *
 * * `session_id` - the session (room) the message belongs to
 * * `sender_id`  - the originating participant
 * * `action_type` - what happened (JOIN, PAGE_MOVE, ADD, ...)
 * * `annotation_type` - what the payload describes (NONE, PAGE, HIGHLIGHT, COMMENT)
 * * `target_user_id` - only meaningful for LEADERSHIP_TRANSFER
 * * `payload` - sparse field bag; which fields are set depends on the action
 * * `snapshot` - only present on PARTICIPANTS_SNAPSHOT messages
 *
 * Messages are transient: they are never persisted standalone.
 */
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::shared::model::{AnnotationBody, AnnotationRecord, Coordinates, Participant, ReadingMode};

/// The action carried by a `SyncMessage`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    Join,
    Leave,
    PageMove,
    ReadingModeChange,
    Add,
    Update,
    Delete,
    ProgressUpdate,
    LeadershipTransfer,
    ParticipantsSnapshot,
}

/// What kind of object the payload describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnnotationType {
    None,
    Page,
    Highlight,
    Comment,
}

/// Sparse payload of a `SyncMessage`
///
/// Fields are optional on the wire; which ones are populated depends on the
/// action. `page` is always meaningful for PAGE_MOVE, PROGRESS_UPDATE and
/// annotation actions; `id` is the authoritative annotation id and is set by
/// the server on ADD echoes and by clients on UPDATE/DELETE.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPayload {
    #[serde(default)]
    pub page: i32,
    /// Normalized zoom level, carried with PAGE_MOVE when available
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<Coordinates>,
    /// Authoritative annotation id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    /// Comment text
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Highlight color, e.g. "#FFFF00"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    /// Reading mode, carried with READING_MODE_CHANGE
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reading_mode: Option<ReadingMode>,
}

/// Full authoritative state of a session, sent to a (re)joining stream
///
/// Includes the live annotation set so a client reconnecting after an
/// offline period recovers additions and deletions it missed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantsSnapshot {
    pub participants: Vec<Participant>,
    pub online_by_user: HashMap<String, bool>,
    pub progress_by_user: HashMap<String, i32>,
    pub reading_mode: ReadingMode,
    pub current_page: i32,
    pub annotations: Vec<AnnotationRecord>,
}

/// One frame on the synchronization stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMessage {
    pub session_id: i64,
    pub sender_id: String,
    pub action_type: ActionType,
    pub annotation_type: AnnotationType,
    /// Only set for LEADERSHIP_TRANSFER
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_user_id: Option<String>,
    #[serde(default)]
    pub payload: SyncPayload,
    /// Only set for PARTICIPANTS_SNAPSHOT
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<ParticipantsSnapshot>,
}

impl SyncMessage {
    /// Create a bare envelope with an empty payload
    pub fn new(session_id: i64, sender_id: impl Into<String>, action_type: ActionType) -> Self {
        Self {
            session_id,
            sender_id: sender_id.into(),
            action_type,
            annotation_type: AnnotationType::None,
            target_user_id: None,
            payload: SyncPayload::default(),
            snapshot: None,
        }
    }

    /// A JOIN announcement for the given participant
    pub fn join(session_id: i64, sender_id: impl Into<String>) -> Self {
        Self::new(session_id, sender_id, ActionType::Join)
    }

    /// A LEAVE announcement for the given participant
    pub fn leave(session_id: i64, sender_id: impl Into<String>) -> Self {
        Self::new(session_id, sender_id, ActionType::Leave)
    }

    /// A leader-originated page move
    pub fn page_move(session_id: i64, sender_id: impl Into<String>, page: i32) -> Self {
        let mut msg = Self::new(session_id, sender_id, ActionType::PageMove);
        msg.annotation_type = AnnotationType::Page;
        msg.payload.page = page;
        msg
    }

    /// A reading-progress update for the sender
    pub fn progress_update(session_id: i64, sender_id: impl Into<String>, page: i32) -> Self {
        let mut msg = Self::new(session_id, sender_id, ActionType::ProgressUpdate);
        msg.annotation_type = AnnotationType::Page;
        msg.payload.page = page;
        msg
    }

    /// A reading-mode change request (leader only)
    pub fn reading_mode_change(
        session_id: i64,
        sender_id: impl Into<String>,
        mode: ReadingMode,
    ) -> Self {
        let mut msg = Self::new(session_id, sender_id, ActionType::ReadingModeChange);
        msg.payload.reading_mode = Some(mode);
        msg
    }

    /// A leadership transfer request naming a target participant
    pub fn leadership_transfer(
        session_id: i64,
        sender_id: impl Into<String>,
        target_user_id: impl Into<String>,
    ) -> Self {
        let mut msg = Self::new(session_id, sender_id, ActionType::LeadershipTransfer);
        msg.target_user_id = Some(target_user_id.into());
        msg
    }

    /// An annotation ADD built from a record
    ///
    /// The record's id is intentionally not copied into the payload: the
    /// authoritative id is assigned by the registry when the action is
    /// confirmed, and a provisional id never leaves the client.
    pub fn annotation_add(
        session_id: i64,
        sender_id: impl Into<String>,
        record: &AnnotationRecord,
    ) -> Self {
        let mut msg = Self::new(session_id, sender_id, ActionType::Add);
        msg.annotation_type = match record.body {
            AnnotationBody::Highlight { .. } => AnnotationType::Highlight,
            AnnotationBody::Comment { .. } => AnnotationType::Comment,
        };
        msg.payload.page = record.page;
        msg.payload.snippet = Some(record.snippet.clone());
        msg.payload.coordinates = Some(record.coordinates);
        match &record.body {
            AnnotationBody::Highlight { color } => msg.payload.color = Some(color.clone()),
            AnnotationBody::Comment { text } => msg.payload.text = Some(text.clone()),
        }
        msg
    }

    /// A comment text edit addressed by authoritative id
    pub fn annotation_update(
        session_id: i64,
        sender_id: impl Into<String>,
        id: i64,
        text: impl Into<String>,
    ) -> Self {
        let mut msg = Self::new(session_id, sender_id, ActionType::Update);
        msg.annotation_type = AnnotationType::Comment;
        msg.payload.id = Some(id);
        msg.payload.text = Some(text.into());
        msg
    }

    /// An annotation DELETE addressed by authoritative id
    pub fn annotation_delete(session_id: i64, sender_id: impl Into<String>, id: i64) -> Self {
        let mut msg = Self::new(session_id, sender_id, ActionType::Delete);
        msg.payload.id = Some(id);
        msg
    }

    /// Build the annotation record described by this message's payload
    ///
    /// Returns `None` when the payload is not a well-formed HIGHLIGHT or
    /// COMMENT (missing geometry, missing color/text). The resulting record
    /// carries `payload.id` when present, otherwise 0; callers assign the
    /// real id.
    pub fn annotation_record(&self) -> Option<AnnotationRecord> {
        let coordinates = self.payload.coordinates?;
        let body = match self.annotation_type {
            AnnotationType::Highlight => AnnotationBody::Highlight {
                color: self.payload.color.clone()?,
            },
            AnnotationType::Comment => AnnotationBody::Comment {
                text: self.payload.text.clone()?,
            },
            _ => return None,
        };
        Some(AnnotationRecord {
            id: self.payload.id.unwrap_or(0),
            page: self.payload.page,
            snippet: self.payload.snippet.clone().unwrap_or_default(),
            body,
            coordinates,
            author_id: self.sender_id.clone(),
        })
    }
}
