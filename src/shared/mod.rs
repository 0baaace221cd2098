//! Shared Types Module
//!
//! Types shared between the server-side session registry and the client
//! runtime. Everything here is transport-agnostic data: the session domain
//! model, the `SyncMessage` wire envelope, and the shared error taxonomy.

/// Session domain model: participants, reading modes, annotations
pub mod model;

/// Wire envelope and payload types for the sync stream
pub mod message;

/// Shared error types
pub mod error;

// Re-export the types used throughout both backend and client
pub use error::SyncError;
pub use message::{ActionType, AnnotationType, ParticipantsSnapshot, SyncMessage, SyncPayload};
pub use model::{AnnotationBody, AnnotationRecord, Coordinates, Participant, ReadingMode};
