//! Shared Error Types
//!
//! Error types used on both the server and the client side of the sync
//! stream. All variants are `Send + Sync` and can cross task boundaries.
//!
//! # Error Categories
//!
//! - `SerializationError` - JSON encode/decode failures on the stream
//! - `ValidationError` - a message failed envelope validation
//! - `TransferRejected` - a leadership transfer was refused (soft warning)
//! - `ConnectionError` - transport-level failures on the client side
//! - `SessionClosed` - the session or stream was closed underneath a caller
use thiserror::Error;

/// Errors that can occur on either end of the sync stream
#[derive(Debug, Error, Clone)]
pub enum SyncError {
    /// JSON serialization or deserialization error
    #[error("Serialization error: {message}")]
    SerializationError {
        /// Human-readable error message
        message: String,
    },

    /// Envelope validation error
    #[error("Validation error in field '{field}': {message}")]
    ValidationError {
        /// The field that failed validation
        field: String,
        /// Human-readable error message
        message: String,
    },

    /// A leadership transfer request was refused
    ///
    /// Not fatal: clients surface this as a soft warning and the session
    /// state is unchanged.
    #[error("Leadership transfer rejected: {reason}")]
    TransferRejected { reason: String },

    /// Transport-level failure on the client connection
    #[error("Connection error: {message}")]
    ConnectionError { message: String },

    /// The session or its stream has been closed
    #[error("Session closed")]
    SessionClosed,
}

impl SyncError {
    /// Create a new serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }

    /// Create a new validation error
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ValidationError {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new transfer-rejected error
    pub fn transfer_rejected(reason: impl Into<String>) -> Self {
        Self::TransferRejected {
            reason: reason.into(),
        }
    }

    /// Create a new connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::ConnectionError {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(format!("JSON error: {}", err))
    }
}
