//! Error types for the disconnected state core.

use crate::version::Conflict;
use dstate_protocol::{FieldId, Key, ProtocolError};
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur while working with disconnected state.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Captured versions no longer match the store.
    #[error("version conflict on {} entity(ies)", .conflicts.len())]
    VersionConflict {
        /// One entry per conflicting entity.
        conflicts: Vec<Conflict>,
    },

    /// A removal was denied because the entity is still referenced.
    #[error("cannot remove {key}: referenced by {referenced_by} through {field}")]
    ReferentialIntegrity {
        /// Entity whose removal was attempted.
        key: Key,
        /// Entity still holding the reference.
        referenced_by: Key,
        /// Field holding the reference.
        field: FieldId,
    },

    /// The call needs a store round trip outside a connect scope.
    #[error("connection required: {message}")]
    ConnectionRequired {
        /// What would have been fetched.
        message: String,
    },

    /// Operation not permitted in the current state.
    #[error("invalid state: {message}")]
    InvalidState {
        /// Description of why the operation is invalid.
        message: String,
    },

    /// Entity not found in the cache or the store.
    #[error("entity not found: {key}")]
    EntityNotFound {
        /// The missing key.
        key: Key,
    },

    /// A type or field does not match the schema.
    #[error("schema error: {message}")]
    Schema {
        /// Description of the mismatch.
        message: String,
    },

    /// The backing store reported an error.
    #[error("store error: {message}")]
    Store {
        /// Error reported by the store.
        message: String,
    },

    /// Replay failed and the store transaction was rolled back.
    #[error("replay failed at operation {index}: {message}")]
    ReplayFailed {
        /// Position of the failing operation in the replayed batch.
        index: usize,
        /// Error reported by the store.
        message: String,
    },

    /// Protocol error (log, codec, or key mapping).
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl CoreError {
    /// Creates a connection required error.
    pub fn connection_required(message: impl Into<String>) -> Self {
        Self::ConnectionRequired {
            message: message.into(),
        }
    }

    /// Creates an invalid state error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Creates a schema error.
    pub fn schema(message: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
        }
    }

    /// Creates a store error.
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    /// Creates an entity not found error.
    pub fn not_found(key: &Key) -> Self {
        Self::EntityNotFound { key: key.clone() }
    }

    /// Returns true if the caller may refresh and retry the whole save.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::VersionConflict { .. } | CoreError::ReplayFailed { .. }
        )
    }
}
