//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while building, encoding, or decoding protocol data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Failed to encode a record body.
    #[error("encoding failed: {message}")]
    EncodingFailed {
        /// Description of the encoding error.
        message: String,
    },

    /// Failed to decode a record body.
    #[error("decoding failed: {message}")]
    DecodingFailed {
        /// Description of the decoding error.
        message: String,
    },

    /// The byte stream is not a serialized operation log.
    #[error("invalid log format: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },

    /// The log was written by an unsupported format version.
    #[error("unsupported log format version {found}")]
    UnsupportedVersion {
        /// Version found in the header.
        found: u16,
    },

    /// The trailing digest does not match the log contents.
    #[error("log digest mismatch")]
    DigestMismatch,

    /// A record carries an unknown operation tag.
    #[error("unknown operation tag {0}")]
    UnknownTag(u8),

    /// The checkpoint is not open in this log.
    #[error("unknown checkpoint {0}")]
    UnknownCheckpoint(u64),

    /// Checkpoints must be released innermost first.
    #[error("checkpoint {requested} released while {innermost} is still open")]
    CheckpointOrder {
        /// Checkpoint the caller tried to release.
        requested: u64,
        /// Innermost open checkpoint.
        innermost: u64,
    },

    /// A log with open checkpoints cannot leave its cycle.
    #[error("log has {count} open checkpoint(s)")]
    OpenCheckpoints {
        /// Number of open checkpoints.
        count: usize,
    },

    /// A key mapping entry would break the temporary-to-permanent bijection.
    #[error("invalid key mapping: {message}")]
    InvalidMapping {
        /// Description of the violation.
        message: String,
    },
}

impl ProtocolError {
    /// Creates an encoding failed error.
    pub fn encoding_failed(message: impl Into<String>) -> Self {
        Self::EncodingFailed {
            message: message.into(),
        }
    }

    /// Creates a decoding failed error.
    pub fn decoding_failed(message: impl Into<String>) -> Self {
        Self::DecodingFailed {
            message: message.into(),
        }
    }

    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Creates an invalid mapping error.
    pub fn invalid_mapping(message: impl Into<String>) -> Self {
        Self::InvalidMapping {
            message: message.into(),
        }
    }
}
