//! Error types for Sediment
//!
//! This module defines the common error types used throughout the system.

use thiserror::Error;

/// Common result type for Sediment operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for Sediment
#[derive(Debug, Error)]
pub enum Error {
    // Consistency errors: fatal bugs, never retried
    #[error("path out of order: {prev:?} followed by {next:?}")]
    PathOrder { prev: String, next: String },

    #[error("malformed index stream: {0}")]
    MalformedIndex(String),

    #[error("index resolver paths out of sync: expected {expected:?}, got {actual:?}")]
    IndexDesync { expected: String, actual: String },

    #[error("fileset {0} is not primitive")]
    NotPrimitive(String),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    // Not-found errors: "never existed / collected" is distinct from I/O failure
    #[error("chunk not found: {0}")]
    ChunkNotFound(String),

    #[error("fileset not found: {0}")]
    FileSetNotFound(String),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("tracker record not found: {0}")]
    TrackerRecordNotFound(String),

    // Transient backend errors: retried with backoff at operation boundaries
    #[error("backend I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    // Task failure: a shard worker reported failure, aborts the compaction attempt
    #[error("shard task failed: {reason}")]
    TaskFailed { reason: String },

    // Internal errors
    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create an unavailable error
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a task failure error
    pub fn task_failed(reason: impl Into<String>) -> Self {
        Self::TaskFailed {
            reason: reason.into(),
        }
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::ChunkNotFound(_)
                | Self::FileSetNotFound(_)
                | Self::FileNotFound(_)
                | Self::TrackerRecordNotFound(_)
        )
    }

    /// Check if this is a retryable error
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Unavailable(_))
    }

    /// Check if this is a consistency error (a bug, never retried)
    #[must_use]
    pub fn is_consistency(&self) -> bool {
        matches!(
            self,
            Self::PathOrder { .. }
                | Self::MalformedIndex(_)
                | Self::IndexDesync { .. }
                | Self::NotPrimitive(_)
                | Self::ChecksumMismatch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_not_found() {
        assert!(Error::ChunkNotFound("abc".into()).is_not_found());
        assert!(Error::FileSetNotFound("id".into()).is_not_found());
        assert!(!Error::unavailable("down").is_not_found());
    }

    #[test]
    fn test_error_retryable() {
        assert!(Error::unavailable("down").is_retryable());
        assert!(!Error::FileSetNotFound("id".into()).is_retryable());
        assert!(
            !Error::PathOrder {
                prev: "/b".into(),
                next: "/a".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_error_consistency() {
        assert!(Error::MalformedIndex("bad".into()).is_consistency());
        assert!(
            Error::IndexDesync {
                expected: "/a".into(),
                actual: "/b".into()
            }
            .is_consistency()
        );
        assert!(!Error::ChunkNotFound("abc".into()).is_consistency());
    }
}
