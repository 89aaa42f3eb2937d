//! Error types and result aliases shared by every lakelog crate.
//!
//! Storage and lock failures are classified here once so that callers can
//! decide between retrying locally and surfacing the failure.

use std::time::Duration;

/// The result type used throughout lakelog.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in core lakelog operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An invalid identifier was provided.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Description of what made the ID invalid.
        message: String,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A storage or lock call exceeded its deadline.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The deadline that was exceeded.
        after: Duration,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// A path or object was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A precondition for the operation was not met.
    #[error("precondition failed: {message}")]
    PreconditionFailed {
        /// Description of the failed precondition.
        message: String,
    },

    /// A lock could not be acquired before the acquisition deadline.
    #[error("lock {key} not acquired within {waited:?} (held by {holder})")]
    LockTimeout {
        /// The lock key.
        key: String,
        /// The last observed holder.
        holder: String,
        /// How long the caller waited.
        waited: Duration,
    },

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a new storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source cause.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Returns true if retrying the same call later may succeed.
    ///
    /// Storage failures, timeouts and lock timeouts are transient. Missing
    /// objects, bad input and corrupt payloads are not.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Storage { .. } | Self::Timeout { .. } | Self::LockTimeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(Error::storage("503").is_retryable());
        assert!(
            Error::Timeout {
                operation: "put".into(),
                after: Duration::from_secs(1),
            }
            .is_retryable()
        );
        assert!(!Error::NotFound("a".into()).is_retryable());
        assert!(!Error::serialization("bad json").is_retryable());
    }

    #[test]
    fn storage_with_source_keeps_cause() {
        let io = std::io::Error::other("connection reset");
        let err = Error::storage_with_source("put failed", io);
        let source = std::error::Error::source(&err).map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("connection reset"));
    }
}
