//! Error types for `lakelog-table`.
//!
//! A commit conflict is not an error: it is the `Conflict` variant of
//! [`CommitResult`](crate::coordinator::CommitResult). Everything here is
//! either retryable (`LockTimeout`, `StoreUnavailable`) or fatal for the
//! current operation.

use std::time::Duration;

/// Result type for table operations.
pub type Result<T> = std::result::Result<T, TableError>;

/// Table-level errors.
#[derive(Debug, thiserror::Error)]
pub enum TableError {
    /// The table's commit lock could not be acquired before the deadline.
    #[error("lock {key} held by {holder}, gave up after {waited:?}")]
    LockTimeout {
        /// Lock key.
        key: String,
        /// Last observed holder.
        holder: String,
        /// Time spent waiting.
        waited: Duration,
    },

    /// The lock expired or was taken over while a commit was in progress.
    #[error("commit lock lost: {message}")]
    LockLost {
        /// Details from the lock service.
        message: String,
    },

    /// The object store failed or timed out.
    #[error("object store unavailable: {message}")]
    StoreUnavailable {
        /// What was being attempted.
        message: String,
        /// The underlying storage error.
        #[source]
        source: lakelog_core::Error,
    },

    /// A log entry or checkpoint is unreadable, inconsistent or missing.
    #[error("corrupt log at {path}: {message}")]
    CorruptLog {
        /// The offending object.
        path: String,
        /// What is wrong with it.
        message: String,
    },

    /// A vacuum was requested with retention below the enforced floor.
    #[error("retention {requested:?} is below the minimum {floor:?}")]
    RetentionViolation {
        /// Requested retention.
        requested: Duration,
        /// Enforced floor.
        floor: Duration,
    },

    /// A data file or batch would be committed twice, or a deterministic
    /// data file path already holds different content.
    #[error("idempotency violation for {path}: {message}")]
    IdempotencyViolation {
        /// File path or batch key involved.
        path: String,
        /// Details.
        message: String,
    },

    /// Commits kept conflicting after the configured number of rebases.
    #[error("gave up after {attempts} consecutive commit conflicts")]
    ConflictRetriesExhausted {
        /// Conflicts observed.
        attempts: u32,
    },

    /// The proposal is malformed or inconsistent with its base snapshot.
    #[error("invalid proposal: {message}")]
    InvalidProposal {
        /// Details.
        message: String,
    },

    /// Configuration is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Details.
        message: String,
    },

    /// No table exists at the root (no version 0 entry).
    #[error("table not found at {root}")]
    TableNotFound {
        /// Table root.
        root: String,
    },

    /// A table already exists at the root.
    #[error("table already exists at {root}")]
    TableAlreadyExists {
        /// Table root.
        root: String,
    },

    /// The requested version or timestamp is outside the log.
    #[error("version not found: {message}")]
    VersionNotFound {
        /// Details.
        message: String,
    },

    /// A data file could not be encoded or decoded.
    #[error("data file error: {message}")]
    DataFile {
        /// Details.
        message: String,
    },

    /// JSON encoding failed.
    #[error("serialization error: {message}")]
    Serialization {
        /// Details.
        message: String,
    },

    /// Any other core error.
    #[error(transparent)]
    Core(lakelog_core::Error),
}

impl TableError {
    /// Returns true for failures worth retrying with backoff.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout { .. } | Self::StoreUnavailable { .. })
    }

    /// Returns true if the same input may succeed later: retryable errors
    /// plus a lost lock or persistent contention. Nothing was published.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.is_retryable()
            || matches!(
                self,
                Self::LockLost { .. } | Self::ConflictRetriesExhausted { .. }
            )
    }

    /// Creates a corrupt-log error.
    #[must_use]
    pub fn corrupt(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CorruptLog {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid-proposal error.
    #[must_use]
    pub fn invalid_proposal(message: impl Into<String>) -> Self {
        Self::InvalidProposal {
            message: message.into(),
        }
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a data file error.
    #[must_use]
    pub fn data_file(message: impl Into<String>) -> Self {
        Self::DataFile {
            message: message.into(),
        }
    }

    /// Creates an idempotency violation.
    #[must_use]
    pub fn idempotency(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::IdempotencyViolation {
            path: path.into(),
            message: message.into(),
        }
    }

    pub(crate) fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Short stable label for metrics and health reasons.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::LockTimeout { .. } => "lock_timeout",
            Self::LockLost { .. } => "lock_lost",
            Self::StoreUnavailable { .. } => "store_unavailable",
            Self::CorruptLog { .. } => "corrupt_log",
            Self::RetentionViolation { .. } => "retention_violation",
            Self::IdempotencyViolation { .. } => "idempotency_violation",
            Self::ConflictRetriesExhausted { .. } => "conflict_retries_exhausted",
            Self::InvalidProposal { .. } => "invalid_proposal",
            Self::Config { .. } => "config",
            Self::TableNotFound { .. } => "table_not_found",
            Self::TableAlreadyExists { .. } => "table_already_exists",
            Self::VersionNotFound { .. } => "version_not_found",
            Self::DataFile { .. } => "data_file",
            Self::Serialization { .. } => "serialization",
            Self::Core(_) => "core",
        }
    }
}

impl From<lakelog_core::Error> for TableError {
    fn from(err: lakelog_core::Error) -> Self {
        match err {
            lakelog_core::Error::LockTimeout {
                key,
                holder,
                waited,
            } => Self::LockTimeout {
                key,
                holder,
                waited,
            },
            e @ (lakelog_core::Error::Storage { .. } | lakelog_core::Error::Timeout { .. }) => {
                Self::StoreUnavailable {
                    message: e.to_string(),
                    source: e,
                }
            }
            lakelog_core::Error::Serialization { message } => Self::Serialization { message },
            other => Self::Core(other),
        }
    }
}
