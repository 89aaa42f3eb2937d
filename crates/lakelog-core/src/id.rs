//! Strongly-typed identifiers.
//!
//! Both identifiers are ULIDs: sortable by creation time and unique without
//! coordination between processes.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::{Error, Result};

/// Identity of one lock holder (one process incarnation of a mutator role).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HolderId(Ulid);

impl HolderId {
    /// Generates a new unique holder ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Returns the underlying ULID.
    #[must_use]
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl fmt::Display for HolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for HolderId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|e| Error::InvalidId {
                message: format!("invalid holder ID '{s}': {e}"),
            })
    }
}

/// Identifier attached to every log entry.
///
/// Distinct from the entry's version: the commit ID is chosen before the
/// version is known and survives conflict retries unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommitId(Ulid);

impl CommitId {
    /// Generates a new unique commit ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Creates a commit ID from a raw ULID.
    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Returns the creation timestamp encoded in the ID.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        let ms = i64::try_from(self.0.timestamp_ms()).unwrap_or(i64::MAX);
        DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CommitId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|e| Error::InvalidId {
                message: format!("invalid commit ID '{s}': {e}"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn holder_ids_are_unique_and_parse_back() {
        let a = HolderId::generate();
        let b = HolderId::generate();
        assert_ne!(a, b);
        let parsed: HolderId = a.to_string().parse().expect("parse");
        assert_eq!(parsed, a);
    }

    #[test]
    fn commit_id_rejects_garbage() {
        let err = "not-a-ulid".parse::<CommitId>().expect_err("invalid");
        assert!(matches!(err, Error::InvalidId { .. }));
    }

    #[test]
    fn commit_id_serializes_transparently() {
        let id = CommitId::generate();
        let json = serde_json::to_string(&id).expect("serialize");
        assert_eq!(json, format!("\"{id}\""));
        let age = Utc::now() - id.created_at();
        assert!(age.num_seconds() < 5);
    }
}
