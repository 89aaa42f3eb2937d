//! Read API: snapshots by version or time, and commit history.
//!
//! Readers take no locks. A snapshot at version N depends only on entries
//! `0..=N`, which are immutable, so it never changes once N exists.

use chrono::{DateTime, Utc};

use crate::error::{Result, TableError};
use crate::log::{LogEntry, Version};
use crate::snapshot::Snapshot;
use crate::table::Table;

/// Which snapshot to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionSpec {
    /// The latest committed version.
    Latest,
    /// An exact version.
    Version(Version),
    /// The last version committed at or before the instant.
    Timestamp(DateTime<Utc>),
}

/// Read-only access to one table.
#[derive(Debug, Clone)]
pub struct TableReader {
    table: Table,
}

impl TableReader {
    /// Creates a reader.
    #[must_use]
    pub fn new(table: Table) -> Self {
        Self { table }
    }

    /// The table.
    #[must_use]
    pub fn table(&self) -> &Table {
        &self.table
    }

    /// Latest committed version.
    ///
    /// # Errors
    ///
    /// Returns `TableNotFound` and storage errors.
    pub async fn latest_version(&self) -> Result<Version> {
        self.table.latest_version().await
    }

    /// Snapshot selected by `spec`.
    ///
    /// # Errors
    ///
    /// Returns `VersionNotFound` for a version beyond the latest or an
    /// instant before the table existed, plus `CorruptLog` and storage
    /// errors.
    pub async fn snapshot(&self, spec: VersionSpec) -> Result<Snapshot> {
        match spec {
            VersionSpec::Latest => self.table.latest_snapshot().await,
            VersionSpec::Version(version) => self.table.snapshot_at(version).await,
            VersionSpec::Timestamp(at) => {
                let version = self.version_at(at).await?;
                self.table.snapshot_at(version).await
            }
        }
    }

    /// Last version committed at or before `at`.
    ///
    /// # Errors
    ///
    /// Returns `VersionNotFound` if `at` precedes table creation.
    pub async fn version_at(&self, at: DateTime<Utc>) -> Result<Version> {
        let latest = self.table.latest_version().await?;
        last_version_at_or_before(&self.table, at, latest)
            .await?
            .ok_or_else(|| TableError::VersionNotFound {
                message: format!("table did not exist at {}", at.to_rfc3339()),
            })
    }

    /// Up to `limit` entries, newest first.
    ///
    /// # Errors
    ///
    /// Returns `TableNotFound`, `CorruptLog` and storage errors.
    pub async fn history(&self, limit: usize) -> Result<Vec<LogEntry>> {
        let latest = self.table.latest_version().await?;
        let mut entries = Vec::with_capacity(limit.min(64));
        for version in (0..=latest).rev().take(limit) {
            entries.push(self.table.log().read_required(version).await?);
        }
        Ok(entries)
    }
}

/// Binary search over `0..=latest` for the last entry with
/// `timestamp <= at`. Relies on entry timestamps being non-decreasing.
pub(crate) async fn last_version_at_or_before(
    table: &Table,
    at: DateTime<Utc>,
    latest: Version,
) -> Result<Option<Version>> {
    let log = table.log();
    if log.read_required(0).await?.timestamp > at {
        return Ok(None);
    }
    let (mut lo, mut hi) = (0, latest);
    while lo < hi {
        let mid = lo + (hi - lo).div_ceil(2);
        if log.read_required(mid).await?.timestamp <= at {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }
    Ok(Some(lo))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;
    use lakelog_core::{CommitId, MemoryBackend};

    use super::*;
    use crate::config::TableConfig;
    use crate::log::{DataFileRef, MutatorRole, Operation, TableMetadata, WriteMode};

    async fn table_with_entries(base: DateTime<Utc>, count: u64) -> Table {
        let table = Table::with_storage("t", Arc::new(MemoryBackend::new()), TableConfig::default());
        let mut metadata = TableMetadata::new("t");
        metadata.created_at = base;
        let genesis = LogEntry {
            version: 0,
            base_version: None,
            commit_id: CommitId::generate(),
            role: MutatorRole::Admin,
            operation: Operation::CreateTable { metadata },
            timestamp: base,
            add: Vec::new(),
            remove: Vec::new(),
            stats: None,
            fencing_token: None,
        };
        table.log().publish(&genesis).await.expect("publish");
        for v in 1..=count {
            let entry = LogEntry {
                version: v,
                base_version: Some(v - 1),
                role: MutatorRole::Writer,
                operation: Operation::Write {
                    mode: WriteMode::Append,
                },
                timestamp: base + Duration::minutes(i64::try_from(v).expect("small") * 10),
                add: vec![DataFileRef {
                    path: format!("t/data/_default/part-{v}.parquet"),
                    size_bytes: 10,
                    row_count: v,
                    partition: None,
                    fingerprint: v.to_string(),
                    source_batches: Vec::new(),
                }],
                ..genesis.clone()
            };
            table.log().publish(&entry).await.expect("publish");
        }
        table
    }

    #[tokio::test]
    async fn timestamp_resolves_to_last_version_at_or_before() {
        let base = Utc::now() - Duration::hours(1);
        let reader = TableReader::new(table_with_entries(base, 4).await);

        assert_eq!(reader.version_at(base).await.expect("v0"), 0);
        assert_eq!(
            reader.version_at(base + Duration::minutes(25)).await.expect("v2"),
            2
        );
        assert_eq!(
            reader.version_at(base + Duration::minutes(30)).await.expect("v3"),
            3
        );
        assert_eq!(reader.version_at(Utc::now()).await.expect("latest"), 4);
        assert!(matches!(
            reader.version_at(base - Duration::seconds(1)).await,
            Err(TableError::VersionNotFound { .. })
        ));

        let snapshot = reader
            .snapshot(VersionSpec::Timestamp(base + Duration::minutes(25)))
            .await
            .expect("snapshot");
        assert_eq!(snapshot.version(), 2);
        assert_eq!(snapshot.row_count(), 3);
    }

    #[tokio::test]
    async fn history_is_newest_first_and_limited() {
        let reader = TableReader::new(table_with_entries(Utc::now(), 5).await);
        let history = reader.history(3).await.expect("history");
        let versions: Vec<Version> = history.iter().map(|e| e.version).collect();
        assert_eq!(versions, vec![5, 4, 3]);
        assert_eq!(reader.history(100).await.expect("history").len(), 6);
    }

    #[tokio::test]
    async fn snapshot_by_version_is_stable() {
        let reader = TableReader::new(table_with_entries(Utc::now(), 3).await);
        let a = reader.snapshot(VersionSpec::Version(2)).await.expect("v2");
        let b = reader.snapshot(VersionSpec::Version(2)).await.expect("v2");
        assert_eq!(a, b);
        assert_eq!(reader.snapshot(VersionSpec::Latest).await.expect("latest").version(), 3);
        assert!(reader.snapshot(VersionSpec::Version(9)).await.is_err());
    }
}
