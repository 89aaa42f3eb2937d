//! Transaction log: entry format and storage access.
//!
//! Each version is one immutable JSON object at `_log/{version:020}.json`,
//! published with put-if-absent. The log is the only source of truth for
//! table state; checkpoints are derived data and may be missing or stale.
//!
//! ## Discovering the latest version
//!
//! Listings may lag recent writes, so the listed maximum is only a lower
//! bound. [`TransactionLog::latest_version`] probes `max + 1, max + 2, ...`
//! with HEAD (read-after-write consistent) until a key is missing.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use lakelog_core::{CommitId, StorageBackend, WritePrecondition, WriteResult};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TableError};
use crate::paths::{LogKey, TablePaths};

/// Log version. Version 0 creates the table.
pub type Version = u64;

/// Who authored a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MutatorRole {
    /// Appends new data.
    Writer,
    /// Rewrites small files.
    Compactor,
    /// Administrative actions such as table creation.
    Admin,
}

impl std::fmt::Display for MutatorRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Writer => "writer",
            Self::Compactor => "compactor",
            Self::Admin => "admin",
        })
    }
}

/// How a write treats existing data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WriteMode {
    /// Add files; never removes anything.
    #[default]
    Append,
    /// Replace the live files of every partition the write touches.
    Overwrite,
}

/// Static table properties recorded in the version 0 entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableMetadata {
    /// Logical table name.
    pub name: String,
    /// Column whose value partitions data files, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_column: Option<String>,
    /// Column names of the table schema, in order.
    #[serde(default)]
    pub columns: Vec<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl TableMetadata {
    /// Creates metadata for a new table.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            partition_column: None,
            columns: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Sets the partition column.
    #[must_use]
    pub fn with_partition_column(mut self, column: impl Into<String>) -> Self {
        self.partition_column = Some(column.into());
        self
    }

    /// Sets the schema column names.
    #[must_use]
    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }
}

/// What a log entry does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Operation {
    /// Creates the table (version 0 only).
    CreateTable {
        /// Table properties.
        metadata: TableMetadata,
    },
    /// Adds data, possibly replacing existing files.
    Write {
        /// Append or overwrite.
        mode: WriteMode,
    },
    /// Replaces small files with larger ones holding the same rows.
    Compact,
}

impl Operation {
    /// Short name for logs and metrics.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateTable { .. } => "create_table",
            Self::Write {
                mode: WriteMode::Append,
            } => "append",
            Self::Write {
                mode: WriteMode::Overwrite,
            } => "overwrite",
            Self::Compact => "compact",
        }
    }
}

/// Reference to one immutable data file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataFileRef {
    /// Object key.
    pub path: String,
    /// Object size in bytes.
    pub size_bytes: u64,
    /// Number of rows.
    pub row_count: u64,
    /// Partition value, if the table is partitioned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<String>,
    /// SHA-256 of the object content, hex encoded.
    pub fingerprint: String,
    /// Digests of the ingest batches whose rows this file first committed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_batches: Vec<String>,
}

/// Aggregate statistics of one entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitStats {
    /// Rows added.
    pub rows_added: u64,
    /// Rows removed.
    pub rows_removed: u64,
    /// Bytes added.
    pub bytes_added: u64,
    /// Bytes removed.
    pub bytes_removed: u64,
}

impl CommitStats {
    /// Computes stats for the given file lists.
    #[must_use]
    pub fn compute(add: &[DataFileRef], remove: &[DataFileRef]) -> Self {
        Self {
            rows_added: add.iter().map(|f| f.row_count).sum(),
            rows_removed: remove.iter().map(|f| f.row_count).sum(),
            bytes_added: add.iter().map(|f| f.size_bytes).sum(),
            bytes_removed: remove.iter().map(|f| f.size_bytes).sum(),
        }
    }
}

/// One immutable commit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    /// Version of this entry.
    pub version: Version,
    /// Version the author's proposal was computed against.
    pub base_version: Option<Version>,
    /// Identifier chosen by the author.
    pub commit_id: CommitId,
    /// Author role.
    pub role: MutatorRole,
    /// What the entry does.
    pub operation: Operation,
    /// Commit time. Never earlier than the previous entry's timestamp.
    pub timestamp: DateTime<Utc>,
    /// Files added.
    #[serde(default)]
    pub add: Vec<DataFileRef>,
    /// Files tombstoned.
    #[serde(default)]
    pub remove: Vec<DataFileRef>,
    /// Aggregate statistics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<CommitStats>,
    /// Fencing token of the lock held while publishing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fencing_token: Option<u64>,
}

impl LogEntry {
    /// Serializes the entry.
    ///
    /// # Errors
    ///
    /// Returns `TableError::Serialization` if encoding fails.
    pub fn encode(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| TableError::serialization(format!("encode entry {}: {e}", self.version)))
    }

    /// Parses the entry stored at `path`, which must hold `version`.
    ///
    /// # Errors
    ///
    /// Returns `TableError::CorruptLog` if the bytes do not parse or hold a
    /// different version.
    pub fn decode(path: &str, version: Version, data: &[u8]) -> Result<Self> {
        let entry: Self = serde_json::from_slice(data)
            .map_err(|e| TableError::corrupt(path, format!("unparseable entry: {e}")))?;
        if entry.version != version {
            return Err(TableError::corrupt(
                path,
                format!("entry claims version {}", entry.version),
            ));
        }
        Ok(entry)
    }

    /// Rows added minus rows removed.
    #[must_use]
    pub fn net_rows(&self) -> i128 {
        let added: u64 = self.add.iter().map(|f| f.row_count).sum();
        let removed: u64 = self.remove.iter().map(|f| f.row_count).sum();
        i128::from(added) - i128::from(removed)
    }
}

/// Result of publishing an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Publish {
    /// The entry is now part of the log.
    Published,
    /// Another entry already occupies the version.
    VersionTaken,
}

/// Storage access for one table's log.
#[derive(Clone)]
pub struct TransactionLog {
    storage: Arc<dyn StorageBackend>,
    paths: TablePaths,
}

impl std::fmt::Debug for TransactionLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionLog")
            .field("root", &self.paths.root())
            .finish_non_exhaustive()
    }
}

impl TransactionLog {
    /// Creates a log accessor.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>, paths: TablePaths) -> Self {
        Self { storage, paths }
    }

    /// Table paths.
    #[must_use]
    pub fn paths(&self) -> &TablePaths {
        &self.paths
    }

    /// Lists log keys in ascending order. May miss recent writes.
    ///
    /// # Errors
    ///
    /// Returns storage errors.
    pub async fn list_keys(&self) -> Result<Vec<LogKey>> {
        let mut keys: Vec<LogKey> = self
            .storage
            .list(&self.paths.log_prefix())
            .await?
            .iter()
            .filter_map(|meta| self.paths.parse_log_key(&meta.path))
            .collect();
        keys.sort_unstable();
        Ok(keys)
    }

    /// Returns the latest published version, or `None` if the table does
    /// not exist.
    ///
    /// # Errors
    ///
    /// Returns storage errors.
    pub async fn latest_version(&self) -> Result<Option<Version>> {
        let listed = self
            .list_keys()
            .await?
            .into_iter()
            .filter_map(|key| match key {
                LogKey::Entry(v) => Some(v),
                LogKey::Checkpoint(_) => None,
            })
            .max();
        self.probe_forward(listed).await
    }

    /// Probes forward from a known version for entries a listing missed.
    ///
    /// # Errors
    ///
    /// Returns storage errors.
    pub async fn probe_forward(&self, known: Option<Version>) -> Result<Option<Version>> {
        let mut latest = known;
        loop {
            let next = latest.map_or(0, |v| v + 1);
            if self.storage.head(&self.paths.log_entry(next)).await?.is_some() {
                latest = Some(next);
            } else {
                return Ok(latest);
            }
        }
    }

    /// Reads the entry at `version`, or `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns `TableError::CorruptLog` if the entry exists but does not
    /// parse, and storage errors.
    pub async fn read_entry(&self, version: Version) -> Result<Option<LogEntry>> {
        let path = self.paths.log_entry(version);
        match self.storage.get(&path).await {
            Ok(data) => LogEntry::decode(&path, version, &data).map(Some),
            Err(lakelog_core::Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Reads an entry that must exist because a later version does.
    ///
    /// # Errors
    ///
    /// Returns `TableError::CorruptLog` for a gap, plus everything
    /// [`read_entry`](Self::read_entry) returns.
    pub async fn read_required(&self, version: Version) -> Result<LogEntry> {
        self.read_entry(version).await?.ok_or_else(|| {
            TableError::corrupt(
                self.paths.log_entry(version),
                "entry missing below the latest version",
            )
        })
    }

    /// Publishes `entry` at its version with put-if-absent.
    ///
    /// # Errors
    ///
    /// Returns storage and serialization errors.
    pub async fn publish(&self, entry: &LogEntry) -> Result<Publish> {
        let path = self.paths.log_entry(entry.version);
        match self
            .storage
            .put(&path, entry.encode()?, WritePrecondition::DoesNotExist)
            .await?
        {
            WriteResult::Success { .. } => Ok(Publish::Published),
            WriteResult::PreconditionFailed { .. } => Ok(Publish::VersionTaken),
        }
    }

    /// Reads raw bytes of a log object.
    pub(crate) async fn read_raw(&self, path: &str) -> Result<Option<Bytes>> {
        match self.storage.get(path).await {
            Ok(data) => Ok(Some(data)),
            Err(lakelog_core::Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes a log-side object with put-if-absent, reporting whether it was
    /// created.
    pub(crate) async fn put_if_absent(&self, path: &str, data: Bytes) -> Result<bool> {
        Ok(self
            .storage
            .put(path, data, WritePrecondition::DoesNotExist)
            .await?
            .is_success())
    }
}

#[cfg(test)]
mod tests {
    use lakelog_core::MemoryBackend;

    use super::*;

    fn entry(version: Version) -> LogEntry {
        LogEntry {
            version,
            base_version: version.checked_sub(1),
            commit_id: CommitId::generate(),
            role: MutatorRole::Writer,
            operation: Operation::Write {
                mode: WriteMode::Append,
            },
            timestamp: Utc::now(),
            add: vec![DataFileRef {
                path: format!("t/data/_default/part-{version}.parquet"),
                size_bytes: 100,
                row_count: 10,
                partition: None,
                fingerprint: "ab".repeat(32),
                source_batches: vec!["k".into()],
            }],
            remove: Vec::new(),
            stats: None,
            fencing_token: Some(1),
        }
    }

    fn log() -> (Arc<MemoryBackend>, TransactionLog) {
        let storage = Arc::new(MemoryBackend::new());
        let log = TransactionLog::new(storage.clone(), TablePaths::new("t"));
        (storage, log)
    }

    #[test]
    fn entry_json_uses_tagged_operation() {
        let json = serde_json::to_value(entry(3)).expect("serialize");
        assert_eq!(json["operation"]["type"], "write");
        assert_eq!(json["operation"]["mode"], "append");
        assert_eq!(json["role"], "writer");
        assert_eq!(json["add"][0]["rowCount"], 10);
    }

    #[test]
    fn decode_rejects_mismatched_version_and_garbage() {
        let bytes = entry(3).encode().expect("encode");
        assert!(LogEntry::decode("p", 3, &bytes).is_ok());
        assert!(matches!(
            LogEntry::decode("p", 4, &bytes),
            Err(TableError::CorruptLog { .. })
        ));
        assert!(matches!(
            LogEntry::decode("p", 3, b"{not json"),
            Err(TableError::CorruptLog { .. })
        ));
    }

    #[tokio::test]
    async fn publish_is_put_if_absent() {
        let (_, log) = log();
        assert_eq!(log.publish(&entry(0)).await.expect("publish"), Publish::Published);
        assert_eq!(
            log.publish(&entry(0)).await.expect("publish"),
            Publish::VersionTaken
        );
        assert_eq!(log.latest_version().await.expect("latest"), Some(0));
    }

    #[tokio::test]
    async fn latest_version_on_empty_table_is_none() {
        let (_, log) = log();
        assert_eq!(log.latest_version().await.expect("latest"), None);
        assert!(log.read_entry(0).await.expect("read").is_none());
    }

    #[tokio::test]
    async fn probe_finds_entries_missing_from_listing() {
        let (_, log) = log();
        for v in 0..4 {
            log.publish(&entry(v)).await.expect("publish");
        }
        // A stale lower bound still reaches the true latest version.
        assert_eq!(log.probe_forward(Some(1)).await.expect("probe"), Some(3));
        assert_eq!(log.probe_forward(None).await.expect("probe"), Some(3));
    }

    #[tokio::test]
    async fn read_required_reports_gap_as_corruption() {
        let (_, log) = log();
        log.publish(&entry(0)).await.expect("publish");
        log.publish(&entry(2)).await.expect("publish");
        assert!(matches!(
            log.read_required(1).await,
            Err(TableError::CorruptLog { .. })
        ));
    }

    #[tokio::test]
    async fn unparseable_entry_is_corrupt_not_missing() {
        let (storage, log) = log();
        storage
            .put(
                &log.paths().log_entry(0),
                Bytes::from_static(b"\x00\x01"),
                WritePrecondition::DoesNotExist,
            )
            .await
            .expect("put");
        assert!(matches!(
            log.read_entry(0).await,
            Err(TableError::CorruptLog { .. })
        ));
    }
}
