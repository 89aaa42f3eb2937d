//! Snapshots: the live file set at one version.
//!
//! A snapshot is built by replaying log entries in order from version 0 or
//! from a checkpoint. [`Snapshot::apply`] is the only state transition, so a
//! snapshot at version N is the same for every reader.
//!
//! Besides live files a snapshot tracks what the roles need to decide
//! without rescanning the log:
//! - tombstones with the version and time of removal (vacuum)
//! - digests of every ingest batch ever committed (writer idempotency)
//! - the last compaction time (compactor time trigger)

use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TableError};
use crate::log::{DataFileRef, LogEntry, Operation, TableMetadata, Version};

/// A live data file and the version that added it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveFile {
    /// The file.
    #[serde(flatten)]
    pub file: DataFileRef,
    /// Version of the entry that added it.
    pub added_version: Version,
}

/// A file removed from the live set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tombstone {
    /// The removed file.
    #[serde(flatten)]
    pub file: DataFileRef,
    /// Version of the entry that removed it.
    pub removed_version: Version,
    /// Timestamp of that entry.
    pub removed_at: DateTime<Utc>,
}

/// Table state at one version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    version: Version,
    timestamp: DateTime<Utc>,
    metadata: TableMetadata,
    files: BTreeMap<String, LiveFile>,
    tombstones: BTreeMap<String, Tombstone>,
    committed_batches: BTreeSet<String>,
    last_compaction: Option<DateTime<Utc>>,
}

impl Snapshot {
    /// Builds the version 0 snapshot from the table-creation entry.
    ///
    /// # Errors
    ///
    /// Returns `TableError::CorruptLog` if `entry` is not a version 0
    /// `CreateTable` entry.
    pub fn genesis(path: &str, entry: &LogEntry) -> Result<Self> {
        let Operation::CreateTable { metadata } = &entry.operation else {
            return Err(TableError::corrupt(path, "version 0 does not create the table"));
        };
        if entry.version != 0 {
            return Err(TableError::corrupt(path, "table creation must be version 0"));
        }
        let mut snapshot = Self {
            version: 0,
            timestamp: entry.timestamp,
            metadata: metadata.clone(),
            files: BTreeMap::new(),
            tombstones: BTreeMap::new(),
            committed_batches: BTreeSet::new(),
            last_compaction: None,
        };
        snapshot.apply_files(path, entry)?;
        Ok(snapshot)
    }

    /// Applies the next entry.
    ///
    /// # Errors
    ///
    /// Returns `TableError::CorruptLog` if the entry does not directly follow
    /// this snapshot, re-creates the table, removes a file that is not live,
    /// or adds a file that already is.
    pub fn apply(&mut self, path: &str, entry: &LogEntry) -> Result<()> {
        if entry.version != self.version + 1 {
            return Err(TableError::corrupt(
                path,
                format!(
                    "entry {} cannot follow snapshot at version {}",
                    entry.version, self.version
                ),
            ));
        }
        if matches!(entry.operation, Operation::CreateTable { .. }) {
            return Err(TableError::corrupt(path, "table created twice"));
        }
        self.apply_files(path, entry)?;
        self.version = entry.version;
        self.timestamp = entry.timestamp;
        if matches!(entry.operation, Operation::Compact) {
            self.last_compaction = Some(entry.timestamp);
        }
        Ok(())
    }

    /// Validates before mutating so a rejected entry leaves `self` intact.
    fn apply_files(&mut self, path: &str, entry: &LogEntry) -> Result<()> {
        if let Some(removed) = entry.remove.iter().find(|r| !self.files.contains_key(&r.path)) {
            return Err(TableError::corrupt(
                path,
                format!("removes {} which is not live", removed.path),
            ));
        }
        if let Some(added) = entry.add.iter().find(|a| {
            self.files.contains_key(&a.path) && !entry.remove.iter().any(|r| r.path == a.path)
        }) {
            return Err(TableError::corrupt(
                path,
                format!("adds {} which is already live", added.path),
            ));
        }

        for removed in &entry.remove {
            self.files.remove(&removed.path);
            self.tombstones.insert(
                removed.path.clone(),
                Tombstone {
                    file: removed.clone(),
                    removed_version: entry.version,
                    removed_at: entry.timestamp,
                },
            );
        }
        for added in &entry.add {
            self.tombstones.remove(&added.path);
            self.committed_batches
                .extend(added.source_batches.iter().cloned());
            self.files.insert(
                added.path.clone(),
                LiveFile {
                    file: added.clone(),
                    added_version: entry.version,
                },
            );
        }
        Ok(())
    }

    /// Version of this snapshot.
    #[must_use]
    pub fn version(&self) -> Version {
        self.version
    }

    /// Timestamp of the entry at this version.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Table metadata.
    #[must_use]
    pub fn metadata(&self) -> &TableMetadata {
        &self.metadata
    }

    /// Live files in path order.
    pub fn files(&self) -> impl Iterator<Item = &DataFileRef> {
        self.files.values().map(|live| &live.file)
    }

    /// Live files with the version that added them.
    pub fn live_files(&self) -> impl Iterator<Item = &LiveFile> {
        self.files.values()
    }

    /// Live file by path.
    #[must_use]
    pub fn file(&self, path: &str) -> Option<&DataFileRef> {
        self.files.get(path).map(|live| &live.file)
    }

    /// Whether `path` is live.
    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    /// Number of live files.
    #[must_use]
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Total live rows.
    #[must_use]
    pub fn row_count(&self) -> u64 {
        self.files().map(|f| f.row_count).sum()
    }

    /// Total live bytes.
    #[must_use]
    pub fn byte_size(&self) -> u64 {
        self.files().map(|f| f.size_bytes).sum()
    }

    /// Live files of one partition (`None` for unpartitioned files).
    pub fn partition_files<'a>(
        &'a self,
        partition: Option<&'a str>,
    ) -> impl Iterator<Item = &'a LiveFile> + 'a {
        self.files
            .values()
            .filter(move |live| live.file.partition.as_deref() == partition)
    }

    /// Distinct partitions among live files.
    #[must_use]
    pub fn partitions(&self) -> BTreeSet<Option<String>> {
        self.files().map(|f| f.partition.clone()).collect()
    }

    /// Files removed at or before this version.
    pub fn tombstones(&self) -> impl Iterator<Item = &Tombstone> {
        self.tombstones.values()
    }

    /// Whether a path was ever referenced by the log up to this version.
    #[must_use]
    pub fn knows(&self, path: &str) -> bool {
        self.files.contains_key(path) || self.tombstones.contains_key(path)
    }

    /// Whether a batch with this digest has been committed.
    #[must_use]
    pub fn is_batch_committed(&self, digest: &str) -> bool {
        self.committed_batches.contains(digest)
    }

    /// Time of the most recent compaction commit.
    #[must_use]
    pub fn last_compaction(&self) -> Option<DateTime<Utc>> {
        self.last_compaction
    }

    /// Serializes the snapshot as a checkpoint.
    ///
    /// # Errors
    ///
    /// Returns `TableError::Serialization` if encoding fails.
    pub fn to_checkpoint(&self) -> Result<Bytes> {
        serde_json::to_vec(self).map(Bytes::from).map_err(|e| {
            TableError::serialization(format!("encode checkpoint {}: {e}", self.version))
        })
    }

    /// Parses a checkpoint that must hold `version`.
    ///
    /// # Errors
    ///
    /// Returns `TableError::CorruptLog` if the bytes do not parse or hold a
    /// different version.
    pub fn from_checkpoint(path: &str, version: Version, data: &[u8]) -> Result<Self> {
        let snapshot: Self = serde_json::from_slice(data)
            .map_err(|e| TableError::corrupt(path, format!("unparseable checkpoint: {e}")))?;
        if snapshot.version != version {
            return Err(TableError::corrupt(
                path,
                format!("checkpoint claims version {}", snapshot.version),
            ));
        }
        Ok(snapshot)
    }
}
