//! Table handle.
//!
//! A [`Table`] bundles everything a role needs to operate on one table:
//! storage, lock service, key layout and configuration. It is passed
//! explicitly; there is no process-wide registry.

use std::sync::Arc;

use chrono::Utc;
use lakelog_core::{
    CommitId, DistributedLock, LockService, ObjectStoreBackend, StorageBackend,
    StorageLockService, TimeoutBackend,
};

use crate::config::TableConfig;
use crate::error::{Result, TableError};
use crate::log::{LogEntry, MutatorRole, Operation, Publish, TableMetadata, TransactionLog, Version};
use crate::paths::{LogKey, TableLocation, TablePaths};
use crate::snapshot::Snapshot;

/// Handle to one table.
#[derive(Clone)]
pub struct Table {
    name: String,
    paths: TablePaths,
    storage: Arc<dyn StorageBackend>,
    locks: Arc<dyn LockService>,
    config: TableConfig,
    log: TransactionLog,
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.name)
            .field("root", &self.paths.root())
            .finish_non_exhaustive()
    }
}

impl Table {
    /// Creates a handle from explicit parts.
    #[must_use]
    pub fn new(
        root: impl Into<String>,
        storage: Arc<dyn StorageBackend>,
        locks: Arc<dyn LockService>,
        config: TableConfig,
    ) -> Self {
        let paths = TablePaths::new(root);
        let name = paths.root().to_string();
        let log = TransactionLog::new(Arc::clone(&storage), paths.clone());
        Self {
            name,
            paths,
            storage,
            locks,
            config,
            log,
        }
    }

    /// Creates a handle whose locks live in the same store as the table.
    #[must_use]
    pub fn with_storage(
        root: impl Into<String>,
        storage: Arc<dyn StorageBackend>,
        config: TableConfig,
    ) -> Self {
        let locks: Arc<dyn LockService> = Arc::new(StorageLockService::new(Arc::clone(&storage)));
        Self::new(root, storage, locks, config)
    }

    /// Opens a handle from a table URI such as `s3://bucket/warehouse/events`.
    ///
    /// Every store call is bounded by the configured store call timeout.
    ///
    /// # Errors
    ///
    /// Returns `TableError::Config` for an unsupported URI and store
    /// construction errors.
    pub fn open(uri: &str, config: TableConfig) -> Result<Self> {
        let location = TableLocation::parse(uri)?;
        let backend = ObjectStoreBackend::from_url(&location.store_url)?;
        let storage: Arc<dyn StorageBackend> =
            Arc::new(TimeoutBackend::new(backend, config.store_call_timeout()));
        Ok(Self::with_storage(location.root, storage, config))
    }

    /// Table name used in logs and metrics (the root prefix).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Key layout.
    #[must_use]
    pub fn paths(&self) -> &TablePaths {
        &self.paths
    }

    /// Object store.
    #[must_use]
    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    /// Lock service.
    #[must_use]
    pub fn locks(&self) -> &Arc<dyn LockService> {
        &self.locks
    }

    /// Configuration.
    #[must_use]
    pub fn config(&self) -> &TableConfig {
        &self.config
    }

    /// Transaction log access.
    #[must_use]
    pub fn log(&self) -> &TransactionLog {
        &self.log
    }

    /// A lock handle for `key` with the configured TTL, timeout and backoff.
    #[must_use]
    pub fn lock(&self, key: impl Into<String>) -> DistributedLock {
        DistributedLock::new(Arc::clone(&self.locks), key)
            .with_ttl(self.config.lock.ttl())
            .with_acquire_timeout(self.config.lock.acquire_timeout())
            .with_backoff(self.config.lock.backoff)
    }

    /// Creates the table by publishing version 0.
    ///
    /// # Errors
    ///
    /// Returns `TableError::TableAlreadyExists` if version 0 is already
    /// present, and storage errors.
    pub async fn create(&self, metadata: TableMetadata) -> Result<Snapshot> {
        let entry = LogEntry {
            version: 0,
            base_version: None,
            commit_id: CommitId::generate(),
            role: MutatorRole::Admin,
            operation: Operation::CreateTable { metadata },
            timestamp: Utc::now(),
            add: Vec::new(),
            remove: Vec::new(),
            stats: None,
            fencing_token: None,
        };
        match self.log.publish(&entry).await? {
            Publish::Published => {
                tracing::info!(table = %self.name, "table created");
                Snapshot::genesis(&self.paths.log_entry(0), &entry)
            }
            Publish::VersionTaken => Err(TableError::TableAlreadyExists {
                root: self.paths.root().to_string(),
            }),
        }
    }

    /// Whether version 0 exists.
    ///
    /// # Errors
    ///
    /// Returns storage errors.
    pub async fn exists(&self) -> Result<bool> {
        Ok(self.storage.head(&self.paths.log_entry(0)).await?.is_some())
    }

    /// Latest published version.
    ///
    /// # Errors
    ///
    /// Returns `TableError::TableNotFound` if the table does not exist, and
    /// storage errors.
    pub async fn latest_version(&self) -> Result<Version> {
        self.log
            .latest_version()
            .await?
            .ok_or_else(|| self.not_found())
    }

    /// Snapshot at the latest version.
    ///
    /// # Errors
    ///
    /// Returns `TableError::TableNotFound`, `CorruptLog` and storage errors.
    pub async fn latest_snapshot(&self) -> Result<Snapshot> {
        let keys = self.log.list_keys().await?;
        let mut snapshot = self.base_snapshot(&keys, Version::MAX).await?;
        self.advance(&mut snapshot).await?;
        Ok(snapshot)
    }

    /// Snapshot at exactly `version`.
    ///
    /// # Errors
    ///
    /// Returns `TableError::VersionNotFound` if `version` is beyond the
    /// latest version, `CorruptLog` for a gap or unparseable entry, and
    /// storage errors.
    pub async fn snapshot_at(&self, version: Version) -> Result<Snapshot> {
        let keys = self.log.list_keys().await?;
        let mut snapshot = self.base_snapshot(&keys, version).await?;
        while snapshot.version() < version {
            let next = snapshot.version() + 1;
            let path = self.paths.log_entry(next);
            match self.log.read_entry(next).await? {
                Some(entry) => snapshot.apply(&path, &entry)?,
                None if self.storage.head(&self.paths.log_entry(version)).await?.is_some() => {
                    return Err(TableError::corrupt(path, "entry missing below a later version"));
                }
                None => {
                    return Err(TableError::VersionNotFound {
                        message: format!(
                            "version {version} is beyond the latest version {}",
                            snapshot.version()
                        ),
                    });
                }
            }
        }
        Ok(snapshot)
    }

    /// Applies every entry published after `snapshot`, returning how many
    /// were applied.
    ///
    /// Reads `version + 1, version + 2, ...` directly, so it never depends
    /// on listing consistency.
    ///
    /// # Errors
    ///
    /// Returns `CorruptLog` and storage errors.
    pub async fn advance(&self, snapshot: &mut Snapshot) -> Result<u64> {
        let mut applied = 0;
        loop {
            let next = snapshot.version() + 1;
            let Some(entry) = self.log.read_entry(next).await? else {
                return Ok(applied);
            };
            snapshot.apply(&self.paths.log_entry(next), &entry)?;
            applied += 1;
        }
    }

    /// Writes a checkpoint for `snapshot` if its version is on the interval.
    ///
    /// Best effort: failures are logged and never returned.
    pub async fn maybe_checkpoint(&self, snapshot: &Snapshot) {
        let interval = self.config.checkpoint_interval;
        let version = snapshot.version();
        if interval == 0 || version == 0 || version % interval != 0 {
            return;
        }
        let path = self.paths.checkpoint(version);
        let result = match snapshot.to_checkpoint() {
            Ok(data) => self.log.put_if_absent(&path, data).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(true) => tracing::debug!(table = %self.name, version, "checkpoint written"),
            Ok(false) => {}
            Err(e) => tracing::warn!(
                table = %self.name,
                version,
                error = %e,
                "checkpoint write failed"
            ),
        }
    }

    /// Newest readable checkpoint at or below `upper`, else the genesis
    /// snapshot.
    async fn base_snapshot(&self, keys: &[LogKey], upper: Version) -> Result<Snapshot> {
        for key in keys.iter().rev() {
            let LogKey::Checkpoint(version) = *key else {
                continue;
            };
            if version > upper {
                continue;
            }
            let path = self.paths.checkpoint(version);
            let Some(data) = self.log.read_raw(&path).await? else {
                continue;
            };
            match Snapshot::from_checkpoint(&path, version, &data) {
                Ok(snapshot) => return Ok(snapshot),
                Err(e) => tracing::warn!(
                    table = %self.name,
                    path = %path,
                    error = %e,
                    "ignoring unreadable checkpoint"
                ),
            }
        }

        let path = self.paths.log_entry(0);
        let entry = self
            .log
            .read_entry(0)
            .await?
            .ok_or_else(|| self.not_found())?;
        Snapshot::genesis(&path, &entry)
    }

    fn not_found(&self) -> TableError {
        TableError::TableNotFound {
            root: self.paths.root().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use lakelog_core::{MemoryBackend, WritePrecondition};

    use super::*;
    use crate::log::{DataFileRef, WriteMode};

    fn table(checkpoint_interval: u64) -> Table {
        let config = TableConfig {
            checkpoint_interval,
            ..TableConfig::default()
        };
        Table::with_storage("t", Arc::new(MemoryBackend::new()), config)
    }

    fn append(version: Version, name: &str) -> LogEntry {
        LogEntry {
            version,
            base_version: Some(version - 1),
            commit_id: CommitId::generate(),
            role: MutatorRole::Writer,
            operation: Operation::Write {
                mode: WriteMode::Append,
            },
            timestamp: Utc::now(),
            add: vec![DataFileRef {
                path: format!("t/data/_default/part-{name}.parquet"),
                size_bytes: 10,
                row_count: 1,
                partition: None,
                fingerprint: name.to_string(),
                source_batches: Vec::new(),
            }],
            remove: Vec::new(),
            stats: None,
            fencing_token: None,
        }
    }

    #[tokio::test]
    async fn create_is_exclusive() {
        let table = table(10);
        assert!(!table.exists().await.expect("exists"));
        table.create(TableMetadata::new("events")).await.expect("create");
        assert!(table.exists().await.expect("exists"));
        assert!(matches!(
            table.create(TableMetadata::new("events")).await,
            Err(TableError::TableAlreadyExists { .. })
        ));
    }

    #[tokio::test]
    async fn missing_table_is_reported() {
        let table = table(10);
        assert!(matches!(
            table.latest_snapshot().await,
            Err(TableError::TableNotFound { .. })
        ));
        assert!(matches!(
            table.latest_version().await,
            Err(TableError::TableNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn snapshot_at_replays_and_rejects_future_versions() {
        let table = table(0);
        table.create(TableMetadata::new("events")).await.expect("create");
        for v in 1..=3 {
            table
                .log()
                .publish(&append(v, &format!("f{v}")))
                .await
                .expect("publish");
        }
        assert_eq!(table.snapshot_at(2).await.expect("v2").file_count(), 2);
        assert_eq!(table.latest_snapshot().await.expect("latest").version(), 3);
        assert!(matches!(
            table.snapshot_at(4).await,
            Err(TableError::VersionNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn checkpoint_is_used_and_corrupt_checkpoint_is_skipped() {
        let table = table(2);
        table.create(TableMetadata::new("events")).await.expect("create");
        for v in 1..=3 {
            table
                .log()
                .publish(&append(v, &format!("f{v}")))
                .await
                .expect("publish");
        }
        let at_two = table.snapshot_at(2).await.expect("v2");
        table.maybe_checkpoint(&at_two).await;
        assert!(
            table
                .storage()
                .head(&table.paths().checkpoint(2))
                .await
                .expect("head")
                .is_some()
        );
        assert_eq!(table.latest_snapshot().await.expect("latest").file_count(), 3);

        // An unreadable checkpoint falls back to the previous one.
        table
            .storage()
            .put(
                &table.paths().checkpoint(3),
                Bytes::from_static(b"garbage"),
                WritePrecondition::None,
            )
            .await
            .expect("put");
        let snapshot = table.latest_snapshot().await.expect("latest");
        assert_eq!(snapshot.version(), 3);
        assert_eq!(snapshot.file_count(), 3);
    }

    #[tokio::test]
    async fn gap_below_latest_is_corruption() {
        let table = table(0);
        table.create(TableMetadata::new("events")).await.expect("create");
        table.log().publish(&append(2, "f2")).await.expect("publish");
        assert!(matches!(
            table.snapshot_at(2).await,
            Err(TableError::CorruptLog { .. })
        ));
    }
}
