//! Writer: turns ingest batches into data files and commits them.
//!
//! ## Idempotency
//!
//! Every ingest batch carries an idempotency key. Its digest is recorded on
//! the data file that first commits the batch, so the snapshot knows every
//! batch ever committed. A restarted writer replaying its input skips those
//! batches. Data file paths derive from the digests of the batches they
//! hold, so re-uploading after a crash hits the same key: put-if-absent
//! either creates it or finds identical bytes. Different bytes at that key
//! are an `IdempotencyViolation`.
//!
//! ## Failure handling
//!
//! - `Conflict`: refresh the snapshot and re-propose immediately, bounded by
//!   `max_conflict_retries`. Appends commute, overwrites recompute their
//!   removals.
//! - `LockTimeout` / `StoreUnavailable`: retry with backoff up to
//!   `max_retries`, then report degraded health and keep the batches
//!   buffered.
//! - Anything else is fatal and returned.
//!
//! When the buffer reaches `max_buffered_batches` the run loop stops
//! draining its channel, so senders block.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use lakelog_core::{
    BackpressureDecision, BackpressureState, HealthReporter, WritePrecondition, WriteResult,
};
use tokio::sync::{mpsc, watch};

use crate::coordinator::{CommitCoordinator, CommitResult, Proposal};
use crate::datafile::{self, batch_digest, file_id_for_batches, sha256_hex};
use crate::error::{Result, TableError};
use crate::log::{DataFileRef, Version, WriteMode};
use crate::metrics;
use crate::snapshot::Snapshot;
use crate::table::Table;

/// Path and bytes of a data file found already uploaded.
type ReusedFile = (String, Bytes);

/// One unit of input.
#[derive(Debug, Clone)]
pub struct IngestBatch {
    /// Caller-chosen key; the same key is never committed twice.
    pub idempotency_key: String,
    /// Partition value, if the table is partitioned.
    pub partition: Option<String>,
    /// Rows.
    pub batch: RecordBatch,
}

impl IngestBatch {
    /// Creates an unpartitioned batch.
    #[must_use]
    pub fn new(idempotency_key: impl Into<String>, batch: RecordBatch) -> Self {
        Self {
            idempotency_key: idempotency_key.into(),
            partition: None,
            batch,
        }
    }

    /// Sets the partition.
    #[must_use]
    pub fn with_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = Some(partition.into());
        self
    }

    /// Digest of the idempotency key as recorded in the log.
    #[must_use]
    pub fn digest(&self) -> String {
        batch_digest(&self.idempotency_key)
    }

    /// Row count.
    #[must_use]
    pub fn rows(&self) -> usize {
        self.batch.num_rows()
    }
}

/// Outcome of one [`Writer::append`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteReport {
    /// Committed version, or `None` if every batch was already committed.
    pub version: Option<Version>,
    /// Files added.
    pub files_added: usize,
    /// Files removed (overwrite only).
    pub files_removed: usize,
    /// Rows committed.
    pub rows_written: u64,
    /// Batches committed.
    pub batches_committed: usize,
    /// Batches skipped as already committed.
    pub batches_skipped: usize,
    /// Conflicts resolved by rebasing.
    pub conflicts: u32,
}

/// Cumulative writer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterMetrics {
    /// Batches committed.
    pub batches: u64,
    /// Rows committed.
    pub rows: u64,
    /// Successful commits.
    pub commits: u64,
    /// Conflicts observed.
    pub conflicts: u64,
    /// Retries after retryable failures.
    pub retries: u64,
    /// Batches skipped as already committed.
    pub duplicates_skipped: u64,
    /// Latency of the most recent successful flush.
    pub last_commit_latency: Option<Duration>,
}

#[derive(Debug, Default)]
struct Counters {
    batches: AtomicU64,
    rows: AtomicU64,
    commits: AtomicU64,
    conflicts: AtomicU64,
    retries: AtomicU64,
    duplicates_skipped: AtomicU64,
    last_commit_latency_us: AtomicU64,
}

/// Writer for one table.
#[derive(Debug, Clone)]
pub struct Writer {
    coordinator: CommitCoordinator,
    mode: WriteMode,
    health: HealthReporter,
    counters: Arc<Counters>,
}

impl Writer {
    /// Creates an append writer whose lock wait per attempt is the
    /// configured commit SLA.
    #[must_use]
    pub fn new(table: Table) -> Self {
        let sla = table.config().writer.commit_sla();
        Self {
            coordinator: CommitCoordinator::new(table).with_acquire_timeout(sla),
            mode: WriteMode::Append,
            health: HealthReporter::new(),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Sets the write mode.
    #[must_use]
    pub fn with_mode(mut self, mode: WriteMode) -> Self {
        self.mode = mode;
        self
    }

    /// Publishes health on an existing reporter.
    #[must_use]
    pub fn with_health(mut self, health: HealthReporter) -> Self {
        self.health = health;
        self
    }

    /// Health reporter.
    #[must_use]
    pub fn health(&self) -> &HealthReporter {
        &self.health
    }

    /// The table.
    #[must_use]
    pub fn table(&self) -> &Table {
        self.coordinator.table()
    }

    /// Counter snapshot.
    #[must_use]
    pub fn metrics(&self) -> WriterMetrics {
        let c = &self.counters;
        let latency = c.last_commit_latency_us.load(Ordering::Relaxed);
        WriterMetrics {
            batches: c.batches.load(Ordering::Relaxed),
            rows: c.rows.load(Ordering::Relaxed),
            commits: c.commits.load(Ordering::Relaxed),
            conflicts: c.conflicts.load(Ordering::Relaxed),
            retries: c.retries.load(Ordering::Relaxed),
            duplicates_skipped: c.duplicates_skipped.load(Ordering::Relaxed),
            last_commit_latency: (latency > 0).then(|| Duration::from_micros(latency)),
        }
    }

    /// Writes and commits `batches` as one log entry.
    ///
    /// Batches are grouped by partition, one data file per group.
    ///
    /// # Errors
    ///
    /// Returns the last retryable error once retries are exhausted (health
    /// is then degraded), `ConflictRetriesExhausted` under persistent
    /// contention, and fatal errors (`CorruptLog`, `IdempotencyViolation`,
    /// `DataFile`) immediately.
    pub async fn append(&self, batches: &[IngestBatch]) -> Result<WriteReport> {
        let started = Instant::now();
        let policy = self.table().config().writer.retry_policy();
        let result = policy
            .retry("writer.commit", TableError::is_retryable, move |attempt| {
                if attempt > 1 {
                    self.counters.retries.fetch_add(1, Ordering::Relaxed);
                }
                self.commit_batches(batches)
            })
            .await;

        match &result {
            Ok(report) => {
                let latency = started.elapsed();
                self.record(report, latency);
                self.health.healthy();
                tracing::debug!(
                    table = %self.table().name(),
                    version = report.version,
                    rows = report.rows_written,
                    skipped = report.batches_skipped,
                    latency_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
                    metric = "writer_flush",
                    "flush committed"
                );
            }
            Err(e) => {
                metrics::record_error(self.table().name(), "writer", e.kind());
                self.health.degraded(format!("writer commit failed: {}", e.kind()));
                if e.is_transient() {
                    tracing::warn!(table = %self.table().name(), error = %e, "flush failed");
                } else {
                    tracing::error!(table = %self.table().name(), error = %e, "flush failed");
                }
            }
        }
        result
    }

    fn record(&self, report: &WriteReport, latency: Duration) {
        let c = &self.counters;
        c.batches
            .fetch_add(report.batches_committed as u64, Ordering::Relaxed);
        c.rows.fetch_add(report.rows_written, Ordering::Relaxed);
        c.conflicts
            .fetch_add(u64::from(report.conflicts), Ordering::Relaxed);
        c.duplicates_skipped
            .fetch_add(report.batches_skipped as u64, Ordering::Relaxed);
        if report.version.is_some() {
            c.commits.fetch_add(1, Ordering::Relaxed);
            c.last_commit_latency_us.store(
                u64::try_from(latency.as_micros()).unwrap_or(u64::MAX).max(1),
                Ordering::Relaxed,
            );
        }
        metrics::record_flush(
            self.table().name(),
            report.rows_written,
            report.batches_skipped as u64,
        );
    }

    /// One attempt: stage files against the latest snapshot and propose,
    /// rebasing on conflicts.
    async fn commit_batches(&self, batches: &[IngestBatch]) -> Result<WriteReport> {
        let max_conflicts = self.table().config().writer.max_conflict_retries;
        let mut snapshot = self.coordinator.latest_snapshot().await?;
        let mut conflicts = 0_u32;

        loop {
            let pending = pending_batches(&snapshot, batches);
            let skipped = batches.len() - pending.len();
            if pending.is_empty() {
                return Ok(WriteReport {
                    batches_skipped: skipped,
                    conflicts,
                    ..WriteReport::default()
                });
            }

            let (add, reused) = self.stage(&pending).await?;
            let remove = match self.mode {
                WriteMode::Append => Vec::new(),
                WriteMode::Overwrite => overwritten_files(&snapshot, &add),
            };
            let rows_written = add.iter().map(|f| f.row_count).sum();
            let (files_added, files_removed) = (add.len(), remove.len());
            let proposal = Proposal::write(self.mode, snapshot.version(), add, remove);

            match self.coordinator.propose(proposal).await? {
                CommitResult::Committed { version, .. } => {
                    self.restore_reused(&reused).await?;
                    return Ok(WriteReport {
                        version: Some(version),
                        files_added,
                        files_removed,
                        rows_written,
                        batches_committed: pending.len(),
                        batches_skipped: skipped,
                        conflicts,
                    });
                }
                CommitResult::Conflict { latest_version } => {
                    conflicts += 1;
                    if conflicts > max_conflicts {
                        return Err(TableError::ConflictRetriesExhausted {
                            attempts: conflicts,
                        });
                    }
                    tracing::debug!(
                        table = %self.table().name(),
                        base_version = snapshot.version(),
                        latest_version,
                        conflicts,
                        "rebasing after conflict"
                    );
                    snapshot = self.coordinator.latest_snapshot().await?;
                }
            }
        }
    }

    /// Uploads one data file per partition group.
    ///
    /// Also returns the files that were already in the store from an
    /// earlier attempt, with their bytes.
    async fn stage(&self, pending: &[&IngestBatch]) -> Result<(Vec<DataFileRef>, Vec<ReusedFile>)> {
        let mut groups: BTreeMap<Option<&str>, Vec<&IngestBatch>> = BTreeMap::new();
        for batch in pending.iter().copied() {
            groups.entry(batch.partition.as_deref()).or_default().push(batch);
        }

        let mut files = Vec::with_capacity(groups.len());
        let mut reused = Vec::new();
        for (partition, mut group) in groups {
            // Content must not depend on arrival order.
            group.sort_by_cached_key(|b| b.digest());
            let digests: Vec<String> = group.iter().map(|b| b.digest()).collect();
            let path = self
                .table()
                .paths()
                .data_file(partition, &file_id_for_batches(&digests));
            let rows: Vec<RecordBatch> = group.iter().map(|b| b.batch.clone()).collect();
            let encoded = datafile::encode(&rows)?;
            let size_bytes = encoded.data.len() as u64;

            if self.put_data_file(&path, &encoded).await? {
                reused.push((path.clone(), encoded.data.clone()));
            }
            files.push(DataFileRef {
                path,
                size_bytes,
                row_count: encoded.row_count,
                partition: partition.map(str::to_string),
                fingerprint: encoded.fingerprint,
                source_batches: digests,
            });
        }
        Ok((files, reused))
    }

    /// Writes a data file, returning whether an identical object was
    /// already there.
    ///
    /// A reused object is rewritten so its modification time is fresh and
    /// vacuum does not take it for an old orphan while the commit is in
    /// flight.
    async fn put_data_file(&self, path: &str, encoded: &datafile::EncodedFile) -> Result<bool> {
        let storage = self.table().storage();
        let written = storage
            .put(path, encoded.data.clone(), WritePrecondition::DoesNotExist)
            .await?;
        if let WriteResult::PreconditionFailed { .. } = written {
            let existing = storage.get(path).await?;
            if sha256_hex(&existing) != encoded.fingerprint {
                return Err(TableError::idempotency(
                    path,
                    "data file already exists with different content",
                ));
            }
            storage
                .put(path, encoded.data.clone(), WritePrecondition::None)
                .await?;
            tracing::debug!(path = %path, "reusing previously uploaded data file");
            return Ok(true);
        }
        Ok(false)
    }

    /// Re-uploads reused files that disappeared before the commit landed.
    ///
    /// A vacuum that listed the store before the commit may have deleted a
    /// reused object as an orphan. Its content is deterministic, so putting
    /// the same bytes back restores the committed file.
    async fn restore_reused(&self, reused: &[ReusedFile]) -> Result<()> {
        let storage = self.table().storage();
        for (path, data) in reused {
            if storage.head(path).await?.is_none() {
                tracing::warn!(
                    table = %self.table().name(),
                    path = %path,
                    "committed data file was missing; restoring it"
                );
                storage
                    .put(path, data.clone(), WritePrecondition::DoesNotExist)
                    .await?;
            }
        }
        Ok(())
    }

    /// Runs the flush loop until shutdown or until `rx` closes, then flushes
    /// whatever is buffered.
    ///
    /// # Errors
    ///
    /// Returns fatal commit errors, and the final flush's error on shutdown.
    pub async fn run(
        self,
        mut rx: mpsc::Receiver<IngestBatch>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<WriterMetrics> {
        let config = self.table().config().writer.clone();
        let name = self.table().name().to_string();
        let max_buffered = config.max_buffered_batches;
        let pressure = BackpressureState::new(name.clone())
            .with_thresholds((max_buffered as u64 / 2).max(1), max_buffered as u64);

        let mut ticker = tokio::time::interval(config.flush_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut buffer: Vec<IngestBatch> = Vec::new();
        let mut input_open = true;
        tracing::info!(table = %name, "writer started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            let accepting = input_open && buffer.len() < max_buffered;
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                received = rx.recv(), if accepting => match received {
                    Some(batch) => {
                        buffer.push(batch);
                        metrics::record_buffered(&name, buffer.len());
                        let buffered_rows: usize = buffer.iter().map(IngestBatch::rows).sum();
                        if buffered_rows >= config.max_batch_rows {
                            self.flush(&mut buffer).await?;
                        } else if let BackpressureDecision::Reject { retry_after } =
                            pressure.clone().with_pending(buffer.len() as u64).evaluate()
                        {
                            tracing::warn!(
                                table = %name,
                                buffered = buffer.len(),
                                retry_after_secs = retry_after.as_secs(),
                                "writer buffer full; no longer accepting input"
                            );
                        }
                    }
                    None => input_open = false,
                },
                _ = ticker.tick() => self.flush(&mut buffer).await?,
            }
            if !input_open {
                break;
            }
        }

        // Batches already queued were accepted by senders; keep them.
        while let Ok(batch) = rx.try_recv() {
            buffer.push(batch);
        }
        if !buffer.is_empty() {
            tracing::info!(table = %name, buffered = buffer.len(), "final flush");
            self.append(&buffer).await?;
            buffer.clear();
            metrics::record_buffered(&name, 0);
        }
        tracing::info!(table = %name, "writer stopped");
        Ok(self.metrics())
    }

    /// Commits the buffer. Transient failures keep it for the next flush.
    async fn flush(&self, buffer: &mut Vec<IngestBatch>) -> Result<()> {
        if buffer.is_empty() {
            return Ok(());
        }
        match self.append(buffer).await {
            Ok(_) => {
                buffer.clear();
                metrics::record_buffered(self.table().name(), 0);
                Ok(())
            }
            Err(e) if e.is_transient() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Batches not yet committed, first occurrence of each key only.
fn pending_batches<'a>(snapshot: &Snapshot, batches: &'a [IngestBatch]) -> Vec<&'a IngestBatch> {
    let mut seen = BTreeSet::new();
    batches
        .iter()
        .filter(|b| {
            let digest = b.digest();
            !snapshot.is_batch_committed(&digest) && seen.insert(digest)
        })
        .collect()
}

/// Live files replaced by an overwrite: every live file in a partition the
/// new files touch.
fn overwritten_files(snapshot: &Snapshot, add: &[DataFileRef]) -> Vec<DataFileRef> {
    let touched: BTreeSet<Option<&str>> = add.iter().map(|f| f.partition.as_deref()).collect();
    touched
        .into_iter()
        .flat_map(|partition| snapshot.partition_files(partition))
        .map(|live| live.file.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use lakelog_core::{HealthSignal, MemoryBackend, StorageBackend};
    use lakelog_test_utils::{OpKind, TracingMemoryBackend, collect_ids, rows_batch};

    use super::*;
    use crate::config::TableConfig;
    use crate::log::TableMetadata;

    async fn table_on(storage: Arc<dyn StorageBackend>, config: TableConfig) -> Table {
        let table = Table::with_storage("t", storage, config);
        table.create(TableMetadata::new("t")).await.expect("create");
        table
    }

    async fn table() -> Table {
        table_on(Arc::new(MemoryBackend::new()), TableConfig::default()).await
    }

    async fn table_rows(table: &Table) -> Vec<i64> {
        let snapshot = table.latest_snapshot().await.expect("snapshot");
        let mut batches = Vec::new();
        for file in snapshot.files() {
            let data = table.storage().get(&file.path).await.expect("get");
            batches.extend(datafile::decode(data).expect("decode"));
        }
        collect_ids(&batches)
    }

    #[tokio::test]
    async fn append_commits_one_file_per_partition() {
        let table = table().await;
        let writer = Writer::new(table.clone());
        let report = writer
            .append(&[
                IngestBatch::new("k1", rows_batch("eu", 0, 3)).with_partition("eu"),
                IngestBatch::new("k2", rows_batch("us", 3, 2)).with_partition("us"),
                IngestBatch::new("k3", rows_batch("eu", 5, 1)).with_partition("eu"),
            ])
            .await
            .expect("append");
        assert_eq!(report.version, Some(1));
        assert_eq!(report.files_added, 2);
        assert_eq!(report.rows_written, 6);

        let snapshot = table.latest_snapshot().await.expect("snapshot");
        assert_eq!(snapshot.partition_files(Some("eu")).count(), 1);
        assert_eq!(table_rows(&table).await, (0..6).collect::<Vec<_>>());
        assert_eq!(writer.metrics().commits, 1);
    }

    #[tokio::test]
    async fn replayed_batches_are_skipped() {
        let table = table().await;
        let batches = [IngestBatch::new("k1", rows_batch("eu", 0, 4))];
        Writer::new(table.clone()).append(&batches).await.expect("first");

        // A fresh writer replays the same input after a restart.
        let restarted = Writer::new(table.clone());
        let report = restarted.append(&batches).await.expect("replay");
        assert_eq!(report.version, None);
        assert_eq!(report.batches_skipped, 1);
        assert_eq!(table.latest_version().await.expect("latest"), 1);
        assert_eq!(table_rows(&table).await.len(), 4);
    }

    #[tokio::test]
    async fn duplicate_keys_within_one_flush_commit_once() {
        let table = table().await;
        let report = Writer::new(table.clone())
            .append(&[
                IngestBatch::new("k1", rows_batch("eu", 0, 2)),
                IngestBatch::new("k1", rows_batch("eu", 0, 2)),
            ])
            .await
            .expect("append");
        assert_eq!(report.batches_committed, 1);
        assert_eq!(table_rows(&table).await, vec![0, 1]);
    }

    #[tokio::test]
    async fn uploaded_but_uncommitted_file_is_reused() {
        let table = table().await;
        let batch = IngestBatch::new("k1", rows_batch("eu", 0, 2));
        // Simulate a crash after upload and before commit.
        let encoded = datafile::encode(&[batch.batch.clone()]).expect("encode");
        let path = table
            .paths()
            .data_file(None, &file_id_for_batches(&[batch.digest()]));
        table
            .storage()
            .put(&path, encoded.data, WritePrecondition::DoesNotExist)
            .await
            .expect("put");

        let report = Writer::new(table.clone())
            .append(&[batch])
            .await
            .expect("append");
        assert_eq!(report.version, Some(1));
        assert!(table.latest_snapshot().await.expect("snapshot").contains(&path));
    }

    #[tokio::test]
    async fn reused_file_gets_a_fresh_modification_time() {
        let table = table().await;
        let batch = IngestBatch::new("k1", rows_batch("eu", 0, 2));
        let encoded = datafile::encode(&[batch.batch.clone()]).expect("encode");
        let path = table
            .paths()
            .data_file(None, &file_id_for_batches(&[batch.digest()]));
        table
            .storage()
            .put(&path, encoded.data, WritePrecondition::DoesNotExist)
            .await
            .expect("put");
        let uploaded = table.storage().head(&path).await.expect("head").expect("exists");

        tokio::time::sleep(Duration::from_millis(20)).await;
        Writer::new(table.clone()).append(&[batch]).await.expect("append");

        let refreshed = table.storage().head(&path).await.expect("head").expect("exists");
        assert!(refreshed.last_modified > uploaded.last_modified);
    }

    #[tokio::test]
    async fn reused_file_deleted_before_commit_is_restored() {
        let table = table().await;
        let batch = IngestBatch::new("k1", rows_batch("eu", 0, 2));
        let encoded = datafile::encode(&[batch.batch.clone()]).expect("encode");
        let path = table
            .paths()
            .data_file(None, &file_id_for_batches(&[batch.digest()]));
        let data = encoded.data.clone();
        table
            .storage()
            .put(&path, encoded.data, WritePrecondition::DoesNotExist)
            .await
            .expect("put");

        // The object vanishes after staging, as if an orphan sweep raced
        // the commit.
        let writer = Writer::new(table.clone());
        table.storage().delete(&path).await.expect("delete");
        writer
            .restore_reused(&[(path.clone(), data.clone())])
            .await
            .expect("restore");
        assert_eq!(table.storage().get(&path).await.expect("get"), data);

        // Present objects are left alone.
        writer
            .restore_reused(&[(path.clone(), data)])
            .await
            .expect("restore");
        assert_eq!(writer.append(&[batch]).await.expect("append").version, Some(1));
    }

    #[tokio::test]
    async fn foreign_content_at_data_path_is_an_idempotency_violation() {
        let table = table().await;
        let batch = IngestBatch::new("k1", rows_batch("eu", 0, 2));
        let path = table
            .paths()
            .data_file(None, &file_id_for_batches(&[batch.digest()]));
        table
            .storage()
            .put(&path, Bytes::from_static(b"other"), WritePrecondition::DoesNotExist)
            .await
            .expect("put");

        let writer = Writer::new(table.clone());
        let err = writer.append(&[batch]).await.expect_err("violation");
        assert!(matches!(err, TableError::IdempotencyViolation { .. }));
        assert!(!writer.health().current().is_healthy());
    }

    #[tokio::test]
    async fn overwrite_replaces_only_touched_partitions() {
        let table = table().await;
        Writer::new(table.clone())
            .append(&[
                IngestBatch::new("a", rows_batch("eu", 0, 2)).with_partition("eu"),
                IngestBatch::new("b", rows_batch("us", 10, 2)).with_partition("us"),
            ])
            .await
            .expect("append");

        let report = Writer::new(table.clone())
            .with_mode(WriteMode::Overwrite)
            .append(&[IngestBatch::new("c", rows_batch("eu", 20, 1)).with_partition("eu")])
            .await
            .expect("overwrite");
        assert_eq!(report.files_removed, 1);
        assert_eq!(table_rows(&table).await, vec![10, 11, 20]);
    }

    #[tokio::test]
    async fn store_outage_degrades_health_then_recovers() {
        let storage = Arc::new(TracingMemoryBackend::new());
        let mut config = TableConfig::default();
        config.writer.max_retries = 1;
        config.writer.retry_delay_ms = 1;
        let table = table_on(storage.clone(), config).await;
        let writer = Writer::new(table.clone());
        let mut health = writer.health().subscribe();

        storage.inject_failure("t/data/");
        let batches = [IngestBatch::new("k1", rows_batch("eu", 0, 2))];
        let err = writer.append(&batches).await.expect_err("outage");
        assert!(matches!(err, TableError::StoreUnavailable { .. }));
        assert!(matches!(*health.borrow_and_update(), HealthSignal::Degraded { .. }));
        assert_eq!(writer.metrics().retries, 1);

        storage.clear_failures();
        writer.append(&batches).await.expect("recovered");
        assert!(health.borrow_and_update().is_healthy());
        assert!(!storage.operations_of(OpKind::Put).is_empty());
    }

    #[tokio::test]
    async fn run_flushes_on_row_threshold_and_on_shutdown() {
        let mut config = TableConfig::default();
        config.writer.max_batch_rows = 5;
        config.writer.flush_interval_ms = 60_000;
        let table = table_on(Arc::new(MemoryBackend::new()), config).await;
        let (tx, rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(Writer::new(table.clone()).run(rx, shutdown_rx));

        tx.send(IngestBatch::new("a", rows_batch("eu", 0, 3))).await.expect("send");
        tx.send(IngestBatch::new("b", rows_batch("eu", 3, 3))).await.expect("send");
        tx.send(IngestBatch::new("c", rows_batch("eu", 6, 1))).await.expect("send");
        // Let the loop drain the channel before shutting down.
        for _ in 0..50 {
            if table.latest_version().await.expect("latest") >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown_tx.send(true).expect("shutdown");
        let stats = handle.await.expect("join").expect("run");

        assert_eq!(table_rows(&table).await, (0..7).collect::<Vec<_>>());
        assert_eq!(stats.rows, 7);
    }

    #[tokio::test]
    async fn run_exits_when_input_closes() {
        let table = table().await;
        let (tx, rx) = mpsc::channel(4);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tx.send(IngestBatch::new("a", rows_batch("eu", 0, 2))).await.expect("send");
        drop(tx);
        let stats = Writer::new(table.clone())
            .run(rx, shutdown_rx)
            .await
            .expect("run");
        assert_eq!(stats.batches, 1);
        assert_eq!(table_rows(&table).await, vec![0, 1]);
    }
}
