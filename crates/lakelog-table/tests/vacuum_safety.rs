//! Integration tests for vacuum safety.
//!
//! Vacuum may only delete files that no snapshot inside the retention
//! window references, and must refuse windows below the floor.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{Duration as ChronoDuration, Utc};
use lakelog_core::{MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult};
use lakelog_table::{
    CompactionOutcome, Compactor, IngestBatch, Table, TableConfig, TableError, TableMetadata,
    Vacuum, VacuumReason, Writer, datafile,
};
use lakelog_test_utils::{TracingMemoryBackend, collect_ids, rows_batch};

/// Storage that lets a writer commit while the data prefix is being
/// listed.
struct CommitDuringListing {
    inner: TracingMemoryBackend,
    pending: Mutex<Option<(Table, IngestBatch)>>,
}

#[async_trait]
impl StorageBackend for CommitDuringListing {
    async fn get(&self, path: &str) -> lakelog_core::Result<Bytes> {
        self.inner.get(path).await
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> lakelog_core::Result<WriteResult> {
        self.inner.put(path, data, precondition).await
    }

    async fn delete(&self, path: &str) -> lakelog_core::Result<()> {
        self.inner.delete(path).await
    }

    async fn list(&self, prefix: &str) -> lakelog_core::Result<Vec<ObjectMeta>> {
        let listed = self.inner.list(prefix).await?;
        let pending = if prefix.contains("/data/") {
            self.pending.lock().unwrap().take()
        } else {
            None
        };
        if let Some((table, batch)) = pending {
            let report = Writer::new(table).append(&[batch]).await.unwrap();
            assert_eq!(report.version, Some(1));
        }
        Ok(listed)
    }

    async fn head(&self, path: &str) -> lakelog_core::Result<Option<ObjectMeta>> {
        self.inner.head(path).await
    }
}

async fn table_with_history() -> Table {
    let table = Table::with_storage("events", Arc::new(MemoryBackend::new()), TableConfig::default());
    table.create(TableMetadata::new("events")).await.unwrap();
    let writer = Writer::new(table.clone());
    for n in 0..6_i64 {
        writer
            .append(&[IngestBatch::new(format!("b{n}"), rows_batch("eu", n * 10, 10))])
            .await
            .unwrap();
    }
    let report = Compactor::new(table.clone()).compact_once().await.unwrap();
    assert_eq!(report.outcome, CompactionOutcome::Compacted);
    writer
        .append(&[IngestBatch::new("b6", rows_batch("eu", 60, 10))])
        .await
        .unwrap();
    table
}

async fn readable_ids(table: &Table, version: u64) -> Option<Vec<i64>> {
    let snapshot = table.snapshot_at(version).await.unwrap();
    let mut batches = Vec::new();
    for file in snapshot.files() {
        let Ok(data) = table.storage().get(&file.path).await else {
            return None;
        };
        batches.extend(datafile::decode(data).unwrap());
    }
    Some(collect_ids(&batches))
}

/// Inside the window nothing is deleted and every version stays readable.
#[tokio::test]
async fn test_time_travel_survives_compaction_and_vacuum() {
    let table = table_with_history().await;
    let latest = table.latest_version().await.unwrap();
    assert_eq!(latest, 8);

    let mut before = Vec::new();
    for version in 0..=latest {
        before.push(readable_ids(&table, version).await.unwrap());
    }

    let report = Vacuum::new(table.clone()).run_once().await.unwrap();
    assert!(report.candidates.is_empty());
    assert_eq!(report.deleted, 0);

    for version in 0..=latest {
        let ids = readable_ids(&table, version).await;
        assert_eq!(ids.as_ref(), Some(&before[usize::try_from(version).unwrap()]));
    }
    assert_eq!(before[6], (0..60).collect::<Vec<_>>());
    assert_eq!(before[8], (0..70).collect::<Vec<_>>());
}

/// Past the window, only tombstoned inputs go; versions from the boundary
/// on stay fully readable.
#[tokio::test]
async fn test_vacuum_never_deletes_reachable_files() {
    let table = table_with_history().await;
    let latest = table.latest_version().await.unwrap();

    let later = Utc::now() + ChronoDuration::hours(80);
    let report = Vacuum::new(table.clone()).run_at(later, None).await.unwrap();
    let boundary = report.retained_from_version.unwrap();
    assert_eq!(boundary, latest);
    assert_eq!(report.deleted, 6);
    assert!(
        report
            .candidates
            .iter()
            .all(|c| c.reason == VacuumReason::Tombstoned { removed_version: 7 })
    );
    assert!(!report.has_errors());

    for version in boundary..=latest {
        assert!(readable_ids(&table, version).await.is_some());
    }
    assert_eq!(
        readable_ids(&table, latest).await.unwrap(),
        (0..70).collect::<Vec<_>>()
    );
    // Older versions keep their log entries; only their data is gone.
    assert!(readable_ids(&table, 6).await.is_none());

    // Idempotent: a second run finds nothing.
    let again = Vacuum::new(table).run_at(later, None).await.unwrap();
    assert!(again.candidates.is_empty());
}

/// Retention below the floor fails before anything is deleted.
#[tokio::test]
async fn test_retention_below_floor_is_refused() {
    let table = table_with_history().await;
    let later = Utc::now() + ChronoDuration::hours(80);

    let err = Vacuum::new(table.clone())
        .run_at(later, Some(Duration::from_secs(3600)))
        .await
        .unwrap_err();
    assert!(matches!(err, TableError::RetentionViolation { .. }));

    // A configured floor below the hard floor does not lower it.
    let mut config = table.config().clone();
    config.retention.retention_floor_hours = 0;
    let lax = Table::with_storage("events", table.storage().clone(), config);
    let err = Vacuum::new(lax)
        .run_at(later, Some(Duration::from_secs(60)))
        .await
        .unwrap_err();
    assert!(matches!(err, TableError::RetentionViolation { .. }));

    assert!(readable_ids(&table, 6).await.is_some());
}

/// Dry run lists the same candidates a real run would delete.
#[tokio::test]
async fn test_dry_run_matches_real_run() {
    let table = table_with_history().await;
    let later = Utc::now() + ChronoDuration::hours(80);

    let dry = Vacuum::new(table.clone())
        .with_dry_run(true)
        .run_at(later, None)
        .await
        .unwrap();
    assert_eq!(dry.deleted, 0);
    assert!(readable_ids(&table, 6).await.is_some());

    let real = Vacuum::new(table).run_at(later, None).await.unwrap();
    assert_eq!(dry.candidates, real.candidates);
    assert_eq!(real.bytes_reclaimed, dry.candidate_bytes());
}

/// A writer that crashed before committing retries while vacuum lists the
/// store. The reused upload is older than the cutoff, but once committed
/// it must survive.
#[tokio::test]
async fn test_commit_during_listing_keeps_reused_file() {
    let mut config = TableConfig::default();
    config.retention.retention_floor_hours = 1;
    config.writer.retry_delay_ms = 5;
    config.writer.max_retries = 2;
    let inner = TracingMemoryBackend::new();
    let storage = Arc::new(CommitDuringListing {
        inner: inner.clone(),
        pending: Mutex::new(None),
    });
    let table = Table::with_storage("t", storage.clone(), config);
    table.create(TableMetadata::new("t")).await.unwrap();

    // Upload succeeds, commit never does.
    let batch = IngestBatch::new("k1", rows_batch("eu", 0, 10));
    inner.inject_failure("t/_locks/");
    assert!(Writer::new(table.clone()).append(&[batch.clone()]).await.is_err());
    inner.clear_failures();
    let uploaded: Vec<String> = inner
        .paths()
        .await
        .into_iter()
        .filter(|p| p.starts_with("t/data/"))
        .collect();
    assert_eq!(uploaded.len(), 1);

    *storage.pending.lock().unwrap() = Some((table.clone(), batch));
    let report = Vacuum::new(table.clone())
        .run_at(Utc::now() + ChronoDuration::hours(5), Some(Duration::from_secs(3 * 3600)))
        .await
        .unwrap();
    assert!(storage.pending.lock().unwrap().is_none(), "writer never ran");
    assert!(report.candidates.is_empty(), "{:?}", report.candidates);

    let latest = table.latest_snapshot().await.unwrap();
    assert!(latest.contains(&uploaded[0]));
    assert!(table.storage().head(&uploaded[0]).await.unwrap().is_some());
    assert_eq!(readable_ids(&table, 1).await, Some((0..10).collect()));
}
