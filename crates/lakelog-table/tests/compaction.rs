//! Integration tests for compaction.
//!
//! Compaction must shrink the file count without adding, losing or
//! reordering rows, and concurrent compactors must never both publish a
//! rewrite of the same inputs.

use std::sync::Arc;

use lakelog_core::MemoryBackend;
use lakelog_table::{
    CompactionOutcome, Compactor, IngestBatch, Snapshot, Table, TableConfig, TableMetadata,
    Writer, datafile,
};
use lakelog_test_utils::{collect_ids, rows_batch};

async fn table_with_config(config: TableConfig) -> Table {
    let table = Table::with_storage("events", Arc::new(MemoryBackend::new()), config);
    table.create(TableMetadata::new("events")).await.unwrap();
    table
}

async fn write_single_row_files(table: &Table, count: i64) {
    let writer = Writer::new(table.clone());
    for id in 0..count {
        writer
            .append(&[IngestBatch::new(format!("row-{id}"), rows_batch("eu", id, 1))])
            .await
            .unwrap();
    }
}

async fn ids_of(table: &Table, snapshot: &Snapshot) -> Vec<i64> {
    let mut batches = Vec::new();
    for file in snapshot.files() {
        let data = table.storage().get(&file.path).await.unwrap();
        batches.extend(datafile::decode(data).unwrap());
    }
    collect_ids(&batches)
}

/// Every listed data object is live or tombstoned: nothing unpublished
/// was left behind.
async fn assert_no_stray_outputs(table: &Table) {
    let snapshot = table.latest_snapshot().await.unwrap();
    let listed = table.storage().list(&table.paths().data_prefix()).await.unwrap();
    for meta in listed {
        assert!(snapshot.knows(&meta.path), "stray data object {}", meta.path);
    }
}

/// 500 one-row files at a 128 MiB target end up as fewer than 10 files.
#[tokio::test]
async fn test_five_hundred_small_files_compact_below_ten() {
    let table = table_with_config(TableConfig::default()).await;
    write_single_row_files(&table, 500).await;

    let before = table.latest_snapshot().await.unwrap();
    assert_eq!(before.file_count(), 500);
    assert_eq!(before.row_count(), 500);

    let report = Compactor::new(table.clone()).compact_once().await.unwrap();
    assert_eq!(report.outcome, CompactionOutcome::Compacted);
    assert_eq!(report.files_removed, 500);
    assert_eq!(report.rows, 500);

    let after = table.latest_snapshot().await.unwrap();
    assert!(after.file_count() < 10, "{} files remain", after.file_count());
    assert_eq!(after.row_count(), 500);
    assert_eq!(ids_of(&table, &after).await, (0..500).collect::<Vec<_>>());

    // Versions before the compaction still read the original files.
    let old = table.snapshot_at(before.version()).await.unwrap();
    assert_eq!(old, before);
    assert_eq!(ids_of(&table, &old).await, (0..500).collect::<Vec<_>>());

    // The entry records the balanced row counts.
    let entry = table.log().read_required(after.version()).await.unwrap();
    let stats = entry.stats.unwrap();
    assert_eq!(stats.rows_added, stats.rows_removed);
}

/// Two compactors without the lease race; exactly one rewrite is published.
#[tokio::test]
async fn test_concurrent_compactors_publish_one_rewrite() {
    let mut config = TableConfig::default();
    config.compaction.exclusive_lease = false;
    config.lock.acquire_timeout_ms = 10_000;
    let table = table_with_config(config).await;
    write_single_row_files(&table, 30).await;
    let base = table.latest_version().await.unwrap();

    let a = Compactor::new(table.clone());
    let b = Compactor::new(table.clone());
    let (ra, rb) = tokio::join!(a.compact_once(), b.compact_once());
    let (ra, rb) = (ra.unwrap(), rb.unwrap());

    let committed: Vec<_> = ra
        .committed_versions
        .iter()
        .chain(&rb.committed_versions)
        .collect();
    assert_eq!(committed.len(), 1, "a: {ra:?}, b: {rb:?}");
    assert_eq!(table.latest_version().await.unwrap(), base + 1);

    let after = table.latest_snapshot().await.unwrap();
    assert_eq!(after.row_count(), 30);
    assert_eq!(ids_of(&table, &after).await, (0..30).collect::<Vec<_>>());
    assert_no_stray_outputs(&table).await;
}

/// With the lease, a second compactor either skips or finds nothing left.
#[tokio::test]
async fn test_lease_admits_one_compactor() {
    let table = table_with_config(TableConfig::default()).await;
    write_single_row_files(&table, 12).await;

    let a = Compactor::new(table.clone());
    let b = Compactor::new(table.clone());
    let (ra, rb) = tokio::join!(a.compact_once(), b.compact_once());
    let outcomes = [ra.unwrap().outcome, rb.unwrap().outcome];

    let compacted = outcomes
        .iter()
        .filter(|o| **o == CompactionOutcome::Compacted)
        .count();
    assert_eq!(compacted, 1, "{outcomes:?}");
    assert!(outcomes.iter().all(|o| matches!(
        o,
        CompactionOutcome::Compacted | CompactionOutcome::Skipped { .. } | CompactionOutcome::NoWork
    )));

    let after = table.latest_snapshot().await.unwrap();
    assert_eq!(after.row_count(), 12);
    assert_eq!(ids_of(&table, &after).await, (0..12).collect::<Vec<_>>());
}

/// A writer racing a compactor: both make progress and no row is lost.
#[tokio::test]
async fn test_compaction_alongside_writes_preserves_rows() {
    let mut config = TableConfig::default();
    config.writer.commit_sla_ms = 5_000;
    config.writer.max_conflict_retries = 64;
    let table = table_with_config(config).await;
    write_single_row_files(&table, 20).await;

    let writer = {
        let table = table.clone();
        tokio::spawn(async move {
            let writer = Writer::new(table);
            for id in 20..40 {
                writer
                    .append(&[IngestBatch::new(format!("row-{id}"), rows_batch("eu", id, 1))])
                    .await
                    .unwrap();
            }
        })
    };
    let compactor = Compactor::new(table.clone());
    for _ in 0..3 {
        compactor.compact_once().await.unwrap();
    }
    writer.await.unwrap();

    let after = table.latest_snapshot().await.unwrap();
    assert_eq!(after.row_count(), 40);
    assert_eq!(ids_of(&table, &after).await, (0..40).collect::<Vec<_>>());
    assert_no_stray_outputs(&table).await;
}
