//! Table metrics.
//!
//! Counters and histograms for commits, writer flushes, compaction and
//! vacuum. Recording is a no-op until a recorder is installed (the CLI
//! installs a Prometheus exporter).

use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

// ============================================================================
// Commit Metrics
// ============================================================================

/// Commit attempts by role and outcome (`committed`, `conflict`, `error`).
pub const COMMITS: &str = "lakelog_commits_total";

/// Time from lock request to published entry.
pub const COMMIT_DURATION: &str = "lakelog_commit_duration_seconds";

/// Latest committed version per table.
pub const TABLE_VERSION: &str = "lakelog_table_version";

// ============================================================================
// Writer Metrics
// ============================================================================

/// Rows committed by writers.
pub const ROWS_WRITTEN: &str = "lakelog_rows_written_total";

/// Batches skipped because their idempotency key was already committed.
pub const BATCHES_DEDUPLICATED: &str = "lakelog_batches_deduplicated_total";

/// Batches buffered in the writer.
pub const WRITER_BUFFERED: &str = "lakelog_writer_buffered_batches";

// ============================================================================
// Compaction / Vacuum Metrics
// ============================================================================

/// Files removed by compaction commits.
pub const FILES_COMPACTED: &str = "lakelog_files_compacted_total";

/// Data files deleted by vacuum.
pub const FILES_VACUUMED: &str = "lakelog_files_vacuumed_total";

/// Bytes reclaimed by vacuum.
pub const BYTES_VACUUMED: &str = "lakelog_bytes_vacuumed_total";

/// Errors by role and kind.
pub const ERRORS: &str = "lakelog_errors_total";

// ============================================================================
// Metric Registration
// ============================================================================

/// Registers all table metric descriptions.
///
/// Call once at startup after installing the recorder.
pub fn register_metrics() {
    describe_counter!(COMMITS, "Commit attempts by role and outcome");
    describe_histogram!(COMMIT_DURATION, "Commit latency in seconds");
    describe_gauge!(TABLE_VERSION, "Latest committed table version");
    describe_counter!(ROWS_WRITTEN, "Rows committed by writers");
    describe_counter!(BATCHES_DEDUPLICATED, "Ingest batches skipped as already committed");
    describe_gauge!(WRITER_BUFFERED, "Ingest batches buffered by the writer");
    describe_counter!(FILES_COMPACTED, "Data files replaced by compaction");
    describe_counter!(FILES_VACUUMED, "Data files deleted by vacuum");
    describe_counter!(BYTES_VACUUMED, "Bytes reclaimed by vacuum");
    describe_counter!(ERRORS, "Errors by role and kind");
}

// ============================================================================
// Recording
// ============================================================================

/// Records a commit attempt.
pub fn record_commit(table: &str, role: &str, outcome: &'static str, elapsed: Duration) {
    let labels = [("table", table.to_string()), ("role", role.to_string())];
    counter!(COMMITS, "table" => table.to_string(), "role" => role.to_string(), "outcome" => outcome)
        .increment(1);
    histogram!(COMMIT_DURATION, &labels).record(elapsed.as_secs_f64());
}

/// Records the latest committed version.
#[allow(clippy::cast_precision_loss)]
pub fn record_version(table: &str, version: u64) {
    gauge!(TABLE_VERSION, "table" => table.to_string()).set(version as f64);
}

/// Records a writer flush.
pub fn record_flush(table: &str, rows: u64, deduplicated: u64) {
    counter!(ROWS_WRITTEN, "table" => table.to_string()).increment(rows);
    if deduplicated > 0 {
        counter!(BATCHES_DEDUPLICATED, "table" => table.to_string()).increment(deduplicated);
    }
}

/// Records the writer buffer depth.
#[allow(clippy::cast_precision_loss)]
pub fn record_buffered(table: &str, batches: usize) {
    gauge!(WRITER_BUFFERED, "table" => table.to_string()).set(batches as f64);
}

/// Records a compaction commit.
pub fn record_compaction(table: &str, files_removed: u64) {
    counter!(FILES_COMPACTED, "table" => table.to_string()).increment(files_removed);
}

/// Records vacuum deletions.
pub fn record_vacuum(table: &str, files: u64, bytes: u64) {
    counter!(FILES_VACUUMED, "table" => table.to_string()).increment(files);
    counter!(BYTES_VACUUMED, "table" => table.to_string()).increment(bytes);
}

/// Records an error.
pub fn record_error(table: &str, role: &str, kind: &'static str) {
    counter!(ERRORS, "table" => table.to_string(), "role" => role.to_string(), "kind" => kind)
        .increment(1);
}
