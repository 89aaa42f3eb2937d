//! Compactor: merges small files into files near the target size.
//!
//! A cycle plans against one snapshot, rewrites every planned group and
//! commits each group as its own `Compact` entry. Row content and order
//! within a group are preserved; the coordinator rejects any compaction
//! whose row counts do not balance.
//!
//! Output keys are unique per rewrite, so files from an abandoned attempt
//! never collide with anyone else's. A conflicting commit deletes its own
//! unpublished outputs and the cycle re-plans from a fresh snapshot, up to
//! `max_attempts`. A stale remove list is never published.
//!
//! With `exclusive_lease` the compactor holds `_locks/compactor` for the
//! whole cycle (renewed between groups); a busy lease skips the cycle.

use std::collections::BTreeMap;
use std::time::Instant;

use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use lakelog_core::{CommitId, LockGuard, WritePrecondition, WriteResult};
use tokio::sync::watch;

use crate::config::CompactionConfig;
use crate::coordinator::{CommitCoordinator, CommitResult, Proposal};
use crate::datafile;
use crate::error::{Result, TableError};
use crate::log::{DataFileRef, Version};
use crate::metrics;
use crate::snapshot::Snapshot;
use crate::table::Table;

// ============================================================================
// Planning
// ============================================================================

/// Why a partition was selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionTrigger {
    /// Enough small files accumulated.
    SmallFiles {
        /// Small files in the partition.
        count: usize,
    },
    /// No compaction for at least the configured interval.
    Interval,
}

/// Files to merge into one rewrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionGroup {
    /// Partition shared by every file.
    pub partition: Option<String>,
    /// Inputs, oldest first.
    pub files: Vec<DataFileRef>,
    /// Why the partition was selected.
    pub trigger: CompactionTrigger,
}

impl CompactionGroup {
    /// Combined input size.
    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size_bytes).sum()
    }

    /// Combined input rows.
    #[must_use]
    pub fn rows(&self) -> u64 {
        self.files.iter().map(|f| f.row_count).sum()
    }
}

/// Groups selected against one snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionPlan {
    /// Snapshot version the plan was computed against.
    pub base_version: Version,
    /// Groups to rewrite.
    pub groups: Vec<CompactionGroup>,
}

impl CompactionPlan {
    /// Whether there is nothing to do.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// Plans compaction for `snapshot` at time `now`.
///
/// Per partition, files below the small-file threshold are candidates.
/// A partition qualifies with at least `min_files_to_compact` candidates,
/// or with at least two once `compaction_interval` has passed since the
/// last compaction (or table creation). Candidates are packed oldest first
/// into groups of at most the target size; single-file groups are dropped.
#[must_use]
pub fn plan(snapshot: &Snapshot, config: &CompactionConfig, now: DateTime<Utc>) -> CompactionPlan {
    let threshold = config.small_file_threshold();
    let target = config.target_file_size_bytes;
    let last = snapshot
        .last_compaction()
        .unwrap_or(snapshot.metadata().created_at);
    let interval_elapsed = now
        .signed_duration_since(last)
        .to_std()
        .is_ok_and(|elapsed| elapsed >= config.interval());

    let mut by_partition: BTreeMap<Option<&str>, Vec<(Version, &DataFileRef)>> = BTreeMap::new();
    for live in snapshot.live_files() {
        if live.file.size_bytes < threshold {
            by_partition
                .entry(live.file.partition.as_deref())
                .or_default()
                .push((live.added_version, &live.file));
        }
    }

    let mut groups = Vec::new();
    for (partition, mut candidates) in by_partition {
        let count = candidates.len();
        let trigger = if count >= config.min_files_to_compact {
            CompactionTrigger::SmallFiles { count }
        } else if interval_elapsed && count >= 2 {
            CompactionTrigger::Interval
        } else {
            continue;
        };
        candidates.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.path.cmp(&b.1.path)));

        let mut current: Vec<DataFileRef> = Vec::new();
        let mut current_bytes = 0_u64;
        let mut packed = Vec::new();
        for (_, file) in candidates {
            if !current.is_empty() && current_bytes + file.size_bytes > target {
                packed.push(std::mem::take(&mut current));
                current_bytes = 0;
            }
            current_bytes += file.size_bytes;
            current.push(file.clone());
        }
        packed.push(current);

        groups.extend(packed.into_iter().filter(|g| g.len() >= 2).map(|files| {
            CompactionGroup {
                partition: partition.map(str::to_string),
                files,
                trigger,
            }
        }));
    }

    CompactionPlan {
        base_version: snapshot.version(),
        groups,
    }
}

// ============================================================================
// Reports
// ============================================================================

/// How a cycle ended.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CompactionOutcome {
    /// Nothing qualified.
    #[default]
    NoWork,
    /// At least one group was committed and no conflict remained.
    Compacted,
    /// Another compactor holds the lease.
    Skipped {
        /// Lease key.
        lease: String,
    },
    /// Conflicts persisted through every attempt.
    Abandoned,
}

/// Result of [`Compactor::compact_once`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionReport {
    /// How the cycle ended.
    pub outcome: CompactionOutcome,
    /// Versions committed by this cycle.
    pub committed_versions: Vec<Version>,
    /// Input files replaced.
    pub files_removed: usize,
    /// Output files added.
    pub files_added: usize,
    /// Rows rewritten.
    pub rows: u64,
    /// Bytes of replaced inputs.
    pub bytes_removed: u64,
    /// Bytes of outputs.
    pub bytes_added: u64,
    /// Planning attempts.
    pub attempts: u32,
}

// ============================================================================
// Compactor
// ============================================================================

/// Rewritten group awaiting commit.
#[derive(Debug)]
struct Rewrite {
    inputs: Vec<DataFileRef>,
    outputs: Vec<DataFileRef>,
}

/// Compactor for one table.
#[derive(Debug, Clone)]
pub struct Compactor {
    coordinator: CommitCoordinator,
}

impl Compactor {
    /// Creates a compactor.
    #[must_use]
    pub fn new(table: Table) -> Self {
        Self {
            coordinator: CommitCoordinator::new(table),
        }
    }

    /// The table.
    #[must_use]
    pub fn table(&self) -> &Table {
        self.coordinator.table()
    }

    fn config(&self) -> &CompactionConfig {
        &self.table().config().compaction
    }

    /// Plans against the latest snapshot without writing anything.
    ///
    /// # Errors
    ///
    /// Returns snapshot errors.
    pub async fn plan(&self) -> Result<CompactionPlan> {
        let snapshot = self.coordinator.latest_snapshot().await?;
        Ok(plan(&snapshot, self.config(), Utc::now()))
    }

    /// Runs one compaction cycle.
    ///
    /// # Errors
    ///
    /// Returns storage, lock and log errors. Outputs of a failed rewrite are
    /// deleted; outputs whose commit outcome is unknown are left for vacuum.
    pub async fn compact_once(&self) -> Result<CompactionReport> {
        let started = Instant::now();
        let mut lease = None;
        if self.config().exclusive_lease {
            let key = self.table().paths().compactor_lock();
            match self.table().lock(key.clone()).try_acquire().await? {
                Some(guard) => lease = Some(guard),
                None => {
                    tracing::info!(table = %self.table().name(), "compactor lease busy; skipping cycle");
                    return Ok(CompactionReport {
                        outcome: CompactionOutcome::Skipped { lease: key },
                        ..CompactionReport::default()
                    });
                }
            }
        }

        let result = self.run_cycles(lease.as_mut()).await;
        if let Some(guard) = lease {
            if let Err(e) = guard.release().await {
                tracing::warn!(table = %self.table().name(), error = %e, "lease release failed");
            }
        }

        match &result {
            Ok(report) => tracing::info!(
                table = %self.table().name(),
                outcome = ?report.outcome,
                files_removed = report.files_removed,
                files_added = report.files_added,
                rows = report.rows,
                attempts = report.attempts,
                duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                metric = "compaction_cycle",
                "compaction cycle finished"
            ),
            Err(e) => metrics::record_error(self.table().name(), "compactor", e.kind()),
        }
        result
    }

    async fn run_cycles(&self, mut lease: Option<&mut LockGuard>) -> Result<CompactionReport> {
        let max_attempts = self.config().max_attempts.max(1);
        let mut report = CompactionReport::default();

        loop {
            report.attempts += 1;
            let snapshot = self.coordinator.latest_snapshot().await?;
            let plan = plan(&snapshot, self.config(), Utc::now());
            if plan.is_empty() {
                report.outcome = if report.committed_versions.is_empty() {
                    CompactionOutcome::NoWork
                } else {
                    CompactionOutcome::Compacted
                };
                return Ok(report);
            }

            let mut rewrites = self.rewrite_all(&plan).await?;
            let mut base = plan.base_version;
            let mut conflicted = false;

            while !rewrites.is_empty() {
                if let Some(guard) = lease.as_deref_mut() {
                    if let Err(e) = guard.renew().await {
                        self.discard(&rewrites).await;
                        return Err(match e {
                            lakelog_core::Error::PreconditionFailed { message } => {
                                TableError::LockLost { message }
                            }
                            other => other.into(),
                        });
                    }
                }

                let rewrite = rewrites.remove(0);
                let proposal =
                    Proposal::compact(base, rewrite.outputs.clone(), rewrite.inputs.clone());
                match self.coordinator.propose(proposal).await {
                    Ok(CommitResult::Committed { version, .. }) => {
                        base = version;
                        report.committed_versions.push(version);
                        report.files_removed += rewrite.inputs.len();
                        report.files_added += rewrite.outputs.len();
                        report.rows += rewrite.inputs.iter().map(|f| f.row_count).sum::<u64>();
                        report.bytes_removed +=
                            rewrite.inputs.iter().map(|f| f.size_bytes).sum::<u64>();
                        report.bytes_added +=
                            rewrite.outputs.iter().map(|f| f.size_bytes).sum::<u64>();
                        metrics::record_compaction(self.table().name(), rewrite.inputs.len() as u64);
                    }
                    Ok(CommitResult::Conflict { latest_version }) => {
                        tracing::info!(
                            table = %self.table().name(),
                            base_version = base,
                            latest_version,
                            attempt = report.attempts,
                            "compaction conflicted; discarding outputs"
                        );
                        self.discard(std::slice::from_ref(&rewrite)).await;
                        self.discard(&rewrites).await;
                        conflicted = true;
                        break;
                    }
                    Err(e) => {
                        // The failed proposal's outputs stay: it may have
                        // been published. Unproposed ones are safe to drop.
                        self.discard(&rewrites).await;
                        return Err(e);
                    }
                }
            }

            if !conflicted {
                report.outcome = CompactionOutcome::Compacted;
                return Ok(report);
            }
            if report.attempts >= max_attempts {
                tracing::warn!(
                    table = %self.table().name(),
                    attempts = report.attempts,
                    "compaction abandoned after repeated conflicts"
                );
                report.outcome = CompactionOutcome::Abandoned;
                return Ok(report);
            }
        }
    }

    /// Rewrites every group with bounded concurrency. On failure all outputs
    /// already written are deleted.
    async fn rewrite_all(&self, plan: &CompactionPlan) -> Result<Vec<Rewrite>> {
        let rewrites: Vec<_> = plan
            .groups
            .iter()
            .map(|group| {
                let compactor = self.clone();
                let group = group.clone();
                async move { compactor.rewrite(&group).await }
            })
            .collect();
        let results: Vec<Result<Rewrite>> = futures::stream::iter(rewrites)
            .buffered(self.config().max_concurrent_rewrites.max(1))
            .collect()
            .await;

        let mut rewrites = Vec::with_capacity(results.len());
        let mut failure = None;
        for result in results {
            match result {
                Ok(rewrite) => rewrites.push(rewrite),
                Err(e) => failure = failure.or(Some(e)),
            }
        }
        if let Some(e) = failure {
            self.discard(&rewrites).await;
            return Err(e);
        }
        Ok(rewrites)
    }

    async fn rewrite(&self, group: &CompactionGroup) -> Result<Rewrite> {
        let storage = self.table().storage();
        let mut batches: Vec<RecordBatch> = Vec::new();
        for file in &group.files {
            let data = storage.get(&file.path).await?;
            batches.extend(datafile::decode(data)?);
        }
        let schema = batches
            .first()
            .map(RecordBatch::schema)
            .ok_or_else(|| TableError::data_file("compaction inputs hold no batches"))?;

        let chunks = datafile::rechunk(&schema, &batches, self.rows_per_file(group))?;
        let attempt = CommitId::generate().to_string().to_ascii_lowercase();
        let mut outputs: Vec<DataFileRef> = Vec::with_capacity(chunks.len());
        for (index, chunk) in chunks.iter().enumerate() {
            let encoded = datafile::encode(std::slice::from_ref(chunk))?;
            let prefix = encoded.fingerprint.get(..16).unwrap_or(&encoded.fingerprint);
            let path = self.table().paths().data_file(
                group.partition.as_deref(),
                &format!("{prefix}-{attempt}-{index}"),
            );
            let size_bytes = encoded.data.len() as u64;
            let written = storage
                .put(&path, encoded.data, WritePrecondition::DoesNotExist)
                .await;
            match written {
                Ok(WriteResult::Success { .. }) => {}
                Ok(WriteResult::PreconditionFailed { .. }) => {
                    self.delete_outputs(&outputs).await;
                    return Err(TableError::idempotency(&path, "compaction output key already taken"));
                }
                Err(e) => {
                    self.delete_outputs(&outputs).await;
                    return Err(e.into());
                }
            }
            outputs.push(DataFileRef {
                path,
                size_bytes,
                row_count: encoded.row_count,
                partition: group.partition.clone(),
                fingerprint: encoded.fingerprint,
                source_batches: Vec::new(),
            });
        }

        tracing::debug!(
            table = %self.table().name(),
            partition = ?group.partition,
            inputs = group.files.len(),
            outputs = outputs.len(),
            rows = group.rows(),
            "group rewritten"
        );
        Ok(Rewrite {
            inputs: group.files.clone(),
            outputs,
        })
    }

    /// Rows per output file so each lands near the target size, assuming
    /// the inputs' average bytes per row.
    fn rows_per_file(&self, group: &CompactionGroup) -> usize {
        let rows = group.rows().max(1);
        let bytes = group.bytes().max(1);
        let target = self.config().target_file_size_bytes;
        let per_file = if bytes <= target {
            rows
        } else {
            (u128::from(rows) * u128::from(target) / u128::from(bytes)).max(1) as u64
        };
        usize::try_from(per_file).unwrap_or(usize::MAX)
    }

    async fn discard(&self, rewrites: &[Rewrite]) {
        for rewrite in rewrites {
            self.delete_outputs(&rewrite.outputs).await;
        }
    }

    async fn delete_outputs(&self, outputs: &[DataFileRef]) {
        for file in outputs {
            match self.table().storage().delete(&file.path).await {
                Ok(()) | Err(lakelog_core::Error::NotFound(_)) => {}
                Err(e) => tracing::warn!(
                    path = %file.path,
                    error = %e,
                    "could not delete unpublished compaction output; vacuum will collect it"
                ),
            }
        }
    }

    /// Runs cycles every `compaction_interval` until shutdown.
    ///
    /// # Errors
    ///
    /// Returns the first non-transient error (e.g. `CorruptLog`). Transient
    /// errors are logged and the next cycle proceeds.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut ticker = tokio::time::interval(self.config().interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(table = %self.table().name(), "compactor started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => match self.compact_once().await {
                    Ok(_) => {}
                    Err(e) if e.is_transient() => {
                        tracing::warn!(table = %self.table().name(), error = %e, "compaction cycle failed");
                    }
                    Err(e) => {
                        tracing::error!(table = %self.table().name(), error = %e, "compactor stopping");
                        return Err(e);
                    }
                },
            }
        }
        tracing::info!(table = %self.table().name(), "compactor stopped");
        Ok(())
    }
}
