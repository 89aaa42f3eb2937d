//! Vacuum: deletes data files no snapshot inside the retention window can
//! reach.
//!
//! The retention cutoff `now - retention` resolves to `Vc`, the last
//! version committed at or before it. Every version a reader may still
//! time-travel to is `>= Vc`, so a file is reachable iff it is live at `Vc`
//! or was added after `Vc`. Candidates are files tombstoned at or before
//! `Vc` that are not reachable, plus (optionally) data objects no entry
//! ever referenced that are older than the cutoff.
//!
//! The latest snapshot is re-read after listing, so a file a concurrent
//! commit made live while the listing ran is never taken for an orphan.
//!
//! Only objects under the data prefix are ever deleted. The log and its
//! checkpoints are never touched. Per-object failures are collected into
//! the report and the next run picks them up again.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use lakelog_core::{ObjectMeta, RetryPolicy};
use tokio::sync::watch;

use crate::config::VacuumConfig;
use crate::error::{Result, TableError};
use crate::log::Version;
use crate::metrics;
use crate::reader::last_version_at_or_before;
use crate::snapshot::Snapshot;
use crate::table::Table;

/// Why an object is eligible for deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VacuumReason {
    /// Removed by a commit at or before the retention boundary.
    Tombstoned {
        /// Version whose entry removed the file.
        removed_version: Version,
    },
    /// Never referenced by any log entry.
    Orphan,
}

/// One object selected for deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VacuumCandidate {
    /// Object key.
    pub path: String,
    /// Size as listed.
    pub size_bytes: u64,
    /// Selection reason.
    pub reason: VacuumReason,
}

/// Result of one vacuum run.
#[derive(Debug, Clone, Default)]
pub struct VacuumReport {
    /// Oldest version still readable after this run; `None` if the whole
    /// log is newer than the cutoff and nothing was considered.
    pub retained_from_version: Option<Version>,
    /// Retention cutoff instant.
    pub cutoff: Option<DateTime<Utc>>,
    /// Objects selected for deletion.
    pub candidates: Vec<VacuumCandidate>,
    /// Objects actually deleted.
    pub deleted: u64,
    /// Bytes actually reclaimed.
    pub bytes_reclaimed: u64,
    /// Per-object failures (the run continues past them).
    pub errors: Vec<String>,
    /// Whether deletion was skipped.
    pub dry_run: bool,
}

impl VacuumReport {
    /// Returns true if any delete failed.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Total listed size of all candidates.
    #[must_use]
    pub fn candidate_bytes(&self) -> u64 {
        self.candidates.iter().map(|c| c.size_bytes).sum()
    }
}

/// Reclaims storage behind the retention window.
#[derive(Debug, Clone)]
pub struct Vacuum {
    table: Table,
    config: VacuumConfig,
}

impl Vacuum {
    /// Creates a vacuum using the table's configuration.
    #[must_use]
    pub fn new(table: Table) -> Self {
        let config = table.config().vacuum.clone();
        Self { table, config }
    }

    /// Overrides the configured dry-run flag.
    #[must_use]
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.config.dry_run = dry_run;
        self
    }

    /// The table.
    #[must_use]
    pub fn table(&self) -> &Table {
        &self.table
    }

    /// Runs once with the configured retention.
    ///
    /// # Errors
    ///
    /// See [`Vacuum::run_at`].
    pub async fn run_once(&self) -> Result<VacuumReport> {
        self.run_at(Utc::now(), None).await
    }

    /// Runs once as of `now`, with `retention` overriding the configured
    /// window.
    ///
    /// # Errors
    ///
    /// Returns `RetentionViolation` if `retention` is below the floor
    /// (nothing is deleted), and log or listing failures. Individual
    /// delete failures are reported in [`VacuumReport::errors`].
    pub async fn run_at(
        &self,
        now: DateTime<Utc>,
        retention: Option<Duration>,
    ) -> Result<VacuumReport> {
        let started = Instant::now();
        let name = self.table.name();
        let retention = retention.unwrap_or_else(|| self.table.config().retention.retention());
        if let Err(e) = self.table.config().retention.check(retention) {
            metrics::record_error(name, "vacuum", e.kind());
            tracing::error!(table = %name, error = %e, "vacuum refused");
            return Err(e);
        }
        let window = chrono::Duration::from_std(retention)
            .map_err(|_| TableError::config(format!("retention {retention:?} out of range")))?;
        let cutoff = now - window;

        let mut report = VacuumReport {
            cutoff: Some(cutoff),
            dry_run: self.config.dry_run,
            ..VacuumReport::default()
        };

        let latest = self.table.latest_version().await?;
        let Some(boundary) = last_version_at_or_before(&self.table, cutoff, latest).await? else {
            tracing::debug!(table = %name, cutoff = %cutoff, "log newer than cutoff, nothing to vacuum");
            return Ok(report);
        };
        report.retained_from_version = Some(boundary);

        let at_boundary = self.table.snapshot_at(boundary).await?;
        let mut current = self.table.latest_snapshot().await?;
        let listed = self.table.storage().list(&self.table.paths().data_prefix()).await?;
        let caught_up = self.table.advance(&mut current).await?;
        if caught_up > 0 {
            tracing::debug!(
                table = %name,
                version = current.version(),
                entries = caught_up,
                "log advanced during listing"
            );
        }

        report.candidates = select_candidates(
            &at_boundary,
            &current,
            &listed,
            cutoff,
            self.config.include_orphans,
        );

        if !self.config.dry_run {
            self.delete_candidates(&mut report).await;
            metrics::record_vacuum(name, report.deleted, report.bytes_reclaimed);
        }
        if report.has_errors() {
            metrics::record_error(name, "vacuum", "delete_failed");
            tracing::warn!(
                table = %name,
                errors = report.errors.len(),
                metric = "lakelog_errors_total",
                "vacuum delete failures"
            );
        }
        tracing::info!(
            table = %name,
            retained_from_version = boundary,
            candidates = report.candidates.len(),
            deleted = report.deleted,
            bytes_reclaimed = report.bytes_reclaimed,
            dry_run = report.dry_run,
            duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            metric = "vacuum",
            "vacuum completed"
        );
        Ok(report)
    }

    async fn delete_candidates(&self, report: &mut VacuumReport) {
        let policy = RetryPolicy::default()
            .with_max_attempts(self.config.max_delete_attempts)
            .with_delays(Duration::from_millis(50), Duration::from_secs(2));
        let deletes: Vec<_> = report
            .candidates
            .iter()
            .enumerate()
            .map(|(index, candidate)| {
                let storage = Arc::clone(self.table.storage());
                let path = candidate.path.clone();
                async move {
                    let outcome = policy
                        .retry("vacuum.delete", lakelog_core::Error::is_retryable, |_| {
                            let storage = Arc::clone(&storage);
                            let path = path.clone();
                            async move { storage.delete(&path).await }
                        })
                        .await;
                    (index, outcome)
                }
            })
            .collect();
        let outcomes: Vec<_> = futures::stream::iter(deletes)
            .buffer_unordered(self.config.delete_concurrency.max(1))
            .collect()
            .await;

        for (index, outcome) in outcomes {
            let candidate = &report.candidates[index];
            match outcome {
                Ok(()) => {
                    report.deleted += 1;
                    report.bytes_reclaimed += candidate.size_bytes;
                }
                Err(e) => report.errors.push(format!("delete {}: {e}", candidate.path)),
            }
        }
    }

    /// Runs on the configured interval until `shutdown` flips to true.
    ///
    /// # Errors
    ///
    /// Returns the first non-transient error (for example a retention
    /// violation from bad configuration).
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(table = %self.table.name(), "vacuum started");
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
                _ = ticker.tick() => match self.run_once().await {
                    Ok(_) => {}
                    Err(e) if e.is_transient() => {
                        tracing::warn!(table = %self.table.name(), error = %e, "vacuum run failed");
                    }
                    Err(e) => {
                        tracing::error!(table = %self.table.name(), error = %e, "vacuum stopping");
                        return Err(e);
                    }
                },
            }
        }
        tracing::info!(table = %self.table.name(), "vacuum stopped");
        Ok(())
    }
}

/// Picks deletable objects from a listing.
///
/// Files live at the boundary or added after it are reachable: such a
/// file is either live in `current` with a later `added_version`, or was
/// tombstoned after the boundary. Only listed objects are returned, so
/// already-vacuumed tombstones drop out.
fn select_candidates(
    at_boundary: &Snapshot,
    current: &Snapshot,
    listed: &[ObjectMeta],
    cutoff: DateTime<Utc>,
    include_orphans: bool,
) -> Vec<VacuumCandidate> {
    let boundary = at_boundary.version();
    let mut reachable: HashSet<&str> = at_boundary.files().map(|f| f.path.as_str()).collect();
    reachable.extend(
        current
            .live_files()
            .filter(|l| l.added_version > boundary)
            .map(|l| l.file.path.as_str()),
    );
    reachable.extend(
        current
            .tombstones()
            .filter(|t| t.removed_version > boundary)
            .map(|t| t.file.path.as_str()),
    );

    let mut candidates: Vec<VacuumCandidate> = listed
        .iter()
        .filter(|meta| !reachable.contains(meta.path.as_str()))
        .filter_map(|meta| {
            let tombstone = at_boundary.tombstones().find(|t| t.file.path == meta.path);
            let reason = match tombstone {
                Some(t) => VacuumReason::Tombstoned {
                    removed_version: t.removed_version,
                },
                None if include_orphans
                    && !current.knows(&meta.path)
                    && meta.last_modified.is_some_and(|m| m < cutoff) =>
                {
                    VacuumReason::Orphan
                }
                None => return None,
            };
            Some(VacuumCandidate {
                path: meta.path.clone(),
                size_bytes: meta.size,
                reason,
            })
        })
        .collect();
    candidates.sort_by(|a, b| a.path.cmp(&b.path));
    candidates
}
