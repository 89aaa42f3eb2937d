//! Commit coordinator.
//!
//! Serializes log appends for one table. A proposal names the version it
//! was computed against; the coordinator publishes it as the next version
//! only if nothing was committed since, otherwise it reports a conflict
//! and leaves reconciliation to the caller.
//!
//! ## Protocol
//!
//! 1. Acquire the table's commit lock (bounded wait, `LockTimeout` after).
//! 2. Discover the latest version (listing or cached version, then HEAD
//!    probing past it).
//! 3. `latest > base` → `Conflict`. `latest == base` → validate against the
//!    base snapshot, renew the lock as a fencing check, publish
//!    `base + 1` with put-if-absent.
//! 4. Release the lock on every path.
//!
//! Put-if-absent on the entry key is the final arbiter: even a process
//! that lost its lock without noticing cannot overwrite a version.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use lakelog_core::{CommitId, DistributedLock, HolderId, LockGuard};
use tokio::sync::Mutex;

use crate::error::{Result, TableError};
use crate::log::{
    CommitStats, DataFileRef, LogEntry, MutatorRole, Operation, Publish, Version, WriteMode,
};
use crate::metrics;
use crate::snapshot::Snapshot;
use crate::table::Table;

/// A proposed commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    /// Author role.
    pub role: MutatorRole,
    /// What the commit does.
    pub operation: Operation,
    /// Version the proposal was computed against.
    pub base_version: Version,
    /// Files to add.
    pub add: Vec<DataFileRef>,
    /// Files to tombstone.
    pub remove: Vec<DataFileRef>,
    /// Author-chosen identifier recorded in the entry.
    pub commit_id: CommitId,
}

impl Proposal {
    /// A writer append.
    #[must_use]
    pub fn append(base_version: Version, add: Vec<DataFileRef>) -> Self {
        Self::write(WriteMode::Append, base_version, add, Vec::new())
    }

    /// A writer commit in the given mode.
    #[must_use]
    pub fn write(
        mode: WriteMode,
        base_version: Version,
        add: Vec<DataFileRef>,
        remove: Vec<DataFileRef>,
    ) -> Self {
        Self {
            role: MutatorRole::Writer,
            operation: Operation::Write { mode },
            base_version,
            add,
            remove,
            commit_id: CommitId::generate(),
        }
    }

    /// A compaction replacing `remove` with `add`.
    #[must_use]
    pub fn compact(base_version: Version, add: Vec<DataFileRef>, remove: Vec<DataFileRef>) -> Self {
        Self {
            role: MutatorRole::Compactor,
            operation: Operation::Compact,
            base_version,
            add,
            remove,
            commit_id: CommitId::generate(),
        }
    }
}

/// Outcome of [`CommitCoordinator::propose`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitResult {
    /// The proposal is now the entry at `version`.
    Committed {
        /// Published version.
        version: Version,
        /// Published entry.
        entry: Box<LogEntry>,
    },
    /// Another commit landed after the base version. Nothing was written.
    Conflict {
        /// Latest version observed.
        latest_version: Version,
    },
}

impl CommitResult {
    /// Published version, if committed.
    #[must_use]
    pub fn version(&self) -> Option<Version> {
        match self {
            Self::Committed { version, .. } => Some(*version),
            Self::Conflict { .. } => None,
        }
    }

    /// Whether the proposal was published.
    #[must_use]
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed { .. })
    }
}

/// Commit coordinator for one table.
///
/// Cheap to clone; clones share the snapshot cache and holder identity.
#[derive(Clone)]
pub struct CommitCoordinator {
    table: Table,
    lock: DistributedLock,
    cache: Arc<Mutex<Option<Snapshot>>>,
}

impl std::fmt::Debug for CommitCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitCoordinator")
            .field("table", &self.table.name())
            .field("holder", &self.lock.holder())
            .finish_non_exhaustive()
    }
}

impl CommitCoordinator {
    /// Creates a coordinator using the table's lock configuration.
    #[must_use]
    pub fn new(table: Table) -> Self {
        let lock = table.lock(table.paths().commit_lock());
        Self {
            table,
            lock,
            cache: Arc::new(Mutex::new(None)),
        }
    }

    /// Bounds how long each proposal waits for the commit lock.
    #[must_use]
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.lock = self.lock.with_acquire_timeout(timeout);
        self
    }

    /// Uses a fixed holder identity for the commit lock.
    #[must_use]
    pub fn with_holder(mut self, holder: HolderId) -> Self {
        self.lock = self.lock.with_holder(holder);
        self
    }

    /// The table.
    #[must_use]
    pub fn table(&self) -> &Table {
        &self.table
    }

    /// Holder identity used for the commit lock.
    #[must_use]
    pub fn holder(&self) -> HolderId {
        self.lock.holder()
    }

    /// Snapshot at the latest version, reusing the cached snapshot.
    ///
    /// # Errors
    ///
    /// Returns `TableNotFound`, `CorruptLog` and storage errors.
    pub async fn latest_snapshot(&self) -> Result<Snapshot> {
        let cached = self.cache.lock().await.clone();
        let snapshot = match cached {
            Some(mut snapshot) => {
                self.table.advance(&mut snapshot).await?;
                snapshot
            }
            None => self.table.latest_snapshot().await?,
        };
        self.remember(&snapshot).await;
        Ok(snapshot)
    }

    /// Proposes a commit.
    ///
    /// `Conflict` is a normal outcome: the caller decides whether to rebase
    /// and retry.
    ///
    /// # Errors
    ///
    /// - `LockTimeout` if the commit lock stays busy past the deadline
    /// - `LockLost` if the lock expired before publishing
    /// - `StoreUnavailable` on storage failures
    /// - `InvalidProposal` / `IdempotencyViolation` if the proposal is
    ///   inconsistent with its base snapshot
    /// - `CorruptLog` if the log cannot be replayed
    pub async fn propose(&self, proposal: Proposal) -> Result<CommitResult> {
        let started = Instant::now();
        let role = proposal.role.to_string();
        let result = match validate_shape(&proposal) {
            Ok(()) => self.propose_locked(proposal).await,
            Err(e) => Err(e),
        };

        let name = self.table.name();
        match &result {
            Ok(CommitResult::Committed { version, .. }) => {
                metrics::record_commit(name, &role, "committed", started.elapsed());
                metrics::record_version(name, *version);
            }
            Ok(CommitResult::Conflict { .. }) => {
                metrics::record_commit(name, &role, "conflict", started.elapsed());
            }
            Err(e) => {
                metrics::record_commit(name, &role, "error", started.elapsed());
                metrics::record_error(name, &role, e.kind());
            }
        }
        result
    }

    async fn propose_locked(&self, proposal: Proposal) -> Result<CommitResult> {
        let mut guard = self.lock.acquire().await?;
        let outcome = self.commit_under_lock(&mut guard, proposal).await;
        if let Err(e) = guard.release().await {
            tracing::warn!(
                table = %self.table.name(),
                error = %e,
                "commit lock release failed; TTL will reclaim it"
            );
        }
        outcome
    }

    async fn commit_under_lock(
        &self,
        guard: &mut LockGuard,
        proposal: Proposal,
    ) -> Result<CommitResult> {
        let base = proposal.base_version;
        let latest = self.discover_latest().await?;
        if latest > base {
            tracing::debug!(
                table = %self.table.name(),
                role = %proposal.role,
                base_version = base,
                latest_version = latest,
                "proposal is stale"
            );
            return Ok(CommitResult::Conflict {
                latest_version: latest,
            });
        }
        if latest < base {
            return Err(TableError::invalid_proposal(format!(
                "base version {base} is ahead of the latest version {latest}"
            )));
        }

        let mut snapshot = self.snapshot_for_base(base).await?;
        validate_against(&snapshot, &proposal)?;

        guard.renew().await.map_err(|e| match e {
            lakelog_core::Error::PreconditionFailed { message } => TableError::LockLost { message },
            other => other.into(),
        })?;

        let Proposal {
            role,
            operation,
            add,
            remove,
            commit_id,
            ..
        } = proposal;
        let version = base + 1;
        let entry = LogEntry {
            version,
            base_version: Some(base),
            commit_id,
            role,
            operation,
            timestamp: Utc::now().max(snapshot.timestamp()),
            stats: Some(CommitStats::compute(&add, &remove)),
            add,
            remove,
            fencing_token: Some(guard.fencing_token().sequence()),
        };

        match self.table.log().publish(&entry).await? {
            Publish::Published => {
                // Published: nothing past this point may return an error.
                match snapshot.apply(&self.table.paths().log_entry(version), &entry) {
                    Ok(()) => {
                        self.table.maybe_checkpoint(&snapshot).await;
                        self.remember(&snapshot).await;
                    }
                    Err(e) => {
                        tracing::error!(
                            table = %self.table.name(),
                            version,
                            error = %e,
                            "published entry does not replay; dropping snapshot cache"
                        );
                        *self.cache.lock().await = None;
                    }
                }
                tracing::info!(
                    table = %self.table.name(),
                    role = %entry.role,
                    operation = entry.operation.name(),
                    version,
                    files_added = entry.add.len(),
                    files_removed = entry.remove.len(),
                    fencing = entry.fencing_token,
                    metric = "commit",
                    "committed"
                );
                Ok(CommitResult::Committed {
                    version,
                    entry: Box::new(entry),
                })
            }
            Publish::VersionTaken => {
                tracing::warn!(
                    table = %self.table.name(),
                    version,
                    "version taken despite holding the commit lock"
                );
                Ok(CommitResult::Conflict {
                    latest_version: version,
                })
            }
        }
    }

    async fn discover_latest(&self) -> Result<Version> {
        let known = self.cache.lock().await.as_ref().map(Snapshot::version);
        let latest = match known {
            Some(version) => self.table.log().probe_forward(Some(version)).await?,
            None => self.table.log().latest_version().await?,
        };
        latest.ok_or_else(|| TableError::TableNotFound {
            root: self.table.paths().root().to_string(),
        })
    }

    async fn snapshot_for_base(&self, base: Version) -> Result<Snapshot> {
        let cached = self.cache.lock().await.clone();
        let Some(mut snapshot) = cached.filter(|s| s.version() <= base) else {
            return self.table.snapshot_at(base).await;
        };
        while snapshot.version() < base {
            let next = snapshot.version() + 1;
            let entry = self.table.log().read_required(next).await?;
            snapshot.apply(&self.table.paths().log_entry(next), &entry)?;
        }
        Ok(snapshot)
    }

    async fn remember(&self, snapshot: &Snapshot) {
        let mut cache = self.cache.lock().await;
        let newer = cache
            .as_ref()
            .is_none_or(|cached| cached.version() < snapshot.version());
        if newer {
            *cache = Some(snapshot.clone());
        }
    }
}

/// Checks that need no snapshot.
fn validate_shape(proposal: &Proposal) -> Result<()> {
    if proposal.add.is_empty() && proposal.remove.is_empty() {
        return Err(TableError::invalid_proposal("proposal adds and removes nothing"));
    }
    match (&proposal.role, &proposal.operation) {
        (_, Operation::CreateTable { .. }) => {
            return Err(TableError::invalid_proposal(
                "tables are created with Table::create, not proposed",
            ));
        }
        (MutatorRole::Writer, Operation::Write { mode }) => {
            if *mode == WriteMode::Append && !proposal.remove.is_empty() {
                return Err(TableError::invalid_proposal("append writes cannot remove files"));
            }
        }
        (MutatorRole::Compactor, Operation::Compact) => {
            if proposal.add.is_empty() || proposal.remove.is_empty() {
                return Err(TableError::invalid_proposal(
                    "compaction must both add and remove files",
                ));
            }
        }
        (role, operation) => {
            return Err(TableError::invalid_proposal(format!(
                "role {role} cannot commit {}",
                operation.name()
            )));
        }
    }
    for (list, label) in [(&proposal.add, "add"), (&proposal.remove, "remove")] {
        let mut seen = std::collections::HashSet::new();
        if let Some(dup) = list.iter().find(|f| !seen.insert(f.path.as_str())) {
            return Err(TableError::invalid_proposal(format!(
                "{} listed twice in {label}",
                dup.path
            )));
        }
    }
    Ok(())
}

/// Checks against the snapshot at the base version.
fn validate_against(snapshot: &Snapshot, proposal: &Proposal) -> Result<()> {
    if let Some(missing) = proposal.remove.iter().find(|f| !snapshot.contains(&f.path)) {
        return Err(TableError::invalid_proposal(format!(
            "removes {} which is not live at version {}",
            missing.path,
            snapshot.version()
        )));
    }
    for file in &proposal.add {
        let replaced = proposal.remove.iter().any(|r| r.path == file.path);
        if snapshot.contains(&file.path) && !replaced {
            return Err(TableError::idempotency(
                &file.path,
                "file is already live in the table",
            ));
        }
        if let Some(batch) = file
            .source_batches
            .iter()
            .find(|digest| snapshot.is_batch_committed(digest))
        {
            return Err(TableError::idempotency(
                &file.path,
                format!("batch {batch} was already committed"),
            ));
        }
    }
    if proposal.operation == Operation::Compact {
        let removed: u64 = proposal
            .remove
            .iter()
            .filter_map(|f| snapshot.file(&f.path))
            .map(|f| f.row_count)
            .sum();
        let added: u64 = proposal.add.iter().map(|f| f.row_count).sum();
        if removed != added {
            return Err(TableError::invalid_proposal(format!(
                "compaction removes {removed} rows but adds {added}"
            )));
        }
    }
    Ok(())
}
