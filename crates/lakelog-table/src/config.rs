//! Table configuration.
//!
//! Every knob has a default, can be loaded from a JSON document (missing
//! fields fall back to defaults) and can be overridden by `LAKELOG_*`
//! environment variables. Call [`TableConfig::validate`] before use; the
//! constructors that load configuration do so already.
//!
//! ```text
//! LAKELOG_CHECKPOINT_INTERVAL        checkpoint every N versions (10)
//! LAKELOG_STORE_CALL_TIMEOUT_MS      deadline per object-store call (10000)
//! LAKELOG_LOCK_TTL_SECS              commit lock TTL (30)
//! LAKELOG_LOCK_ACQUIRE_TIMEOUT_MS    max wait for the commit lock (5000)
//! LAKELOG_WRITER_FLUSH_INTERVAL_MS   writer flush window (1000)
//! LAKELOG_WRITER_MAX_BATCH_ROWS      rows that force an early flush (1000)
//! LAKELOG_WRITER_COMMIT_SLA_MS       lock wait per writer commit attempt (250)
//! LAKELOG_WRITER_MAX_RETRIES         retries on lock/store failures (3)
//! LAKELOG_WRITER_MAX_BUFFERED        buffered batches before backpressure (64)
//! LAKELOG_COMPACTION_TARGET_BYTES    target output file size (128 MiB)
//! LAKELOG_COMPACTION_MIN_FILES       small files that trigger compaction (5)
//! LAKELOG_COMPACTION_INTERVAL_SECS   time trigger and loop interval (300)
//! LAKELOG_COMPACTION_EXCLUSIVE       single-active-compactor lease (true)
//! LAKELOG_VACUUM_INTERVAL_SECS       vacuum loop interval (3600)
//! LAKELOG_VACUUM_DRY_RUN             report without deleting (false)
//! LAKELOG_RETENTION_HOURS            time-travel retention window (72)
//! LAKELOG_RETENTION_FLOOR_HOURS      minimum allowed retention (24)
//! ```

use std::path::Path;
use std::time::Duration;

use lakelog_core::RetryPolicy;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TableError};

/// Retention can never be configured or requested below this.
pub const HARD_RETENTION_FLOOR: Duration = Duration::from_secs(60 * 60);

const MIB: u64 = 1024 * 1024;

/// Time-travel retention for one table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct RetentionConfig {
    /// How long removed files stay readable by time travel.
    pub retention_hours: u64,
    /// Smallest retention a vacuum may be asked for.
    pub retention_floor_hours: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            retention_hours: 72,
            retention_floor_hours: 24,
        }
    }
}

impl RetentionConfig {
    /// Configured retention.
    #[must_use]
    pub fn retention(&self) -> Duration {
        hours(self.retention_hours)
    }

    /// Effective floor: the table floor, never below the hard floor.
    #[must_use]
    pub fn floor(&self) -> Duration {
        hours(self.retention_floor_hours).max(HARD_RETENTION_FLOOR)
    }

    /// Checks `requested` against the floor.
    ///
    /// # Errors
    ///
    /// Returns `TableError::RetentionViolation` if `requested` is below the
    /// effective floor. The request is rejected, never clamped.
    pub fn check(&self, requested: Duration) -> Result<()> {
        let floor = self.floor();
        if requested < floor {
            return Err(TableError::RetentionViolation { requested, floor });
        }
        Ok(())
    }
}

fn hours(h: u64) -> Duration {
    Duration::from_secs(h.saturating_mul(3600))
}

/// Writer tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct WriterConfig {
    /// Flush window: buffered batches are committed at least this often.
    pub flush_interval_ms: u64,
    /// Buffered rows that trigger a flush before the window closes.
    pub max_batch_rows: usize,
    /// Lock wait allowed per commit attempt.
    pub commit_sla_ms: u64,
    /// Retries on lock timeouts and store failures per flush.
    pub max_retries: u32,
    /// First backoff delay for those retries.
    pub retry_delay_ms: u64,
    /// Immediate retries after a commit conflict.
    pub max_conflict_retries: u32,
    /// Buffered batches at which the writer stops accepting input.
    pub max_buffered_batches: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 1000,
            max_batch_rows: 1000,
            commit_sla_ms: 250,
            max_retries: 3,
            retry_delay_ms: 100,
            max_conflict_retries: 16,
            max_buffered_batches: 64,
        }
    }
}

impl WriterConfig {
    /// Flush window.
    #[must_use]
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Lock wait per commit attempt.
    #[must_use]
    pub fn commit_sla(&self) -> Duration {
        Duration::from_millis(self.commit_sla_ms)
    }

    /// Backoff policy for retryable failures. Attempts include the first.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(self.max_retries.saturating_add(1))
            .with_delays(
                Duration::from_millis(self.retry_delay_ms),
                Duration::from_millis(self.retry_delay_ms.saturating_mul(20)),
            )
    }
}

/// Compactor tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct CompactionConfig {
    /// Target output file size.
    pub target_file_size_bytes: u64,
    /// Files below this size are compaction candidates (default: half the
    /// target).
    pub small_file_threshold_bytes: Option<u64>,
    /// Small files in one partition that trigger compaction.
    pub min_files_to_compact: usize,
    /// Time trigger and loop interval.
    pub compaction_interval_secs: u64,
    /// Groups rewritten concurrently.
    pub max_concurrent_rewrites: usize,
    /// Cycles attempted when commits conflict.
    pub max_attempts: u32,
    /// Hold a lease so only one compactor per table does work.
    pub exclusive_lease: bool,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            target_file_size_bytes: 128 * MIB,
            small_file_threshold_bytes: None,
            min_files_to_compact: 5,
            compaction_interval_secs: 300,
            max_concurrent_rewrites: 2,
            max_attempts: 3,
            exclusive_lease: true,
        }
    }
}

impl CompactionConfig {
    /// Size below which a file counts as small.
    #[must_use]
    pub fn small_file_threshold(&self) -> u64 {
        self.small_file_threshold_bytes
            .unwrap_or(self.target_file_size_bytes / 2)
    }

    /// Time trigger and loop interval.
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.compaction_interval_secs)
    }
}

/// Vacuum tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct VacuumConfig {
    /// Loop interval.
    pub vacuum_interval_secs: u64,
    /// Report candidates without deleting.
    pub dry_run: bool,
    /// Attempts per object delete.
    pub max_delete_attempts: u32,
    /// Also delete data objects no log entry ever referenced.
    pub include_orphans: bool,
    /// Concurrent deletes.
    pub delete_concurrency: usize,
}

impl Default for VacuumConfig {
    fn default() -> Self {
        Self {
            vacuum_interval_secs: 3600,
            dry_run: false,
            max_delete_attempts: 3,
            include_orphans: true,
            delete_concurrency: 8,
        }
    }
}

impl VacuumConfig {
    /// Loop interval.
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.vacuum_interval_secs)
    }
}

/// Commit lock timing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct LockConfig {
    /// Lock TTL.
    pub ttl_secs: u64,
    /// Maximum wait for a busy lock.
    pub acquire_timeout_ms: u64,
    /// Backoff between acquisition attempts.
    pub backoff: RetryPolicy,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 30,
            acquire_timeout_ms: 5000,
            backoff: RetryPolicy::default()
                .with_delays(Duration::from_millis(20), Duration::from_millis(500)),
        }
    }
}

impl LockConfig {
    /// Lock TTL.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Maximum wait for a busy lock.
    #[must_use]
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

/// All configuration for one table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct TableConfig {
    /// Write a checkpoint every N versions (0 disables checkpoints).
    pub checkpoint_interval: u64,
    /// Deadline for every object-store call.
    pub store_call_timeout_ms: u64,
    /// Commit lock.
    pub lock: LockConfig,
    /// Writer.
    pub writer: WriterConfig,
    /// Compactor.
    pub compaction: CompactionConfig,
    /// Vacuum.
    pub vacuum: VacuumConfig,
    /// Retention.
    pub retention: RetentionConfig,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: 10,
            store_call_timeout_ms: 10_000,
            lock: LockConfig::default(),
            writer: WriterConfig::default(),
            compaction: CompactionConfig::default(),
            vacuum: VacuumConfig::default(),
            retention: RetentionConfig::default(),
        }
    }
}

impl TableConfig {
    /// Deadline for every object-store call.
    #[must_use]
    pub fn store_call_timeout(&self) -> Duration {
        Duration::from_millis(self.store_call_timeout_ms)
    }

    /// Loads defaults overridden by `LAKELOG_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns `TableError::Config` for unparseable values or a configuration
    /// that fails [`validate`](Self::validate).
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a JSON document, then applies environment overrides.
    ///
    /// # Errors
    ///
    /// Returns `TableError::Config` if the file cannot be read or parsed, or
    /// the result is invalid.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| TableError::config(format!("read {}: {e}", path.display())))?;
        let mut config: Self = serde_json::from_str(&raw)
            .map_err(|e| TableError::config(format!("parse {}: {e}", path.display())))?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(v) = env_u64("LAKELOG_CHECKPOINT_INTERVAL")? {
            self.checkpoint_interval = v;
        }
        if let Some(v) = env_u64("LAKELOG_STORE_CALL_TIMEOUT_MS")? {
            self.store_call_timeout_ms = v;
        }
        if let Some(v) = env_u64("LAKELOG_LOCK_TTL_SECS")? {
            self.lock.ttl_secs = v;
        }
        if let Some(v) = env_u64("LAKELOG_LOCK_ACQUIRE_TIMEOUT_MS")? {
            self.lock.acquire_timeout_ms = v;
        }
        if let Some(v) = env_u64("LAKELOG_WRITER_FLUSH_INTERVAL_MS")? {
            self.writer.flush_interval_ms = v;
        }
        if let Some(v) = env_usize("LAKELOG_WRITER_MAX_BATCH_ROWS")? {
            self.writer.max_batch_rows = v;
        }
        if let Some(v) = env_u64("LAKELOG_WRITER_COMMIT_SLA_MS")? {
            self.writer.commit_sla_ms = v;
        }
        if let Some(v) = env_u64("LAKELOG_WRITER_MAX_RETRIES")? {
            self.writer.max_retries = u32::try_from(v).map_err(|e| {
                TableError::config(format!("LAKELOG_WRITER_MAX_RETRIES out of range: {e}"))
            })?;
        }
        if let Some(v) = env_usize("LAKELOG_WRITER_MAX_BUFFERED")? {
            self.writer.max_buffered_batches = v;
        }
        if let Some(v) = env_u64("LAKELOG_COMPACTION_TARGET_BYTES")? {
            self.compaction.target_file_size_bytes = v;
        }
        if let Some(v) = env_usize("LAKELOG_COMPACTION_MIN_FILES")? {
            self.compaction.min_files_to_compact = v;
        }
        if let Some(v) = env_u64("LAKELOG_COMPACTION_INTERVAL_SECS")? {
            self.compaction.compaction_interval_secs = v;
        }
        if let Some(v) = env_bool("LAKELOG_COMPACTION_EXCLUSIVE")? {
            self.compaction.exclusive_lease = v;
        }
        if let Some(v) = env_u64("LAKELOG_VACUUM_INTERVAL_SECS")? {
            self.vacuum.vacuum_interval_secs = v;
        }
        if let Some(v) = env_bool("LAKELOG_VACUUM_DRY_RUN")? {
            self.vacuum.dry_run = v;
        }
        if let Some(v) = env_u64("LAKELOG_RETENTION_HOURS")? {
            self.retention.retention_hours = v;
        }
        if let Some(v) = env_u64("LAKELOG_RETENTION_FLOOR_HOURS")? {
            self.retention.retention_floor_hours = v;
        }
        Ok(())
    }

    /// Checks invariants between settings.
    ///
    /// # Errors
    ///
    /// Returns `TableError::Config` describing the first violation.
    pub fn validate(&self) -> Result<()> {
        if hours(self.retention.retention_floor_hours) < HARD_RETENTION_FLOOR {
            return Err(TableError::config(format!(
                "retention floor {}h is below the hard floor of {}h",
                self.retention.retention_floor_hours,
                HARD_RETENTION_FLOOR.as_secs() / 3600
            )));
        }
        if self.retention.retention_hours < self.retention.retention_floor_hours {
            return Err(TableError::config(format!(
                "retention {}h is below the floor {}h",
                self.retention.retention_hours, self.retention.retention_floor_hours
            )));
        }
        if self.compaction.target_file_size_bytes == 0 {
            return Err(TableError::config("compaction target size must be positive"));
        }
        if self.compaction.small_file_threshold() > self.compaction.target_file_size_bytes {
            return Err(TableError::config(
                "small-file threshold cannot exceed the compaction target size",
            ));
        }
        if self.compaction.min_files_to_compact < 2 {
            return Err(TableError::config("compaction needs at least 2 files per group"));
        }
        if self.compaction.max_concurrent_rewrites == 0 || self.vacuum.delete_concurrency == 0 {
            return Err(TableError::config("concurrency limits must be positive"));
        }
        if self.lock.ttl_secs == 0 {
            return Err(TableError::config("lock TTL must be positive"));
        }
        if self.store_call_timeout_ms == 0 {
            return Err(TableError::config("store call timeout must be positive"));
        }
        if self.writer.max_buffered_batches == 0 || self.writer.max_batch_rows == 0 {
            return Err(TableError::config("writer buffer limits must be positive"));
        }
        Ok(())
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn env_u64(name: &str) -> Result<Option<u64>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<u64>()
        .map(Some)
        .map_err(|e| TableError::config(format!("{name} must be a u64: {e}")))
}

fn env_usize(name: &str) -> Result<Option<usize>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<usize>()
        .map(Some)
        .map_err(|e| TableError::config(format!("{name} must be a usize: {e}")))
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "y" => Ok(true),
        "false" | "0" | "no" | "n" => Ok(false),
        _ => Err(TableError::config(format!(
            "{name} must be a boolean (true/false/1/0)"
        ))),
    }
}

fn env_bool(name: &str) -> Result<Option<bool>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    parse_bool(name, &v).map(Some)
}
