//! # lakelog-table
//!
//! Log-structured transactional tables on object storage.
//!
//! A table is an ordered log of immutable JSON entries plus immutable
//! Parquet data files. Every mutation goes through one commit protocol:
//!
//! - **Coordinator**: serializes commits under a distributed lock and
//!   publishes entry `base + 1` with put-if-absent, or reports a conflict
//! - **Writer**: buffers ingest batches and appends them idempotently
//! - **Compactor**: merges small files without changing any row
//! - **Vacuum**: deletes files no snapshot in the retention window can reach
//! - **Reader**: snapshots by version or timestamp, and commit history
//!
//! ## Storage Layout
//!
//! ```text
//! {root}/
//! ├── _log/
//! │   ├── 00000000000000000000.json              # version 0: table metadata
//! │   ├── 00000000000000000001.json              # one entry per commit
//! │   └── 00000000000000000010.checkpoint.json   # replay shortcut
//! ├── _locks/
//! │   ├── commit                                 # serializes log writes
//! │   └── compactor                              # optional compactor lease
//! └── data/
//!     ├── p=eu/part-….parquet
//!     └── _default/part-….parquet
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use lakelog_table::prelude::*;
//!
//! let table = Table::open("s3://bucket/tables/events", TableConfig::from_env()?)?;
//! table.create(TableMetadata::new("events").with_partition_column("region")).await?;
//!
//! let writer = Writer::new(table.clone());
//! writer.append(&[IngestBatch::new("batch-0001", batch).with_partition("eu")]).await?;
//!
//! let snapshot = TableReader::new(table).snapshot(VersionSpec::Latest).await?;
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod compactor;
pub mod config;
pub mod coordinator;
pub mod datafile;
pub mod error;
pub mod log;
pub mod metrics;
pub mod orchestrator;
pub mod paths;
pub mod reader;
pub mod snapshot;
pub mod table;
pub mod vacuum;
pub mod writer;

pub use compactor::{
    CompactionOutcome, CompactionPlan, CompactionReport, CompactionTrigger, Compactor,
};
pub use config::{
    CompactionConfig, LockConfig, RetentionConfig, TableConfig, VacuumConfig, WriterConfig,
};
pub use coordinator::{CommitCoordinator, CommitResult, Proposal};
pub use error::{Result, TableError};
pub use log::{
    CommitStats, DataFileRef, LogEntry, MutatorRole, Operation, TableMetadata, TransactionLog,
    Version, WriteMode,
};
pub use orchestrator::{Orchestrator, OrchestratorHandle, OrchestratorSummary};
pub use paths::{TableLocation, TablePaths};
pub use reader::{TableReader, VersionSpec};
pub use snapshot::{LiveFile, Snapshot, Tombstone};
pub use table::Table;
pub use vacuum::{Vacuum, VacuumCandidate, VacuumReason, VacuumReport};
pub use writer::{IngestBatch, WriteReport, Writer, WriterMetrics};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::compactor::Compactor;
    pub use crate::config::TableConfig;
    pub use crate::coordinator::{CommitCoordinator, CommitResult, Proposal};
    pub use crate::error::{Result, TableError};
    pub use crate::log::{TableMetadata, WriteMode};
    pub use crate::reader::{TableReader, VersionSpec};
    pub use crate::table::Table;
    pub use crate::vacuum::Vacuum;
    pub use crate::writer::{IngestBatch, Writer};
}
