//! Runs the writer, compactor and vacuum of one table as independent tasks.
//!
//! Each role is its own tokio task with its own loop; they share only the
//! `Table` handle and a shutdown channel. A role blocked on the commit lock
//! or a slow store does not stall the others.

use lakelog_core::{HealthReporter, role_span};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::compactor::Compactor;
use crate::error::{Result, TableError};
use crate::table::Table;
use crate::vacuum::Vacuum;
use crate::writer::{IngestBatch, Writer, WriterMetrics};

/// Which roles to run.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    table: Table,
    writer: Option<Writer>,
    compactor: bool,
    vacuum: bool,
}

impl Orchestrator {
    /// Runs all three roles with default settings.
    #[must_use]
    pub fn new(table: Table) -> Self {
        Self {
            writer: Some(Writer::new(table.clone())),
            table,
            compactor: true,
            vacuum: true,
        }
    }

    /// Uses a preconfigured writer.
    #[must_use]
    pub fn with_writer(mut self, writer: Writer) -> Self {
        self.writer = Some(writer);
        self
    }

    /// Runs no writer; the ingest receiver is dropped.
    #[must_use]
    pub fn without_writer(mut self) -> Self {
        self.writer = None;
        self
    }

    /// Runs no compactor.
    #[must_use]
    pub fn without_compactor(mut self) -> Self {
        self.compactor = false;
        self
    }

    /// Runs no vacuum.
    #[must_use]
    pub fn without_vacuum(mut self) -> Self {
        self.vacuum = false;
        self
    }

    /// Spawns the configured roles.
    #[must_use]
    pub fn start(self, input: mpsc::Receiver<IngestBatch>) -> OrchestratorHandle {
        let (shutdown, rx) = watch::channel(false);
        let name = self.table.name().to_string();

        let health = self
            .writer
            .as_ref()
            .map_or_else(HealthReporter::new, |w| w.health().clone());
        let writer = self.writer.map(|writer| {
            let rx = rx.clone();
            tokio::spawn(writer.run(input, rx).instrument(role_span("writer", &name)))
        });
        let compactor = self.compactor.then(|| {
            let compactor = Compactor::new(self.table.clone());
            let rx = rx.clone();
            tokio::spawn(compactor.run(rx).instrument(role_span("compactor", &name)))
        });
        let vacuum = self.vacuum.then(|| {
            let vacuum = Vacuum::new(self.table.clone());
            tokio::spawn(vacuum.run(rx).instrument(role_span("vacuum", &name)))
        });

        tracing::info!(
            table = %name,
            writer = writer.is_some(),
            compactor = compactor.is_some(),
            vacuum = vacuum.is_some(),
            "orchestrator started"
        );
        OrchestratorHandle {
            table: name,
            shutdown,
            health,
            writer,
            compactor,
            vacuum,
        }
    }
}

/// Outcome of each role after shutdown.
#[derive(Debug)]
pub struct OrchestratorSummary {
    /// Writer counters, if a writer ran.
    pub writer: Option<Result<WriterMetrics>>,
    /// Compactor exit status, if it ran.
    pub compactor: Option<Result<()>>,
    /// Vacuum exit status, if it ran.
    pub vacuum: Option<Result<()>>,
}

impl OrchestratorSummary {
    /// Returns true if every role that ran exited cleanly.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.writer.as_ref().is_none_or(Result::is_ok)
            && self.compactor.as_ref().is_none_or(Result::is_ok)
            && self.vacuum.as_ref().is_none_or(Result::is_ok)
    }
}

/// Running roles.
#[derive(Debug)]
pub struct OrchestratorHandle {
    table: String,
    shutdown: watch::Sender<bool>,
    health: HealthReporter,
    writer: Option<JoinHandle<Result<WriterMetrics>>>,
    compactor: Option<JoinHandle<Result<()>>>,
    vacuum: Option<JoinHandle<Result<()>>>,
}

impl OrchestratorHandle {
    /// Writer health (always healthy when no writer runs).
    #[must_use]
    pub fn health(&self) -> &HealthReporter {
        &self.health
    }

    /// Returns true while every spawned role is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        alive(self.writer.as_ref()) && alive(self.compactor.as_ref()) && alive(self.vacuum.as_ref())
    }

    /// Signals shutdown and waits for every role. The writer flushes its
    /// buffer before exiting.
    pub async fn shutdown(self) -> OrchestratorSummary {
        let _ = self.shutdown.send(true);
        let summary = OrchestratorSummary {
            writer: join(self.writer).await,
            compactor: join(self.compactor).await,
            vacuum: join(self.vacuum).await,
        };
        tracing::info!(table = %self.table, clean = summary.is_clean(), "orchestrator stopped");
        summary
    }
}

fn alive<T>(handle: Option<&JoinHandle<T>>) -> bool {
    handle.is_none_or(|h| !h.is_finished())
}

async fn join<T>(handle: Option<JoinHandle<Result<T>>>) -> Option<Result<T>> {
    let handle = handle?;
    Some(match handle.await {
        Ok(result) => result,
        Err(e) => Err(TableError::Core(lakelog_core::Error::Internal {
            message: format!("role task failed: {e}"),
        })),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use lakelog_core::MemoryBackend;
    use lakelog_test_utils::{collect_ids, rows_batch};

    use super::*;
    use crate::config::TableConfig;
    use crate::datafile;
    use crate::log::TableMetadata;

    #[tokio::test]
    async fn roles_run_side_by_side_and_flush_on_shutdown() {
        let mut config = TableConfig::default();
        config.writer.flush_interval_ms = 20;
        config.compaction.compaction_interval_secs = 1;
        config.compaction.min_files_to_compact = 2;
        let table = Table::with_storage("t", Arc::new(MemoryBackend::new()), config);
        table.create(TableMetadata::new("t")).await.expect("create");

        let (tx, rx) = mpsc::channel(16);
        let handle = Orchestrator::new(table.clone()).start(rx);
        assert!(handle.is_running());

        for i in 0..5 {
            tx.send(IngestBatch::new(format!("b{i}"), rows_batch("eu", i * 10, 10)))
                .await
                .expect("send");
        }
        drop(tx);

        let summary = handle.shutdown().await;
        assert!(summary.is_clean(), "{summary:?}");
        let metrics = summary.writer.expect("writer ran").expect("writer ok");
        assert_eq!(metrics.rows, 50);

        let snapshot = table.latest_snapshot().await.expect("snapshot");
        assert_eq!(snapshot.row_count(), 50);
        let mut batches = Vec::new();
        for file in snapshot.files() {
            let data = table.storage().get(&file.path).await.expect("get");
            batches.extend(datafile::decode(data).expect("decode"));
        }
        assert_eq!(collect_ids(&batches), (0..50).collect::<Vec<i64>>());
    }

    fn assert_send<T: Send + 'static>(_: &T) {}

    #[test]
    fn role_loops_can_be_spawned() {
        let table = Table::with_storage("t", Arc::new(MemoryBackend::new()), TableConfig::default());
        let (_shutdown, rx) = watch::channel(false);
        let (_tx, input) = mpsc::channel(1);
        assert_send(&Compactor::new(table.clone()).run(rx.clone()));
        assert_send(&Vacuum::new(table.clone()).run(rx.clone()));
        assert_send(&Writer::new(table).run(input, rx));
    }

    #[tokio::test]
    async fn compactor_and_vacuum_without_writer() {
        let mut config = TableConfig::default();
        config.compaction.compaction_interval_secs = 1;
        config.compaction.min_files_to_compact = 2;
        let table = Table::with_storage("t", Arc::new(MemoryBackend::new()), config);
        table.create(TableMetadata::new("t")).await.expect("create");
        let writer = Writer::new(table.clone());
        for i in 0..4 {
            writer
                .append(&[IngestBatch::new(format!("b{i}"), rows_batch("eu", i * 10, 10))])
                .await
                .expect("append");
        }

        let (_tx, rx) = mpsc::channel(1);
        let handle = Orchestrator::new(table.clone()).without_writer().start(rx);
        // The first compactor tick fires immediately.
        let mut compacted = false;
        for _ in 0..100 {
            if table.latest_snapshot().await.expect("snapshot").file_count() == 1 {
                compacted = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        let summary = handle.shutdown().await;
        assert!(compacted);
        assert!(summary.writer.is_none());
        assert!(summary.is_clean(), "{summary:?}");
        assert_eq!(table.latest_snapshot().await.expect("snapshot").row_count(), 40);
    }

    #[tokio::test]
    async fn selected_roles_only() {
        let table = Table::with_storage("t", Arc::new(MemoryBackend::new()), TableConfig::default());
        table.create(TableMetadata::new("t")).await.expect("create");
        let (_tx, rx) = mpsc::channel(1);
        let handle = Orchestrator::new(table)
            .without_compactor()
            .without_vacuum()
            .start(rx);
        let summary = handle.shutdown().await;
        assert!(summary.compactor.is_none());
        assert!(summary.vacuum.is_none());
        assert!(summary.writer.is_some());
        assert!(summary.is_clean());
    }
}
