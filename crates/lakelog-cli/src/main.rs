//! # lakelog
//!
//! Operator CLI and long-running service for lakelog tables.
//!
//! ## Modes
//!
//! - **Service Mode**: runs the compactor and vacuum loops with HTTP health
//!   endpoints
//! - **CLI Mode**: one-shot table operations for operators and debugging
//!
//! ## Health Endpoints
//!
//! - `GET /health` - Shallow liveness check (always 200)
//! - `GET /ready` - Readiness: table reachable and every role running
//! - `GET /metrics` - Prometheus exposition
//!
//! ## Usage
//!
//! ```bash
//! export LAKELOG_TABLE_URI=s3://bucket/warehouse/events
//!
//! lakelog create --partition-column region
//! lakelog write-batch --rows 1000 --partition eu
//! lakelog compact --dry-run
//! lakelog vacuum --retention-hours 168
//! lakelog history --limit 10
//! lakelog snapshot --timestamp 2026-10-01T00:00:00Z
//! lakelog serve --port 8080
//! ```

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use arrow::array::{Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;
use serde_json::json;
use tokio::sync::{Mutex, mpsc};
use tracing::Instrument;

use lakelog_core::{CommitId, LogFormat, init_logging, table_span};
use lakelog_table::{
    Compactor, IngestBatch, Orchestrator, OrchestratorHandle, Snapshot, Table, TableConfig,
    TableMetadata, TableReader, Vacuum, VersionSpec, WriteMode, Writer,
};

// ============================================================================
// CLI Arguments
// ============================================================================

/// lakelog table operations.
#[derive(Debug, Parser)]
#[command(name = "lakelog")]
#[command(about = "Log-structured transactional tables on object storage")]
#[command(version)]
struct Args {
    /// Table URI (`s3://bucket/prefix`, `gs://bucket/prefix` or `memory://name`).
    #[arg(long, env = "LAKELOG_TABLE_URI", global = true)]
    table: Option<String>,

    /// JSON configuration file; `LAKELOG_*` variables are used when absent.
    #[arg(long, env = "LAKELOG_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Log output format (`json` or `pretty`).
    #[arg(long, env = "LAKELOG_LOG_FORMAT", default_value = "pretty", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create the table (writes version 0).
    Create {
        /// Column whose value selects a file's partition directory.
        #[arg(long)]
        partition_column: Option<String>,
    },

    /// Commit one batch of generated rows.
    WriteBatch {
        /// Rows to generate.
        #[arg(long)]
        rows: usize,

        /// First generated id.
        #[arg(long, default_value = "0")]
        first_id: i64,

        /// Target partition.
        #[arg(long)]
        partition: Option<String>,

        /// Idempotency key (random when absent).
        #[arg(long)]
        key: Option<String>,

        /// Replace the partition's live files instead of appending.
        #[arg(long)]
        overwrite: bool,
    },

    /// Run a single compaction cycle.
    Compact {
        /// Print the plan without rewriting anything.
        #[arg(long)]
        dry_run: bool,
    },

    /// Run a single vacuum pass.
    Vacuum {
        /// Retention window in hours (default from configuration).
        #[arg(long)]
        retention_hours: Option<u64>,

        /// List candidates without deleting.
        #[arg(long)]
        dry_run: bool,
    },

    /// Print recent commits, newest first.
    History {
        /// Maximum entries.
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Print a snapshot.
    Snapshot {
        /// Exact version.
        #[arg(long, conflicts_with = "timestamp")]
        version: Option<u64>,

        /// Last version committed at or before this RFC 3339 instant.
        #[arg(long)]
        timestamp: Option<DateTime<Utc>>,
    },

    /// Run compactor and vacuum loops with health endpoints.
    Serve {
        /// HTTP port for health endpoints.
        #[arg(long, env = "LAKELOG_PORT", default_value = "8080")]
        port: u16,
    },
}

impl Args {
    fn table(&self) -> Result<Table> {
        let uri = self
            .table
            .as_deref()
            .ok_or_else(|| anyhow!("missing --table or LAKELOG_TABLE_URI"))?;
        let config = match &self.config {
            Some(path) => TableConfig::from_json_file(path)?,
            None => TableConfig::from_env()?,
        };
        Table::open(uri, config).with_context(|| format!("open table {uri}"))
    }
}

// ============================================================================
// One-shot Commands
// ============================================================================

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Rows `first_id..first_id + rows` with the fixed demo schema.
fn generated_batch(first_id: i64, rows: usize, partition: Option<&str>) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("region", DataType::Utf8, false),
        Field::new("payload", DataType::Utf8, false),
    ]));
    let count = i64::try_from(rows).context("row count out of range")?;
    let ids: Vec<i64> = (first_id..first_id + count).collect();
    let regions = vec![partition.unwrap_or("default"); rows];
    let payloads: Vec<String> = ids.iter().map(|id| format!("event-{id}")).collect();
    Ok(RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int64Array::from(ids)),
            Arc::new(StringArray::from(regions)),
            Arc::new(StringArray::from(payloads)),
        ],
    )?)
}

fn snapshot_json(snapshot: &Snapshot) -> serde_json::Value {
    let files: Vec<_> = snapshot
        .live_files()
        .map(|live| {
            json!({
                "path": live.file.path,
                "partition": live.file.partition,
                "rows": live.file.row_count,
                "bytes": live.file.size_bytes,
                "addedVersion": live.added_version,
            })
        })
        .collect();
    json!({
        "version": snapshot.version(),
        "timestamp": snapshot.timestamp().to_rfc3339(),
        "name": snapshot.metadata().name,
        "partitionColumn": snapshot.metadata().partition_column,
        "fileCount": snapshot.file_count(),
        "rowCount": snapshot.row_count(),
        "byteSize": snapshot.byte_size(),
        "files": files,
    })
}

async fn run_command(args: &Args) -> Result<()> {
    let table = args.table()?;
    match &args.command {
        Commands::Create { partition_column } => {
            let mut metadata = TableMetadata::new(table.name())
                .with_columns(["id", "region", "payload"]);
            if let Some(column) = partition_column {
                metadata = metadata.with_partition_column(column);
            }
            let snapshot = table.create(metadata).await?;
            print_json(&snapshot_json(&snapshot))
        }

        Commands::WriteBatch {
            rows,
            first_id,
            partition,
            key,
            overwrite,
        } => {
            let key = key.clone().unwrap_or_else(|| CommitId::generate().to_string());
            let mut batch = IngestBatch::new(key, generated_batch(*first_id, *rows, partition.as_deref())?);
            if let Some(partition) = partition {
                batch = batch.with_partition(partition);
            }
            let mode = if *overwrite {
                WriteMode::Overwrite
            } else {
                WriteMode::Append
            };
            let report = Writer::new(table).with_mode(mode).append(&[batch]).await?;
            print_json(&json!({
                "version": report.version,
                "rowsWritten": report.rows_written,
                "filesAdded": report.files_added,
                "filesRemoved": report.files_removed,
                "batchesSkipped": report.batches_skipped,
                "conflicts": report.conflicts,
            }))
        }

        Commands::Compact { dry_run } => {
            let compactor = Compactor::new(table);
            if *dry_run {
                tracing::info!("dry run: planning only");
                let plan = compactor.plan().await?;
                let groups: Vec<_> = plan
                    .groups
                    .iter()
                    .map(|g| {
                        json!({
                            "partition": g.partition,
                            "files": g.files.len(),
                            "bytes": g.bytes(),
                            "rows": g.rows(),
                            "trigger": format!("{:?}", g.trigger),
                        })
                    })
                    .collect();
                return print_json(&json!({ "baseVersion": plan.base_version, "groups": groups }));
            }
            let report = compactor.compact_once().await?;
            print_json(&json!({
                "outcome": format!("{:?}", report.outcome),
                "committedVersions": report.committed_versions,
                "filesRemoved": report.files_removed,
                "filesAdded": report.files_added,
                "rows": report.rows,
                "bytesRemoved": report.bytes_removed,
                "bytesAdded": report.bytes_added,
                "attempts": report.attempts,
            }))
        }

        Commands::Vacuum {
            retention_hours,
            dry_run,
        } => {
            let retention = retention_hours.map(|h| Duration::from_secs(h.saturating_mul(3600)));
            let mut vacuum = Vacuum::new(table);
            if *dry_run {
                vacuum = vacuum.with_dry_run(true);
            }
            let report = vacuum.run_at(Utc::now(), retention).await?;
            let candidates: Vec<_> = report
                .candidates
                .iter()
                .map(|c| json!({ "path": c.path, "bytes": c.size_bytes, "reason": format!("{:?}", c.reason) }))
                .collect();
            print_json(&json!({
                "retainedFromVersion": report.retained_from_version,
                "dryRun": report.dry_run,
                "candidates": candidates,
                "deleted": report.deleted,
                "bytesReclaimed": report.bytes_reclaimed,
                "errors": report.errors,
            }))?;
            if report.has_errors() {
                bail!("{} deletes failed", report.errors.len());
            }
            Ok(())
        }

        Commands::History { limit } => {
            let entries = TableReader::new(table).history(*limit).await?;
            print_json(&serde_json::to_value(entries)?)
        }

        Commands::Snapshot { version, timestamp } => {
            let spec = match (version, timestamp) {
                (Some(v), _) => VersionSpec::Version(*v),
                (None, Some(ts)) => VersionSpec::Timestamp(*ts),
                (None, None) => VersionSpec::Latest,
            };
            let snapshot = TableReader::new(table).snapshot(spec).await?;
            print_json(&snapshot_json(&snapshot))
        }

        Commands::Serve { port } => serve(table, *port).await,
    }
}

// ============================================================================
// Service Mode
// ============================================================================

/// Shared state for HTTP handlers.
struct ServiceState {
    table: Table,
    roles: Mutex<Option<OrchestratorHandle>>,
    metrics: PrometheusHandle,
}

/// Health check response.
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
}

/// Readiness check response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReadyResponse {
    ready: bool,
    table: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    latest_version: Option<u64>,
    roles_running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

/// GET /health - Shallow liveness check.
async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

/// GET /ready - Table reachable and every role still running.
async fn ready(State(state): State<Arc<ServiceState>>) -> impl IntoResponse {
    let roles_running = state
        .roles
        .lock()
        .await
        .as_ref()
        .is_some_and(OrchestratorHandle::is_running);
    let (latest_version, message) = match state.table.latest_version().await {
        Ok(version) if roles_running => (Some(version), None),
        Ok(version) => (Some(version), Some("a background role has stopped".to_string())),
        Err(e) => (None, Some(e.to_string())),
    };
    let ready = roles_running && latest_version.is_some();
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadyResponse {
            ready,
            table: state.table.name().to_string(),
            latest_version,
            roles_running,
            message,
        }),
    )
}

/// GET /metrics - Prometheus exposition.
async fn serve_metrics(State(state): State<Arc<ServiceState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        state.metrics.render(),
    )
}

async fn serve(table: Table, port: u16) -> Result<()> {
    let metrics = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow!("install prometheus recorder: {e}"))?;
    lakelog_table::metrics::register_metrics();

    // Ingestion is embedded; the service runs maintenance roles only.
    let (_ingest, input) = mpsc::channel(1);
    let roles = Orchestrator::new(table.clone())
        .without_writer()
        .start(input);
    let state = Arc::new(ServiceState {
        table,
        roles: Mutex::new(Some(roles)),
        metrics,
    });

    let router = Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(serve_metrics))
        .with_state(Arc::clone(&state));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(address = %addr, table = %state.table.name(), "starting service");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "signal handler failed");
            }
        })
        .await?;

    if let Some(roles) = state.roles.lock().await.take() {
        let summary = roles.shutdown().await;
        if !summary.is_clean() {
            bail!("roles exited with errors: {summary:?}");
        }
    }
    Ok(())
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_format);

    let table = args.table.clone().unwrap_or_default();
    let span = table_span(command_name(&args.command), &table);
    run_command(&args).instrument(span).await
}

fn command_name(command: &Commands) -> &'static str {
    match command {
        Commands::Create { .. } => "create",
        Commands::WriteBatch { .. } => "write-batch",
        Commands::Compact { .. } => "compact",
        Commands::Vacuum { .. } => "vacuum",
        Commands::History { .. } => "history",
        Commands::Snapshot { .. } => "snapshot",
        Commands::Serve { .. } => "serve",
    }
}
