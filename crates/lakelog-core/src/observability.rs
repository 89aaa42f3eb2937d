//! Logging initialization and span helpers.
//!
//! Every lakelog event carries the table it concerns; role loops run inside
//! a [`role_span`] so that field is attached once.

use std::str::FromStr;
use std::sync::Once;

use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::Error;

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" | "text" => Ok(Self::Pretty),
            other => Err(Error::InvalidInput(format!(
                "unknown log format '{other}', expected json or pretty"
            ))),
        }
    }
}

/// Initializes the logging subsystem.
///
/// Safe to call multiple times; only the first call installs a subscriber.
/// `RUST_LOG` controls levels (default `info`).
///
/// # Example
///
/// ```rust
/// use lakelog_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let installed = match format {
            LogFormat::Json => tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json())
                .try_init(),
            LogFormat::Pretty => tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().pretty())
                .try_init(),
        };
        if installed.is_err() {
            tracing::debug!("global subscriber already installed");
        }
    });
}

/// Creates a span for one table operation (commit, snapshot, history).
#[must_use]
pub fn table_span(operation: &str, table: &str) -> Span {
    tracing::info_span!("table", op = operation, table = table)
}

/// Creates a span for a long-running mutator role loop.
///
/// # Example
///
/// ```rust
/// use lakelog_core::observability::role_span;
///
/// let span = role_span("compactor", "events");
/// let _guard = span.enter();
/// tracing::info!("cycle started");
/// ```
#[must_use]
pub fn role_span(role: &str, table: &str) -> Span {
    tracing::info_span!("role", role = role, table = table)
}
