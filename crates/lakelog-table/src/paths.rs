//! Object key layout for a table.
//!
//! Single source of truth for every key lakelog reads or writes. Nothing
//! else formats table paths.
//!
//! ```text
//! {root}/
//! ├── _log/
//! │   ├── 00000000000000000000.json             # version 0 (table creation)
//! │   ├── 00000000000000000001.json
//! │   └── 00000000000000000010.checkpoint.json  # snapshot at version 10
//! ├── _locks/
//! │   ├── commit                                 # serializes log appends
//! │   └── compactor                              # single-active-compactor lease
//! └── data/
//!     ├── _default/part-{id}.parquet             # unpartitioned files
//!     └── p={partition}/part-{id}.parquet
//! ```
//!
//! Version numbers are zero-padded to 20 digits so lexicographic listing
//! order matches numeric order.

use crate::error::{Result, TableError};

const LOG_DIR: &str = "_log";
const LOCK_DIR: &str = "_locks";
const DATA_DIR: &str = "data";
const ENTRY_SUFFIX: &str = ".json";
const CHECKPOINT_SUFFIX: &str = ".checkpoint.json";
const UNPARTITIONED: &str = "_default";

/// A parsed key under `{root}/_log/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogKey {
    /// A log entry.
    Entry(u64),
    /// A checkpoint.
    Checkpoint(u64),
}

/// Key builder for one table root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TablePaths {
    root: String,
}

impl TablePaths {
    /// Creates paths under `root` (no leading or trailing slash needed).
    #[must_use]
    pub fn new(root: impl Into<String>) -> Self {
        let root: String = root.into();
        Self {
            root: root.trim_matches('/').to_string(),
        }
    }

    /// Table root.
    #[must_use]
    pub fn root(&self) -> &str {
        &self.root
    }

    fn join(&self, rest: &str) -> String {
        if self.root.is_empty() {
            rest.to_string()
        } else {
            format!("{}/{rest}", self.root)
        }
    }

    /// Prefix of every log object, with trailing slash.
    #[must_use]
    pub fn log_prefix(&self) -> String {
        self.join(&format!("{LOG_DIR}/"))
    }

    /// Key of the entry at `version`.
    #[must_use]
    pub fn log_entry(&self, version: u64) -> String {
        self.join(&format!("{LOG_DIR}/{version:020}{ENTRY_SUFFIX}"))
    }

    /// Key of the checkpoint at `version`.
    #[must_use]
    pub fn checkpoint(&self, version: u64) -> String {
        self.join(&format!("{LOG_DIR}/{version:020}{CHECKPOINT_SUFFIX}"))
    }

    /// Lock key serializing log appends.
    #[must_use]
    pub fn commit_lock(&self) -> String {
        self.join(&format!("{LOCK_DIR}/commit"))
    }

    /// Lease key for the single active compactor.
    #[must_use]
    pub fn compactor_lock(&self) -> String {
        self.join(&format!("{LOCK_DIR}/compactor"))
    }

    /// Prefix of every data file, with trailing slash.
    #[must_use]
    pub fn data_prefix(&self) -> String {
        self.join(&format!("{DATA_DIR}/"))
    }

    /// Key of a data file with the given id in `partition`.
    #[must_use]
    pub fn data_file(&self, partition: Option<&str>, file_id: &str) -> String {
        let dir = partition.map_or_else(|| UNPARTITIONED.to_string(), |p| {
            format!("p={}", encode_partition(p))
        });
        self.join(&format!("{DATA_DIR}/{dir}/part-{file_id}.parquet"))
    }

    /// Parses a key returned by listing [`log_prefix`](Self::log_prefix).
    ///
    /// Returns `None` for keys that are not log objects (e.g. temp files).
    #[must_use]
    pub fn parse_log_key(&self, key: &str) -> Option<LogKey> {
        let name = key.strip_prefix(&self.log_prefix())?;
        if let Some(digits) = name.strip_suffix(CHECKPOINT_SUFFIX) {
            return parse_version(digits).map(LogKey::Checkpoint);
        }
        name.strip_suffix(ENTRY_SUFFIX)
            .and_then(parse_version)
            .map(LogKey::Entry)
    }
}

fn parse_version(digits: &str) -> Option<u64> {
    if digits.len() == 20 && digits.bytes().all(|b| b.is_ascii_digit()) {
        digits.parse().ok()
    } else {
        None
    }
}

/// Escapes a partition value into one path segment.
///
/// Bytes outside `[A-Za-z0-9._-]` become `+XX` (uppercase hex), so distinct
/// values never share a directory. `%` is not used as the escape because
/// object store clients percent-encode it again.
fn encode_partition(value: &str) -> String {
    use std::fmt::Write as _;

    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.') {
            out.push(char::from(byte));
        } else {
            let _ = write!(out, "+{byte:02X}");
        }
    }
    out
}

/// Where a table lives: a store URL plus a root inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableLocation {
    /// Store URL understood by `ObjectStoreBackend::from_url`.
    pub store_url: String,
    /// Root prefix of the table inside the store.
    pub root: String,
}

impl TableLocation {
    /// Parses `s3://bucket/path/to/table`, `gs://bucket/path` or
    /// `memory://path`.
    ///
    /// # Errors
    ///
    /// Returns `TableError::Config` for an unknown scheme or an empty root.
    pub fn parse(uri: &str) -> Result<Self> {
        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| TableError::config(format!("table uri '{uri}' has no scheme")))?;

        let (store_url, root) = match scheme {
            "s3" | "gs" => {
                let (bucket, root) = rest.split_once('/').unwrap_or((rest, ""));
                if bucket.is_empty() {
                    return Err(TableError::config(format!("table uri '{uri}' has no bucket")));
                }
                (format!("{scheme}://{bucket}"), root)
            }
            "memory" => ("memory://".to_string(), rest),
            other => {
                return Err(TableError::config(format!(
                    "unsupported scheme '{other}' in table uri '{uri}'"
                )));
            }
        };

        let root = root.trim_matches('/');
        if root.is_empty() {
            return Err(TableError::config(format!(
                "table uri '{uri}' must name a path inside the store"
            )));
        }
        Ok(Self {
            store_url,
            root: root.to_string(),
        })
    }
}
