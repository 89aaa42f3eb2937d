//! Shared test utilities for lakelog integration tests.
//!
//! This crate provides:
//! - [`TracingMemoryBackend`]: in-memory storage with operation recording
//!   and fault injection
//! - Record batch fixtures with a fixed schema
//!
//! # Example
//!
//! ```rust,ignore
//! use lakelog_test_utils::{TracingMemoryBackend, rows_batch};
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let storage = Arc::new(TracingMemoryBackend::new());
//!     let batch = rows_batch("eu", 0, 100);
//!     // ... commit and assert ...
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
// Test utilities use expect/unwrap for cleaner test code - panics are acceptable in tests
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod fixtures;
pub mod storage;

pub use fixtures::*;
pub use storage::*;

/// Initialize test logging (call once per test module).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("lakelog_core=debug".parse().expect("valid directive"))
                .add_directive("lakelog_table=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}
