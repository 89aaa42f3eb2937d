//! # lakelog-core
//!
//! Shared primitives for lakelog, a log-structured transactional table
//! engine on object storage.
//!
//! - **Storage**: the object store contract (conditional put, get, list,
//!   delete) and its backends
//! - **Locks**: the lock-service boundary, an object-store implementation
//!   of it, and the client adapter mutators use
//! - **Retry**: bounded jittered backoff used by every retry loop
//! - **Backpressure**: lag thresholds and health signals for upstream sources
//! - **Identifiers** and **error types**
//!
//! ## Crate Boundary
//!
//! `lakelog-core` is the **only** crate allowed to define shared primitives.
//! Table semantics (log format, commit protocol, roles) live in
//! `lakelog-table` and build on what is exported here.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use lakelog_core::prelude::*;
//!
//! let storage = Arc::new(MemoryBackend::new());
//! let locks: Arc<dyn LockService> = Arc::new(StorageLockService::new(storage));
//! let lock = DistributedLock::new(locks, "tables/events/_locks/commit");
//! assert_eq!(lock.key(), "tables/events/_locks/commit");
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod backpressure;
pub mod error;
pub mod id;
pub mod lock;
pub mod observability;
pub mod retry;
pub mod storage;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::backpressure::{
        BackpressureDecision, BackpressureState, HealthReporter, HealthSignal,
    };
    pub use crate::error::{Error, Result};
    pub use crate::id::{CommitId, HolderId};
    pub use crate::lock::{
        DistributedLock, FencingToken, LockAcquire, LockGuard, LockInfo, LockService, LockToken,
        StorageLockService,
    };
    pub use crate::retry::RetryPolicy;
    pub use crate::storage::{
        MemoryBackend, ObjectMeta, ObjectStoreBackend, StorageBackend, TimeoutBackend,
        WritePrecondition, WriteResult,
    };
}

pub use backpressure::{BackpressureDecision, BackpressureState, HealthReporter, HealthSignal};
pub use error::{Error, Result};
pub use id::{CommitId, HolderId};
pub use lock::{
    DistributedLock, FencingToken, LockAcquire, LockGuard, LockInfo, LockService, LockToken,
    StorageLockService,
};
pub use observability::{LogFormat, init_logging, role_span, table_span};
pub use retry::RetryPolicy;
pub use storage::{
    MemoryBackend, ObjectMeta, ObjectStoreBackend, StorageBackend, TimeoutBackend,
    WritePrecondition, WriteResult,
};
