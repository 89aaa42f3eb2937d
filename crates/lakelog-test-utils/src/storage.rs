//! Test storage with operation tracing and fault injection.
//!
//! [`TracingMemoryBackend`] delegates to [`MemoryBackend`] and adds the
//! failure modes object stores exhibit in production: transient errors on
//! specific calls, permanently failing prefixes, slow calls and listings
//! that lag behind recent writes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use lakelog_core::error::{Error, Result};
use lakelog_core::storage::{
    MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult,
};

/// Kind of storage call, for recording and targeted fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// `get`
    Get,
    /// `put`
    Put,
    /// `delete`
    Delete,
    /// `list`
    List,
    /// `head`
    Head,
}

/// Record of a storage operation for test assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageOp {
    /// Which call was made.
    pub kind: OpKind,
    /// Path (or prefix for `list`).
    pub path: String,
    /// Precondition, for `put`.
    pub precondition: Option<WritePrecondition>,
}

#[derive(Debug, Clone)]
struct TransientFault {
    kind: OpKind,
    prefix: String,
    remaining: u32,
}

#[derive(Debug, Default)]
struct Faults {
    permanent: Vec<String>,
    transient: Vec<TransientFault>,
    hidden_from_list: Vec<String>,
}

/// In-memory storage backend with operation tracing and fault injection.
#[derive(Debug, Clone, Default)]
pub struct TracingMemoryBackend {
    inner: MemoryBackend,
    operations: Arc<Mutex<Vec<StorageOp>>>,
    faults: Arc<Mutex<Faults>>,
    latency: Option<Duration>,
}

impl TracingMemoryBackend {
    /// Creates a new empty tracing storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates storage that sleeps `latency` before every call.
    #[must_use]
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    /// Returns all recorded operations.
    #[must_use]
    pub fn operations(&self) -> Vec<StorageOp> {
        self.operations.lock().expect("lock").clone()
    }

    /// Returns recorded operations of one kind.
    #[must_use]
    pub fn operations_of(&self, kind: OpKind) -> Vec<StorageOp> {
        self.operations()
            .into_iter()
            .filter(|op| op.kind == kind)
            .collect()
    }

    /// Clears recorded operations.
    pub fn clear_operations(&self) {
        self.operations.lock().expect("lock").clear();
    }

    /// Makes every call on paths under `prefix` fail until cleared.
    pub fn inject_failure(&self, prefix: impl Into<String>) {
        self.faults.lock().expect("lock").permanent.push(prefix.into());
    }

    /// Makes the next `count` calls of `kind` under `prefix` fail.
    pub fn fail_next(&self, kind: OpKind, prefix: impl Into<String>, count: u32) {
        self.faults.lock().expect("lock").transient.push(TransientFault {
            kind,
            prefix: prefix.into(),
            remaining: count,
        });
    }

    /// Omits objects under `prefix` from `list` results, like a listing
    /// that has not caught up with recent writes. `get` and `head` still
    /// see them.
    pub fn hide_from_list(&self, prefix: impl Into<String>) {
        self.faults
            .lock()
            .expect("lock")
            .hidden_from_list
            .push(prefix.into());
    }

    /// Clears all injected faults.
    pub fn clear_failures(&self) {
        let mut faults = self.faults.lock().expect("lock");
        faults.permanent.clear();
        faults.transient.clear();
        faults.hidden_from_list.clear();
    }

    /// Returns all stored paths, sorted.
    pub async fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .inner
            .list("")
            .await
            .expect("list")
            .into_iter()
            .map(|meta| meta.path)
            .collect();
        paths.sort();
        paths
    }

    /// Returns stored object sizes keyed by path.
    pub async fn sizes(&self) -> HashMap<String, u64> {
        self.inner
            .list("")
            .await
            .expect("list")
            .into_iter()
            .map(|meta| (meta.path, meta.size))
            .collect()
    }

    fn record(&self, kind: OpKind, path: &str, precondition: Option<WritePrecondition>) {
        self.operations.lock().expect("lock").push(StorageOp {
            kind,
            path: path.to_string(),
            precondition,
        });
    }

    async fn enter(&self, kind: OpKind, path: &str) -> Result<()> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let mut faults = self.faults.lock().expect("lock");
        if faults.permanent.iter().any(|p| path.starts_with(p)) {
            return Err(Error::storage(format!("injected failure for {path}")));
        }
        if let Some(fault) = faults
            .transient
            .iter_mut()
            .find(|f| f.kind == kind && f.remaining > 0 && path.starts_with(&f.prefix))
        {
            fault.remaining -= 1;
            return Err(Error::storage(format!("injected transient failure for {path}")));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl StorageBackend for TracingMemoryBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        self.enter(OpKind::Get, path).await?;
        self.record(OpKind::Get, path, None);
        self.inner.get(path).await
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        self.enter(OpKind::Put, path).await?;
        self.record(OpKind::Put, path, Some(precondition.clone()));
        self.inner.put(path, data, precondition).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.enter(OpKind::Delete, path).await?;
        self.record(OpKind::Delete, path, None);
        self.inner.delete(path).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        self.enter(OpKind::List, prefix).await?;
        self.record(OpKind::List, prefix, None);
        let hidden = self.faults.lock().expect("lock").hidden_from_list.clone();
        Ok(self
            .inner
            .list(prefix)
            .await?
            .into_iter()
            .filter(|meta| !hidden.iter().any(|h| meta.path.starts_with(h)))
            .collect())
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        self.enter(OpKind::Head, path).await?;
        self.record(OpKind::Head, path, None);
        self.inner.head(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_operations_in_order() {
        let storage = TracingMemoryBackend::new();
        storage
            .put("t/a", Bytes::from("hello"), WritePrecondition::DoesNotExist)
            .await
            .expect("put");
        let _ = storage.get("t/a").await;
        let _ = storage.list("t/").await;

        let kinds: Vec<OpKind> = storage.operations().iter().map(|op| op.kind).collect();
        assert_eq!(kinds, vec![OpKind::Put, OpKind::Get, OpKind::List]);
        assert_eq!(
            storage.operations_of(OpKind::Put)[0].precondition,
            Some(WritePrecondition::DoesNotExist)
        );
    }

    #[tokio::test]
    async fn transient_failures_run_out() {
        let storage = TracingMemoryBackend::new();
        storage
            .put("t/a", Bytes::from("x"), WritePrecondition::None)
            .await
            .expect("put");
        storage.fail_next(OpKind::Delete, "t/", 2);

        assert!(storage.delete("t/a").await.is_err());
        assert!(storage.delete("t/a").await.is_err());
        storage.delete("t/a").await.expect("third attempt succeeds");
        assert!(storage.head("t/a").await.expect("head").is_none());
    }

    #[tokio::test]
    async fn permanent_failure_is_retryable_storage_error() {
        let storage = TracingMemoryBackend::new();
        storage.inject_failure("fail/");
        let err = storage.get("fail/x").await.expect_err("injected");
        assert!(err.is_retryable());

        storage.clear_failures();
        assert!(matches!(storage.get("fail/x").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn hidden_objects_are_still_readable() {
        let storage = TracingMemoryBackend::new();
        storage
            .put("t/_log/1", Bytes::from("x"), WritePrecondition::None)
            .await
            .expect("put");
        storage.hide_from_list("t/_log/1");
        assert!(storage.list("t/").await.expect("list").is_empty());
        assert!(storage.head("t/_log/1").await.expect("head").is_some());
        assert_eq!(storage.paths().await, vec!["t/_log/1".to_string()]);
    }
}
