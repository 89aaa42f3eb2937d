//! Object store contract and backends.
//!
//! Everything lakelog persists goes through [`StorageBackend`]: log entries,
//! checkpoints, data files and lock records. The contract is small and
//! matches what S3-compatible stores can guarantee:
//! - conditional writes (put-if-absent and compare-and-swap on a version token)
//! - read-after-write for a single object, no cross-object atomicity
//! - idempotent delete
//! - prefix listing in arbitrary order, possibly lagging recent writes
//!
//! ## Version tokens
//!
//! The version token is an opaque `String`. S3 and the in-memory stores use
//! the `ETag`, GCS uses the object generation. Callers never parse it.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use object_store::aws::{AmazonS3Builder, S3ConditionalPut};
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::memory::InMemory;
use object_store::path::Path as StorePath;
use object_store::{ObjectStore, PutMode, PutOptions, PutPayload, UpdateVersion};

use crate::error::{Error, Result};

/// Precondition for conditional writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WritePrecondition {
    /// Write only if the object does not exist (put-if-absent).
    DoesNotExist,
    /// Write only if the object's version matches the given token.
    MatchesVersion(String),
    /// Write unconditionally.
    None,
}

/// Result of a conditional write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteResult {
    /// Write succeeded, returns the new version token.
    Success {
        /// The new version token after the write.
        version: String,
    },
    /// Precondition failed, returns the current version token.
    PreconditionFailed {
        /// The current version that caused the precondition to fail.
        current_version: String,
    },
}

impl WriteResult {
    /// Returns true if the write was applied.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Metadata about a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Object path (key).
    pub path: String,
    /// Object size in bytes.
    pub size: u64,
    /// Opaque version token for CAS operations.
    pub version: String,
    /// Last modification timestamp.
    pub last_modified: Option<DateTime<Utc>>,
}

/// Storage backend trait for object storage.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Reads an entire object.
    ///
    /// Returns `Error::NotFound` if the object doesn't exist.
    async fn get(&self, path: &str) -> Result<Bytes>;

    /// Writes with an optional precondition.
    ///
    /// A failed precondition is reported as `WriteResult::PreconditionFailed`,
    /// never as an error.
    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult>;

    /// Deletes an object. Succeeds if the object doesn't exist.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Lists objects whose key starts with `prefix`.
    ///
    /// Results come back in arbitrary order and may not yet include objects
    /// written moments ago. Callers that need order must sort.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;

    /// Gets object metadata without reading content.
    ///
    /// Returns `None` if the object doesn't exist.
    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>>;
}

// ============================================================================
// In-memory backend
// ============================================================================

/// In-memory storage backend for tests and single-process demos.
///
/// Versions are monotonically increasing integers rendered as strings.
#[derive(Debug, Default, Clone)]
pub struct MemoryBackend {
    objects: Arc<RwLock<HashMap<String, StoredObject>>>,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    version: u64,
    last_modified: DateTime<Utc>,
}

impl StoredObject {
    fn meta(&self, path: &str) -> ObjectMeta {
        ObjectMeta {
            path: path.to_string(),
            size: self.data.len() as u64,
            version: self.version.to_string(),
            last_modified: Some(self.last_modified),
        }
    }
}

fn poisoned() -> Error {
    Error::Internal {
        message: "memory backend lock poisoned".into(),
    }
}

impl MemoryBackend {
    /// Creates a new empty memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.read().map_or(0, |objects| objects.len())
    }

    /// Returns true if no objects are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        let objects = self.objects.read().map_err(|_| poisoned())?;
        objects
            .get(path)
            .map(|o| o.data.clone())
            .ok_or_else(|| Error::NotFound(format!("object not found: {path}")))
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let mut objects = self.objects.write().map_err(|_| poisoned())?;
        let current = objects.get(path);

        match (&precondition, current) {
            (WritePrecondition::DoesNotExist, Some(obj)) => {
                return Ok(WriteResult::PreconditionFailed {
                    current_version: obj.version.to_string(),
                });
            }
            (WritePrecondition::MatchesVersion(expected), Some(obj))
                if *expected != obj.version.to_string() =>
            {
                return Ok(WriteResult::PreconditionFailed {
                    current_version: obj.version.to_string(),
                });
            }
            (WritePrecondition::MatchesVersion(_), None) => {
                return Ok(WriteResult::PreconditionFailed {
                    current_version: String::new(),
                });
            }
            _ => {}
        }

        let version = current.map_or(1, |o| o.version + 1);
        objects.insert(
            path.to_string(),
            StoredObject {
                data,
                version,
                last_modified: Utc::now(),
            },
        );
        drop(objects);

        Ok(WriteResult::Success {
            version: version.to_string(),
        })
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.objects.write().map_err(|_| poisoned())?.remove(path);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let objects = self.objects.read().map_err(|_| poisoned())?;
        Ok(objects
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(path, obj)| obj.meta(path))
            .collect())
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        let objects = self.objects.read().map_err(|_| poisoned())?;
        Ok(objects.get(path).map(|obj| obj.meta(path)))
    }
}

// ============================================================================
// object_store backend
// ============================================================================

/// Which metadata field a provider uses for compare-and-swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CasToken {
    ETag,
    Generation,
}

/// Backend over the `object_store` crate (S3, GCS, in-memory).
///
/// S3 buckets are configured for `ETag`-matching conditional puts, so both
/// put-if-absent and version CAS are atomic on the server.
#[derive(Clone)]
pub struct ObjectStoreBackend {
    store: Arc<dyn ObjectStore>,
    cas: CasToken,
    description: String,
}

impl std::fmt::Debug for ObjectStoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStoreBackend")
            .field("store", &self.description)
            .finish_non_exhaustive()
    }
}

impl ObjectStoreBackend {
    /// Builds a backend from a store URL: `s3://bucket`, `gs://bucket` or
    /// `memory://`.
    ///
    /// Credentials and endpoints come from the provider's standard
    /// environment variables (`AWS_*`, `GOOGLE_*`).
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` for an unsupported scheme and
    /// `Error::Storage` if the provider client cannot be built.
    pub fn from_url(url: &str) -> Result<Self> {
        if let Some(bucket) = url.strip_prefix("s3://") {
            let store = AmazonS3Builder::from_env()
                .with_bucket_name(bucket.trim_end_matches('/'))
                .with_conditional_put(S3ConditionalPut::ETagMatch)
                .build()
                .map_err(|e| Error::storage_with_source(format!("build s3 client for {url}"), e))?;
            return Ok(Self {
                store: Arc::new(store),
                cas: CasToken::ETag,
                description: url.to_string(),
            });
        }
        if let Some(bucket) = url.strip_prefix("gs://") {
            let store = GoogleCloudStorageBuilder::from_env()
                .with_bucket_name(bucket.trim_end_matches('/'))
                .build()
                .map_err(|e| Error::storage_with_source(format!("build gcs client for {url}"), e))?;
            return Ok(Self {
                store: Arc::new(store),
                cas: CasToken::Generation,
                description: url.to_string(),
            });
        }
        if url.starts_with("memory://") {
            return Ok(Self {
                store: Arc::new(InMemory::new()),
                cas: CasToken::ETag,
                description: "memory://".to_string(),
            });
        }
        Err(Error::InvalidInput(format!(
            "unsupported store url {url}; expected s3://, gs:// or memory://"
        )))
    }

    fn token(&self, meta: &object_store::ObjectMeta) -> String {
        match self.cas {
            CasToken::ETag => meta.e_tag.clone(),
            CasToken::Generation => meta.version.clone(),
        }
        .unwrap_or_default()
    }

    fn update_version(&self, token: String) -> UpdateVersion {
        match self.cas {
            CasToken::ETag => UpdateVersion {
                e_tag: Some(token),
                version: None,
            },
            CasToken::Generation => UpdateVersion {
                e_tag: None,
                version: Some(token),
            },
        }
    }

    fn convert_meta(&self, meta: &object_store::ObjectMeta) -> ObjectMeta {
        ObjectMeta {
            path: meta.location.to_string(),
            size: meta.size as u64,
            version: self.token(meta),
            last_modified: Some(meta.last_modified),
        }
    }
}

fn map_store_error(path: &str, op: &str, err: object_store::Error) -> Error {
    match err {
        object_store::Error::NotFound { .. } => {
            Error::NotFound(format!("object not found: {path}"))
        }
        other => Error::storage_with_source(format!("{op} {path}"), other),
    }
}

#[async_trait]
impl StorageBackend for ObjectStoreBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        let location = StorePath::from(path);
        let result = self
            .store
            .get(&location)
            .await
            .map_err(|e| map_store_error(path, "get", e))?;
        result
            .bytes()
            .await
            .map_err(|e| map_store_error(path, "read body of", e))
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let location = StorePath::from(path);
        let mode = match precondition {
            WritePrecondition::DoesNotExist => PutMode::Create,
            WritePrecondition::MatchesVersion(token) => {
                PutMode::Update(self.update_version(token))
            }
            WritePrecondition::None => PutMode::Overwrite,
        };
        let opts = PutOptions {
            mode,
            ..PutOptions::default()
        };

        match self
            .store
            .put_opts(&location, PutPayload::from(data), opts)
            .await
        {
            Ok(result) => {
                let version = match self.cas {
                    CasToken::ETag => result.e_tag,
                    CasToken::Generation => result.version,
                }
                .unwrap_or_default();
                Ok(WriteResult::Success { version })
            }
            Err(
                object_store::Error::AlreadyExists { .. }
                | object_store::Error::Precondition { .. }
                | object_store::Error::NotFound { .. },
            ) => {
                let current_version = self
                    .head(path)
                    .await?
                    .map(|meta| meta.version)
                    .unwrap_or_default();
                Ok(WriteResult::PreconditionFailed { current_version })
            }
            Err(e) => Err(map_store_error(path, "put", e)),
        }
    }

    async fn delete(&self, path: &str) -> Result<()> {
        match self.store.delete(&StorePath::from(path)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(map_store_error(path, "delete", e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let location = StorePath::from(prefix);
        let objects: Vec<object_store::ObjectMeta> = self
            .store
            .list(Some(&location))
            .try_collect()
            .await
            .map_err(|e| map_store_error(prefix, "list", e))?;
        Ok(objects
            .iter()
            .map(|meta| self.convert_meta(meta))
            .filter(|meta| meta.path.starts_with(prefix))
            .collect())
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        match self.store.head(&StorePath::from(path)).await {
            Ok(meta) => Ok(Some(self.convert_meta(&meta))),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(map_store_error(path, "head", e)),
        }
    }
}

// ============================================================================
// Deadlines
// ============================================================================

/// Wraps a backend so every call carries a deadline.
///
/// A call that exceeds the deadline fails with `Error::Timeout`, which is
/// retryable. The underlying request is dropped, not awaited.
#[derive(Debug, Clone)]
pub struct TimeoutBackend<S> {
    inner: S,
    timeout: Duration,
}

impl<S: StorageBackend> TimeoutBackend<S> {
    /// Wraps `inner` with a per-call `timeout`.
    #[must_use]
    pub fn new(inner: S, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    /// Returns the wrapped backend.
    #[must_use]
    pub fn inner(&self) -> &S {
        &self.inner
    }

    async fn with_deadline<T>(
        &self,
        operation: &str,
        path: &str,
        fut: impl std::future::Future<Output = Result<T>> + Send,
    ) -> Result<T> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| Error::Timeout {
                operation: format!("{operation} {path}"),
                after: self.timeout,
            })?
    }
}

#[async_trait]
impl<S: StorageBackend> StorageBackend for TimeoutBackend<S> {
    async fn get(&self, path: &str) -> Result<Bytes> {
        self.with_deadline("get", path, self.inner.get(path)).await
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        self.with_deadline("put", path, self.inner.put(path, data, precondition))
            .await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.with_deadline("delete", path, self.inner.delete(path))
            .await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        self.with_deadline("list", prefix, self.inner.list(prefix))
            .await
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        self.with_deadline("head", path, self.inner.head(path)).await
    }
}

#[async_trait]
impl StorageBackend for Arc<dyn StorageBackend> {
    async fn get(&self, path: &str) -> Result<Bytes> {
        self.as_ref().get(path).await
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        self.as_ref().put(path, data, precondition).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.as_ref().delete(path).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        self.as_ref().list(prefix).await
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        self.as_ref().head(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_backend_roundtrip() {
        let backend = MemoryBackend::new();
        let data = Bytes::from("hello world");

        let result = backend
            .put("t/file.txt", data.clone(), WritePrecondition::None)
            .await
            .expect("put should succeed");
        assert!(matches!(result, WriteResult::Success { ref version } if version == "1"));

        let retrieved = backend.get("t/file.txt").await.expect("get");
        assert_eq!(retrieved, data);
    }

    #[tokio::test]
    async fn test_put_if_absent_rejects_second_writer() {
        let backend = MemoryBackend::new();
        let first = backend
            .put("log/1.json", Bytes::from("a"), WritePrecondition::DoesNotExist)
            .await
            .expect("put");
        assert!(first.is_success());

        let second = backend
            .put("log/1.json", Bytes::from("b"), WritePrecondition::DoesNotExist)
            .await
            .expect("put");
        assert!(matches!(
            second,
            WriteResult::PreconditionFailed { ref current_version } if current_version == "1"
        ));
        assert_eq!(backend.get("log/1.json").await.expect("get"), "a");
    }

    #[tokio::test]
    async fn test_matches_version_cas() {
        let backend = MemoryBackend::new();
        backend
            .put("lock", Bytes::from("v1"), WritePrecondition::None)
            .await
            .expect("put");

        let stale = backend
            .put(
                "lock",
                Bytes::from("v2"),
                WritePrecondition::MatchesVersion("7".into()),
            )
            .await
            .expect("put");
        assert!(!stale.is_success());

        let fresh = backend
            .put(
                "lock",
                Bytes::from("v2"),
                WritePrecondition::MatchesVersion("1".into()),
            )
            .await
            .expect("put");
        assert_eq!(
            fresh,
            WriteResult::Success {
                version: "2".into()
            }
        );

        let missing = backend
            .put(
                "absent",
                Bytes::from("x"),
                WritePrecondition::MatchesVersion("1".into()),
            )
            .await
            .expect("put");
        assert!(!missing.is_success());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let backend = MemoryBackend::new();
        backend
            .put("f", Bytes::from("x"), WritePrecondition::None)
            .await
            .expect("put");
        backend.delete("f").await.expect("first delete");
        backend.delete("f").await.expect("second delete");
        assert!(backend.head("f").await.expect("head").is_none());
        assert!(matches!(backend.get("f").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_list_filters_by_prefix() {
        let backend = MemoryBackend::new();
        for path in ["t/_log/1.json", "t/_log/2.json", "t/data/a.parquet", "u/_log/1.json"] {
            backend
                .put(path, Bytes::from("x"), WritePrecondition::None)
                .await
                .expect("put");
        }
        let mut paths: Vec<String> = backend
            .list("t/_log/")
            .await
            .expect("list")
            .into_iter()
            .map(|m| m.path)
            .collect();
        paths.sort();
        assert_eq!(paths, vec!["t/_log/1.json", "t/_log/2.json"]);
    }

    #[tokio::test]
    async fn test_object_meta_has_required_fields() {
        let backend = MemoryBackend::new();
        backend
            .put("test.txt", Bytes::from("data"), WritePrecondition::None)
            .await
            .expect("put");

        let meta = backend
            .head("test.txt")
            .await
            .expect("head")
            .expect("object should exist");
        assert_eq!(meta.path, "test.txt");
        assert_eq!(meta.size, 4);
        assert!(!meta.version.is_empty());
        assert!(meta.last_modified.is_some());
    }

    #[tokio::test]
    async fn test_object_store_backend_in_memory() {
        let backend = ObjectStoreBackend::from_url("memory://").expect("backend");
        let created = backend
            .put("t/_log/00.json", Bytes::from("{}"), WritePrecondition::DoesNotExist)
            .await
            .expect("put");
        assert!(created.is_success());

        let again = backend
            .put("t/_log/00.json", Bytes::from("{}"), WritePrecondition::DoesNotExist)
            .await
            .expect("put");
        assert!(!again.is_success());

        let meta = backend
            .head("t/_log/00.json")
            .await
            .expect("head")
            .expect("exists");
        let updated = backend
            .put(
                "t/_log/00.json",
                Bytes::from("{\"a\":1}"),
                WritePrecondition::MatchesVersion(meta.version),
            )
            .await
            .expect("put");
        assert!(updated.is_success());

        let listed = backend.list("t/_log/").await.expect("list");
        assert_eq!(listed.len(), 1);

        backend.delete("t/_log/00.json").await.expect("delete");
        backend.delete("t/_log/00.json").await.expect("delete again");
        assert!(backend.head("t/_log/00.json").await.expect("head").is_none());
    }

    #[test]
    fn test_unsupported_scheme_rejected() {
        let err = ObjectStoreBackend::from_url("ftp://bucket").expect_err("must fail");
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    struct SlowBackend;

    #[async_trait]
    impl StorageBackend for SlowBackend {
        async fn get(&self, _path: &str) -> Result<Bytes> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Bytes::new())
        }
        async fn put(&self, _: &str, _: Bytes, _: WritePrecondition) -> Result<WriteResult> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(WriteResult::Success {
                version: "1".into(),
            })
        }
        async fn delete(&self, _: &str) -> Result<()> {
            Ok(())
        }
        async fn list(&self, _: &str) -> Result<Vec<ObjectMeta>> {
            Ok(Vec::new())
        }
        async fn head(&self, _: &str) -> Result<Option<ObjectMeta>> {
            Ok(None)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_backend_surfaces_retryable_timeout() {
        let backend = TimeoutBackend::new(SlowBackend, Duration::from_millis(50));
        let err = backend.get("slow").await.expect_err("must time out");
        assert!(matches!(err, Error::Timeout { .. }));
        assert!(err.is_retryable());

        backend.delete("fast").await.expect("fast call passes through");
    }
}
