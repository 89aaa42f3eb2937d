//! Distributed locking over object storage.
//!
//! Two layers:
//! - [`LockService`] is the narrow lock-service boundary: `acquire` returns
//!   either a token or `Busy`, `renew` heartbeats a token, `release` gives it
//!   back. [`StorageLockService`] implements it with conditional writes on a
//!   lock object, so any [`StorageBackend`] with CAS can host locks.
//! - [`DistributedLock`] is the client adapter every mutator uses: it retries
//!   `Busy` answers with jittered backoff until a deadline, then fails with
//!   [`Error::LockTimeout`]. The returned [`LockGuard`] renews and releases.
//!
//! # Protocol
//!
//! 1. Acquisition writes a lock record with `DoesNotExist`; only one writer
//!    can succeed.
//! 2. If a record exists and is expired, it is taken over with a CAS write
//!    against the version observed by HEAD. An unexpired record is never
//!    overridden.
//! 3. Each acquisition increments the record's sequence number, which is the
//!    fencing token.
//! 4. Release CAS-writes an expired record rather than deleting, so a holder
//!    that lost the lock can never remove its successor's record.
//!
//! # Example
//!
//! ```rust,ignore
//! let service = Arc::new(StorageLockService::new(storage.clone()));
//! let lock = DistributedLock::new(service, "tables/events/_locks/commit");
//!
//! let mut guard = lock.acquire().await?;
//! // ... critical section ...
//! guard.renew().await?;
//! guard.release().await?;
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::id::HolderId;
use crate::retry::RetryPolicy;
use crate::storage::{StorageBackend, WritePrecondition, WriteResult};

/// Default lock TTL (30 seconds).
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(30);

/// Default time a caller waits for a busy lock before giving up.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Lock record persisted at the lock key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    /// Current (or last) holder.
    pub holder_id: HolderId,

    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,

    /// When the lock expires.
    pub expires_at: DateTime<Utc>,

    /// Incremented on every acquisition; doubles as the fencing token.
    #[serde(default)]
    pub sequence_number: u64,
}

impl LockInfo {
    fn new(holder_id: HolderId, ttl: Duration, sequence_number: u64) -> Self {
        let now = Utc::now();
        Self {
            holder_id,
            acquired_at: now,
            expires_at: now + chrono_ttl(ttl),
            sequence_number,
        }
    }

    /// Returns whether this lock has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Returns the remaining TTL, or zero if expired.
    #[must_use]
    pub fn remaining_ttl(&self) -> Duration {
        (self.expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }

    fn to_bytes(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| Error::serialization(format!("serialize lock: {e}")))
    }

    fn from_bytes(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| Error::serialization(format!("parse lock: {e}")))
    }
}

fn chrono_ttl(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(30))
}

/// Monotonic fencing token handed out with each lock acquisition.
///
/// A higher token always belongs to a later holder. Mutators stamp it on what
/// they publish so stale holders can be detected after the fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FencingToken(u64);

impl FencingToken {
    /// Creates a token from a raw sequence number.
    #[must_use]
    pub const fn new(sequence: u64) -> Self {
        Self(sequence)
    }

    /// Returns the raw sequence number.
    #[must_use]
    pub const fn sequence(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for FencingToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Proof of a held lock, returned by [`LockService::acquire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    /// The lock key.
    pub key: String,
    /// The holder that owns this token.
    pub holder: HolderId,
    /// Fencing token of this acquisition.
    pub fencing: FencingToken,
    /// When the lock expires unless renewed.
    pub expires_at: DateTime<Utc>,
    /// Opaque store version of the lock record, used for CAS.
    version: String,
}

/// Outcome of a single acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAcquire {
    /// The lock is ours.
    Acquired(LockToken),
    /// Someone else holds an unexpired lock.
    Busy {
        /// The current holder.
        holder: String,
        /// How long until the holder's TTL runs out.
        remaining: Duration,
    },
}

/// Lock-service boundary: conditional acquire, renew and release.
#[async_trait]
pub trait LockService: Send + Sync + 'static {
    /// Attempts to acquire `key` for `holder` once, without waiting.
    async fn acquire(&self, key: &str, holder: HolderId, ttl: Duration) -> Result<LockAcquire>;

    /// Extends a held lock by `ttl` from now.
    ///
    /// Fails with `Error::PreconditionFailed` if the lock was lost, which
    /// means another holder may already be acting under a newer token.
    async fn renew(&self, token: &LockToken, ttl: Duration) -> Result<LockToken>;

    /// Releases a held lock. Releasing a lock that was already lost is not an
    /// error; the successor's record is left intact.
    async fn release(&self, token: LockToken) -> Result<()>;
}

// ============================================================================
// Storage-backed lock service
// ============================================================================

/// [`LockService`] implemented with conditional writes on lock objects.
pub struct StorageLockService<S: StorageBackend + ?Sized> {
    storage: Arc<S>,
}

impl<S: StorageBackend + ?Sized> fmt::Debug for StorageLockService<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageLockService").finish_non_exhaustive()
    }
}

impl<S: StorageBackend + ?Sized> StorageLockService<S> {
    /// Creates a lock service storing records in `storage`.
    #[must_use]
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }

    /// Reads the current lock record without acquiring it.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be read or parsed.
    pub async fn inspect(&self, key: &str) -> Result<Option<LockInfo>> {
        match self.storage.get(key).await {
            Ok(data) => LockInfo::from_bytes(&data).map(Some),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn token(key: &str, info: &LockInfo, version: String) -> LockToken {
        LockToken {
            key: key.to_string(),
            holder: info.holder_id,
            fencing: FencingToken::new(info.sequence_number),
            expires_at: info.expires_at,
            version,
        }
    }
}

#[async_trait]
impl<S: StorageBackend + ?Sized> LockService for StorageLockService<S> {
    async fn acquire(&self, key: &str, holder: HolderId, ttl: Duration) -> Result<LockAcquire> {
        let fresh = LockInfo::new(holder, ttl, 1);
        if let WriteResult::Success { version } = self
            .storage
            .put(key, fresh.to_bytes()?, WritePrecondition::DoesNotExist)
            .await?
        {
            return Ok(LockAcquire::Acquired(Self::token(key, &fresh, version)));
        }

        // HEAD before GET: the expiry decision must be bound to the version
        // the takeover CAS is conditioned on.
        let Some(meta) = self.storage.head(key).await? else {
            return Ok(LockAcquire::Busy {
                holder: "unknown".into(),
                remaining: Duration::ZERO,
            });
        };
        let Some(existing) = self.inspect(key).await? else {
            return Ok(LockAcquire::Busy {
                holder: "unknown".into(),
                remaining: Duration::ZERO,
            });
        };

        if !existing.is_expired() {
            return Ok(LockAcquire::Busy {
                holder: existing.holder_id.to_string(),
                remaining: existing.remaining_ttl(),
            });
        }

        let takeover = LockInfo::new(holder, ttl, existing.sequence_number.saturating_add(1));
        match self
            .storage
            .put(
                key,
                takeover.to_bytes()?,
                WritePrecondition::MatchesVersion(meta.version),
            )
            .await?
        {
            WriteResult::Success { version } => {
                tracing::debug!(
                    key,
                    previous_holder = %existing.holder_id,
                    fencing = takeover.sequence_number,
                    "took over expired lock"
                );
                Ok(LockAcquire::Acquired(Self::token(key, &takeover, version)))
            }
            WriteResult::PreconditionFailed { .. } => Ok(LockAcquire::Busy {
                holder: "unknown".into(),
                remaining: Duration::ZERO,
            }),
        }
    }

    async fn renew(&self, token: &LockToken, ttl: Duration) -> Result<LockToken> {
        let current = self.inspect(&token.key).await?;
        let Some(info) = current.filter(|info| {
            info.holder_id == token.holder && info.sequence_number == token.fencing.sequence()
        }) else {
            return Err(Error::PreconditionFailed {
                message: format!("lock {} lost by {}", token.key, token.holder),
            });
        };

        let renewed = LockInfo {
            expires_at: Utc::now() + chrono_ttl(ttl),
            ..info
        };
        match self
            .storage
            .put(
                &token.key,
                renewed.to_bytes()?,
                WritePrecondition::MatchesVersion(token.version.clone()),
            )
            .await?
        {
            WriteResult::Success { version } => Ok(Self::token(&token.key, &renewed, version)),
            WriteResult::PreconditionFailed { .. } => Err(Error::PreconditionFailed {
                message: format!("lock {} modified by another holder", token.key),
            }),
        }
    }

    async fn release(&self, token: LockToken) -> Result<()> {
        let Some(info) = self.inspect(&token.key).await? else {
            return Ok(());
        };
        if info.holder_id != token.holder || info.sequence_number != token.fencing.sequence() {
            return Ok(());
        }

        // The expired record stays in place and keeps the sequence number so
        // the next acquisition increments it.
        let expired = LockInfo {
            expires_at: Utc::now() - chrono::Duration::seconds(1),
            ..info
        };
        let _ = self
            .storage
            .put(
                &token.key,
                expired.to_bytes()?,
                WritePrecondition::MatchesVersion(token.version),
            )
            .await?;
        Ok(())
    }
}

// ============================================================================
// Client adapter
// ============================================================================

/// Client-side lock handle bound to one key and one holder identity.
#[derive(Clone)]
pub struct DistributedLock {
    service: Arc<dyn LockService>,
    key: String,
    holder: HolderId,
    ttl: Duration,
    acquire_timeout: Duration,
    backoff: RetryPolicy,
}

impl fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedLock")
            .field("key", &self.key)
            .field("holder", &self.holder)
            .field("ttl", &self.ttl)
            .field("acquire_timeout", &self.acquire_timeout)
            .finish_non_exhaustive()
    }
}

impl DistributedLock {
    /// Creates a lock handle with a fresh holder identity and default timing.
    #[must_use]
    pub fn new(service: Arc<dyn LockService>, key: impl Into<String>) -> Self {
        Self {
            service,
            key: key.into(),
            holder: HolderId::generate(),
            ttl: DEFAULT_LOCK_TTL,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            backoff: RetryPolicy::default()
                .with_delays(Duration::from_millis(20), Duration::from_millis(500)),
        }
    }

    /// Sets the lock TTL.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Sets how long [`acquire`](Self::acquire) waits for a busy lock.
    #[must_use]
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Sets the backoff between acquisition attempts.
    #[must_use]
    pub fn with_backoff(mut self, backoff: RetryPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Uses a fixed holder identity instead of a generated one.
    #[must_use]
    pub fn with_holder(mut self, holder: HolderId) -> Self {
        self.holder = holder;
        self
    }

    /// Returns the lock key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns the holder identity used for acquisitions.
    #[must_use]
    pub fn holder(&self) -> HolderId {
        self.holder
    }

    /// Acquires the lock, waiting at most the configured acquire timeout.
    ///
    /// # Errors
    ///
    /// Returns `Error::LockTimeout` if the lock stays busy past the deadline
    /// (or the service is too slow to answer before it). Non-retryable
    /// service errors are returned immediately.
    pub async fn acquire(&self) -> Result<LockGuard> {
        self.acquire_within(self.acquire_timeout).await
    }

    /// Attempts to acquire the lock once, without waiting.
    ///
    /// Returns `None` if another holder has it.
    ///
    /// # Errors
    ///
    /// Returns lock service errors.
    pub async fn try_acquire(&self) -> Result<Option<LockGuard>> {
        match self.service.acquire(&self.key, self.holder, self.ttl).await? {
            LockAcquire::Acquired(token) => Ok(Some(LockGuard {
                service: Arc::clone(&self.service),
                ttl: self.ttl,
                token: Some(token),
            })),
            LockAcquire::Busy { holder, .. } => {
                tracing::debug!(key = %self.key, holder = %holder, "lock busy");
                Ok(None)
            }
        }
    }

    /// Acquires the lock, waiting at most `timeout`.
    ///
    /// # Errors
    ///
    /// See [`acquire`](Self::acquire).
    pub async fn acquire_within(&self, timeout: Duration) -> Result<LockGuard> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut attempt: u32 = 0;
        let mut last_holder = String::from("unknown");

        loop {
            attempt = attempt.saturating_add(1);
            let remaining = deadline.saturating_duration_since(Instant::now());
            let outcome = tokio::time::timeout(
                remaining,
                self.service.acquire(&self.key, self.holder, self.ttl),
            )
            .await;

            match outcome {
                Ok(Ok(LockAcquire::Acquired(token))) => {
                    tracing::debug!(
                        key = %self.key,
                        holder = %self.holder,
                        fencing = token.fencing.sequence(),
                        attempts = attempt,
                        "lock acquired"
                    );
                    return Ok(LockGuard {
                        service: Arc::clone(&self.service),
                        ttl: self.ttl,
                        token: Some(token),
                    });
                }
                Ok(Ok(LockAcquire::Busy { holder, .. })) => last_holder = holder,
                Ok(Err(e)) if e.is_retryable() => {
                    tracing::debug!(key = %self.key, error = %e, "lock service call failed");
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::LockTimeout {
                    key: self.key.clone(),
                    holder: last_holder,
                    waited: now - started,
                });
            }
            let delay = self.backoff.delay_for(attempt).min(deadline - now);
            tokio::time::sleep(delay).await;
        }
    }
}

/// RAII guard for a held lock.
///
/// Dropping an unreleased guard spawns a best-effort release on the current
/// tokio runtime. Without a runtime the TTL reclaims the lock.
pub struct LockGuard {
    service: Arc<dyn LockService>,
    ttl: Duration,
    token: Option<LockToken>,
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

impl LockGuard {
    /// Returns the fencing token of this acquisition.
    #[must_use]
    pub fn fencing_token(&self) -> FencingToken {
        self.token
            .as_ref()
            .map_or(FencingToken::new(0), |token| token.fencing)
    }

    /// Returns the holder identity.
    #[must_use]
    pub fn holder(&self) -> Option<HolderId> {
        self.token.as_ref().map(|token| token.holder)
    }

    /// Heartbeats the lock for another full TTL.
    ///
    /// # Errors
    ///
    /// Returns `Error::PreconditionFailed` if the lock has been lost, and
    /// storage errors from the service.
    pub async fn renew(&mut self) -> Result<()> {
        let Some(token) = self.token.as_ref() else {
            return Err(Error::PreconditionFailed {
                message: "lock already released".into(),
            });
        };
        let renewed = self.service.renew(token, self.ttl).await?;
        self.token = Some(renewed);
        Ok(())
    }

    /// Explicitly releases the lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the release write fails. The TTL still bounds how
    /// long the lock stays held.
    pub async fn release(mut self) -> Result<()> {
        match self.token.take() {
            Some(token) => self.service.release(token).await,
            None => Ok(()),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let service = Arc::clone(&self.service);
        handle.spawn(async move {
            if let Err(e) = service.release(token).await {
                tracing::warn!(error = %e, "best-effort lock release failed");
            }
        });
    }
}
