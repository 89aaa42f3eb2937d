//! Backpressure and health signalling for long-running mutators.
//!
//! A writer that cannot commit keeps its batches buffered. The number of
//! buffered-but-uncommitted batches is the lag; two thresholds turn it into
//! a decision for the upstream source:
//!
//! | Stage  | Lag range           | Behavior                         |
//! |--------|---------------------|----------------------------------|
//! | Normal | `lag < soft`        | Accept                           |
//! | Soft   | `soft <= lag < hard`| Accept, report degraded health   |
//! | Hard   | `lag >= hard`       | Stop accepting, `retry_after`    |
//!
//! [`HealthSignal`] values are published on a `tokio::sync::watch` channel
//! so health endpoints and upstream sources observe them without polling
//! the mutator.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Backpressure state for one mutator.
///
/// # Example
///
/// ```rust
/// use lakelog_core::backpressure::{BackpressureDecision, BackpressureState};
///
/// let state = BackpressureState::new("events").with_pending(20).with_thresholds(16, 64);
/// assert_eq!(
///     state.evaluate(),
///     BackpressureDecision::AcceptWithWarning { pending: 20 }
/// );
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackpressureState {
    /// Table the lag belongs to.
    pub table: String,
    /// Batches accepted but not yet committed.
    pub pending: u64,
    /// Lag at which health degrades.
    pub soft_threshold: u64,
    /// Lag at which new input is refused.
    pub hard_threshold: u64,
}

impl BackpressureState {
    /// Creates an empty state with default thresholds (16 / 64 batches).
    #[must_use]
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            pending: 0,
            soft_threshold: 16,
            hard_threshold: 64,
        }
    }

    /// Sets the pending lag.
    #[must_use]
    pub fn with_pending(mut self, pending: u64) -> Self {
        self.pending = pending;
        self
    }

    /// Sets the soft/hard thresholds.
    #[must_use]
    pub fn with_thresholds(mut self, soft: u64, hard: u64) -> Self {
        self.soft_threshold = soft;
        self.hard_threshold = hard;
        self
    }

    /// Evaluates the current lag.
    #[must_use]
    pub fn evaluate(&self) -> BackpressureDecision {
        if self.pending >= self.hard_threshold {
            BackpressureDecision::Reject {
                retry_after: Self::compute_retry_after(self.pending, self.hard_threshold),
            }
        } else if self.pending >= self.soft_threshold {
            BackpressureDecision::AcceptWithWarning {
                pending: self.pending,
            }
        } else {
            BackpressureDecision::Accept
        }
    }

    /// The further past the hard threshold, the longer callers should wait.
    fn compute_retry_after(lag: u64, hard_threshold: u64) -> Duration {
        let base_secs = 5;
        let overage_ratio = if hard_threshold > 0 {
            lag.saturating_sub(hard_threshold) / hard_threshold
        } else {
            0
        };
        Duration::from_secs((base_secs + overage_ratio).min(60))
    }
}

/// Backpressure decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackpressureDecision {
    /// Accept input.
    Accept,
    /// Accept input but report degraded health.
    AcceptWithWarning {
        /// Current lag.
        pending: u64,
    },
    /// Refuse input for now.
    Reject {
        /// Suggested wait before retrying.
        retry_after: Duration,
    },
}

/// Health of a long-running mutator as seen from outside.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum HealthSignal {
    /// Operating normally.
    Healthy,
    /// Making no or slow progress; upstream should slow down.
    Degraded {
        /// Human-readable cause.
        reason: String,
        /// When the mutator first became degraded.
        since: DateTime<Utc>,
    },
}

impl HealthSignal {
    /// Returns true for [`HealthSignal::Healthy`].
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

/// Publishes [`HealthSignal`] transitions for one mutator.
#[derive(Debug, Clone)]
pub struct HealthReporter {
    tx: watch::Sender<HealthSignal>,
}

impl Default for HealthReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthReporter {
    /// Creates a reporter that starts healthy.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(HealthSignal::Healthy);
        Self { tx }
    }

    /// Returns a receiver observing every transition.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<HealthSignal> {
        self.tx.subscribe()
    }

    /// Returns the current signal.
    #[must_use]
    pub fn current(&self) -> HealthSignal {
        self.tx.borrow().clone()
    }

    /// Marks the mutator healthy. No-op if it already is.
    pub fn healthy(&self) {
        self.tx.send_if_modified(|signal| {
            if signal.is_healthy() {
                false
            } else {
                tracing::info!("health recovered");
                *signal = HealthSignal::Healthy;
                true
            }
        });
    }

    /// Marks the mutator degraded, keeping the original `since` if it
    /// already was.
    pub fn degraded(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.tx.send_if_modified(|signal| match signal {
            HealthSignal::Degraded { reason: current, .. } if *current == reason => false,
            HealthSignal::Degraded { reason: current, .. } => {
                *current = reason.clone();
                true
            }
            HealthSignal::Healthy => {
                tracing::warn!(reason = %reason, "health degraded");
                *signal = HealthSignal::Degraded {
                    reason: reason.clone(),
                    since: Utc::now(),
                };
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thresholds() {
        let state = BackpressureState::new("t").with_thresholds(2, 4);
        assert_eq!(state.clone().with_pending(1).evaluate(), BackpressureDecision::Accept);
        assert_eq!(
            state.clone().with_pending(3).evaluate(),
            BackpressureDecision::AcceptWithWarning { pending: 3 }
        );
        assert_eq!(
            state.with_pending(4).evaluate(),
            BackpressureDecision::Reject {
                retry_after: Duration::from_secs(5)
            }
        );
    }

    #[test]
    fn test_retry_after_is_capped() {
        let state = BackpressureState::new("t")
            .with_thresholds(1, 2)
            .with_pending(10_000);
        assert_eq!(
            state.evaluate(),
            BackpressureDecision::Reject {
                retry_after: Duration::from_secs(60)
            }
        );
    }

    #[tokio::test]
    async fn test_reporter_publishes_transitions() {
        let reporter = HealthReporter::new();
        let mut rx = reporter.subscribe();
        assert!(rx.borrow().is_healthy());

        reporter.degraded("store unavailable");
        rx.changed().await.expect("changed");
        let since = match &*rx.borrow_and_update() {
            HealthSignal::Degraded { reason, since } => {
                assert_eq!(reason, "store unavailable");
                *since
            }
            HealthSignal::Healthy => panic!("expected degraded"),
        };

        reporter.degraded("store unavailable");
        assert!(!rx.has_changed().expect("open"));

        reporter.degraded("lock timeout");
        match reporter.current() {
            HealthSignal::Degraded { reason, since: s } => {
                assert_eq!(reason, "lock timeout");
                assert_eq!(s, since);
            }
            HealthSignal::Healthy => panic!("expected degraded"),
        }

        reporter.healthy();
        assert!(reporter.current().is_healthy());
    }
}
