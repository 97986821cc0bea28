// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Circuit breaker pattern for remote operation protection.
//!
//! Prevents cascading failures when the tracking service is overloaded or
//! unhealthy. One breaker guards one named operation; the orchestrator keeps
//! one more for the batch as a whole.
//!
//! # States
//!
//! - **Closed**: Normal operation, requests pass through
//! - **Open**: Service unhealthy, requests fail-fast without attempting
//! - **HalfOpen**: Testing if the service recovered, probe requests allowed
//!
//! # Transitions
//!
//! ```text
//!            failure_count >= failure_threshold
//!   Closed ─────────────────────────────────────▶ Open
//!     ▲                                          │  ▲
//!     │ success_count >= success_threshold       │  │ any failure
//!     │                                timeout   ▼  │
//!     └──────────────────────────────────── HalfOpen
//! ```
//!
//! The open → half-open move happens inside [`CircuitBreaker::is_call_allowed`],
//! so the caller that observes the elapsed timeout is the probe. Callers must
//! report exactly one outcome per admitted call via
//! [`record_success`](CircuitBreaker::record_success) or
//! [`record_failure`](CircuitBreaker::record_failure).
//!
//! # Usage
//!
//! ```rust,no_run
//! # use tracking_sync::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitError};
//! # async fn example() {
//! let breaker = CircuitBreaker::new("get_item", CircuitBreakerConfig::default());
//!
//! match breaker.call(|| async { Ok::<u32, String>(7) }).await {
//!     Ok(value) => { /* success */ }
//!     Err(CircuitError::Rejected { .. }) => { /* circuit open, back off */ }
//!     Err(CircuitError::Inner(e)) => { /* operation error */ }
//! }
//! # }
//! ```

use crate::error::{Result, SyncError};
use crate::events::{SharedSink, SyncEvent, TracingSink};
use crate::metrics;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Circuit breaker state for metrics/monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, requests pass through
    Closed = 0,
    /// Testing if service recovered
    HalfOpen = 1,
    /// Service unhealthy, fail-fast
    Open = 2,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::HalfOpen => write!(f, "half_open"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// Error type for circuit-protected operations.
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The circuit breaker rejected the call (circuit is open).
    #[error("circuit breaker '{circuit}' open, request rejected")]
    Rejected { circuit: String },

    /// The underlying operation failed.
    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

impl<E> CircuitError<E> {
    /// Check if this is a rejection (circuit open).
    pub fn is_rejected(&self) -> bool {
        matches!(self, CircuitError::Rejected { .. })
    }

    /// Check if this is an inner error.
    pub fn is_inner(&self) -> bool {
        matches!(self, CircuitError::Inner(_))
    }

    /// Get the inner error if present.
    pub fn inner(&self) -> Option<&E> {
        match self {
            CircuitError::Inner(e) => Some(e),
            _ => None,
        }
    }
}

/// Configuration for a circuit breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures to trip the circuit.
    pub failure_threshold: u32,
    /// Number of consecutive successes in half-open to close circuit.
    pub success_threshold: u32,
    /// How long to stay open before admitting a probe.
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// Aggressive config for critical paths (trips faster, recovers cautiously).
    ///
    /// Used for the batch-level breaker: a run that keeps failing should not be
    /// re-attempted every tick.
    #[must_use]
    pub fn aggressive() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 3,
            timeout: Duration::from_secs(60),
        }
    }

    /// Lenient config for less critical paths (tolerates more failures).
    #[must_use]
    pub fn lenient() -> Self {
        Self {
            failure_threshold: 10,
            success_threshold: 1,
            timeout: Duration::from_secs(15),
        }
    }

    /// Fast recovery for tests.
    #[must_use]
    pub fn testing() -> Self {
        Self {
            failure_threshold: 2,
            success_threshold: 1,
            timeout: Duration::from_millis(50),
        }
    }

    /// Check the config invariants.
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(SyncError::Config("failure_threshold must be >= 1".into()));
        }
        if self.success_threshold == 0 {
            return Err(SyncError::Config("success_threshold must be >= 1".into()));
        }
        if self.timeout.is_zero() {
            return Err(SyncError::Config("circuit timeout must be > 0".into()));
        }
        Ok(())
    }
}

/// Point-in-time view of a breaker, for health endpoints.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    /// Milliseconds since the last recorded failure that opened the circuit.
    pub millis_since_failure: Option<u64>,
    pub calls_total: u64,
    pub rejections: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
}

/// A named circuit breaker with metrics tracking.
///
/// State lives behind a mutex that is never held across an `.await`, so the
/// breaker can be shared freely between tasks.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    sink: SharedSink,

    // Metrics
    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("config", &self.config)
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker reporting to the default tracing sink.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_sink(name, config, TracingSink::shared())
    }

    /// Create a new circuit breaker reporting transitions to `sink`.
    pub fn with_sink(name: impl Into<String>, config: CircuitBreakerConfig, sink: SharedSink) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_time: None,
            }),
            sink,
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    /// Create with default config.
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    /// Get the circuit breaker name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the circuit breaker config.
    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        // A panic while holding the lock cannot leave the counters half-updated
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit_transition(&self, from: CircuitState, to: CircuitState) {
        self.sink.emit(&SyncEvent::CircuitTransition {
            circuit: self.name.clone(),
            from,
            to,
        });
    }

    /// Decide whether a call may be attempted right now.
    ///
    /// Open circuits whose timeout has elapsed move to half-open here and the
    /// current caller becomes the probe.
    pub fn is_call_allowed(&self) -> bool {
        let mut transition = None;
        let allowed = {
            let mut inner = self.lock();
            match inner.state {
                CircuitState::Closed | CircuitState::HalfOpen => true,
                CircuitState::Open => {
                    let elapsed = inner
                        .last_failure_time
                        .map(|at| at.elapsed())
                        .unwrap_or(Duration::MAX);
                    if elapsed >= self.config.timeout {
                        inner.state = CircuitState::HalfOpen;
                        inner.success_count = 0;
                        transition = Some((CircuitState::Open, CircuitState::HalfOpen));
                        true
                    } else {
                        false
                    }
                }
            }
        };

        if let Some((from, to)) = transition {
            self.emit_transition(from, to);
        }

        if allowed {
            self.calls_total.fetch_add(1, Ordering::Relaxed);
        } else {
            self.rejections.fetch_add(1, Ordering::Relaxed);
            metrics::record_circuit_rejection(&self.name);
            debug!(circuit = %self.name, "Circuit breaker rejected call (open)");
        }
        allowed
    }

    /// Report that an admitted call succeeded.
    pub fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);

        let transition = {
            let mut inner = self.lock();
            match inner.state {
                CircuitState::Closed => {
                    inner.failure_count = 0;
                    None
                }
                CircuitState::HalfOpen => {
                    inner.success_count += 1;
                    if inner.success_count >= self.config.success_threshold {
                        inner.state = CircuitState::Closed;
                        inner.failure_count = 0;
                        inner.success_count = 0;
                        Some((CircuitState::HalfOpen, CircuitState::Closed))
                    } else {
                        None
                    }
                }
                // Late result of a call admitted before the trip
                CircuitState::Open => None,
            }
        };

        if let Some((from, to)) = transition {
            self.emit_transition(from, to);
        }
    }

    /// Report that an admitted call failed (after all of its retries).
    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);

        let transition = {
            let mut inner = self.lock();
            let now = Instant::now();
            match inner.state {
                CircuitState::Closed => {
                    inner.failure_count += 1;
                    if inner.failure_count >= self.config.failure_threshold {
                        inner.state = CircuitState::Open;
                        inner.last_failure_time = Some(now);
                        Some((CircuitState::Closed, CircuitState::Open))
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen => {
                    inner.state = CircuitState::Open;
                    inner.last_failure_time = Some(now);
                    Some((CircuitState::HalfOpen, CircuitState::Open))
                }
                CircuitState::Open => {
                    inner.last_failure_time = Some(now);
                    None
                }
            }
        };

        if let Some((from, to)) = transition {
            self.emit_transition(from, to);
        }
    }

    /// Execute a single async attempt through the circuit breaker.
    ///
    /// Takes a closure that returns a Future, allowing lazy evaluation: when
    /// the circuit is open the closure is never called.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> std::result::Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        if !self.is_call_allowed() {
            return Err(CircuitError::Rejected {
                circuit: self.name.clone(),
            });
        }

        match f().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(CircuitError::Inner(e))
            }
        }
    }

    /// Current state, without triggering the open → half-open move.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Consecutive failures counted while closed.
    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    /// Consecutive successes counted while half-open.
    #[must_use]
    pub fn success_count(&self) -> u32 {
        self.lock().success_count
    }

    /// When the circuit last (re)opened.
    #[must_use]
    pub fn last_failure_time(&self) -> Option<Instant> {
        self.lock().last_failure_time
    }

    /// Force the breaker back to closed (operator override).
    pub fn reset(&self) {
        let previous = {
            let mut inner = self.lock();
            let previous = inner.state;
            inner.state = CircuitState::Closed;
            inner.failure_count = 0;
            inner.success_count = 0;
            inner.last_failure_time = None;
            previous
        };
        if previous != CircuitState::Closed {
            self.emit_transition(previous, CircuitState::Closed);
        }
    }

    /// Snapshot for health reporting.
    #[must_use]
    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.lock();
        CircuitSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            millis_since_failure: inner.last_failure_time.map(|at| at.elapsed().as_millis() as u64),
            calls_total: self.calls_total(),
            rejections: self.rejections(),
        }
    }

    /// Get total number of admitted calls.
    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    /// Get number of successful calls.
    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    /// Get number of failed calls (operation errors).
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Get number of rejected calls (circuit open).
    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    /// Get failure rate (0.0 - 1.0) over admitted calls.
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        let total = self.calls_total();
        if total == 0 {
            return 0.0;
        }
        self.failures() as f64 / total as f64
    }

    /// Reset all metrics counters (state is untouched).
    pub fn reset_metrics(&self) {
        self.calls_total.store(0, Ordering::Relaxed);
        self.successes.store(0, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);
        self.rejections.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventSink;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[derive(Default)]
    struct Transitions(Mutex<Vec<(CircuitState, CircuitState)>>);

    impl EventSink for Transitions {
        fn emit(&self, event: &SyncEvent) {
            if let SyncEvent::CircuitTransition { from, to, .. } = event {
                self.0.lock().unwrap().push((*from, *to));
            }
        }
    }

    fn breaker(failure_threshold: u32, success_threshold: u32, timeout_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold,
                success_threshold,
                timeout: Duration::from_millis(timeout_ms),
            },
        )
    }

    #[tokio::test]
    async fn test_circuit_passes_successful_calls() {
        let cb = CircuitBreaker::new("test", CircuitBreakerConfig::testing());

        let result: std::result::Result<i32, CircuitError<&str>> = cb.call(|| async { Ok(42) }).await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(cb.successes(), 1);
        assert_eq!(cb.failures(), 0);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_circuit_tracks_failures() {
        let cb = breaker(3, 1, 1000);

        let result: std::result::Result<i32, CircuitError<&str>> = cb.call(|| async { Err("boom") }).await;

        assert!(matches!(result, Err(CircuitError::Inner("boom"))));
        assert_eq!(cb.failures(), 1);
        assert_eq!(cb.failure_count(), 1);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_success_resets_failure_count_when_closed() {
        let cb = breaker(3, 1, 1000);
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.failure_count(), 2);

        cb.record_success();
        assert_eq!(cb.failure_count(), 0);

        // Non-consecutive failures never trip
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_at_threshold_and_blocks_until_timeout() {
        let cb = breaker(2, 1, 5_000);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.last_failure_time().is_some());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!cb.is_call_allowed());
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.rejections(), 1);

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(cb.is_call_allowed());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.success_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_closes_after_success_threshold() {
        let cb = breaker(1, 2, 100);
        cb.record_failure();
        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(cb.is_call_allowed());

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.success_count(), 1);

        // Further probes are admitted while half-open
        assert!(cb.is_call_allowed());
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens_immediately() {
        let cb = breaker(3, 3, 100);
        for _ in 0..3 {
            cb.record_failure();
        }
        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(cb.is_call_allowed());
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let before = cb.last_failure_time().unwrap();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.last_failure_time().unwrap() > before);

        // Timeout restarts from the reopen
        assert!(!cb.is_call_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_ignores_late_success() {
        let cb = breaker(1, 1, 1_000);
        cb.record_failure();
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_call_never_invokes_operation() {
        let cb = breaker(1, 1, 60_000);
        cb.record_failure();

        let invoked = Arc::new(AtomicUsize::new(0));
        let counter = invoked.clone();
        let result: std::result::Result<(), CircuitError<&str>> = cb
            .call(|| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(CircuitError::Rejected { ref circuit }) if circuit == "test"));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transitions_are_reported() {
        let sink = Arc::new(Transitions::default());
        let cb = CircuitBreaker::with_sink(
            "reported",
            CircuitBreakerConfig {
                failure_threshold: 1,
                success_threshold: 1,
                timeout: Duration::from_millis(10),
            },
            sink.clone(),
        );

        cb.record_failure();
        tokio::time::advance(Duration::from_millis(10)).await;
        assert!(cb.is_call_allowed());
        cb.record_success();

        let seen = sink.0.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::HalfOpen),
                (CircuitState::HalfOpen, CircuitState::Closed),
            ]
        );
    }

    #[test]
    fn test_reset_closes_circuit() {
        let cb = breaker(1, 1, 60_000);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.last_failure_time().is_none());
        assert!(cb.is_call_allowed());
    }

    #[tokio::test]
    async fn test_failure_rate_and_reset_metrics() {
        let cb = breaker(100, 1, 1000);

        let _: std::result::Result<i32, CircuitError<&str>> = cb.call(|| async { Ok(1) }).await;
        let _: std::result::Result<i32, CircuitError<&str>> = cb.call(|| async { Err("x") }).await;
        let _: std::result::Result<i32, CircuitError<&str>> = cb.call(|| async { Ok(2) }).await;
        let _: std::result::Result<i32, CircuitError<&str>> = cb.call(|| async { Err("y") }).await;

        assert_eq!(cb.calls_total(), 4);
        assert!((cb.failure_rate() - 0.5).abs() < 0.01);

        cb.reset_metrics();
        assert_eq!(cb.calls_total(), 0);
        assert_eq!(cb.successes(), 0);
        assert_eq!(cb.failures(), 0);
        assert_eq!(cb.rejections(), 0);
        assert_eq!(cb.failure_rate(), 0.0);
    }

    #[test]
    fn test_snapshot_reflects_state() {
        let cb = breaker(2, 1, 60_000);
        cb.record_failure();
        let snap = cb.snapshot();
        assert_eq!(snap.name, "test");
        assert_eq!(snap.state, CircuitState::Closed);
        assert_eq!(snap.failure_count, 1);
        assert!(snap.millis_since_failure.is_none());
    }

    #[test]
    fn test_circuit_config_presets() {
        let default = CircuitBreakerConfig::default();
        let aggressive = CircuitBreakerConfig::aggressive();
        let lenient = CircuitBreakerConfig::lenient();

        assert!(aggressive.failure_threshold < default.failure_threshold);
        assert!(lenient.failure_threshold > default.failure_threshold);
        assert!(aggressive.timeout > lenient.timeout);
        assert!(CircuitBreakerConfig::testing().validate().is_ok());
    }

    #[test]
    fn test_circuit_config_validation() {
        let mut config = CircuitBreakerConfig::default();
        config.failure_threshold = 0;
        assert!(config.validate().is_err());

        let mut config = CircuitBreakerConfig::default();
        config.success_threshold = 0;
        assert!(config.validate().is_err());

        let mut config = CircuitBreakerConfig::default();
        config.timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_circuit_error_methods() {
        let rejected: CircuitError<&str> = CircuitError::Rejected {
            circuit: "c".into(),
        };
        assert!(rejected.is_rejected());
        assert!(!rejected.is_inner());
        assert!(rejected.inner().is_none());

        let inner: CircuitError<&str> = CircuitError::Inner("boom");
        assert!(!inner.is_rejected());
        assert!(inner.is_inner());
        assert_eq!(inner.inner(), Some(&"boom"));
    }

    #[test]
    fn test_circuit_state_display() {
        assert_eq!(CircuitState::Closed.to_string(), "closed");
        assert_eq!(CircuitState::HalfOpen.to_string(), "half_open");
        assert_eq!(CircuitState::Open.to_string(), "open");
    }
}
