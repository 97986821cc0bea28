// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Resilience utilities: retry with backoff, jitter, rate limiting.
//!
//! - [`RetryConfig`]: Exponential backoff schedule for transient failures
//! - [`RetryPolicy`]: Runs an operation under a [`RetryConfig`]
//! - [`RateLimiter`]: Token bucket so we don't hammer the tracking service
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() {
//! use tracking_sync::resilience::{RetryConfig, RetryPolicy};
//!
//! let policy = RetryPolicy::new("get_item", RetryConfig::default());
//! let value = policy
//!     .execute_with(|| async { Ok::<_, String>(1) }, |_| true)
//!     .await;
//! # }
//! ```

use crate::error::{Result, RetryError, Retryable, SyncError};
use crate::events::{SharedSink, SyncEvent, TracingSink};
use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovLimiter,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Which failures the retry loop will retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryOn {
    /// Retry every failure until attempts run out.
    #[default]
    AnyError,
    /// Stop at the first failure that is not retryable.
    RetryableOnly,
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_attempts: u32,

    /// Delay after the first failed attempt.
    pub base_delay: Duration,

    /// Ceiling for exponential backoff.
    pub max_delay: Duration,

    /// Backoff multiplier (e.g., 2.0 = double delay each retry).
    pub exponential_base: f64,

    /// Scale each delay into `[0.5, 1.0)` of its capped value.
    pub jitter: bool,

    pub retry_on: RetryOn,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            exponential_base: 2.0,
            jitter: true,
            retry_on: RetryOn::AnyError,
        }
    }
}

impl RetryConfig {
    /// Patient retry for enumeration calls.
    ///
    /// A failed listing aborts the whole run, so it is worth waiting longer.
    ///
    /// # Backoff Schedule
    ///
    /// ```text
    /// Attempt  Delay (before jitter)
    /// -------  -----
    /// 1        2s
    /// 2        4s
    /// 3        8s
    /// 4        16s
    /// ```
    pub fn patient() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            exponential_base: 2.0,
            jitter: true,
            retry_on: RetryOn::RetryableOnly,
        }
    }

    /// Single attempt, no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Fast-fail retry for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            exponential_base: 2.0,
            jitter: false,
            retry_on: RetryOn::AnyError,
        }
    }

    /// Delay after the failure of attempt `attempt` (0-indexed), before jitter.
    ///
    /// `min(base_delay * exponential_base^attempt, max_delay)`.
    pub fn base_delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = self.exponential_base.powi(attempt.min(i32::MAX as u32) as i32);
        let delay_secs = self.base_delay.as_secs_f64() * multiplier;
        let max_secs = self.max_delay.as_secs_f64();

        if !delay_secs.is_finite() || delay_secs >= max_secs {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay_secs.max(0.0))
    }

    /// Check the config invariants.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(SyncError::Config("max_attempts must be >= 1".into()));
        }
        if self.base_delay.is_zero() {
            return Err(SyncError::Config("base_delay must be > 0".into()));
        }
        if self.max_delay < self.base_delay {
            return Err(SyncError::Config("max_delay must be >= base_delay".into()));
        }
        if !(self.exponential_base > 1.0) {
            return Err(SyncError::Config("exponential_base must be > 1".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Jitter
// =============================================================================

/// Source of jitter samples in `[0, 1)`.
pub trait JitterSource: Send + Sync + 'static {
    fn sample(&self) -> f64;
}

/// Jitter from the thread-local RNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadRngJitter;

impl JitterSource for ThreadRngJitter {
    fn sample(&self) -> f64 {
        rand::thread_rng().gen::<f64>()
    }
}

/// Always returns the same sample. Clamped into `[0, 1)`.
#[derive(Debug, Clone, Copy)]
pub struct FixedJitter(pub f64);

impl JitterSource for FixedJitter {
    fn sample(&self) -> f64 {
        if self.0.is_nan() {
            return 0.0;
        }
        self.0.clamp(0.0, 1.0 - f64::EPSILON)
    }
}

// =============================================================================
// Retry Policy
// =============================================================================

/// Runs an async operation up to `max_attempts` times with backoff.
///
/// Only the calling task sleeps between attempts. Operations must be safe to
/// invoke more than once.
#[derive(Clone)]
pub struct RetryPolicy {
    name: String,
    config: RetryConfig,
    jitter: Arc<dyn JitterSource>,
    sink: SharedSink,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish()
    }
}

impl RetryPolicy {
    pub fn new(name: impl Into<String>, config: RetryConfig) -> Self {
        Self {
            name: name.into(),
            config,
            jitter: Arc::new(ThreadRngJitter),
            sink: TracingSink::shared(),
        }
    }

    /// Replace the jitter source.
    #[must_use]
    pub fn with_jitter(mut self, jitter: Arc<dyn JitterSource>) -> Self {
        self.jitter = jitter;
        self
    }

    /// Replace the event sink.
    #[must_use]
    pub fn with_sink(mut self, sink: SharedSink) -> Self {
        self.sink = sink;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Actual delay after attempt `attempt` (0-indexed) fails, jitter included.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let capped = self.config.base_delay_for_attempt(attempt);
        if !self.config.jitter {
            return capped;
        }
        let factor = 0.5 + self.jitter.sample().clamp(0.0, 1.0) * 0.5;
        capped.mul_f64(factor).min(capped)
    }

    /// Run `op`, classifying failures with [`Retryable`].
    pub async fn execute<F, Fut, T, E>(&self, op: F) -> std::result::Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Retryable + Display,
    {
        self.execute_with(op, |e: &E| e.is_retryable()).await
    }

    /// Run `op`, classifying failures with `is_retryable`.
    ///
    /// The classifier is only consulted under [`RetryOn::RetryableOnly`].
    pub async fn execute_with<F, Fut, T, E, C>(
        &self,
        mut op: F,
        is_retryable: C,
    ) -> std::result::Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Display,
        C: Fn(&E) -> bool,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt: u32 = 0;

        loop {
            let error = match op().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            let made = attempt + 1;

            if self.config.retry_on == RetryOn::RetryableOnly && !is_retryable(&error) {
                debug!(
                    operation = %self.name,
                    attempt = made,
                    error = %error,
                    "Non-retryable failure, giving up"
                );
                return Err(RetryError::NonRetryable { attempt: made, error });
            }

            if made >= max_attempts {
                debug!(
                    operation = %self.name,
                    attempts = made,
                    error = %error,
                    "Retry attempts exhausted"
                );
                return Err(RetryError::Exhausted {
                    attempts: max_attempts,
                    last_error: error,
                });
            }

            let delay = self.delay_for_attempt(attempt);
            self.sink.emit(&SyncEvent::RetryAttempt {
                operation: self.name.clone(),
                attempt: made,
                max_attempts,
                delay,
                error: error.to_string(),
            });
            tokio::time::sleep(delay).await;
            attempt = made;
        }
    }
}

// =============================================================================
// Rate Limiting
// =============================================================================

/// Configuration for rate limiting.
///
/// Uses a token bucket algorithm: tokens refill at `refill_rate` per second,
/// up to `burst_size` tokens. Each transport attempt consumes one token.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    /// Maximum tokens that can be accumulated (burst capacity).
    pub burst_size: u32,

    /// Tokens added per second (sustained rate).
    pub refill_rate: u32,
}

impl Default for RateLimitConfig {
    /// Default: 50 calls/sec with burst of 20.
    fn default() -> Self {
        Self {
            burst_size: 20,
            refill_rate: 50,
        }
    }
}

impl RateLimitConfig {
    /// For shared or free-tier service accounts.
    pub fn conservative() -> Self {
        Self {
            burst_size: 5,
            refill_rate: 10,
        }
    }
}

/// Token bucket rate limiter.
///
/// Thread-safe and async-aware.
pub struct RateLimiter {
    limiter: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
    config: RateLimitConfig,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter").field("config", &self.config).finish()
    }
}

impl RateLimiter {
    /// Create a new rate limiter with the given configuration.
    pub fn new(config: RateLimitConfig) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(config.refill_rate).unwrap_or(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN));

        let limiter = GovLimiter::direct(quota);

        Self { limiter, config }
    }

    /// Acquire a permit, waiting until one is available.
    ///
    /// This method is cancel-safe.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    /// Try to acquire a permit without waiting.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }

    /// Get the current configuration.
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}
