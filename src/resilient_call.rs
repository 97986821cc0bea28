// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Breaker gate around a retried call.
//!
//! The breaker sees exactly one outcome per logical call: the aggregated
//! result of the whole retry loop, never the individual attempts.

use crate::circuit_breaker::{CircuitBreaker, CircuitError};
use crate::error::RetryError;
use crate::resilience::RetryPolicy;
use std::fmt::Display;
use std::future::Future;

/// One logical call: gate, retry loop, then report.
#[derive(Debug, Clone, Copy)]
pub struct ResilientCall<'a> {
    breaker: &'a CircuitBreaker,
    policy: &'a RetryPolicy,
}

impl<'a> ResilientCall<'a> {
    pub fn new(breaker: &'a CircuitBreaker, policy: &'a RetryPolicy) -> Self {
        Self { breaker, policy }
    }

    /// Run `op` using `is_retryable` to classify failures.
    ///
    /// When the breaker refuses, `op` is never invoked and nothing is
    /// recorded against the breaker.
    pub async fn run<F, Fut, T, E, C>(
        &self,
        op: F,
        is_retryable: C,
    ) -> Result<T, CircuitError<RetryError<E>>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
        C: Fn(&E) -> bool,
    {
        if !self.breaker.is_call_allowed() {
            return Err(CircuitError::Rejected {
                circuit: self.breaker.name().to_string(),
            });
        }

        match self.policy.execute_with(op, is_retryable).await {
            Ok(value) => {
                self.breaker.record_success();
                Ok(value)
            }
            Err(e) => {
                self.breaker.record_failure();
                Err(CircuitError::Inner(e))
            }
        }
    }
}
