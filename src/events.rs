// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Structured events for observability.
//!
//! Retry policies, circuit breakers and the orchestrator report what they do
//! through an injected [`EventSink`]. The default [`TracingSink`] turns each
//! event into a `tracing` record plus the matching `metrics` update, so a
//! deployment gets logs and Prometheus series without wiring anything.
//!
//! Tests inject their own sink to assert on exact delays and transitions.

use crate::circuit_breaker::CircuitState;
use crate::metrics;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Something worth reporting happened.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// An attempt failed and another one is scheduled after `delay`.
    RetryAttempt {
        operation: String,
        /// 1-indexed number of the attempt that just failed.
        attempt: u32,
        max_attempts: u32,
        delay: Duration,
        error: String,
    },
    /// A circuit breaker changed state.
    CircuitTransition {
        circuit: String,
        from: CircuitState,
        to: CircuitState,
    },
    /// A sync run enumerated its work and is about to schedule it.
    BatchStarted { run_id: u64, mode: String, total: usize },
    /// An item finished (successfully or not).
    BatchProgress {
        run_id: u64,
        processed: usize,
        failed: usize,
        total: usize,
    },
    /// A sync run finished and its result was computed.
    BatchFinished {
        run_id: u64,
        mode: String,
        success: bool,
        processed: usize,
        failed: usize,
        unstarted: usize,
        duration: Duration,
    },
}

/// Receiver for [`SyncEvent`]s.
///
/// Implementations must be cheap and must not block: events are emitted from
/// inside retry loops and while a batch is being scheduled.
pub trait EventSink: Send + Sync + 'static {
    fn emit(&self, event: &SyncEvent);
}

/// Shared handle to a sink.
pub type SharedSink = Arc<dyn EventSink>;

/// Default sink: `tracing` logs plus `metrics` counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl TracingSink {
    /// Shared instance for constructors that take a [`SharedSink`].
    pub fn shared() -> SharedSink {
        Arc::new(TracingSink)
    }
}

impl EventSink for TracingSink {
    fn emit(&self, event: &SyncEvent) {
        match event {
            SyncEvent::RetryAttempt {
                operation,
                attempt,
                max_attempts,
                delay,
                error,
            } => {
                warn!(
                    operation = %operation,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Attempt failed, retrying"
                );
                metrics::record_retry_attempt(operation, *delay);
            }
            SyncEvent::CircuitTransition { circuit, from, to } => {
                if *to == CircuitState::Open {
                    warn!(circuit = %circuit, from = %from, to = %to, "Circuit breaker opened");
                } else {
                    info!(circuit = %circuit, from = %from, to = %to, "Circuit breaker transition");
                }
                metrics::record_circuit_transition(circuit, *to);
            }
            SyncEvent::BatchStarted { run_id, mode, total } => {
                info!(run_id, mode = %mode, total, "Sync run started");
            }
            SyncEvent::BatchProgress {
                run_id,
                processed,
                failed,
                total,
            } => {
                debug!(run_id, processed, failed, total, "Sync progress");
                metrics::set_batch_progress(*processed, *total);
            }
            SyncEvent::BatchFinished {
                run_id,
                mode,
                success,
                processed,
                failed,
                unstarted,
                duration,
            } => {
                if *success {
                    info!(run_id, mode = %mode, processed, unstarted, duration_ms = duration.as_millis() as u64, "Sync run complete");
                } else {
                    warn!(run_id, mode = %mode, processed, failed, unstarted, duration_ms = duration.as_millis() as u64, "Sync run finished with failures");
                }
                metrics::record_batch_run(mode, *processed, *failed, *unstarted, *duration);
            }
        }
    }
}

/// Sink that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &SyncEvent) {}
}
