//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Retry attempts and backoff delays
//! - Circuit breaker state and transitions
//! - Per-operation call outcomes
//! - Batch run progress and results
//! - Checkpoint persistence
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `tracking_sync_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! No recorder is installed here; without one every call is a no-op.

use crate::circuit_breaker::CircuitState;
use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Retry Metrics
// =============================================================================

/// Record a failed attempt that will be retried.
pub fn record_retry_attempt(operation: &str, delay: Duration) {
    counter!("tracking_sync_retry_attempts_total", "operation" => operation.to_string()).increment(1);
    histogram!("tracking_sync_retry_delay_seconds", "operation" => operation.to_string())
        .record(delay.as_secs_f64());
}

// =============================================================================
// Circuit Breaker Metrics
// =============================================================================

/// Record a circuit breaker state change and update its state gauge.
pub fn record_circuit_transition(circuit_name: &str, to: CircuitState) {
    counter!(
        "tracking_sync_circuit_transitions_total",
        "circuit" => circuit_name.to_string(),
        "state" => to.to_string()
    )
    .increment(1);
    set_circuit_state(circuit_name, to);
}

/// Set circuit breaker state gauge (0=closed, 1=half_open, 2=open).
pub fn set_circuit_state(circuit_name: &str, state: CircuitState) {
    gauge!("tracking_sync_circuit_state", "circuit" => circuit_name.to_string()).set(state as u8 as f64);
}

/// Record circuit breaker rejection (circuit was open).
pub fn record_circuit_rejection(circuit_name: &str) {
    counter!(
        "tracking_sync_circuit_rejections_total",
        "circuit" => circuit_name.to_string()
    )
    .increment(1);
}

// =============================================================================
// Client Metrics
// =============================================================================

/// Record the outcome of one logical client call.
pub fn record_operation(operation: &str, outcome: &str, duration: Duration) {
    counter!(
        "tracking_sync_operation_calls_total",
        "operation" => operation.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!("tracking_sync_operation_duration_seconds", "operation" => operation.to_string())
        .record(duration.as_secs_f64());
}

// =============================================================================
// Batch Metrics
// =============================================================================

/// Gauge for progress of the current run.
pub fn set_batch_progress(processed: usize, total: usize) {
    gauge!("tracking_sync_batch_processed_items").set(processed as f64);
    gauge!("tracking_sync_batch_total_items").set(total as f64);
}

/// Record a completed sync run.
pub fn record_batch_run(mode: &str, processed: usize, failed: usize, unstarted: usize, duration: Duration) {
    let mode = mode.to_string();
    counter!("tracking_sync_batch_runs_total", "mode" => mode.clone()).increment(1);
    counter!("tracking_sync_batch_items_total", "mode" => mode.clone()).increment(processed as u64);

    if failed > 0 {
        counter!("tracking_sync_batch_item_failures_total", "mode" => mode.clone()).increment(failed as u64);
    }
    if unstarted > 0 {
        counter!("tracking_sync_batch_items_unstarted_total", "mode" => mode.clone()).increment(unstarted as u64);
    }

    histogram!("tracking_sync_batch_duration_seconds", "mode" => mode).record(duration.as_secs_f64());
}

/// Record a run that was refused or failed to enumerate.
pub fn record_batch_abort(mode: &str, reason: &str) {
    counter!(
        "tracking_sync_batch_aborts_total",
        "mode" => mode.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record an item failure by error type.
pub fn record_item_error(error_type: &str) {
    counter!("tracking_sync_item_errors_total", "error_type" => error_type.to_string()).increment(1);
}

// =============================================================================
// Checkpoint Metrics
// =============================================================================

/// Record checkpoint flush batch (debounced writes).
pub fn record_checkpoint_flush(flushed: usize, errors: usize) {
    counter!("tracking_sync_checkpoint_flushes_total").increment(1);
    counter!("tracking_sync_checkpoint_flushed_count").increment(flushed as u64);
    if errors > 0 {
        counter!("tracking_sync_checkpoint_flush_errors_total").increment(errors as u64);
    }
}

/// Record checkpoint SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn checkpoint_retries_total(operation: &str) {
    counter!("tracking_sync_checkpoint_retries_total", "operation" => operation.to_string()).increment(1);
}
