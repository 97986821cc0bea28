// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the sync client.
//!
//! Errors are split by the layer that produces them. The transport classifies
//! what the remote service told us, the retry and circuit layers wrap that
//! classification, and [`SyncError`] is what callers of the client and the
//! orchestrator see.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `TransportError::Timeout` | Yes | Remote call timed out |
//! | `TransportError::Server` | Yes | 5xx from the tracking service |
//! | `TransportError::RateLimited` | Yes | Service asked us to slow down |
//! | `TransportError::NotFound` | No | Record does not exist |
//! | `TransportError::Auth` | No | Credentials rejected |
//! | `SyncError::CircuitOpen` | No | Breaker rejected the call, nothing was sent |
//! | `SyncError::Validation` | No | Item shape is invalid |
//! | `SyncError::Decode` | No | Response body did not match the expected shape |
//! | `SyncError::BatchAborted` | No | The whole run was refused or could not enumerate |
//! | `SyncError::Checkpoint` | No | Local SQLite errors (needs operator attention) |
//! | `SyncError::Config` | No | Configuration invalid |
//!
//! # Batch Aborts
//!
//! A sync run reports per-item failures inside its
//! [`BatchSyncResult`](crate::orchestrator::BatchSyncResult). Only two
//! conditions surface as `Err`: the batch breaker refusing the run, and the
//! item enumeration failing. Both are [`SyncError::BatchAborted`], so
//! "nothing ran" is always distinguishable from "ran with failures".

use std::time::Duration;
use thiserror::Error;

/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors that can decide whether another attempt is worthwhile.
pub trait Retryable {
    /// Whether retrying the same call could plausibly succeed.
    fn is_retryable(&self) -> bool;
}

/// Classified failure of a single transport call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The requested record or collection does not exist.
    #[error("{operation}: not found: {message}")]
    NotFound { operation: String, message: String },

    /// The service rejected our credentials.
    #[error("{operation}: authentication failed: {message}")]
    Auth { operation: String, message: String },

    /// The call did not complete in time.
    #[error("{operation}: timed out after {elapsed:?}")]
    Timeout { operation: String, elapsed: Duration },

    /// The service failed with a 5xx status.
    #[error("{operation}: server error {status}: {message}")]
    Server {
        operation: String,
        status: u16,
        message: String,
    },

    /// The service is throttling us.
    #[error("{operation}: rate limited (retry after {retry_after:?})")]
    RateLimited {
        operation: String,
        retry_after: Option<Duration>,
    },
}

impl TransportError {
    /// Name of the remote operation that failed.
    pub fn operation(&self) -> &str {
        match self {
            Self::NotFound { operation, .. }
            | Self::Auth { operation, .. }
            | Self::Timeout { operation, .. }
            | Self::Server { operation, .. }
            | Self::RateLimited { operation, .. } => operation,
        }
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::Auth { .. } => "auth",
            Self::Timeout { .. } => "timeout",
            Self::Server { .. } => "server",
            Self::RateLimited { .. } => "rate_limited",
        }
    }

    /// Map an HTTP-style status code onto the taxonomy.
    ///
    /// Returns `None` for statuses that are not errors (< 400). Unknown 4xx
    /// statuses are treated as server errors so they stay retryable.
    pub fn from_status(operation: impl Into<String>, status: u16, message: impl Into<String>) -> Option<Self> {
        let operation = operation.into();
        let message = message.into();
        match status {
            0..=399 => None,
            401 | 403 => Some(Self::Auth { operation, message }),
            404 | 410 => Some(Self::NotFound { operation, message }),
            429 => Some(Self::RateLimited {
                operation,
                retry_after: None,
            }),
            _ => Some(Self::Server {
                operation,
                status,
                message,
            }),
        }
    }
}

impl Retryable for TransportError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Server { .. } => true,
            Self::RateLimited { .. } => true,
            Self::NotFound { .. } => false, // Retrying won't make it exist
            Self::Auth { .. } => false,     // Needs new credentials
        }
    }
}

/// Terminal outcome of a retried operation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RetryError<E> {
    /// Every attempt failed. `attempts` equals the configured maximum.
    #[error("gave up after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: E },

    /// An attempt failed with an error that is not worth retrying.
    #[error("non-retryable failure on attempt {attempt}: {error}")]
    NonRetryable { attempt: u32, error: E },
}

impl<E> RetryError<E> {
    /// Number of attempts actually made.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. } => *attempts,
            Self::NonRetryable { attempt, .. } => *attempt,
        }
    }

    /// The last error observed.
    pub fn last_error(&self) -> &E {
        match self {
            Self::Exhausted { last_error, .. } => last_error,
            Self::NonRetryable { error, .. } => error,
        }
    }

    /// Consume and return the last error observed.
    pub fn into_last_error(self) -> E {
        match self {
            Self::Exhausted { last_error, .. } => last_error,
            Self::NonRetryable { error, .. } => error,
        }
    }
}

/// Why a whole sync run was refused.
#[derive(Error, Debug)]
pub enum BatchAbort {
    /// The batch-level breaker is open; no item was attempted.
    #[error("batch circuit '{circuit}' is open")]
    CircuitOpen { circuit: String },

    /// Listing the items to sync failed, so there is nothing to attempt.
    #[error("could not enumerate items: {source}")]
    Enumeration {
        #[source]
        source: Box<SyncError>,
    },
}

/// Errors surfaced by the client and the orchestrator.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The transport failed and the failure was not retried.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// All retry attempts were used up.
    #[error("{operation}: gave up after {attempts} attempts: {source}")]
    RetryExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: TransportError,
    },

    /// The operation's circuit breaker rejected the call.
    #[error("circuit '{circuit}' is open, call rejected")]
    CircuitOpen { circuit: String },

    /// A fetched item failed shape or required-field validation.
    #[error("validation failed for item {item_id}: {message}")]
    Validation { item_id: String, message: String },

    /// A response could not be decoded into the expected type.
    #[error("{operation}: could not decode response: {message}")]
    Decode { operation: String, message: String },

    /// The sync run was aborted before any item was attempted.
    #[error("batch aborted: {0}")]
    BatchAborted(#[from] BatchAbort),

    /// SQLite error during checkpoint persistence.
    #[error("Checkpoint store error: {0}")]
    Checkpoint(#[from] sqlx::Error),

    /// The local item sink refused an item.
    #[error("item sink rejected {item_id}: {message}")]
    Sink { item_id: String, message: String },

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Whether this error ended the run before any item was attempted.
    pub fn is_batch_abort(&self) -> bool {
        matches!(self, Self::BatchAborted(_))
    }

    /// Whether this is a circuit rejection (nothing was sent).
    pub fn is_circuit_open(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen { .. } | Self::BatchAborted(BatchAbort::CircuitOpen { .. })
        )
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport(e) => e.kind(),
            Self::RetryExhausted { .. } => "retry_exhausted",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Validation { .. } => "validation",
            Self::Decode { .. } => "decode",
            Self::BatchAborted(_) => "batch_aborted",
            Self::Checkpoint(_) => "checkpoint",
            Self::Sink { .. } => "sink",
            Self::Config(_) => "config",
            Self::Internal(_) => "internal",
        }
    }
}

impl Retryable for SyncError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_retryable(),
            Self::RetryExhausted { source, .. } => source.is_retryable(),
            Self::CircuitOpen { .. } => false, // Wait for the breaker, don't hammer it
            Self::Validation { .. } => false,
            Self::Decode { .. } => false,
            Self::BatchAborted(_) => false,
            Self::Checkpoint(_) => false, // Local DB issues need attention
            Self::Sink { .. } => false,
            Self::Config(_) => false,
            Self::Internal(_) => false,
        }
    }
}
