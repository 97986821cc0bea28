//! # Tracking Sync
//!
//! A resilient client and batch synchronizer for a remote experiment-tracking
//! service.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                              tracking-sync                                │
//! │                                                                           │
//! │  ┌───────────────────────┐   per item   ┌──────────────────────────────┐  │
//! │  │ BatchSyncOrchestrator │─────────────►│ RemoteServiceClient          │  │
//! │  │ (batch breaker,       │              │  per-operation:              │  │
//! │  │  JoinSet workers)     │              │  CircuitBreaker ► RetryPolicy│  │
//! │  └───────────────────────┘              │  ► RateLimiter ► Transport   │  │
//! │         │           │                   └──────────────────────────────┘  │
//! │         ▼           ▼                                                     │
//! │  ┌─────────────┐ ┌──────────┐                                             │
//! │  │ Checkpoint  │ │ ItemSink │                                             │
//! │  │ (SQLite)    │ │          │                                             │
//! │  └─────────────┘ └──────────┘                                             │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Failure Handling
//!
//! 1. **Per call**: each remote operation is retried with exponential backoff
//!    and jitter, behind its own circuit breaker.
//! 2. **Per item**: a failed item is recorded in the run's [`SyncState`] and
//!    the run continues.
//! 3. **Per run**: a batch-level breaker refuses whole runs after repeated
//!    failed runs, and a failed enumeration aborts the run before any item
//!    is attempted.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tracking_sync::{
//!     BatchSyncConfig, BatchSyncOrchestrator, ClientConfig, NoOpTransport, RemoteServiceClient,
//! };
//!
//! #[tokio::main]
//! async fn main() -> tracking_sync::Result<()> {
//!     let client = RemoteServiceClient::new(Arc::new(NoOpTransport), ClientConfig::default());
//!     let orchestrator = BatchSyncOrchestrator::new(Arc::new(client), BatchSyncConfig::default());
//!
//!     let result = orchestrator.run_full_sync().await?;
//!     println!("{}", result.summary);
//!     Ok(())
//! }
//! ```

pub mod checkpoint;
pub mod circuit_breaker;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod resilience;
pub mod resilient_call;
pub mod sink;
pub mod transport;

// Re-exports for convenience
pub use checkpoint::{CheckpointStore, MemoryCheckpointStore, SqliteCheckpointStore};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitError, CircuitSnapshot, CircuitState};
pub use client::{ClientConfig, OperationCircuits, OperationOverride, RemoteServiceClient};
pub use config::SyncConfig;
pub use error::{BatchAbort, Result, RetryError, Retryable, SyncError, TransportError};
pub use events::{EventSink, NullSink, SharedSink, SyncEvent, TracingSink};
pub use models::{AppendReceipt, Collection, ItemRef, NewItem, Page, TrackedItem};
pub use orchestrator::{
    BatchSyncConfig, BatchSyncOrchestrator, BatchSyncResult, PeriodicSync, SyncErrorEntry, SyncMode, SyncRequest,
    SyncState,
};
pub use resilience::{FixedJitter, JitterSource, RateLimitConfig, RateLimiter, RetryConfig, RetryOn, RetryPolicy};
pub use resilient_call::ResilientCall;
pub use sink::{ItemSink, NoOpSink};
pub use transport::{NoOpTransport, Operation, Transport, TransportFuture};
