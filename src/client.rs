// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Remote service client.
//!
//! Every named operation runs as one [`ResilientCall`]: its own circuit
//! breaker gates a retry loop around a single [`Transport`] call. Breakers are
//! never shared between operations, so a flapping `get_item` endpoint does
//! not stop us from listing collections.
//!
//! ```text
//! get_item(id)
//!     │
//!     ├─ circuits.get_item.is_call_allowed()?  ── no ──▶ SyncError::CircuitOpen
//!     │
//!     ├─ policies.get_item.execute(|| {
//!     │       limiter.acquire()        (optional)
//!     │       transport.call(GetItem, {"id": ..})
//!     │  })
//!     │
//!     ├─ breaker.record_success() / record_failure()   (once)
//!     │
//!     └─ serde_json::from_value::<TrackedItem>()  ── err ──▶ SyncError::Decode
//! ```

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitError, CircuitSnapshot};
use crate::error::{Result, RetryError, Retryable, SyncError, TransportError};
use crate::events::{SharedSink, TracingSink};
use crate::metrics;
use crate::models::{AppendReceipt, Collection, ItemRef, NewItem, Page, TrackedItem};
use crate::resilience::{JitterSource, RateLimitConfig, RateLimiter, RetryConfig, RetryPolicy};
use crate::resilient_call::ResilientCall;
use crate::transport::{Operation, Transport};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument};

// =============================================================================
// Configuration
// =============================================================================

/// Per-operation replacement for the shared defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationOverride {
    pub retry: Option<RetryConfig>,
    pub circuit: Option<CircuitBreakerConfig>,
}

/// Runtime configuration for [`RemoteServiceClient`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientConfig {
    /// Shared retry defaults.
    pub retry: RetryConfig,
    /// Shared breaker defaults.
    pub circuit: CircuitBreakerConfig,
    /// Client-side throttle applied to every transport attempt.
    pub rate_limit: Option<RateLimitConfig>,
    pub overrides: HashMap<Operation, OperationOverride>,
}

impl ClientConfig {
    /// Effective retry config for `op`.
    pub fn retry_for(&self, op: Operation) -> RetryConfig {
        self.overrides
            .get(&op)
            .and_then(|o| o.retry.clone())
            .unwrap_or_else(|| self.retry.clone())
    }

    /// Effective breaker config for `op`.
    pub fn circuit_for(&self, op: Operation) -> CircuitBreakerConfig {
        self.overrides
            .get(&op)
            .and_then(|o| o.circuit.clone())
            .unwrap_or_else(|| self.circuit.clone())
    }

    pub fn validate(&self) -> Result<()> {
        for op in Operation::ALL {
            self.retry_for(op)
                .validate()
                .map_err(|e| SyncError::Config(format!("{op}: {e}")))?;
            self.circuit_for(op)
                .validate()
                .map_err(|e| SyncError::Config(format!("{op}: {e}")))?;
        }
        Ok(())
    }
}

// =============================================================================
// Per-operation storage
// =============================================================================

/// One value per [`Operation`].
#[derive(Debug, Clone)]
pub struct PerOperation<V> {
    pub list_collections: V,
    pub get_item: V,
    pub list_children: V,
    pub append_items: V,
}

impl<V> PerOperation<V> {
    pub fn from_fn(mut f: impl FnMut(Operation) -> V) -> Self {
        Self {
            list_collections: f(Operation::ListCollections),
            get_item: f(Operation::GetItem),
            list_children: f(Operation::ListChildren),
            append_items: f(Operation::AppendItems),
        }
    }

    pub fn get(&self, op: Operation) -> &V {
        match op {
            Operation::ListCollections => &self.list_collections,
            Operation::GetItem => &self.get_item,
            Operation::ListChildren => &self.list_children,
            Operation::AppendItems => &self.append_items,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Operation, &V)> + '_ {
        Operation::ALL.into_iter().map(move |op| (op, self.get(op)))
    }
}

/// The client's breakers, one field per operation.
pub type OperationCircuits = PerOperation<CircuitBreaker>;

// =============================================================================
// Client
// =============================================================================

/// Resilient façade over a [`Transport`].
pub struct RemoteServiceClient<T: Transport> {
    transport: Arc<T>,
    config: ClientConfig,
    circuits: OperationCircuits,
    policies: PerOperation<RetryPolicy>,
    limiter: Option<RateLimiter>,
}

impl<T: Transport> std::fmt::Debug for RemoteServiceClient<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteServiceClient")
            .field("config", &self.config)
            .field("circuits", &self.circuits)
            .finish()
    }
}

impl<T: Transport> RemoteServiceClient<T> {
    /// Create a client reporting through the default tracing sink.
    pub fn new(transport: Arc<T>, config: ClientConfig) -> Self {
        Self::with_sink(transport, config, TracingSink::shared())
    }

    /// Create a client whose breakers and retry loops report to `sink`.
    pub fn with_sink(transport: Arc<T>, config: ClientConfig, sink: SharedSink) -> Self {
        let circuits = PerOperation::from_fn(|op| {
            CircuitBreaker::with_sink(op.as_str(), config.circuit_for(op), Arc::clone(&sink))
        });
        let policies = PerOperation::from_fn(|op| {
            RetryPolicy::new(op.as_str(), config.retry_for(op)).with_sink(Arc::clone(&sink))
        });
        let limiter = config.rate_limit.clone().map(RateLimiter::new);

        Self {
            transport,
            config,
            circuits,
            policies,
            limiter,
        }
    }

    /// Use `jitter` for every operation's retry delays.
    #[must_use]
    pub fn with_jitter(mut self, jitter: Arc<dyn JitterSource>) -> Self {
        let policies = &self.policies;
        self.policies = PerOperation::from_fn(|op| policies.get(op).clone().with_jitter(Arc::clone(&jitter)));
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn circuits(&self) -> &OperationCircuits {
        &self.circuits
    }

    /// Health view of every operation breaker.
    pub fn circuit_snapshots(&self) -> Vec<CircuitSnapshot> {
        self.circuits.iter().map(|(_, cb)| cb.snapshot()).collect()
    }

    /// One resilient call plus decoding of the response.
    async fn invoke<R: DeserializeOwned>(&self, op: Operation, params: Value) -> Result<R> {
        let start = Instant::now();
        let transport = &self.transport;
        let limiter = self.limiter.as_ref();

        let outcome = ResilientCall::new(self.circuits.get(op), self.policies.get(op))
            .run(
                move || {
                    let params = params.clone();
                    async move {
                        if let Some(limiter) = limiter {
                            limiter.acquire().await;
                        }
                        transport.call(op, params).await
                    }
                },
                |e: &TransportError| e.is_retryable(),
            )
            .await;

        let value = match outcome {
            Ok(value) => value,
            Err(e) => {
                let err = map_call_error(op, e);
                metrics::record_operation(op.as_str(), err.kind(), start.elapsed());
                return Err(err);
            }
        };

        match serde_json::from_value(value) {
            Ok(decoded) => {
                metrics::record_operation(op.as_str(), "success", start.elapsed());
                Ok(decoded)
            }
            Err(e) => {
                metrics::record_operation(op.as_str(), "decode", start.elapsed());
                Err(SyncError::Decode {
                    operation: op.to_string(),
                    message: e.to_string(),
                })
            }
        }
    }

    /// List every collection visible to our credentials.
    pub async fn list_collections(&self) -> Result<Vec<Collection>> {
        self.invoke(Operation::ListCollections, json!({})).await
    }

    /// Fetch one record.
    pub async fn get_item(&self, id: &str) -> Result<TrackedItem> {
        self.invoke(Operation::GetItem, json!({ "id": id })).await
    }

    /// Fetch one page of a collection's children.
    ///
    /// `since` limits the listing to items updated at or after that instant.
    pub async fn list_children(
        &self,
        collection: &str,
        since: Option<DateTime<Utc>>,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Page<ItemRef>> {
        let params = json!({
            "collection": collection,
            "since": since.map(|t| t.to_rfc3339()),
            "cursor": cursor,
            "limit": limit,
        });
        self.invoke(Operation::ListChildren, params).await
    }

    /// Walk every page of a collection's children.
    ///
    /// Each page is its own resilient call; a page that still fails after
    /// retries fails the whole listing.
    #[instrument(skip(self, since))]
    pub async fn list_all_children(
        &self,
        collection: &str,
        since: Option<DateTime<Utc>>,
        page_size: usize,
    ) -> Result<Vec<ItemRef>> {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;
        let mut seen_cursors: HashSet<String> = HashSet::new();
        let mut pages = 0usize;

        loop {
            let page = self
                .list_children(collection, since, cursor.as_deref(), page_size.max(1))
                .await?;
            pages += 1;
            let last = page.is_last();
            items.extend(page.items);

            if last {
                break;
            }
            // A cursor handed out twice means the listing cycles
            let next = page.next_cursor.unwrap_or_default();
            if !seen_cursors.insert(next.clone()) {
                return Err(SyncError::Decode {
                    operation: Operation::ListChildren.to_string(),
                    message: format!("cursor {next:?} repeated after page {pages}"),
                });
            }
            cursor = Some(next);
        }

        debug!(collection = %collection, pages, items = items.len(), "Listed children");
        Ok(items)
    }

    /// Append records to a collection.
    ///
    /// One idempotency key covers every attempt of this call, so the service
    /// can drop duplicates created by retries.
    #[instrument(skip(self, items), fields(count = items.len()))]
    pub async fn append_items(&self, collection: &str, items: &[NewItem]) -> Result<AppendReceipt> {
        if items.is_empty() {
            return Ok(AppendReceipt {
                accepted: 0,
                ids: Vec::new(),
            });
        }

        let params = json!({
            "collection": collection,
            "idempotency_key": idempotency_key(collection),
            "items": items,
        });
        self.invoke(Operation::AppendItems, params).await
    }
}

fn map_call_error(op: Operation, err: CircuitError<RetryError<TransportError>>) -> SyncError {
    match err {
        CircuitError::Rejected { circuit } => SyncError::CircuitOpen { circuit },
        CircuitError::Inner(RetryError::Exhausted { attempts, last_error }) if attempts > 1 => {
            SyncError::RetryExhausted {
                operation: op.to_string(),
                attempts,
                source: last_error,
            }
        }
        CircuitError::Inner(e) => SyncError::Transport(e.into_last_error()),
    }
}

fn idempotency_key(collection: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let salt: u64 = rand::thread_rng().gen();
    format!("{collection}-{nanos:x}-{salt:016x}")
}
