// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Batch sync orchestrator.
//!
//! Drives bulk synchronization of remote items through a
//! [`RemoteServiceClient`], tracking per-item success and failure instead of
//! failing atomically.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │                      BatchSyncOrchestrator                            │
//! │                                                                       │
//! │  batch breaker ── open? ──▶ Err(BatchAborted::CircuitOpen)            │
//! │       │                                                               │
//! │       ▼                                                               │
//! │  enumerate (collections → pages of children)                          │
//! │       │ ── fails? ──▶ Err(BatchAborted::Enumeration)                  │
//! │       ▼                                                               │
//! │  ┌──────────── JoinSet (≤ max_workers) ────────────┐                  │
//! │  │ get_item → validate → ItemSink::accept          │ ──▶ outcomes     │
//! │  └─────────────────────────────────────────────────┘        │         │
//! │                                                             ▼         │
//! │                          scheduling loop (sole writer of SyncState)   │
//! │                                                             │         │
//! │  advance checkpoints, report to batch breaker ◀─────────────┘         │
//! └───────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Timeouts
//!
//! The run's timeout starts when the run is admitted, so enumeration counts
//! against it; a listing still running at the deadline aborts the run. Once
//! the timeout elapses no new item is scheduled. Items already in flight are
//! allowed to finish, and items never started are listed in
//! [`BatchSyncResult::unstarted_items`] without counting as failures.
//!
//! # Retry-failed Cap
//!
//! Retry-failed runs take both the failed and the unstarted items of the
//! prior result. An item's counter is bumped only when a worker actually
//! picks it up; once an item has been retried `max_item_retries` times it is
//! listed in [`BatchSyncResult::skipped_items`] instead of being attempted
//! again. Any successful sync of the item clears its counter.

mod periodic;
mod types;

pub use periodic::PeriodicSync;
pub use types::{BatchSyncConfig, BatchSyncResult, SyncErrorEntry, SyncMode, SyncRequest, SyncState};

use crate::checkpoint::CheckpointStore;
use crate::circuit_breaker::{CircuitBreaker, CircuitSnapshot};
use crate::client::RemoteServiceClient;
use crate::error::{BatchAbort, Result, SyncError, TransportError};
use crate::events::{SharedSink, SyncEvent, TracingSink};
use crate::metrics;
use crate::sink::{ItemSink, NoOpSink};
use crate::transport::Transport;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Name of the run-level breaker.
pub const BATCH_CIRCUIT: &str = "batch";

/// Deadline used when the configured timeout overflows the clock.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// One item to fetch.
#[derive(Debug, Clone)]
struct WorkItem {
    id: String,
    collection: Option<String>,
}

/// Enumerated work for one run.
#[derive(Debug, Default)]
struct Plan {
    items: Vec<WorkItem>,
    /// Collections listed, in listing order.
    collections: Vec<String>,
    enumerated_at: Option<DateTime<Utc>>,
}

/// How incremental listings pick their lower bound.
#[derive(Debug, Clone, Copy)]
enum Since {
    Everything,
    Fixed(DateTime<Utc>),
    Checkpoint,
}

/// Drives sync runs.
///
/// `K` is where fetched items land; it defaults to discarding them.
pub struct BatchSyncOrchestrator<T: Transport, K: ItemSink = NoOpSink> {
    client: Arc<RemoteServiceClient<T>>,
    sink: Arc<K>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    config: BatchSyncConfig,
    batch_circuit: CircuitBreaker,
    events: SharedSink,
    created_at: DateTime<Utc>,
    run_counter: AtomicU64,
    /// Retry-failed attempts per item id
    retry_counts: Mutex<HashMap<String, u32>>,
}

impl<T: Transport, K: ItemSink> std::fmt::Debug for BatchSyncOrchestrator<T, K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchSyncOrchestrator")
            .field("config", &self.config)
            .field("batch_circuit", &self.batch_circuit)
            .field("created_at", &self.created_at)
            .finish()
    }
}

impl<T: Transport> BatchSyncOrchestrator<T, NoOpSink> {
    /// Create an orchestrator that discards fetched items.
    pub fn new(client: Arc<RemoteServiceClient<T>>, config: BatchSyncConfig) -> Self {
        let events = TracingSink::shared();
        Self {
            client,
            sink: Arc::new(NoOpSink),
            checkpoints: None,
            batch_circuit: CircuitBreaker::with_sink(BATCH_CIRCUIT, config.circuit.clone(), Arc::clone(&events)),
            config,
            events,
            created_at: Utc::now(),
            run_counter: AtomicU64::new(0),
            retry_counts: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Transport, K: ItemSink> BatchSyncOrchestrator<T, K> {
    /// Deliver fetched items to `sink`.
    pub fn with_item_sink<K2: ItemSink>(self, sink: Arc<K2>) -> BatchSyncOrchestrator<T, K2> {
        BatchSyncOrchestrator {
            client: self.client,
            sink,
            checkpoints: self.checkpoints,
            config: self.config,
            batch_circuit: self.batch_circuit,
            events: self.events,
            created_at: self.created_at,
            run_counter: self.run_counter,
            retry_counts: self.retry_counts,
        }
    }

    /// Persist incremental progress in `store`.
    #[must_use]
    pub fn with_checkpoints(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    /// Report run events (and batch breaker transitions) to `events`.
    #[must_use]
    pub fn with_events(mut self, events: SharedSink) -> Self {
        self.batch_circuit = CircuitBreaker::with_sink(BATCH_CIRCUIT, self.config.circuit.clone(), Arc::clone(&events));
        self.events = events;
        self
    }

    pub fn client(&self) -> &Arc<RemoteServiceClient<T>> {
        &self.client
    }

    pub fn config(&self) -> &BatchSyncConfig {
        &self.config
    }

    pub fn batch_circuit(&self) -> &CircuitBreaker {
        &self.batch_circuit
    }

    /// Snapshots of the batch breaker followed by every operation breaker.
    pub fn circuit_snapshots(&self) -> Vec<CircuitSnapshot> {
        let mut snapshots = vec![self.batch_circuit.snapshot()];
        snapshots.extend(self.client.circuit_snapshots());
        snapshots
    }

    /// How many retry-failed runs have re-attempted `item_id` since it last synced.
    pub fn item_retry_count(&self, item_id: &str) -> u32 {
        self.lock_retry_counts().get(item_id).copied().unwrap_or(0)
    }

    fn lock_retry_counts(&self) -> std::sync::MutexGuard<'_, HashMap<String, u32>> {
        self.retry_counts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // Entry points
    // =========================================================================

    /// Run whatever `request` asks for.
    pub async fn run(&self, request: &SyncRequest) -> Result<BatchSyncResult> {
        match request {
            SyncRequest::Full => self.run_full_sync().await,
            SyncRequest::Incremental { since } => self.run_incremental_sync(*since).await,
            SyncRequest::Subset { ids } => self.sync_subset(ids).await,
        }
    }

    /// Sync every item of every collection.
    #[instrument(skip(self))]
    pub async fn run_full_sync(&self) -> Result<BatchSyncResult> {
        let started = Instant::now();
        self.admit(SyncMode::Full)?;
        let plan = self
            .enumerate(SyncMode::Full, Since::Everything, self.deadline(started))
            .await?;
        Ok(self.execute(SyncMode::Full, plan, Vec::new(), started).await)
    }

    /// Sync items changed since `since`.
    ///
    /// Without an explicit `since`, each collection starts from its stored
    /// checkpoint, falling back to when this orchestrator was created.
    #[instrument(skip(self))]
    pub async fn run_incremental_sync(&self, since: Option<DateTime<Utc>>) -> Result<BatchSyncResult> {
        let started = Instant::now();
        self.admit(SyncMode::Incremental)?;
        let since = since.map_or(Since::Checkpoint, Since::Fixed);
        let plan = self
            .enumerate(SyncMode::Incremental, since, self.deadline(started))
            .await?;
        Ok(self.execute(SyncMode::Incremental, plan, Vec::new(), started).await)
    }

    /// Sync exactly `ids` (duplicates are attempted once).
    #[instrument(skip(self, ids), fields(requested = ids.len()))]
    pub async fn sync_subset(&self, ids: &[String]) -> Result<BatchSyncResult> {
        let started = Instant::now();
        self.admit(SyncMode::Subset)?;
        let plan = Plan {
            items: dedup_ids(ids.iter().map(String::as_str)),
            ..Plan::default()
        };
        Ok(self.execute(SyncMode::Subset, plan, Vec::new(), started).await)
    }

    /// Re-run only the items that failed, or never started, in `prior`.
    #[instrument(skip(self, prior), fields(prior_run = prior.run_id))]
    pub async fn retry_failed(&self, prior: &BatchSyncResult) -> Result<BatchSyncResult> {
        let started = Instant::now();
        self.admit(SyncMode::RetryFailed)?;

        let mut attempt = Vec::new();
        let mut skipped = Vec::new();
        {
            let counts = self.lock_retry_counts();
            let candidates = prior
                .failed_item_ids()
                .into_iter()
                .chain(prior.unstarted_items.iter().map(String::as_str));
            for id in candidates {
                if counts.get(id).copied().unwrap_or(0) >= self.config.max_item_retries {
                    skipped.push(id.to_string());
                } else {
                    attempt.push(id);
                }
            }
        }

        if !skipped.is_empty() {
            warn!(
                skipped = skipped.len(),
                max_item_retries = self.config.max_item_retries,
                "Skipping items that reached the retry cap"
            );
        }

        let plan = Plan {
            items: dedup_ids(attempt.into_iter()),
            ..Plan::default()
        };
        Ok(self.execute(SyncMode::RetryFailed, plan, skipped, started).await)
    }

    /// Repeat `request` every `interval` until [`PeriodicSync::stop`].
    ///
    /// Fails with [`SyncError::Config`] when `interval` is zero.
    pub fn start_periodic(self: &Arc<Self>, request: SyncRequest, interval: Duration) -> Result<PeriodicSync> {
        if interval.is_zero() {
            return Err(SyncError::Config("periodic sync interval must be > 0".into()));
        }
        Ok(PeriodicSync::spawn(Arc::clone(self), request, interval))
    }

    // =========================================================================
    // Run phases
    // =========================================================================

    /// Ask the batch breaker for permission to run.
    fn admit(&self, mode: SyncMode) -> Result<()> {
        if self.batch_circuit.is_call_allowed() {
            return Ok(());
        }
        warn!(mode = %mode, circuit = BATCH_CIRCUIT, "Batch circuit open, refusing run");
        metrics::record_batch_abort(mode.as_str(), "circuit_open");
        Err(BatchAbort::CircuitOpen {
            circuit: BATCH_CIRCUIT.to_string(),
        }
        .into())
    }

    fn deadline(&self, started: Instant) -> Instant {
        started
            .checked_add(self.config.timeout)
            .unwrap_or_else(|| started + FAR_FUTURE)
    }

    async fn enumerate(&self, mode: SyncMode, since: Since, deadline: Instant) -> Result<Plan> {
        let listed = match tokio::time::timeout_at(deadline, self.list_work(since)).await {
            Ok(listed) => listed,
            Err(_) => Err(TransportError::Timeout {
                operation: "enumerate".to_string(),
                elapsed: self.config.timeout,
            }
            .into()),
        };
        match listed {
            Ok(plan) => {
                debug!(
                    mode = %mode,
                    collections = plan.collections.len(),
                    items = plan.items.len(),
                    "Enumerated work"
                );
                Ok(plan)
            }
            Err(e) => {
                self.batch_circuit.record_failure();
                warn!(mode = %mode, error = %e, "Enumeration failed, aborting run");
                metrics::record_batch_abort(mode.as_str(), "enumeration");
                Err(BatchAbort::Enumeration { source: Box::new(e) }.into())
            }
        }
    }

    async fn list_work(&self, since: Since) -> Result<Plan> {
        let enumerated_at = Utc::now();
        let collections = self.client.list_collections().await?;

        let mut seen = HashSet::new();
        let mut items = Vec::new();
        for collection in &collections {
            let lower_bound = match since {
                Since::Everything => None,
                Since::Fixed(at) => Some(at),
                Since::Checkpoint => Some(self.checkpoint_for(&collection.id).await?),
            };
            let children = self
                .client
                .list_all_children(&collection.id, lower_bound, self.config.batch_size)
                .await?;
            for child in children {
                if seen.insert(child.id.clone()) {
                    items.push(WorkItem {
                        id: child.id,
                        collection: Some(collection.id.clone()),
                    });
                }
            }
        }

        Ok(Plan {
            items,
            collections: collections.into_iter().map(|c| c.id).collect(),
            enumerated_at: Some(enumerated_at),
        })
    }

    async fn checkpoint_for(&self, collection: &str) -> Result<DateTime<Utc>> {
        match &self.checkpoints {
            Some(store) => Ok(store.get_checkpoint(collection).await?.unwrap_or(self.created_at)),
            None => Ok(self.created_at),
        }
    }

    /// Process `plan` and freeze the outcome. Never fails: per-item errors
    /// land in the result.
    async fn execute(
        &self,
        mode: SyncMode,
        plan: Plan,
        skipped_items: Vec<String>,
        started: Instant,
    ) -> BatchSyncResult {
        let run_id = self.run_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let deadline = self.deadline(started);
        let total = plan.items.len();
        let report_every = self.config.batch_size.max(1);

        let mut state = SyncState::new(total);
        self.events.emit(&SyncEvent::BatchStarted {
            run_id,
            mode: mode.to_string(),
            total,
        });

        let required_fields = Arc::new(self.config.required_fields.clone());
        let max_workers = self.config.max_workers.max(1);
        let mut pending: VecDeque<WorkItem> = plan.items.into();
        let mut in_flight: JoinSet<Result<()>> = JoinSet::new();
        let mut running: HashMap<tokio::task::Id, WorkItem> = HashMap::new();
        let mut dirty_collections: HashSet<String> = HashSet::new();
        let mut timed_out = false;

        loop {
            while !timed_out && in_flight.len() < max_workers {
                if Instant::now() >= deadline {
                    timed_out = true;
                    break;
                }
                let Some(item) = pending.pop_front() else { break };
                if mode == SyncMode::RetryFailed {
                    *self.lock_retry_counts().entry(item.id.clone()).or_insert(0) += 1;
                }

                let client = Arc::clone(&self.client);
                let sink = Arc::clone(&self.sink);
                let required = Arc::clone(&required_fields);
                let validate = self.config.validate_on_sync;
                let id = item.id.clone();
                let handle = in_flight.spawn(async move {
                    sync_item(&client, sink.as_ref(), &id, validate, &required).await
                });
                running.insert(handle.id(), item);
            }

            if in_flight.is_empty() {
                break;
            }

            let joined = if timed_out {
                in_flight.join_next_with_id().await
            } else {
                tokio::select! {
                    joined = in_flight.join_next_with_id() => joined,
                    _ = tokio::time::sleep_until(deadline) => {
                        timed_out = true;
                        continue;
                    }
                }
            };

            let (item, outcome) = match joined {
                None => break,
                Some(Ok((task_id, outcome))) => (running.remove(&task_id), outcome),
                Some(Err(join_err)) => {
                    let item = running.remove(&join_err.id());
                    let reason = if join_err.is_panic() { "worker panicked" } else { "worker cancelled" };
                    (item, Err(SyncError::Internal(reason.to_string())))
                }
            };
            let Some(item) = item else {
                warn!(run_id, "Finished task not found in running set");
                continue;
            };

            match outcome {
                Ok(()) => {
                    state.record_success();
                    self.lock_retry_counts().remove(&item.id);
                }
                Err(e) => {
                    debug!(run_id, item_id = %item.id, error = %e, "Item failed");
                    metrics::record_item_error(e.kind());
                    state.record_failure(item.id.clone(), e.to_string());
                    if let Some(collection) = item.collection {
                        dirty_collections.insert(collection);
                    }
                }
            }

            if state.processed_items % report_every == 0 || state.processed_items == total {
                self.events.emit(&SyncEvent::BatchProgress {
                    run_id,
                    processed: state.processed_items,
                    failed: state.failed_items,
                    total,
                });
            }
        }

        let unstarted: Vec<WorkItem> = pending.into_iter().collect();
        if !unstarted.is_empty() {
            warn!(
                run_id,
                mode = %mode,
                unstarted = unstarted.len(),
                timeout_secs = self.config.timeout.as_secs(),
                "Run timed out, remaining items not scheduled"
            );
        }
        dirty_collections.extend(unstarted.iter().filter_map(|i| i.collection.clone()));
        let unstarted_items: Vec<String> = unstarted.into_iter().map(|i| i.id).collect();

        if let Some(enumerated_at) = plan.enumerated_at {
            self.advance_checkpoints(&plan.collections, &dirty_collections, enumerated_at)
                .await;
        }

        let duration = started.elapsed();
        let success = state.failed_items == 0;
        if success {
            self.batch_circuit.record_success();
        } else {
            self.batch_circuit.record_failure();
        }

        let summary = format!(
            "{} sync: {}/{} items synced, {} failed, {} unstarted, {} skipped in {:.2}s",
            mode,
            state.succeeded_items(),
            total,
            state.failed_items,
            unstarted_items.len(),
            skipped_items.len(),
            duration.as_secs_f64()
        );

        self.events.emit(&SyncEvent::BatchFinished {
            run_id,
            mode: mode.to_string(),
            success,
            processed: state.processed_items,
            failed: state.failed_items,
            unstarted: unstarted_items.len(),
            duration,
        });
        info!(run_id, summary = %summary, "Sync run finished");

        BatchSyncResult {
            run_id,
            mode,
            state,
            success,
            duration_seconds: duration.as_secs_f64(),
            summary,
            unstarted_items,
            skipped_items,
        }
    }

    /// Move clean collections' checkpoints to `enumerated_at`.
    ///
    /// Best effort: failures are logged, the run result is unaffected.
    async fn advance_checkpoints(&self, collections: &[String], dirty: &HashSet<String>, enumerated_at: DateTime<Utc>) {
        let Some(store) = &self.checkpoints else { return };

        let mut advanced = 0usize;
        for collection in collections.iter().filter(|c| !dirty.contains(*c)) {
            match store.set_checkpoint(collection, enumerated_at).await {
                Ok(()) => advanced += 1,
                Err(e) => warn!(collection = %collection, error = %e, "Failed to record checkpoint"),
            }
        }

        if let Err(e) = store.flush().await {
            warn!(error = %e, "Failed to flush checkpoints");
        }
        debug!(advanced, held_back = dirty.len(), "Checkpoints updated");
    }
}

/// Fetch, validate and store one item.
async fn sync_item<T: Transport, K: ItemSink>(
    client: &RemoteServiceClient<T>,
    sink: &K,
    id: &str,
    validate: bool,
    required_fields: &[String],
) -> Result<()> {
    let item = client.get_item(id).await?;
    if validate {
        item.validate(id, required_fields)?;
    }
    sink.accept(item).await
}

fn dedup_ids<'a>(ids: impl Iterator<Item = &'a str>) -> Vec<WorkItem> {
    let mut seen = HashSet::new();
    ids.filter(|id| seen.insert(*id))
        .map(|id| WorkItem {
            id: id.to_string(),
            collection: None,
        })
        .collect()
}
