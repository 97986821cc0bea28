//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - `MockTransport`: an in-memory tracking service with scriptable failures
//! - `RecordingSink`: an item sink that remembers what it accepted
//! - `EventRecorder`: an event sink for asserting on retries and transitions

#![allow(dead_code)]

use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracking_sync::sink::BoxFuture;
use tracking_sync::{
    CircuitBreakerConfig, CircuitState, ClientConfig, EventSink, ItemSink, Operation, RetryConfig, SyncError,
    SyncEvent, TrackedItem, Transport, TransportError, TransportFuture,
};

// =============================================================================
// Mock transport
// =============================================================================

#[derive(Default)]
struct MockState {
    /// Collection id -> child item ids, in listing order
    collections: Vec<(String, Vec<String>)>,
    /// Items that fail on every fetch
    broken_items: HashSet<String>,
    /// Items that fail this many more fetches, then succeed
    flaky_items: HashMap<String, u32>,
    /// Operations that fail this many more calls, then succeed
    failing_ops: HashMap<Operation, u32>,
    /// Every call received, in order
    calls: Vec<(Operation, Value)>,
}

/// In-memory tracking service.
///
/// # Example
/// ```rust,ignore
/// let mock = MockTransport::new().with_collection("c1", &["a", "b"]);
/// mock.break_item("b");
///
/// // Use in tests...
///
/// assert_eq!(mock.get_item_calls("b"), 3);
/// ```
#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
    /// Simulated latency of each get_item call
    item_delay: Mutex<Option<Duration>>,
    total_calls: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a collection whose children are `items`.
    pub fn with_collection(self, id: &str, items: &[&str]) -> Self {
        self.lock()
            .collections
            .push((id.to_string(), items.iter().map(|s| s.to_string()).collect()));
        self
    }

    /// One collection `c1` holding `item-1..=item-n`.
    pub fn with_items(n: usize) -> Self {
        let ids: Vec<String> = (1..=n).map(|i| format!("item-{i}")).collect();
        let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        Self::new().with_collection("c1", &refs)
    }

    /// Make every fetch of `id` fail with a 500.
    pub fn break_item(&self, id: &str) {
        self.lock().broken_items.insert(id.to_string());
    }

    /// Undo [`break_item`](Self::break_item).
    pub fn heal_item(&self, id: &str) {
        self.lock().broken_items.remove(id);
    }

    /// Make the next `times` fetches of `id` fail with a 500.
    pub fn fail_item_times(&self, id: &str, times: u32) {
        self.lock().flaky_items.insert(id.to_string(), times);
    }

    /// Make the next `times` calls of `op` fail with a 503.
    pub fn fail_operation_times(&self, op: Operation, times: u32) {
        self.lock().failing_ops.insert(op, times);
    }

    /// Stop failing calls of `op`.
    pub fn heal_operation(&self, op: Operation) {
        self.lock().failing_ops.remove(&op);
    }

    pub fn set_item_delay(&self, delay: Duration) {
        *self.item_delay.lock().unwrap() = Some(delay);
    }

    pub fn total_calls(&self) -> usize {
        self.total_calls.load(Ordering::SeqCst)
    }

    /// Params of every call of `op`, in order.
    pub fn calls(&self, op: Operation) -> Vec<Value> {
        self.lock()
            .calls
            .iter()
            .filter(|(o, _)| *o == op)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn call_count(&self, op: Operation) -> usize {
        self.calls(op).len()
    }

    pub fn get_item_calls(&self, id: &str) -> usize {
        self.calls(Operation::GetItem)
            .iter()
            .filter(|p| p["id"] == id)
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Decide the reply while holding the lock; the async part never holds it.
    fn reply(&self, operation: Operation, params: &Value) -> Result<Value, TransportError> {
        let mut guard = self.lock();
        let state = &mut *guard;
        state.calls.push((operation, params.clone()));

        if let Some(remaining) = state.failing_ops.get_mut(&operation) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(TransportError::Server {
                    operation: operation.to_string(),
                    status: 503,
                    message: "scripted outage".to_string(),
                });
            }
        }

        match operation {
            Operation::ListCollections => Ok(Value::Array(
                state
                    .collections
                    .iter()
                    .map(|(id, _)| json!({ "id": id, "name": id }))
                    .collect(),
            )),
            Operation::ListChildren => {
                let collection = params["collection"].as_str().unwrap_or_default();
                let items: Vec<Value> = state
                    .collections
                    .iter()
                    .filter(|(id, _)| id == collection)
                    .flat_map(|(id, items)| items.iter().map(move |item| json!({ "id": item, "collection": id })))
                    .collect();
                Ok(json!({ "items": items, "next_cursor": null }))
            }
            Operation::GetItem => {
                let id = params["id"].as_str().unwrap_or_default().to_string();
                let fail = match state.flaky_items.get_mut(&id) {
                    Some(remaining) if *remaining > 0 => {
                        *remaining -= 1;
                        true
                    }
                    _ => state.broken_items.contains(&id),
                };
                if fail {
                    return Err(TransportError::Server {
                        operation: operation.to_string(),
                        status: 500,
                        message: format!("cannot load {id}"),
                    });
                }
                let collection = state
                    .collections
                    .iter()
                    .find(|(_, items)| items.contains(&id))
                    .map(|(c, _)| c.clone())
                    .unwrap_or_default();
                Ok(json!({ "id": id, "collection": collection, "fields": { "name": id } }))
            }
            Operation::AppendItems => {
                let count = params["items"].as_array().map_or(0, Vec::len);
                Ok(json!({ "accepted": count, "ids": [] }))
            }
        }
    }
}

impl Transport for MockTransport {
    fn call(&self, operation: Operation, params: Value) -> TransportFuture<'_> {
        self.total_calls.fetch_add(1, Ordering::SeqCst);
        let delay = match operation {
            Operation::GetItem => *self.item_delay.lock().unwrap(),
            _ => None,
        };
        let reply = self.reply(operation, &params);
        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            reply
        })
    }
}

// =============================================================================
// Item sink
// =============================================================================

/// Item sink that records accepted item ids.
#[derive(Default)]
pub struct RecordingSink {
    accepted: Mutex<Vec<String>>,
    /// Ids whose accept() panics
    panic_on: Mutex<HashSet<String>>,
    /// Ids whose accept() returns an error
    reject: Mutex<HashSet<String>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn panic_on(&self, id: &str) {
        self.panic_on.lock().unwrap().insert(id.to_string());
    }

    pub fn reject(&self, id: &str) {
        self.reject.lock().unwrap().insert(id.to_string());
    }

    /// Accepted ids, sorted.
    pub fn accepted(&self) -> Vec<String> {
        let mut ids = self.accepted.lock().unwrap().clone();
        ids.sort();
        ids
    }
}

impl ItemSink for RecordingSink {
    fn accept(&self, item: TrackedItem) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.panic_on.lock().unwrap().contains(&item.id) {
                panic!("sink exploded on {}", item.id);
            }
            if self.reject.lock().unwrap().contains(&item.id) {
                return Err(SyncError::Sink {
                    item_id: item.id,
                    message: "disk full".to_string(),
                });
            }
            self.accepted.lock().unwrap().push(item.id);
            Ok(())
        })
    }
}

// =============================================================================
// Event recorder
// =============================================================================

/// Event sink that keeps every event.
#[derive(Default)]
pub struct EventRecorder {
    events: Mutex<Vec<SyncEvent>>,
}

impl EventRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<SyncEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Delays of every scheduled retry of `operation`.
    pub fn retry_delays(&self, operation: &str) -> Vec<Duration> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SyncEvent::RetryAttempt { operation: op, delay, .. } if op == operation => Some(delay),
                _ => None,
            })
            .collect()
    }

    /// State changes of `circuit`, in order.
    pub fn transitions(&self, circuit: &str) -> Vec<(CircuitState, CircuitState)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SyncEvent::CircuitTransition { circuit: c, from, to } if c == circuit => Some((from, to)),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for EventRecorder {
    fn emit(&self, event: &SyncEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

// =============================================================================
// Config helpers
// =============================================================================

/// Client config with fast, deterministic retries and a patient breaker.
pub fn fast_client_config() -> ClientConfig {
    ClientConfig {
        retry: RetryConfig::testing(),
        circuit: CircuitBreakerConfig {
            failure_threshold: 100,
            ..CircuitBreakerConfig::default()
        },
        ..ClientConfig::default()
    }
}

/// Breaker config that effectively never opens.
pub fn patient_circuit() -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold: 1_000,
        ..CircuitBreakerConfig::default()
    }
}
