// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chaos tests: simulate failures and verify graceful degradation.
//!
//! These tests verify the system handles failures gracefully without panics,
//! deadlocks, or miscounted results.
//!
//! Run with: cargo test --test chaos_tests -- --nocapture

mod common;

use common::{fast_client_config, patient_circuit, MockTransport, RecordingSink};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tracking_sync::{
    BatchSyncConfig, BatchSyncOrchestrator, CheckpointStore, CircuitBreaker, CircuitBreakerConfig, CircuitError,
    CircuitState, RemoteServiceClient, SqliteCheckpointStore,
};

fn orchestrator(
    transport: &Arc<MockTransport>,
    config: BatchSyncConfig,
) -> BatchSyncOrchestrator<MockTransport> {
    let client = RemoteServiceClient::new(Arc::clone(transport), fast_client_config());
    BatchSyncOrchestrator::new(Arc::new(client), config)
}

// =============================================================================
// Worker Failures
// =============================================================================

/// Test: A panicking item sink fails only that item
#[tokio::test]
async fn sink_panic_is_recorded_as_item_failure() {
    let transport = Arc::new(MockTransport::with_items(8));
    let sink = RecordingSink::new();
    sink.panic_on("item-4");

    let config = BatchSyncConfig {
        circuit: patient_circuit(),
        ..BatchSyncConfig::testing()
    };
    let orchestrator = orchestrator(&transport, config).with_item_sink(Arc::clone(&sink));
    let result = orchestrator.run_full_sync().await.unwrap();

    assert_eq!(result.state.processed_items, 8);
    assert_eq!(result.state.failed_items, 1);
    assert_eq!(result.failed_item_ids(), vec!["item-4"]);
    assert!(result.state.errors[0].message.contains("panicked"));
    assert_eq!(sink.accepted().len(), 7);
}

/// Test: A sink rejecting items never aborts the run
#[tokio::test]
async fn sink_rejections_are_per_item() {
    let transport = Arc::new(MockTransport::with_items(6));
    let sink = RecordingSink::new();
    sink.reject("item-1");
    sink.reject("item-6");

    let config = BatchSyncConfig {
        circuit: patient_circuit(),
        ..BatchSyncConfig::testing()
    };
    let orchestrator = orchestrator(&transport, config).with_item_sink(Arc::clone(&sink));
    let result = orchestrator.run_full_sync().await.unwrap();

    assert_eq!(result.state.failed_items, 2);
    let mut failed = result.failed_item_ids();
    failed.sort();
    assert_eq!(failed, vec!["item-1", "item-6"]);
}

// =============================================================================
// Flapping Service
// =============================================================================

/// Test: Every item flaps, wide fan-out; counts stay consistent
#[tokio::test(start_paused = true)]
async fn flapping_items_with_many_workers() {
    let n = 200;
    let transport = Arc::new(MockTransport::with_items(n));
    for i in 1..=n {
        // 0, 1 or 2 failures: all recoverable within 3 attempts
        transport.fail_item_times(&format!("item-{i}"), (i % 3) as u32);
    }
    let sink = RecordingSink::new();

    let config = BatchSyncConfig {
        max_workers: 32,
        batch_size: 7,
        circuit: patient_circuit(),
        ..BatchSyncConfig::testing()
    };
    let orchestrator = orchestrator(&transport, config).with_item_sink(Arc::clone(&sink));
    let result = orchestrator.run_full_sync().await.unwrap();

    assert_eq!(result.state.total_items, n);
    assert_eq!(result.state.processed_items, n);
    assert_eq!(result.state.failed_items, 0);
    assert!(result.success);
    assert_eq!(sink.accepted().len(), n);
}

/// Test: Item outage trips the get_item breaker mid-run; the rest fail fast
#[tokio::test(start_paused = true)]
async fn item_breaker_trips_mid_run() {
    let n = 20;
    let transport = Arc::new(MockTransport::with_items(n));
    for i in 1..=n {
        transport.break_item(&format!("item-{i}"));
    }

    let client_config = tracking_sync::ClientConfig {
        circuit: CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 1,
            timeout: Duration::from_secs(600),
        },
        ..fast_client_config()
    };
    let client = Arc::new(RemoteServiceClient::new(Arc::clone(&transport), client_config));
    let config = BatchSyncConfig {
        max_workers: 1,
        circuit: patient_circuit(),
        ..BatchSyncConfig::testing()
    };
    let orchestrator = BatchSyncOrchestrator::new(Arc::clone(&client), config);
    let result = orchestrator.run_full_sync().await.unwrap();

    // Every item is accounted for; only the first three reached the service
    assert_eq!(result.state.processed_items, n);
    assert_eq!(result.state.failed_items, n);
    assert_eq!(transport.call_count(tracking_sync::Operation::GetItem), 3 * 3);
    assert!(result
        .state
        .errors
        .iter()
        .skip(3)
        .all(|e| e.message.contains("circuit")));
    assert_eq!(
        client.circuits().get(tracking_sync::Operation::GetItem).state(),
        CircuitState::Open
    );
}

// =============================================================================
// Circuit Breaker Under Concurrency
// =============================================================================

/// Test: Concurrent callers never corrupt breaker state
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn circuit_breaker_concurrent_calls() {
    let breaker = Arc::new(CircuitBreaker::new(
        "chaos",
        CircuitBreakerConfig {
            failure_threshold: 5,
            success_threshold: 1,
            timeout: Duration::from_secs(600),
        },
    ));
    let attempts = Arc::new(AtomicU32::new(0));

    let mut handles = Vec::new();
    for i in 0..100u32 {
        let breaker = Arc::clone(&breaker);
        let attempts = Arc::clone(&attempts);
        handles.push(tokio::spawn(async move {
            breaker
                .call(|| async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    if i % 2 == 0 {
                        Err::<(), _>("boom")
                    } else {
                        Ok(())
                    }
                })
                .await
        }));
    }

    let mut rejected = 0u32;
    for handle in handles {
        if let Err(CircuitError::Rejected { .. }) = handle.await.unwrap() {
            rejected += 1;
        }
    }

    let admitted = attempts.load(Ordering::SeqCst);
    assert_eq!(admitted + rejected, 100);
    assert_eq!(breaker.calls_total(), u64::from(admitted));
    assert_eq!(breaker.rejections(), u64::from(rejected));
    assert_eq!(breaker.successes() + breaker.failures(), u64::from(admitted));
    if breaker.state() == CircuitState::Closed {
        assert!(breaker.failure_count() < 5);
    }
}

// =============================================================================
// Checkpoint Store
// =============================================================================

/// Test: Concurrent checkpoint writes all land after one flush
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn checkpoint_concurrent_writes() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("checkpoints.db");
    let store = Arc::new(SqliteCheckpointStore::open(&path).await.unwrap());
    let now = chrono::Utc::now();

    let mut handles = Vec::new();
    for i in 0..50 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            store
                .set_checkpoint(&format!("collection-{i}"), now)
                .await
                .unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(store.dirty_count().await, 50);
    assert_eq!(store.flush().await.unwrap(), 50);
    assert_eq!(store.dirty_count().await, 0);
    store.close().await;

    let reopened = SqliteCheckpointStore::open(&path).await.unwrap();
    assert_eq!(reopened.get_all().await.len(), 50);
}
