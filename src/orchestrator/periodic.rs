// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Periodic sync runner.
//!
//! Repeats one [`SyncRequest`] on a fixed interval until stopped. Each run's
//! outcome (including aborted runs) is published on a bounded channel; a
//! slow consumer delays the next run rather than piling results up. A run
//! that finishes after shutdown was signalled is still delivered if the
//! channel has room.

use super::types::{BatchSyncResult, SyncRequest};
use super::BatchSyncOrchestrator;
use crate::error::Result;
use crate::sink::ItemSink;
use crate::transport::Transport;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

/// Results buffered before the runner waits for the consumer.
const RESULT_BUFFER: usize = 16;

/// Handle to a running periodic sync.
#[derive(Debug)]
pub struct PeriodicSync {
    results: mpsc::Receiver<Result<BatchSyncResult>>,
    shutdown_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicSync {
    pub(super) fn spawn<T, K>(
        orchestrator: Arc<BatchSyncOrchestrator<T, K>>,
        request: SyncRequest,
        interval: Duration,
    ) -> Self
    where
        T: Transport,
        K: ItemSink,
    {
        let (tx, results) = mpsc::channel(RESULT_BUFFER);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let span = tracing::info_span!("periodic_sync", mode = %request.mode());
        let handle = tokio::spawn(run_loop(orchestrator, request, interval, tx, shutdown_rx).instrument(span));

        Self {
            results,
            shutdown_tx,
            handle: Some(handle),
        }
    }

    /// Wait for the next run's outcome. `None` once the runner has stopped
    /// and every buffered outcome has been taken.
    pub async fn next(&mut self) -> Option<Result<BatchSyncResult>> {
        self.results.recv().await
    }

    /// Signal shutdown and wait for the runner to exit.
    ///
    /// A run in progress is allowed to finish first; its outcome stays
    /// readable through [`next`](Self::next) unless the buffer was full.
    pub async fn stop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        let Some(handle) = self.handle.take() else { return };
        if let Err(e) = handle.await {
            warn!(error = %e, "Periodic sync task ended abnormally");
        }
    }
}

async fn run_loop<T, K>(
    orchestrator: Arc<BatchSyncOrchestrator<T, K>>,
    request: SyncRequest,
    interval: Duration,
    tx: mpsc::Sender<Result<BatchSyncResult>>,
    mut shutdown_rx: watch::Receiver<bool>,
) where
    T: Transport,
    K: ItemSink,
{
    // Mark initial shutdown value as seen so changed() only fires on actual changes
    let _ = shutdown_rx.borrow_and_update();

    info!(interval_ms = interval.as_millis() as u64, "Starting periodic sync");

    let mut timer = tokio::time::interval(interval);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    break;
                }
                continue;
            }

            _ = timer.tick() => {}
        }

        let outcome = orchestrator.run(&request).await;
        match &outcome {
            Ok(result) => debug!(run_id = result.run_id, success = result.success, "Periodic run finished"),
            Err(e) => warn!(error = %e, "Periodic run aborted"),
        }

        let outcome = match tx.try_send(outcome) {
            Ok(()) => continue,
            Err(TrySendError::Closed(_)) => break,
            Err(TrySendError::Full(outcome)) => outcome,
        };

        // Buffer full: wait for the consumer, unless we are told to stop
        tokio::select! {
            biased;

            sent = tx.send(outcome) => {
                if sent.is_err() {
                    break;
                }
            }

            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    warn!("Shutdown while result buffer full, dropping last outcome");
                    break;
                }
            }
        }
    }

    info!("Periodic sync stopped");
}
