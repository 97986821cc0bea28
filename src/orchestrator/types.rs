// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Types for the batch sync orchestrator.

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::{Result, SyncError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Runtime configuration for [`BatchSyncOrchestrator`](super::BatchSyncOrchestrator).
#[derive(Debug, Clone, PartialEq)]
pub struct BatchSyncConfig {
    /// Page size for children listings; also how often progress is reported.
    pub batch_size: usize,
    /// Maximum items fetched concurrently.
    pub max_workers: usize,
    /// Wall-clock budget for scheduling new items in one run.
    pub timeout: Duration,
    /// Check each fetched item before handing it to the sink.
    pub validate_on_sync: bool,
    /// Fields every item must carry (non-null) when validating.
    pub required_fields: Vec<String>,
    /// How many retry-failed runs may re-attempt the same item.
    pub max_item_retries: u32,
    /// Breaker guarding whole runs.
    pub circuit: CircuitBreakerConfig,
}

impl Default for BatchSyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_workers: 8,
            timeout: Duration::from_secs(30 * 60),
            validate_on_sync: true,
            required_fields: Vec::new(),
            max_item_retries: 3,
            circuit: CircuitBreakerConfig::aggressive(),
        }
    }
}

impl BatchSyncConfig {
    /// Small, fast settings for tests.
    pub fn testing() -> Self {
        Self {
            batch_size: 10,
            max_workers: 4,
            timeout: Duration::from_secs(60),
            validate_on_sync: true,
            required_fields: Vec::new(),
            max_item_retries: 2,
            circuit: CircuitBreakerConfig::testing(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(SyncError::Config("batch_size must be >= 1".into()));
        }
        if self.max_workers == 0 {
            return Err(SyncError::Config("max_workers must be >= 1".into()));
        }
        if self.timeout.is_zero() {
            return Err(SyncError::Config("batch timeout must be > 0".into()));
        }
        self.circuit.validate()
    }
}

/// Which kind of run produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Full,
    Incremental,
    Subset,
    RetryFailed,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
            Self::Subset => "subset",
            Self::RetryFailed => "retry_failed",
        }
    }
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a periodic runner (or any trigger) asks for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SyncRequest {
    /// Every item of every collection.
    Full,
    /// Items changed since `since`, or since each collection's checkpoint.
    Incremental {
        #[serde(default)]
        since: Option<DateTime<Utc>>,
    },
    /// Exactly these ids.
    Subset { ids: Vec<String> },
}

impl SyncRequest {
    pub fn mode(&self) -> SyncMode {
        match self {
            Self::Full => SyncMode::Full,
            Self::Incremental { .. } => SyncMode::Incremental,
            Self::Subset { .. } => SyncMode::Subset,
        }
    }
}

/// One failed item.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncErrorEntry {
    pub item_id: String,
    pub message: String,
    pub time: DateTime<Utc>,
}

/// Progress of one run.
///
/// Only the run's scheduling loop mutates it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncState {
    pub total_items: usize,
    /// Items attempted to completion, successful or not.
    pub processed_items: usize,
    pub failed_items: usize,
    pub start_time: DateTime<Utc>,
    pub errors: Vec<SyncErrorEntry>,
}

impl SyncState {
    pub fn new(total_items: usize) -> Self {
        Self {
            total_items,
            processed_items: 0,
            failed_items: 0,
            start_time: Utc::now(),
            errors: Vec::new(),
        }
    }

    pub fn record_success(&mut self) {
        self.processed_items += 1;
    }

    pub fn record_failure(&mut self, item_id: impl Into<String>, message: impl Into<String>) {
        self.processed_items += 1;
        self.failed_items += 1;
        self.errors.push(SyncErrorEntry {
            item_id: item_id.into(),
            message: message.into(),
            time: Utc::now(),
        });
    }

    pub fn succeeded_items(&self) -> usize {
        self.processed_items - self.failed_items
    }

    /// Fraction of items processed (1.0 for an empty run).
    pub fn progress(&self) -> f64 {
        if self.total_items == 0 {
            return 1.0;
        }
        self.processed_items as f64 / self.total_items as f64
    }
}

/// Frozen outcome of one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchSyncResult {
    pub run_id: u64,
    pub mode: SyncMode,
    pub state: SyncState,
    /// True when no attempted item failed.
    pub success: bool,
    pub duration_seconds: f64,
    pub summary: String,
    /// Never scheduled because the run timed out. Not failures.
    pub unstarted_items: Vec<String>,
    /// Not attempted because they hit the retry-failed cap.
    pub skipped_items: Vec<String>,
}

impl BatchSyncResult {
    /// Ids of failed items, in the order they failed, without duplicates.
    pub fn failed_item_ids(&self) -> Vec<&str> {
        let mut seen = std::collections::HashSet::new();
        self.state
            .errors
            .iter()
            .map(|e| e.item_id.as_str())
            .filter(|id| seen.insert(*id))
            .collect()
    }
}
