// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the sync client and orchestrator.
//!
//! These are the serializable settings a daemon loads from disk. Durations
//! are human-readable strings (`"500ms"`, `"30s"`, `"5m"`) parsed with
//! `humantime`. Each settings struct converts into the runtime config the
//! library actually uses, validating it on the way.
//!
//! # Configuration Structure
//!
//! ```text
//! SyncConfig
//! ├── client: ClientSettings
//! │   ├── retry: RetrySettings          # shared retry defaults
//! │   ├── circuit: CircuitSettings      # shared breaker defaults
//! │   ├── rate_limit: Option<...>       # client-side throttle
//! │   └── overrides: {operation: ...}   # per-operation replacements
//! ├── batch: BatchSettings              # orchestrator + batch breaker
//! └── checkpoint: CheckpointConfig      # incremental progress persistence
//! ```
//!
//! # JSON Example
//!
//! ```json
//! {
//!   "client": {
//!     "retry": { "max_attempts": 4, "base_delay": "500ms" },
//!     "overrides": {
//!       "list_children": { "retry": { "max_attempts": 6, "retry_on": "retryable_only" } }
//!     }
//!   },
//!   "batch": { "max_workers": 16, "timeout": "10m", "interval": "15m" },
//!   "checkpoint": { "sqlite_path": "/var/lib/tracking-sync/checkpoints.db" }
//! }
//! ```

use crate::checkpoint::{CheckpointStore, MemoryCheckpointStore, SqliteCheckpointStore};
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::client::{ClientConfig, OperationOverride};
use crate::error::{Result, SyncError};
use crate::orchestrator::BatchSyncConfig;
use crate::resilience::{RateLimitConfig, RetryConfig, RetryOn};
use crate::transport::Operation;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// Everything a sync daemon needs, as loaded from disk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub client: ClientSettings,
    #[serde(default)]
    pub batch: BatchSettings,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
}

impl SyncConfig {
    /// Parse and validate a JSON document. Missing sections take defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| SyncError::Config(format!("invalid config JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json_str(&raw)
    }

    /// Check every section converts into a valid runtime config.
    pub fn validate(&self) -> Result<()> {
        self.client.to_client_config()?;
        self.batch.to_batch_config()?;
        self.batch.interval()?;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Client settings
// ═══════════════════════════════════════════════════════════════════════════════

/// Settings for [`RemoteServiceClient`](crate::client::RemoteServiceClient).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientSettings {
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub circuit: CircuitSettings,
    /// Omit to disable client-side throttling.
    #[serde(default)]
    pub rate_limit: Option<RateLimitSettings>,
    /// Keyed by operation name (`get_item`, `list_children`, ...).
    #[serde(default)]
    pub overrides: HashMap<Operation, OperationSettings>,
}

impl ClientSettings {
    pub fn to_client_config(&self) -> Result<ClientConfig> {
        let mut overrides = HashMap::with_capacity(self.overrides.len());
        for (op, settings) in &self.overrides {
            let retry = settings.retry.as_ref().map(RetrySettings::to_retry_config).transpose()?;
            let circuit = settings
                .circuit
                .as_ref()
                .map(CircuitSettings::to_circuit_config)
                .transpose()?;
            overrides.insert(*op, OperationOverride { retry, circuit });
        }

        let config = ClientConfig {
            retry: self.retry.to_retry_config()?,
            circuit: self.circuit.to_circuit_config()?,
            rate_limit: self.rate_limit.as_ref().map(RateLimitSettings::to_rate_limit_config),
            overrides,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Retry settings, shared or per operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Total attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay: String,
    #[serde(default = "default_max_delay")]
    pub max_delay: String,
    #[serde(default = "default_exponential_base")]
    pub exponential_base: f64,
    #[serde(default = "default_true")]
    pub jitter: bool,
    #[serde(default)]
    pub retry_on: RetryOn,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> String {
    "1s".to_string()
}

fn default_max_delay() -> String {
    "30s".to_string()
}

fn default_exponential_base() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            exponential_base: default_exponential_base(),
            jitter: true,
            retry_on: RetryOn::AnyError,
        }
    }
}

impl RetrySettings {
    pub fn to_retry_config(&self) -> Result<RetryConfig> {
        let config = RetryConfig {
            max_attempts: self.max_attempts,
            base_delay: parse_duration("base_delay", &self.base_delay)?,
            max_delay: parse_duration("max_delay", &self.max_delay)?,
            exponential_base: self.exponential_base,
            jitter: self.jitter,
            retry_on: self.retry_on,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Circuit breaker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    /// How long the breaker stays open before admitting a probe.
    #[serde(default = "default_circuit_timeout")]
    pub timeout: String,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_circuit_timeout() -> String {
    "30s".to_string()
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            timeout: default_circuit_timeout(),
        }
    }
}

impl CircuitSettings {
    pub fn to_circuit_config(&self) -> Result<CircuitBreakerConfig> {
        let config = CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            success_threshold: self.success_threshold,
            timeout: parse_duration("circuit timeout", &self.timeout)?,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Token bucket settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitSettings {
    #[serde(default = "default_burst_size")]
    pub burst_size: u32,
    /// Tokens per second.
    #[serde(default = "default_refill_rate")]
    pub refill_rate: u32,
}

fn default_burst_size() -> u32 {
    20
}

fn default_refill_rate() -> u32 {
    50
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            burst_size: default_burst_size(),
            refill_rate: default_refill_rate(),
        }
    }
}

impl RateLimitSettings {
    pub fn to_rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            burst_size: self.burst_size,
            refill_rate: self.refill_rate,
        }
    }
}

/// Replacement settings for one operation. Absent parts use the shared ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationSettings {
    #[serde(default)]
    pub retry: Option<RetrySettings>,
    #[serde(default)]
    pub circuit: Option<CircuitSettings>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Batch settings
// ═══════════════════════════════════════════════════════════════════════════════

/// Settings for [`BatchSyncOrchestrator`](crate::orchestrator::BatchSyncOrchestrator).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSettings {
    /// Listing page size and progress cadence.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Per-run budget for scheduling items.
    #[serde(default = "default_batch_timeout")]
    pub timeout: String,
    #[serde(default = "default_true")]
    pub validate_on_sync: bool,
    #[serde(default)]
    pub required_fields: Vec<String>,
    #[serde(default = "default_max_item_retries")]
    pub max_item_retries: u32,
    /// Breaker guarding whole runs. Trips faster than the operation breakers.
    #[serde(default = "default_batch_circuit")]
    pub circuit: CircuitSettings,
    /// Period for a periodic runner; omit for one-shot use.
    #[serde(default)]
    pub interval: Option<String>,
}

fn default_batch_size() -> usize {
    100
}

fn default_max_workers() -> usize {
    8
}

fn default_batch_timeout() -> String {
    "30m".to_string()
}

fn default_max_item_retries() -> u32 {
    3
}

fn default_batch_circuit() -> CircuitSettings {
    CircuitSettings {
        failure_threshold: 3,
        success_threshold: 3,
        timeout: "60s".to_string(),
    }
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_workers: default_max_workers(),
            timeout: default_batch_timeout(),
            validate_on_sync: true,
            required_fields: Vec::new(),
            max_item_retries: default_max_item_retries(),
            circuit: default_batch_circuit(),
            interval: None,
        }
    }
}

impl BatchSettings {
    pub fn to_batch_config(&self) -> Result<BatchSyncConfig> {
        let config = BatchSyncConfig {
            batch_size: self.batch_size,
            max_workers: self.max_workers,
            timeout: parse_duration("batch timeout", &self.timeout)?,
            validate_on_sync: self.validate_on_sync,
            required_fields: self.required_fields.clone(),
            max_item_retries: self.max_item_retries,
            circuit: self.circuit.to_circuit_config()?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Parsed periodic interval, if one is configured.
    pub fn interval(&self) -> Result<Option<Duration>> {
        let Some(raw) = &self.interval else {
            return Ok(None);
        };
        let interval = parse_duration("interval", raw)?;
        if interval.is_zero() {
            return Err(SyncError::Config("interval must be > 0".into()));
        }
        Ok(Some(interval))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Checkpoint persistence
// ═══════════════════════════════════════════════════════════════════════════════

/// Where incremental checkpoints live.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// SQLite database path. Omit to keep checkpoints in memory only.
    #[serde(default)]
    pub sqlite_path: Option<String>,
}

impl CheckpointConfig {
    /// Checkpoints persisted at `path`.
    pub fn sqlite(path: impl Into<String>) -> Self {
        Self {
            sqlite_path: Some(path.into()),
        }
    }

    /// Open the configured store.
    pub async fn open_store(&self) -> Result<Arc<dyn CheckpointStore>> {
        match &self.sqlite_path {
            Some(path) => Ok(Arc::new(SqliteCheckpointStore::open(path).await?)),
            None => Ok(Arc::new(MemoryCheckpointStore::new())),
        }
    }
}

fn parse_duration(field: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value).map_err(|e| SyncError::Config(format!("{field}: invalid duration {value:?}: {e}")))
}
