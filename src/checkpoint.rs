// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Checkpoint persistence for incremental sync.
//!
//! A checkpoint is the instant a collection was last enumerated by a run in
//! which every one of its items synced. The next incremental run asks the
//! service only for items updated since then.
//!
//! # Debounced Writes
//!
//! [`SqliteCheckpointStore`] keeps checkpoints in an in-memory cache:
//! - `set_checkpoint()` updates the cache immediately and marks the collection dirty
//! - `flush()` persists all dirty checkpoints in a batch
//! - The orchestrator flushes at the end of every run
//! - `close()` flushes whatever is left
//!
//! A crash between set and flush loses that run's progress. The next run
//! re-fetches a few items that were already stored, which the item sink must
//! tolerate anyway.
//!
//! # SQLite Busy Handling
//!
//! SQLITE_BUSY/SQLITE_LOCKED are retried with exponential backoff (5
//! attempts, 10ms doubling to 500ms). The cache is always written first.
//!
//! ## Checkpoint Semantics
//!
//! ```text
//! enumerate at T → sync all items of collection C → set_checkpoint(C, T)
//!                  (any item failed = keep old checkpoint, re-list next time)
//! ```

use crate::error::{Result, SyncError};
use crate::sink::BoxFuture;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Where incremental sync remembers how far it got.
pub trait CheckpointStore: Send + Sync + 'static {
    /// Last checkpoint for `collection`, if any.
    fn get_checkpoint(&self, collection: &str) -> BoxFuture<'_, Option<DateTime<Utc>>>;

    /// Record a new checkpoint. May be buffered until [`flush`](Self::flush).
    fn set_checkpoint(&self, collection: &str, value: DateTime<Utc>) -> BoxFuture<'_, ()>;

    /// Persist buffered checkpoints, returning how many were written.
    fn flush(&self) -> BoxFuture<'_, usize> {
        Box::pin(async { Ok(0) })
    }
}

// =============================================================================
// In-memory store
// =============================================================================

/// Process-local checkpoints. Lost on restart.
#[derive(Debug, Default, Clone)]
pub struct MemoryCheckpointStore {
    checkpoints: Arc<RwLock<HashMap<String, DateTime<Utc>>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all checkpoints (for diagnostics).
    pub async fn get_all(&self) -> HashMap<String, DateTime<Utc>> {
        self.checkpoints.read().await.clone()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn get_checkpoint(&self, collection: &str) -> BoxFuture<'_, Option<DateTime<Utc>>> {
        let collection = collection.to_string();
        Box::pin(async move { Ok(self.checkpoints.read().await.get(&collection).copied()) })
    }

    fn set_checkpoint(&self, collection: &str, value: DateTime<Utc>) -> BoxFuture<'_, ()> {
        let collection = collection.to_string();
        Box::pin(async move {
            self.checkpoints.write().await.insert(collection, value);
            Ok(())
        })
    }
}

// =============================================================================
// SQLite store
// =============================================================================

const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "SQLite operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::checkpoint_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(operation = operation_name, attempts, "SQLite busy, max retries exceeded");
                }
                return Err(e);
            }
        }
    }
}

/// Checkpoints backed by a SQLite file (WAL mode).
pub struct SqliteCheckpointStore {
    pool: SqlitePool,
    cache: RwLock<HashMap<String, DateTime<Utc>>>,
    /// Collections whose checkpoint is not yet on disk
    dirty: RwLock<HashSet<String>>,
    path: String,
}

impl std::fmt::Debug for SqliteCheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteCheckpointStore").field("path", &self.path).finish()
    }
}

impl SqliteCheckpointStore {
    /// Open (or create) the store at `path` and load existing checkpoints.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!(path = %path_str, "Initializing checkpoint store");

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path_str))
            .map_err(|e| SyncError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new().max_connections(2).connect_with(options).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                collection TEXT PRIMARY KEY,
                checkpoint TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let rows: Vec<(String, String)> = sqlx::query_as("SELECT collection, checkpoint FROM checkpoints")
            .fetch_all(&pool)
            .await?;

        let mut cache = HashMap::new();
        for (collection, raw) in rows {
            match DateTime::parse_from_rfc3339(&raw) {
                Ok(at) => {
                    cache.insert(collection, at.with_timezone(&Utc));
                }
                Err(e) => {
                    warn!(collection = %collection, value = %raw, error = %e, "Ignoring unreadable checkpoint");
                }
            }
        }

        if !cache.is_empty() {
            info!(count = cache.len(), "Restored checkpoints from previous run");
        }

        Ok(Self {
            pool,
            cache: RwLock::new(cache),
            dirty: RwLock::new(HashSet::new()),
            path: path_str,
        })
    }

    /// Flush all dirty checkpoints to disk.
    ///
    /// Failed rows stay dirty for the next flush.
    pub async fn flush_dirty(&self) -> Result<usize> {
        let dirty: Vec<String> = self.dirty.write().await.drain().collect();
        if dirty.is_empty() {
            return Ok(0);
        }

        let now = Utc::now().timestamp_millis();
        let snapshot: Vec<(String, String)> = {
            let cache = self.cache.read().await;
            dirty
                .iter()
                .filter_map(|c| cache.get(c).map(|at| (c.clone(), at.to_rfc3339())))
                .collect()
        };
        let pool = &self.pool;

        let mut flushed = 0;
        let mut errors = 0;

        for (collection, checkpoint) in &snapshot {
            let result = execute_with_retry("checkpoint_flush", || async {
                sqlx::query(
                    r#"
                    INSERT INTO checkpoints (collection, checkpoint, updated_at)
                    VALUES (?, ?, ?)
                    ON CONFLICT(collection) DO UPDATE SET
                        checkpoint = excluded.checkpoint,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(collection)
                .bind(checkpoint)
                .bind(now)
                .execute(pool)
                .await
            })
            .await;

            match result {
                Ok(_) => flushed += 1,
                Err(e) => {
                    errors += 1;
                    warn!(collection = %collection, error = %e, "Failed to flush checkpoint");
                    self.dirty.write().await.insert(collection.clone());
                }
            }
        }

        debug!(flushed, errors, "Flushed dirty checkpoints");
        crate::metrics::record_checkpoint_flush(flushed, errors);

        if errors > 0 {
            return Err(SyncError::Internal(format!("Failed to flush {} checkpoints", errors)));
        }
        Ok(flushed)
    }

    /// Get count of checkpoints pending flush.
    pub async fn dirty_count(&self) -> usize {
        self.dirty.read().await.len()
    }

    /// Forget a collection's checkpoint (forces a full listing next time).
    pub async fn delete(&self, collection: &str) -> Result<()> {
        self.cache.write().await.remove(collection);
        self.dirty.write().await.remove(collection);

        let pool = &self.pool;
        let collection_owned = collection.to_string();
        execute_with_retry("checkpoint_delete", || async {
            sqlx::query("DELETE FROM checkpoints WHERE collection = ?")
                .bind(&collection_owned)
                .execute(pool)
                .await
        })
        .await?;

        info!(collection = %collection, "Deleted checkpoint");
        Ok(())
    }

    /// Get all checkpoints (for diagnostics).
    pub async fn get_all(&self) -> HashMap<String, DateTime<Utc>> {
        self.cache.read().await.clone()
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Flush dirty checkpoints, truncate the WAL and close the pool.
    pub async fn close(&self) {
        if self.dirty_count().await > 0 {
            match self.flush_dirty().await {
                Ok(count) => info!(count, "Flushed dirty checkpoints on close"),
                Err(e) => warn!(error = %e, "Failed to flush dirty checkpoints on close"),
            }
        }

        let pool = &self.pool;
        if let Err(e) = execute_with_retry("checkpoint_wal", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool).await
        })
        .await
        {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Checkpoint store closed");
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    fn get_checkpoint(&self, collection: &str) -> BoxFuture<'_, Option<DateTime<Utc>>> {
        let collection = collection.to_string();
        Box::pin(async move { Ok(self.cache.read().await.get(&collection).copied()) })
    }

    fn set_checkpoint(&self, collection: &str, value: DateTime<Utc>) -> BoxFuture<'_, ()> {
        let collection = collection.to_string();
        Box::pin(async move {
            self.cache.write().await.insert(collection.clone(), value);
            debug!(collection = %collection, checkpoint = %value, "Checkpoint updated (pending flush)");
            self.dirty.write().await.insert(collection);
            Ok(())
        })
    }

    fn flush(&self) -> BoxFuture<'_, usize> {
        Box::pin(self.flush_dirty())
    }
}
