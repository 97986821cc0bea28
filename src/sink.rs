// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local destination for synced items.

use crate::error::Result;
use crate::models::TrackedItem;
use std::future::Future;
use std::pin::Pin;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Where fetched and validated items land.
///
/// Called once per successfully fetched item, possibly from several workers
/// at once. An `Err` marks that item as failed in the run.
pub trait ItemSink: Send + Sync + 'static {
    fn accept(&self, item: TrackedItem) -> BoxFuture<'_, ()>;
}

/// Discards items (dry runs, health checks).
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpSink;

impl ItemSink for NoOpSink {
    fn accept(&self, item: TrackedItem) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            tracing::trace!(
                item_id = %item.id,
                collection = %item.collection,
                fields = item.fields.len(),
                "NoOp: would store item"
            );
            Ok(())
        })
    }
}
