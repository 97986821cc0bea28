// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Transport integration trait.
//!
//! The client never speaks HTTP itself. A [`Transport`] performs exactly one
//! network call per invocation and classifies its failure as a
//! [`TransportError`]; retrying and circuit breaking happen above it.
//!
//! # Example
//!
//! ```rust,no_run
//! use tracking_sync::transport::{Operation, Transport, TransportFuture};
//! use serde_json::{json, Value};
//!
//! struct StaticTransport;
//!
//! impl Transport for StaticTransport {
//!     fn call(&self, operation: Operation, _params: Value) -> TransportFuture<'_> {
//!         Box::pin(async move {
//!             match operation {
//!                 Operation::ListCollections => Ok(json!([{ "id": "c1", "name": "runs" }])),
//!                 _ => Ok(Value::Null),
//!             }
//!         })
//!     }
//! }
//! ```

use crate::error::TransportError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by [`Transport::call`].
pub type TransportFuture<'a> = Pin<Box<dyn Future<Output = Result<Value, TransportError>> + Send + 'a>>;

/// Named remote operations. Each one gets its own circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    ListCollections,
    GetItem,
    ListChildren,
    AppendItems,
}

impl Operation {
    pub const ALL: [Operation; 4] = [
        Operation::ListCollections,
        Operation::GetItem,
        Operation::ListChildren,
        Operation::AppendItems,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ListCollections => "list_collections",
            Self::GetItem => "get_item",
            Self::ListChildren => "list_children",
            Self::AppendItems => "append_items",
        }
    }

    /// Whether the operation only reads remote state.
    pub fn is_read_only(&self) -> bool {
        !matches!(self, Self::AppendItems)
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the client needs from the network layer.
///
/// `params` and the returned value are JSON. Implementations must map
/// failures onto [`TransportError`] so the retry layer can classify them
/// (see [`TransportError::from_status`] for HTTP-shaped backends).
pub trait Transport: Send + Sync + 'static {
    /// Perform one call. Never retries internally.
    fn call(&self, operation: Operation, params: Value) -> TransportFuture<'_>;
}

/// A no-op transport for dry runs.
///
/// Every listing is empty and every lookup is not-found.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpTransport;

impl Transport for NoOpTransport {
    fn call(&self, operation: Operation, params: Value) -> TransportFuture<'_> {
        Box::pin(async move {
            tracing::debug!(operation = %operation, "NoOp: would call tracking service");
            match operation {
                Operation::ListCollections => Ok(json!([])),
                Operation::ListChildren => Ok(json!({ "items": [], "next_cursor": null })),
                Operation::GetItem => Err(TransportError::NotFound {
                    operation: operation.to_string(),
                    message: params
                        .get("id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                }),
                Operation::AppendItems => {
                    let accepted = params
                        .get("items")
                        .and_then(Value::as_array)
                        .map(Vec::len)
                        .unwrap_or(0);
                    Ok(json!({ "accepted": accepted, "ids": [] }))
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_names() {
        let names: Vec<&str> = Operation::ALL.iter().map(Operation::as_str).collect();
        assert_eq!(names, vec!["list_collections", "get_item", "list_children", "append_items"]);
        assert_eq!(Operation::GetItem.to_string(), "get_item");
        assert!(Operation::GetItem.is_read_only());
        assert!(!Operation::AppendItems.is_read_only());
    }

    #[test]
    fn test_operation_serde_matches_display() {
        for op in Operation::ALL {
            let encoded = serde_json::to_value(op).unwrap();
            assert_eq!(encoded, Value::String(op.to_string()));
        }
    }

    #[tokio::test]
    async fn test_noop_transport_listings_are_empty() {
        let transport = NoOpTransport;
        let collections = transport.call(Operation::ListCollections, Value::Null).await.unwrap();
        assert_eq!(collections, json!([]));

        let page = transport
            .call(Operation::ListChildren, json!({ "collection": "c1" }))
            .await
            .unwrap();
        assert_eq!(page["items"], json!([]));
    }

    #[tokio::test]
    async fn test_noop_transport_get_is_not_found() {
        let err = NoOpTransport
            .call(Operation::GetItem, json!({ "id": "run-1" }))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
        assert!(err.to_string().contains("run-1"));
    }

    #[tokio::test]
    async fn test_noop_transport_append_accepts_all() {
        let receipt = NoOpTransport
            .call(Operation::AppendItems, json!({ "items": [{}, {}, {}] }))
            .await
            .unwrap();
        assert_eq!(receipt["accepted"], json!(3));
    }
}
