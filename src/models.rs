// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Records exchanged with the tracking service.
//!
//! Payloads stay as JSON objects; the client only checks shape.

use crate::error::SyncError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A top-level container (experiment, dataset, project).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// One entry of a children listing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemRef {
    pub id: String,
    pub collection: String,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// A cursor-paginated listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

impl<T> Page<T> {
    pub fn is_last(&self) -> bool {
        self.next_cursor.as_deref().map_or(true, str::is_empty)
    }
}

/// A fully fetched record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedItem {
    pub id: String,
    #[serde(default)]
    pub collection: String,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl TrackedItem {
    /// Check that this is the record we asked for and that every required
    /// field is present and non-null.
    pub fn validate(&self, expected_id: &str, required_fields: &[String]) -> Result<(), SyncError> {
        if self.id.is_empty() {
            return Err(SyncError::Validation {
                item_id: expected_id.to_string(),
                message: "missing id".to_string(),
            });
        }
        if self.id != expected_id {
            return Err(SyncError::Validation {
                item_id: expected_id.to_string(),
                message: format!("service returned item {}", self.id),
            });
        }

        let missing: Vec<&str> = required_fields
            .iter()
            .filter(|field| self.fields.get(field.as_str()).map_or(true, Value::is_null))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(SyncError::Validation {
                item_id: expected_id.to_string(),
                message: format!("missing required fields: {}", missing.join(", ")),
            });
        }
        Ok(())
    }
}

/// A record to append to a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewItem {
    pub fields: Map<String, Value>,
}

/// Service acknowledgement for an append.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendReceipt {
    pub accepted: usize,
    #[serde(default)]
    pub ids: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(value: Value) -> TrackedItem {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_item_decodes_with_defaults() {
        let parsed = item(json!({ "id": "run-1" }));
        assert_eq!(parsed.id, "run-1");
        assert!(parsed.collection.is_empty());
        assert!(parsed.updated_at.is_none());
        assert!(parsed.fields.is_empty());
    }

    #[test]
    fn test_validate_accepts_complete_item() {
        let parsed = item(json!({
            "id": "run-1",
            "collection": "exp-1",
            "updated_at": "2026-03-01T10:00:00Z",
            "fields": { "name": "baseline", "score": 0.91 }
        }));
        assert!(parsed.validate("run-1", &["name".into(), "score".into()]).is_ok());
    }

    #[test]
    fn test_validate_reports_missing_and_null_fields() {
        let parsed = item(json!({ "id": "run-1", "fields": { "name": null } }));
        let err = parsed.validate("run-1", &["name".into(), "score".into()]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("name"));
        assert!(msg.contains("score"));
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn test_validate_rejects_wrong_or_empty_id() {
        assert!(item(json!({ "id": "run-2" })).validate("run-1", &[]).is_err());
        assert!(item(json!({ "id": "" })).validate("run-1", &[]).is_err());
    }

    #[test]
    fn test_page_last_detection() {
        let last: Page<ItemRef> = serde_json::from_value(json!({ "items": [] })).unwrap();
        assert!(last.is_last());

        let empty_cursor: Page<ItemRef> =
            serde_json::from_value(json!({ "items": [], "next_cursor": "" })).unwrap();
        assert!(empty_cursor.is_last());

        let more: Page<ItemRef> = serde_json::from_value(json!({
            "items": [{ "id": "a", "collection": "c" }],
            "next_cursor": "p2"
        }))
        .unwrap();
        assert!(!more.is_last());
    }
}
