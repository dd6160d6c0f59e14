//! Elasticsearch response bodies.

use serde_json::{Value, json};

use crate::backend::{
    BulkItem, BulkResponse, ByQueryFailure, ByQueryResponse, ClusterHealth, HealthStatus,
};
use crate::error::BackendError;

pub(super) fn acknowledged(body: &Value) -> bool {
    body["acknowledged"].as_bool().unwrap_or(false)
}

/// `type: reason` of an error object, or its JSON text.
fn reason(error: &Value) -> String {
    match (error["type"].as_str(), error["reason"].as_str()) {
        (Some(kind), Some(reason)) => format!("{kind}: {reason}"),
        (None, Some(reason)) => reason.to_string(),
        _ => error.to_string(),
    }
}

fn count(body: &Value, key: &str) -> u64 {
    body[key].as_u64().unwrap_or(0)
}

/// Parses an `_update_by_query` / `_delete_by_query` response.
pub(super) fn by_query(body: &Value) -> ByQueryResponse {
    let failures = body["failures"]
        .as_array()
        .map(|failures| {
            failures
                .iter()
                .map(|failure| ByQueryFailure {
                    id: failure["id"].as_str().map(str::to_string),
                    status: failure["status"].as_u64().unwrap_or(500) as u16,
                    cause: reason(&failure["cause"]),
                })
                .collect()
        })
        .unwrap_or_default();

    ByQueryResponse {
        updated: count(body, "updated"),
        deleted: count(body, "deleted"),
        noops: count(body, "noops"),
        version_conflicts: count(body, "version_conflicts"),
        failures,
    }
}

/// Parses a `_bulk` response.
pub(super) fn bulk(body: &Value) -> BulkResponse {
    let items = body["items"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_object()?.values().next())
                .map(|result| BulkItem {
                    id: result["_id"].as_str().unwrap_or_default().to_string(),
                    status: result["status"].as_u64().unwrap_or(0) as u16,
                    error: result.get("error").map(reason),
                })
                .collect()
        })
        .unwrap_or_default();

    BulkResponse {
        took_ms: count(body, "took"),
        items,
    }
}

/// Parses a `_cluster/health` response.
pub(super) fn health(body: &Value) -> Result<ClusterHealth, BackendError> {
    let status = body["status"]
        .as_str()
        .and_then(HealthStatus::parse)
        .ok_or_else(|| BackendError::SerializationError {
            message: format!("cluster health response has no valid status: {body}"),
        })?;
    Ok(ClusterHealth {
        status,
        timed_out: body["timed_out"].as_bool().unwrap_or(false),
    })
}

/// The entry of `index` in a per-index response, falling back to the only
/// entry when `index` is an alias.
fn index_entry<'a>(body: &'a Value, index: &str) -> Option<&'a Value> {
    let entries = body.as_object()?;
    entries.get(index).or_else(|| entries.values().next())
}

/// Extracts the type mapping from a `_mapping` response.
pub(super) fn mapping(body: &Value, index: &str) -> Value {
    index_entry(body, index)
        .map(|entry| entry["mappings"].clone())
        .filter(|m| !m.is_null())
        .unwrap_or_else(|| json!({}))
}

/// Extracts the index-level settings from a `_settings` response.
pub(super) fn settings(body: &Value, index: &str) -> Value {
    index_entry(body, index)
        .map(|entry| entry["settings"]["index"].clone())
        .filter(|s| !s.is_null())
        .unwrap_or_else(|| json!({}))
}
