//! Search backend abstraction.
//!
//! This module defines the [`IndexBackend`] trait, the complete capability set
//! the engine needs from a search backend: index lifecycle, mapping and
//! settings introspection/update, explicit refresh, a readiness query, filtered
//! update/delete by query and bulk writes. Everything above this trait
//! ([`IndexAdmin`](crate::admin::IndexAdmin), [`Writer`](crate::writer::Writer))
//! is backend agnostic.

pub mod bulk;

use std::fmt::{self, Debug};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::BackendError;

pub use bulk::BulkStream;

/// HTTP status the backend reports for a version conflict.
pub const VERSION_CONFLICT_STATUS: u16 = 409;

/// Cluster health levels, ordered from worst to best.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Some primary shards are unassigned.
    Red,
    /// Primaries are assigned, some replicas are not.
    Yellow,
    /// Every shard is assigned.
    Green,
}

impl HealthStatus {
    /// Parses the status string of a health response.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "red" => Some(HealthStatus::Red),
            "yellow" => Some(HealthStatus::Yellow),
            "green" => Some(HealthStatus::Green),
            _ => None,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Red => write!(f, "red"),
            HealthStatus::Yellow => write!(f, "yellow"),
            HealthStatus::Green => write!(f, "green"),
        }
    }
}

/// Answer of one readiness poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterHealth {
    /// Status reached when the poll returned.
    pub status: HealthStatus,
    /// The poll's own timeout elapsed before the requested status was reached.
    pub timed_out: bool,
}

/// A query selecting the documents a filtered bulk operation applies to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Filter(Value);

impl Filter {
    /// Matches every document.
    pub fn match_all() -> Self {
        Filter(json!({ "match_all": {} }))
    }

    /// Exact match on a single keyword value.
    pub fn term(field: &str, value: impl Into<Value>) -> Self {
        Filter(json!({ "term": { field: value.into() } }))
    }

    /// Exact match on any of the values.
    pub fn terms<I, V>(field: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let values: Vec<Value> = values.into_iter().map(Into::into).collect();
        Filter(json!({ "terms": { field: values } }))
    }

    /// Documents with one of the given keys.
    pub fn ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids: Vec<String> = ids.into_iter().map(Into::into).collect();
        Filter(json!({ "ids": { "values": ids } }))
    }

    /// Wraps a raw query DSL object.
    pub fn raw(query: Value) -> Self {
        Filter(query)
    }

    /// The query DSL object.
    pub fn as_query(&self) -> &Value {
        &self.0
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An inline painless script with parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InlineScript {
    /// Painless source.
    pub source: String,
    /// Values bound to `params.*` in the source.
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl InlineScript {
    /// Request body form: `{ "lang": "painless", "source": .., "params": .. }`.
    pub fn to_json(&self) -> Value {
        json!({
            "lang": "painless",
            "source": self.source,
            "params": self.params,
        })
    }
}

/// A filtered update-by-script or delete-by-query request.
#[derive(Debug, Clone, PartialEq)]
pub struct ByQueryRequest {
    /// Physical index the request runs against.
    pub index: String,
    /// Query DSL selecting the documents.
    pub query: Value,
    /// Update script; `None` rewrites each matching document in place.
    pub script: Option<InlineScript>,
    /// Scroll batch size.
    pub batch_size: u64,
}

/// A per-document failure reported by a filtered bulk operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByQueryFailure {
    /// Key of the failed document, when reported.
    pub id: Option<String>,
    /// HTTP-style status of the failure.
    pub status: u16,
    /// Backend error type and reason.
    pub cause: String,
}

impl ByQueryFailure {
    /// A concurrent write changed the document first (409).
    pub fn is_version_conflict(&self) -> bool {
        self.status == VERSION_CONFLICT_STATUS
    }
}

/// Counts and failures of one filtered bulk attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ByQueryResponse {
    /// Documents rewritten.
    pub updated: u64,
    /// Documents removed.
    pub deleted: u64,
    /// Documents the script left untouched.
    pub noops: u64,
    /// Version conflicts counted by the backend.
    pub version_conflicts: u64,
    /// Per-document failures, conflicts included.
    pub failures: Vec<ByQueryFailure>,
}

impl ByQueryResponse {
    /// Whether the attempt changed any document.
    pub fn changed(&self) -> bool {
        self.updated > 0 || self.deleted > 0
    }

    /// Conflicts reported either as a count or as individual failures.
    pub fn conflicts(&self) -> u64 {
        let listed = self
            .failures
            .iter()
            .filter(|f| f.is_version_conflict())
            .count() as u64;
        self.version_conflicts.max(listed)
    }
}

/// A single per-document write inside a bulk request.
#[derive(Debug, Clone, PartialEq)]
pub enum BulkAction {
    /// Stores `source` under `id`, replacing any earlier version.
    Index {
        /// Target physical index.
        index: String,
        /// Document key.
        id: String,
        /// Serialized document.
        source: Value,
    },
    /// Removes the document stored under `id`.
    Delete {
        /// Target physical index.
        index: String,
        /// Document key.
        id: String,
    },
}

impl BulkAction {
    /// Target physical index.
    pub fn index(&self) -> &str {
        match self {
            BulkAction::Index { index, .. } | BulkAction::Delete { index, .. } => index,
        }
    }

    /// Document key.
    pub fn id(&self) -> &str {
        match self {
            BulkAction::Index { id, .. } | BulkAction::Delete { id, .. } => id,
        }
    }

    /// The action metadata line of the bulk body.
    pub fn header(&self) -> Value {
        match self {
            BulkAction::Index { index, id, .. } => {
                json!({ "index": { "_index": index, "_id": id } })
            }
            BulkAction::Delete { index, id } => {
                json!({ "delete": { "_index": index, "_id": id } })
            }
        }
    }

    /// Approximate request body size in bytes.
    pub fn estimated_size(&self) -> usize {
        let header = self.header().to_string().len() + 1;
        match self {
            BulkAction::Index { source, .. } => header + source.to_string().len() + 1,
            BulkAction::Delete { .. } => header,
        }
    }
}

/// Outcome of one item of a bulk request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkItem {
    /// Document key.
    pub id: String,
    /// Item status as reported by the backend.
    pub status: u16,
    /// Failure reason, `None` when the item succeeded.
    pub error: Option<String>,
}

/// Response of one bulk request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkResponse {
    /// Server-side processing time in milliseconds.
    pub took_ms: u64,
    /// One entry per action, in request order.
    pub items: Vec<BulkItem>,
}

impl BulkResponse {
    /// Whether any item failed.
    pub fn has_failures(&self) -> bool {
        self.items.iter().any(|item| item.error.is_some())
    }

    /// `id: reason` lines for every failed item.
    pub fn failures(&self) -> Vec<String> {
        self.items
            .iter()
            .filter_map(|item| {
                item.error
                    .as_ref()
                    .map(|e| format!("{} ({}): {}", item.id, item.status, e))
            })
            .collect()
    }
}

/// The capability set the engine requires from a search backend.
///
/// Methods report transport-level problems as [`BackendError`]. Admin calls
/// return whether the backend acknowledged the request; callers decide what
/// an unacknowledged answer means.
#[async_trait]
pub trait IndexBackend: Send + Sync + Debug {
    /// A short name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Returns true if every listed index exists.
    async fn indices_exist(&self, indices: &[String]) -> Result<bool, BackendError>;

    /// Creates an index with settings and a type mapping.
    async fn create_index(
        &self,
        index: &str,
        settings: &Value,
        mapping: &Value,
    ) -> Result<bool, BackendError>;

    /// Deletes the listed indices.
    async fn delete_indices(&self, indices: &[String]) -> Result<bool, BackendError>;

    /// Returns the stored type mapping of an index.
    async fn get_mapping(&self, index: &str) -> Result<Value, BackendError>;

    /// Applies a mapping to an existing index.
    async fn put_mapping(&self, index: &str, mapping: &Value) -> Result<bool, BackendError>;

    /// Returns the index-level settings of an index.
    async fn get_settings(&self, index: &str) -> Result<Value, BackendError>;

    /// Updates index-level settings of a live index.
    async fn put_settings(&self, index: &str, settings: &Value) -> Result<bool, BackendError>;

    /// Makes recent writes to the given indices visible.
    async fn refresh(&self, indices: &[String]) -> Result<(), BackendError>;

    /// Waits up to `timeout` for the indices to reach at least yellow health.
    async fn cluster_health(
        &self,
        indices: &[String],
        timeout: Duration,
    ) -> Result<ClusterHealth, BackendError>;

    /// Runs an update by query, proceeding past version conflicts.
    async fn update_by_query(&self, request: &ByQueryRequest)
    -> Result<ByQueryResponse, BackendError>;

    /// Runs a delete by query, proceeding past version conflicts.
    async fn delete_by_query(&self, request: &ByQueryRequest)
    -> Result<ByQueryResponse, BackendError>;

    /// Sends one bulk request.
    async fn bulk(&self, actions: Vec<BulkAction>) -> Result<BulkResponse, BackendError>;
}
