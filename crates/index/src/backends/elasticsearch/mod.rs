//! Elasticsearch backend.
//!
//! Implements [`IndexBackend`](crate::backend::IndexBackend) over the official
//! `elasticsearch` client. Filtered bulk operations are sent as
//! `_update_by_query` / `_delete_by_query` with `conflicts=proceed`, readiness
//! polls use `_cluster/health` with `wait_for_status=yellow` and index-level
//! detail, and per-document writes go through `_bulk`.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use helios_index::backends::elasticsearch::{ElasticsearchBackend, ElasticsearchConfig};
//!
//! let config = ElasticsearchConfig {
//!     nodes: vec!["http://localhost:9200".to_string()],
//!     ..Default::default()
//! };
//! let backend = Arc::new(ElasticsearchBackend::new(config)?);
//! ```

mod backend;
mod response;

pub use backend::{ElasticsearchAuth, ElasticsearchBackend, ElasticsearchConfig};
