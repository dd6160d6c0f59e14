//! Helios Index Write Engine
//!
//! This crate is the write and schema-evolution layer of a document store built
//! on a full-text search backend. Client code stages mutations against typed
//! documents and commits them in one step; the engine turns the staged intent
//! into backend operations.
//!
//! # Guarantees
//!
//! - **One outcome per key**: a key staged for both upsert and delete in the
//!   same batch is deleted and never re-indexed.
//! - **Safe mapping evolution**: derived mappings are diffed against the stored
//!   ones; additive changes are applied in place, breaking changes are reported
//!   and never applied.
//! - **Bounded conflict retries**: filtered bulk updates and deletes are retried
//!   on version conflicts up to a fixed budget, then fail.
//!
//! # Components
//!
//! - [`schema`] - static document descriptors, mapping derivation and diff
//! - [`settings`] - the settings map and its Dynamic/Local/Static partitions
//! - [`backend`] - the [`IndexBackend`] capability trait and the bulk stream
//! - [`retry`] - the version conflict retry loop
//! - [`health`] - the cluster readiness wait
//! - [`admin`] - [`IndexAdmin`], index lifecycle and migration
//! - [`writer`] - [`Writer`], the transaction-scoped mutation buffer
//!
//! # Backend Features
//!
//! - `elasticsearch` (default) - [`backends::elasticsearch::ElasticsearchBackend`]
//! - `cli` - the `index-admin` operator binary
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use helios_index::backends::elasticsearch::{ElasticsearchBackend, ElasticsearchConfig};
//! use helios_index::{CommitPool, IndexAdmin, IndexConfig, Mappings, Writer};
//! use serde_json::json;
//!
//! let backend = Arc::new(ElasticsearchBackend::new(ElasticsearchConfig::default())?);
//! let admin = Arc::new(IndexAdmin::new(backend, IndexConfig::new("snomed"), mappings));
//! admin.create().await?;
//!
//! let pool = CommitPool::default();
//! let mut writer = Writer::new(admin.clone(), pool.clone());
//! writer.put("concept", "138875005", json!({ "active": true }));
//! writer.commit().await?;
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod admin;
pub mod backend;
pub mod backends;
pub mod config;
pub mod error;
pub mod health;
pub mod retry;
pub mod schema;
pub mod settings;
pub mod writer;

pub use admin::{BulkDelete, BulkUpdate, CreateReport, IndexAdmin, MigrationOutcome};
pub use backend::{Filter, IndexBackend};
pub use config::IndexConfig;
pub use error::{BackendError, IndexError, IndexResult};
pub use schema::{Document, FieldSpec, Mappings, SchemaDescriptor};
pub use settings::{SettingKind, Settings};
pub use writer::{CommitPool, Writer};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
