//! Transaction-scoped mutation buffer.
//!
//! A [`Writer`] stages upserts, deletes and filtered bulk operations and
//! applies them in one [`commit`](Writer::commit):
//!
//! 1. Filtered bulk updates and deletes run through the conflict retry loop,
//!    concurrently on the [`CommitPool`] when more than one is staged.
//! 2. Per-document upserts and deletes are streamed type by type through a
//!    single [`BulkStream`], flushed at every type boundary. A key staged for
//!    both upsert and delete in the same type is only deleted.
//! 3. Every touched physical index is refreshed once.
//!
//! Staged operations are cleared once the backend has accepted the writes.
//!
//! # Example
//!
//! ```ignore
//! let mut writer = Writer::new(admin.clone(), pool.clone());
//! writer.put("concept", "138875005", json!({ "active": true }));
//! writer.remove("description", "12345");
//! let refreshed = writer.commit().await?;
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::admin::{BulkDelete, BulkUpdate, IndexAdmin};
use crate::backend::{BulkAction, BulkStream};
use crate::error::{BackendError, IndexError, IndexResult};
use crate::schema::Document;

/// Default number of filtered bulk operations run at once.
pub const DEFAULT_COMMIT_WORKERS: usize = 4;

/// Bounds how many filtered bulk operations run concurrently.
///
/// The pool is owned by the caller and shared by every [`Writer`] created
/// from it, so the bound holds across concurrent commits.
#[derive(Debug, Clone)]
pub struct CommitPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl Default for CommitPool {
    fn default() -> Self {
        Self::new(DEFAULT_COMMIT_WORKERS)
    }
}

impl CommitPool {
    /// Creates a pool with `size` permits, at least one.
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// Total number of permits.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Permits currently not held by a running operation.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

#[derive(Debug, Clone)]
enum FilteredOp {
    Update(BulkUpdate),
    Delete(BulkDelete),
}

impl FilteredOp {
    fn doc_type(&self) -> &str {
        match self {
            FilteredOp::Update(u) => &u.doc_type,
            FilteredOp::Delete(d) => &d.doc_type,
        }
    }

    async fn run(&self, admin: &IndexAdmin) -> IndexResult<bool> {
        match self {
            FilteredOp::Update(update) => admin.bulk_update(update).await,
            FilteredOp::Delete(delete) => admin.bulk_delete(delete).await,
        }
    }
}

/// Stages mutations for one transaction and commits them.
#[derive(Debug)]
pub struct Writer {
    admin: Arc<IndexAdmin>,
    pool: CommitPool,
    index_ops: BTreeMap<String, BTreeMap<String, Value>>,
    delete_ops: BTreeMap<String, BTreeSet<String>>,
    bulk_updates: Vec<BulkUpdate>,
    bulk_deletes: Vec<BulkDelete>,
}

impl Writer {
    /// Creates an empty writer.
    ///
    /// Writers sharing a [`CommitPool`] share its bound on concurrent filtered
    /// operations.
    pub fn new(admin: Arc<IndexAdmin>, pool: CommitPool) -> Self {
        Self {
            admin,
            pool,
            index_ops: BTreeMap::new(),
            delete_ops: BTreeMap::new(),
            bulk_updates: Vec::new(),
            bulk_deletes: Vec::new(),
        }
    }

    /// The admin of the store this writer commits to.
    pub fn admin(&self) -> &Arc<IndexAdmin> {
        &self.admin
    }

    /// Stages an upsert, replacing any earlier upsert of the same key.
    pub fn put(&mut self, doc_type: impl Into<String>, key: impl Into<String>, document: Value) {
        self.index_ops
            .entry(doc_type.into())
            .or_default()
            .insert(key.into(), document);
    }

    /// Serializes and stages a typed document.
    pub fn put_document<D: Document>(&mut self, key: impl Into<String>, document: &D) -> IndexResult<()> {
        let value = serde_json::to_value(document)?;
        self.put(D::TYPE, key, value);
        Ok(())
    }

    /// Stages every `(key, document)` pair of one type.
    pub fn put_all<K, I>(&mut self, doc_type: &str, documents: I)
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        for (key, document) in documents {
            self.put(doc_type, key, document);
        }
    }

    /// Stages a delete.
    pub fn remove(&mut self, doc_type: impl Into<String>, key: impl Into<String>) {
        self.delete_ops
            .entry(doc_type.into())
            .or_default()
            .insert(key.into());
    }

    /// Stages deletes of several keys of one type.
    pub fn remove_all<K, I>(&mut self, doc_type: &str, keys: I)
    where
        K: Into<String>,
        I: IntoIterator<Item = K>,
    {
        for key in keys {
            self.remove(doc_type, key);
        }
    }

    /// Stages deletes for several types at once.
    pub fn remove_all_by_type<K, I>(&mut self, keys_by_type: BTreeMap<String, I>)
    where
        K: Into<String>,
        I: IntoIterator<Item = K>,
    {
        for (doc_type, keys) in keys_by_type {
            self.remove_all(&doc_type, keys);
        }
    }

    /// Stages a filtered update-by-script.
    pub fn bulk_update(&mut self, update: BulkUpdate) {
        self.bulk_updates.push(update);
    }

    /// Stages a filtered delete.
    pub fn bulk_delete(&mut self, delete: BulkDelete) {
        self.bulk_deletes.push(delete);
    }

    /// Whether nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.index_ops.is_empty()
            && self.delete_ops.is_empty()
            && self.bulk_updates.is_empty()
            && self.bulk_deletes.is_empty()
    }

    /// Applies every staged operation.
    ///
    /// Returns the document types whose indices were refreshed. On error the
    /// staged operations are kept.
    pub async fn commit(&mut self) -> IndexResult<BTreeSet<String>> {
        if self.is_empty() {
            return Ok(BTreeSet::new());
        }
        self.log_commit_size();

        let mut touched = self.run_filtered_phase().await?;
        touched.extend(self.run_document_phase().await?);

        self.index_ops.clear();
        self.delete_ops.clear();
        self.bulk_updates.clear();
        self.bulk_deletes.clear();

        let types: Vec<&str> = touched.iter().map(String::as_str).collect();
        self.admin.refresh(&types).await?;
        Ok(touched)
    }

    fn log_commit_size(&self) {
        let staged: usize = self.index_ops.values().map(BTreeMap::len).sum::<usize>()
            + self.delete_ops.values().map(BTreeSet::len).sum::<usize>();
        let (low, high) = self.admin.settings().commit_watermarks();
        let staged_u64 = staged as u64;
        if staged_u64 > high {
            warn!(
                store = %self.admin.name(),
                staged,
                watermark = high,
                "Commit stages more documents than the high watermark"
            );
        } else if staged_u64 > low {
            info!(
                store = %self.admin.name(),
                staged,
                watermark = low,
                "Commit stages more documents than the low watermark"
            );
        }
    }

    async fn run_filtered_phase(&self) -> IndexResult<BTreeSet<String>> {
        let ops: Vec<FilteredOp> = self
            .bulk_updates
            .iter()
            .cloned()
            .map(FilteredOp::Update)
            .chain(self.bulk_deletes.iter().cloned().map(FilteredOp::Delete))
            .collect();

        let mut touched = BTreeSet::new();
        if ops.len() <= 1 {
            for op in &ops {
                if op.run(&self.admin).await? {
                    touched.insert(op.doc_type().to_string());
                }
            }
            return Ok(touched);
        }

        // per-commit bound on top of the shared pool bound
        let workers = Arc::new(Semaphore::new(self.pool.size().min(ops.len())));
        debug!(operations = ops.len(), "Running filtered bulk operations concurrently");

        let mut tasks = JoinSet::new();
        for op in ops {
            let admin = Arc::clone(&self.admin);
            let shared = Arc::clone(&self.pool.permits);
            let local = Arc::clone(&workers);
            tasks.spawn(async move {
                let _local = local.acquire_owned().await.map_err(closed_pool)?;
                let _shared = shared.acquire_owned().await.map_err(closed_pool)?;
                let changed = op.run(&admin).await?;
                Ok::<_, IndexError>(changed.then(|| op.doc_type().to_string()))
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let result = joined.map_err(IndexError::from).and_then(|r| r);
            match result {
                Ok(Some(doc_type)) => {
                    touched.insert(doc_type);
                }
                Ok(None) => {}
                Err(err) => {
                    tasks.abort_all();
                    while tasks.join_next().await.is_some() {}
                    return Err(err);
                }
            }
        }
        Ok(touched)
    }

    async fn run_document_phase(&self) -> IndexResult<BTreeSet<String>> {
        let mut touched = BTreeSet::new();
        if self.index_ops.is_empty() && self.delete_ops.is_empty() {
            return Ok(touched);
        }

        let settings = self.admin.settings();
        let mut stream = BulkStream::from_settings(Arc::clone(self.admin.backend()), &settings);
        let no_deletes = BTreeSet::new();

        for (doc_type, documents) in &self.index_ops {
            let index = self.admin.physical_index(doc_type)?;
            let deletes = self.delete_ops.get(doc_type).unwrap_or(&no_deletes);

            for (id, source) in documents {
                if deletes.contains(id) {
                    continue;
                }
                stream
                    .add(BulkAction::Index {
                        index: index.clone(),
                        id: id.clone(),
                        source: source.clone(),
                    })
                    .await?;
            }
            for id in deletes {
                stream
                    .add(BulkAction::Delete {
                        index: index.clone(),
                        id: id.clone(),
                    })
                    .await?;
            }
            stream.flush().await?;
            touched.insert(doc_type.clone());
        }

        for (doc_type, ids) in &self.delete_ops {
            if self.index_ops.contains_key(doc_type) {
                continue;
            }
            let index = self.admin.physical_index(doc_type)?;
            for id in ids {
                stream
                    .add(BulkAction::Delete {
                        index: index.clone(),
                        id: id.clone(),
                    })
                    .await?;
            }
            stream.flush().await?;
            touched.insert(doc_type.clone());
        }

        stream.close(self.admin.config().bulk_close_timeout).await?;
        Ok(touched)
    }
}

fn closed_pool(err: tokio::sync::AcquireError) -> IndexError {
    BackendError::Internal {
        backend_name: "commit pool".to_string(),
        message: err.to_string(),
        source: Some(Box::new(err)),
    }
    .into()
}
