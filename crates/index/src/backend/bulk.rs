//! Bulk write stream.
//!
//! [`BulkStream`] batches per-document actions into bulk requests. A request
//! is sent once the pending batch reaches the action count or byte threshold,
//! at most `concurrency` requests are in flight at a time, and
//! [`flush`](BulkStream::flush) sends whatever is pending and waits for every
//! in-flight request. Any failed item fails the stream.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, error};

use crate::error::{BackendError, IndexError, IndexResult};
use crate::settings::Settings;

use super::{BulkAction, BulkResponse, IndexBackend};

/// A batching bulk writer over an [`IndexBackend`].
pub struct BulkStream {
    backend: Arc<dyn IndexBackend>,
    pending: Vec<BulkAction>,
    pending_bytes: usize,
    max_actions: usize,
    max_bytes: usize,
    concurrency: usize,
    in_flight: JoinSet<(String, Result<BulkResponse, BackendError>)>,
}

impl std::fmt::Debug for BulkStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkStream")
            .field("backend", &self.backend.name())
            .field("pending", &self.pending.len())
            .field("pending_bytes", &self.pending_bytes)
            .field("in_flight", &self.in_flight.len())
            .finish_non_exhaustive()
    }
}

impl BulkStream {
    /// Creates a stream with explicit thresholds.
    ///
    /// Zero thresholds and concurrency are raised to one.
    pub fn new(
        backend: Arc<dyn IndexBackend>,
        max_actions: usize,
        max_bytes: usize,
        concurrency: usize,
    ) -> Self {
        Self {
            backend,
            pending: Vec::new(),
            pending_bytes: 0,
            max_actions: max_actions.max(1),
            max_bytes: max_bytes.max(1),
            concurrency: concurrency.max(1),
            in_flight: JoinSet::new(),
        }
    }

    /// Uses the bulk thresholds and commit concurrency of the settings.
    pub fn from_settings(backend: Arc<dyn IndexBackend>, settings: &Settings) -> Self {
        Self::new(
            backend,
            settings.bulk_actions(),
            settings.bulk_size_bytes(),
            settings.commit_concurrency_level(),
        )
    }

    /// Queues an action, sending a request once a threshold is reached.
    pub async fn add(&mut self, action: BulkAction) -> IndexResult<()> {
        self.pending_bytes += action.estimated_size();
        self.pending.push(action);
        if self.pending.len() >= self.max_actions || self.pending_bytes >= self.max_bytes {
            self.send().await?;
        }
        Ok(())
    }

    /// Sends pending actions and waits for every in-flight request.
    pub async fn flush(&mut self) -> IndexResult<()> {
        self.send().await?;
        while let Some(joined) = self.in_flight.join_next().await {
            let (index, result) = joined?;
            check(&index, result)?;
        }
        Ok(())
    }

    /// Flushes, giving up after `timeout`.
    pub async fn close(mut self, timeout: Duration) -> IndexResult<()> {
        match tokio::time::timeout(timeout, self.flush()).await {
            Ok(result) => result,
            Err(_) => {
                self.in_flight.abort_all();
                Err(BackendError::Unavailable {
                    backend_name: self.backend.name().to_string(),
                    message: format!("bulk requests did not complete within {timeout:?}"),
                }
                .into())
            }
        }
    }

    async fn send(&mut self) -> IndexResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        while self.in_flight.len() >= self.concurrency {
            if let Some(joined) = self.in_flight.join_next().await {
                let (index, result) = joined?;
                check(&index, result)?;
            }
        }

        let actions = std::mem::take(&mut self.pending);
        self.pending_bytes = 0;
        let index = actions
            .first()
            .map(|a| a.index().to_string())
            .unwrap_or_default();
        debug!(index = %index, actions = actions.len(), "Sending bulk request");

        let backend = Arc::clone(&self.backend);
        self.in_flight.spawn(async move {
            let result = backend.bulk(actions).await;
            (index, result)
        });
        Ok(())
    }
}

fn check(index: &str, result: Result<BulkResponse, BackendError>) -> IndexResult<()> {
    let response = result?;
    if response.has_failures() {
        let failures = response.failures();
        error!(index = %index, failed = failures.len(), "Failed to commit bulk request");
        return Err(IndexError::IndexingFailure {
            index: index.to_string(),
            failures,
        });
    }
    debug!(
        index = %index,
        actions = response.items.len(),
        took_ms = response.took_ms,
        "Successfully processed bulk request"
    );
    Ok(())
}
