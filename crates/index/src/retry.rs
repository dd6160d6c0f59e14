//! Version conflict retries for filtered bulk operations.
//!
//! Update and delete by query run with `conflicts=proceed`, so a document that
//! changed underneath the scroll is skipped and reported as a version
//! conflict. [`ConflictRetryLoop`] re-runs such an operation until an attempt
//! completes without conflicts, refreshing the index between attempts so the
//! next scroll sees the latest versions. The loop is bounded by
//! [`RetryPolicy::max_attempts`]; running out of attempts is an error, never a
//! partial success.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::backend::{ByQueryRequest, ByQueryResponse, IndexBackend};
use crate::config::humantime_serde;
use crate::error::{IndexError, IndexResult};

/// Attempt budget and backoff range of the conflict retry loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Lower bound (inclusive) of the randomized backoff.
    #[serde(with = "humantime_serde", default = "default_min_backoff")]
    pub min_backoff: Duration,

    /// Upper bound (exclusive) of the randomized backoff.
    #[serde(with = "humantime_serde", default = "default_max_backoff")]
    pub max_backoff: Duration,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_min_backoff() -> Duration {
    Duration::from_millis(100)
}

fn default_max_backoff() -> Duration {
    Duration::from_millis(1000)
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            min_backoff: default_min_backoff(),
            max_backoff: default_max_backoff(),
        }
    }
}

impl RetryPolicy {
    /// A random delay in `[min_backoff, max_backoff)`.
    pub fn backoff(&self) -> Duration {
        if self.max_backoff <= self.min_backoff {
            return self.min_backoff;
        }
        rand::thread_rng().gen_range(self.min_backoff..self.max_backoff)
    }
}

/// Which filtered bulk operation to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByQueryKind {
    /// Update-by-query, optionally with a script.
    Update,
    /// Delete-by-query.
    Delete,
}

impl std::fmt::Display for ByQueryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ByQueryKind::Update => write!(f, "update"),
            ByQueryKind::Delete => write!(f, "delete"),
        }
    }
}

/// A filtered bulk operation bound to one document type.
#[derive(Debug, Clone)]
pub struct FilteredOperation {
    /// Document type the operation was requested for.
    pub doc_type: String,
    /// Update or delete.
    pub kind: ByQueryKind,
    /// Request sent on every attempt.
    pub request: ByQueryRequest,
    /// Human readable description used in logs.
    pub description: String,
}

/// Runs filtered bulk operations until they converge.
#[derive(Debug, Clone, Copy)]
pub struct ConflictRetryLoop<'a> {
    backend: &'a dyn IndexBackend,
    policy: &'a RetryPolicy,
}

impl<'a> ConflictRetryLoop<'a> {
    /// Binds the loop to a backend and a retry policy.
    pub fn new(backend: &'a dyn IndexBackend, policy: &'a RetryPolicy) -> Self {
        Self { backend, policy }
    }

    /// Runs the operation and reports whether any attempt changed documents.
    ///
    /// Fails with [`IndexError::IndexingFailure`] on the first failure that is
    /// not a version conflict, and with [`IndexError::ConflictExceeded`] when
    /// conflicts remain after the last attempt.
    pub async fn run(&self, op: &FilteredOperation) -> IndexResult<bool> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut changed = false;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let response = match op.kind {
                ByQueryKind::Update => self.backend.update_by_query(&op.request).await?,
                ByQueryKind::Delete => self.backend.delete_by_query(&op.request).await?,
            };
            changed |= response.changed();
            report(op, &response);

            let fatal: Vec<String> = response
                .failures
                .iter()
                .filter(|f| !f.is_version_conflict())
                .map(|f| match &f.id {
                    Some(id) => format!("{} ({}): {}", id, f.status, f.cause),
                    None => format!("({}): {}", f.status, f.cause),
                })
                .collect();
            if !fatal.is_empty() {
                for failure in &fatal {
                    error!(doc_type = %op.doc_type, "Index failure during bulk {}: {}", op.kind, failure);
                }
                return Err(IndexError::IndexingFailure {
                    index: op.request.index.clone(),
                    failures: fatal,
                });
            }

            let conflicts = response.conflicts();
            if conflicts == 0 {
                return Ok(changed);
            }
            for failure in response.failures.iter().filter(|f| f.is_version_conflict()) {
                warn!(doc_type = %op.doc_type, "Version conflict reason: {}", failure.cause);
            }

            if attempt >= max_attempts {
                return Err(IndexError::ConflictExceeded {
                    doc_type: op.doc_type.clone(),
                    operation: op.kind.to_string(),
                    attempts: attempt,
                    conflicts,
                });
            }

            let delay = self.policy.backoff();
            debug!(
                doc_type = %op.doc_type,
                attempt,
                conflicts,
                delay_ms = delay.as_millis() as u64,
                "Retrying bulk {} after version conflicts",
                op.kind
            );
            tokio::time::sleep(delay).await;
            self.backend
                .refresh(std::slice::from_ref(&op.request.index))
                .await?;
        }
    }
}

fn report(op: &FilteredOperation, response: &ByQueryResponse) {
    if response.updated > 0 {
        info!(
            doc_type = %op.doc_type,
            "Updated {} {} documents with bulk {}",
            response.updated, op.doc_type, op.description
        );
    }
    if response.deleted > 0 {
        info!(
            doc_type = %op.doc_type,
            "Deleted {} {} documents with bulk {}",
            response.deleted, op.doc_type, op.description
        );
    }
    if !response.changed() {
        warn!(
            doc_type = %op.doc_type,
            noops = response.noops,
            conflicts = response.version_conflicts,
            "Bulk {} could not be applied to {} documents",
            op.description,
            op.doc_type
        );
    }
}
