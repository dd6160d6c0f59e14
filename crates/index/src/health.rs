//! Cluster readiness after index creation.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::backend::{ClusterHealth, HealthStatus, IndexBackend};
use crate::error::{BackendError, IndexResult};
use crate::settings::Settings;

/// Polls cluster health until the given indices are at least yellow.
///
/// Every poll asks the backend to wait at most `poll_timeout` for the status,
/// so a single unresponsive poll cannot use up the whole `deadline`. There is
/// no extra delay between polls.
#[derive(Debug, Clone, Copy)]
pub struct ReadinessWaiter<'a> {
    backend: &'a dyn IndexBackend,
    deadline: Duration,
    poll_timeout: Duration,
}

impl<'a> ReadinessWaiter<'a> {
    /// Polls for at most `deadline`, each poll waiting up to `poll_timeout`.
    pub fn new(backend: &'a dyn IndexBackend, deadline: Duration, poll_timeout: Duration) -> Self {
        Self {
            backend,
            deadline,
            poll_timeout,
        }
    }

    /// Deadline from `cluster_health_timeout`, poll timeout half of `socket_timeout`.
    pub fn from_settings(backend: &'a dyn IndexBackend, settings: &Settings) -> Self {
        Self::new(
            backend,
            settings.cluster_health_timeout(),
            settings.socket_timeout() / 2,
        )
    }

    /// Blocks until the indices are ready. An empty list returns immediately.
    pub async fn wait_ready(&self, indices: &[String]) -> IndexResult<Option<ClusterHealth>> {
        if indices.is_empty() {
            return Ok(None);
        }

        let start = Instant::now();
        let mut polls = 0u32;
        loop {
            polls += 1;
            let health = self.backend.cluster_health(indices, self.poll_timeout).await?;
            let elapsed = start.elapsed();
            if !health.timed_out {
                info!(
                    indices = ?indices,
                    status = %health.status,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Cluster health reported ready"
                );
                return Ok(Some(health));
            }
            debug!(indices = ?indices, polls, status = %health.status, "Cluster health poll timed out");
            if elapsed >= self.deadline {
                return Err(BackendError::ReadinessTimeout {
                    indices: indices.to_vec(),
                    status: HealthStatus::Yellow.to_string(),
                    elapsed_ms: elapsed.as_millis() as u64,
                }
                .into());
            }
        }
    }
}
