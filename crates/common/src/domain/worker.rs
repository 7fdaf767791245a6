use crate::domain::DomainResult;
use async_trait::async_trait;
use serde::Serialize;

/// Counters reported by the batch worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStats {
    pub running: bool,
    pub batches_written: u64,
    pub records_written: u64,
    pub batches_dropped: u64,
}

/// Start/stop control over the background batch worker.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait WorkerControl: Send + Sync {
    /// Idempotent: returns `Ok(false)` when already running.
    async fn start(&self) -> DomainResult<bool>;

    /// Returns `false` when the worker was not running.
    async fn stop(&self) -> bool;

    fn stats(&self) -> WorkerStats;
}
