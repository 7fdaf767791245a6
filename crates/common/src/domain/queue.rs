use crate::domain::{DomainResult, NewQueueEntry, QueueEntry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Which implementation sits behind a `TelemetryQueue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    /// Bounded, in-process, lost on restart.
    Volatile,
    /// External append-only log with a persisted consumer cursor.
    Durable,
}

/// Entries read past the committed cursor of a durable backend.
///
/// `last_sequence` may be ahead of the last entry when undecodable
/// records were skipped; committing advances past them too.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueueBatch {
    pub entries: Vec<QueueEntry>,
    pub last_sequence: Option<u64>,
}

impl QueueBatch {
    pub fn is_empty(&self) -> bool {
        self.last_sequence.is_none()
    }
}

/// Buffer between the ingestion gateway and the batch worker.
///
/// Implementations:
/// - must serialize concurrent `enqueue`/`dequeue` calls so FIFO order holds
/// - return `QueueUnavailable` when an append cannot be confirmed
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait TelemetryQueue: Send + Sync {
    fn backend(&self) -> QueueBackend;

    /// Entries dropped by the capacity policy since startup.
    fn evictions(&self) -> u64;

    /// Append an entry, returning the position assigned to it.
    async fn enqueue(&self, entry: NewQueueEntry) -> DomainResult<u64>;

    /// Remove and return the oldest entry.
    async fn dequeue(&self) -> DomainResult<Option<QueueEntry>>;

    /// Entries currently waiting to be consumed.
    async fn size(&self) -> DomainResult<u64>;

    /// Read up to `max` entries past the committed cursor without consuming them.
    ///
    /// Returns `None` for backends that have no durable cursor; the batch
    /// worker treats that as "nothing to drain".
    async fn read_batch(&self, max: usize) -> DomainResult<Option<QueueBatch>>;

    /// Advance the committed cursor past everything in `batch`.
    async fn commit(&self, batch: &QueueBatch) -> DomainResult<()>;
}

/// Non-destructive windowed read over retained entries.
#[derive(Debug, Clone, PartialEq)]
pub struct RecentTelemetryQuery {
    pub since: DateTime<Utc>,
    pub device_id: Option<String>,
}

/// Retained window used by the aggregation fallback.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait RecentTelemetry: Send + Sync {
    /// Entries whose envelope timestamp is at or after `since`, oldest first.
    async fn recent(&self, query: RecentTelemetryQuery) -> DomainResult<Vec<QueueEntry>>;
}
