use crate::domain::{
    DomainResult, NewQueueEntry, QueueBackend, QueueBatch, QueueEntry, RecentTelemetry,
    RecentTelemetryQuery, TelemetryQueue,
};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

struct Ring {
    entries: VecDeque<QueueEntry>,
    next_sequence: u64,
}

/// Bounded in-process queue.
///
/// One ring buffer backs two views: `dequeue` is a destructive consumer
/// cursor and `recent` is a non-destructive windowed read. Appending past
/// capacity drops the oldest entry and bumps the eviction counter.
pub struct VolatileTelemetryQueue {
    ring: Mutex<Ring>,
    capacity: usize,
    evicted: AtomicU64,
}

impl Default for VolatileTelemetryQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl VolatileTelemetryQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ring: Mutex::new(Ring {
                entries: VecDeque::with_capacity(capacity.min(DEFAULT_QUEUE_CAPACITY)),
                next_sequence: 1,
            }),
            capacity,
            evicted: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries discarded because the queue was full.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl TelemetryQueue for VolatileTelemetryQueue {
    fn backend(&self) -> QueueBackend {
        QueueBackend::Volatile
    }

    fn evictions(&self) -> u64 {
        self.evicted()
    }

    async fn enqueue(&self, entry: NewQueueEntry) -> DomainResult<u64> {
        let mut ring = self.ring.lock().await;

        if ring.entries.len() >= self.capacity {
            if let Some(dropped) = ring.entries.pop_front() {
                let total = self.evicted.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    device_id = %dropped.envelope.device_id,
                    sequence = dropped.sequence,
                    evicted_total = total,
                    "queue full, evicted oldest entry"
                );
            }
        }

        let sequence = ring.next_sequence;
        ring.next_sequence += 1;
        ring.entries.push_back(QueueEntry::from_new(entry, sequence));

        debug!(sequence, size = ring.entries.len(), "enqueued telemetry");
        Ok(sequence)
    }

    async fn dequeue(&self) -> DomainResult<Option<QueueEntry>> {
        Ok(self.ring.lock().await.entries.pop_front())
    }

    async fn size(&self) -> DomainResult<u64> {
        Ok(self.ring.lock().await.entries.len() as u64)
    }

    async fn read_batch(&self, _max: usize) -> DomainResult<Option<QueueBatch>> {
        Ok(None)
    }

    async fn commit(&self, _batch: &QueueBatch) -> DomainResult<()> {
        Ok(())
    }
}

#[async_trait]
impl RecentTelemetry for VolatileTelemetryQueue {
    async fn recent(&self, query: RecentTelemetryQuery) -> DomainResult<Vec<QueueEntry>> {
        let ring = self.ring.lock().await;

        Ok(ring
            .entries
            .iter()
            .filter(|entry| {
                query
                    .device_id
                    .as_deref()
                    .map_or(true, |device_id| entry.envelope.device_id == device_id)
            })
            .filter(|entry| {
                entry
                    .envelope
                    .occurred_at()
                    .is_some_and(|occurred_at| occurred_at >= query.since)
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Metric, TelemetryEnvelope};
    use chrono::{DateTime, TimeDelta, Utc};
    use std::sync::Arc;

    fn entry(device_id: &str, ts: DateTime<Utc>, power: f64) -> NewQueueEntry {
        NewQueueEntry {
            envelope: TelemetryEnvelope {
                version: "1.0".to_string(),
                device_id: device_id.to_string(),
                ts: ts.to_rfc3339(),
                metrics: vec![Metric {
                    name: "power_active_w".to_string(),
                    value: power,
                    unit: "W".to_string(),
                }],
                tags: None,
            },
            received_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_dequeue_is_fifo() {
        let queue = VolatileTelemetryQueue::new(10);
        let now = Utc::now();

        queue.enqueue(entry("dev-001", now, 1.0)).await.unwrap();
        queue.enqueue(entry("dev-001", now, 2.0)).await.unwrap();

        let first = queue.dequeue().await.unwrap().unwrap();
        let second = queue.dequeue().await.unwrap().unwrap();

        assert_eq!(first.envelope.metric("power_active_w"), Some(1.0));
        assert_eq!(second.envelope.metric("power_active_w"), Some(2.0));
        assert!(first.sequence < second.sequence);
        assert!(queue.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_overflow_evicts_oldest_and_counts() {
        // Arrange
        let capacity = 100;
        let overflow = 7;
        let queue = VolatileTelemetryQueue::new(capacity);
        let now = Utc::now();

        // Act
        for i in 0..(capacity + overflow) {
            queue
                .enqueue(entry("dev-001", now, i as f64))
                .await
                .unwrap();
        }

        // Assert
        assert_eq!(queue.size().await.unwrap(), capacity as u64);
        assert_eq!(queue.evicted(), overflow as u64);
        let oldest = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(oldest.envelope.metric("power_active_w"), Some(overflow as f64));
    }

    #[tokio::test]
    async fn test_default_capacity() {
        let queue = VolatileTelemetryQueue::default();
        assert_eq!(queue.capacity(), 10_000);
    }

    #[tokio::test]
    async fn test_recent_is_non_destructive_and_filtered() {
        let queue = VolatileTelemetryQueue::new(10);
        let now = Utc::now();

        queue
            .enqueue(entry("dev-001", now - TimeDelta::hours(30), 1.0))
            .await
            .unwrap();
        queue.enqueue(entry("dev-001", now, 2.0)).await.unwrap();
        queue.enqueue(entry("dev-002", now, 3.0)).await.unwrap();

        let recent = queue
            .recent(RecentTelemetryQuery {
                since: now - TimeDelta::hours(24),
                device_id: Some("dev-001".to_string()),
            })
            .await
            .unwrap();

        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].envelope.metric("power_active_w"), Some(2.0));
        assert_eq!(queue.size().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_read_batch_has_no_durable_cursor() {
        let queue = VolatileTelemetryQueue::new(10);
        queue.enqueue(entry("dev-001", Utc::now(), 1.0)).await.unwrap();

        assert!(queue.read_batch(50).await.unwrap().is_none());
        assert_eq!(queue.backend(), QueueBackend::Volatile);
    }

    #[tokio::test]
    async fn test_concurrent_enqueues_respect_capacity() {
        let queue = Arc::new(VolatileTelemetryQueue::new(50));
        let now = Utc::now();

        let mut handles = Vec::new();
        for task in 0..8 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..25 {
                    queue
                        .enqueue(entry("dev-001", now, (task * 100 + i) as f64))
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(queue.size().await.unwrap(), 50);
        assert_eq!(queue.evicted(), 150);
    }
}
