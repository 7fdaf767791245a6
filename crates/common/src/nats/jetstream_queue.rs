use crate::domain::{
    DomainError, DomainResult, NewQueueEntry, QueueBackend, QueueBatch, QueueEntry,
    TelemetryQueue,
};
use crate::nats::{JetStreamConsumer, JetStreamPublisher, LogRecord, PullConsumer};
use async_nats::jetstream;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

#[derive(Debug, Clone)]
pub struct JetStreamQueueConfig {
    pub stream: String,
    pub subject: String,
    pub consumer_name: String,
    /// How long a fetch waits for the batch to fill before returning what it has.
    pub fetch_wait: Duration,
}

/// Durable queue backed by a JetStream stream.
///
/// Appends are atomic publishes confirmed by the server. Reads go through a
/// durable pull consumer whose acknowledged position is the committed
/// cursor, so a restarted worker resumes after the last committed batch
/// instead of re-reading the stream from the start.
pub struct JetStreamTelemetryQueue {
    publisher: Arc<dyn JetStreamPublisher>,
    consumer: Box<dyn PullConsumer>,
    subject: String,
    fetch_wait: Duration,
    read_lock: Mutex<()>,
}

impl JetStreamTelemetryQueue {
    pub async fn new(
        consumer_client: Arc<dyn JetStreamConsumer>,
        publisher: Arc<dyn JetStreamPublisher>,
        config: JetStreamQueueConfig,
    ) -> anyhow::Result<Self> {
        debug!(
            stream = %config.stream,
            consumer = %config.consumer_name,
            subject = %config.subject,
            "creating durable telemetry consumer"
        );

        let consumer = consumer_client
            .create_consumer(
                jetstream::consumer::pull::Config {
                    name: Some(config.consumer_name.clone()),
                    durable_name: Some(config.consumer_name.clone()),
                    filter_subject: config.subject.clone(),
                    ack_policy: jetstream::consumer::AckPolicy::All,
                    deliver_policy: jetstream::consumer::DeliverPolicy::All,
                    ..Default::default()
                },
                &config.stream,
            )
            .await?;

        Ok(Self {
            publisher,
            consumer,
            subject: config.subject,
            fetch_wait: config.fetch_wait,
            read_lock: Mutex::new(()),
        })
    }

    fn decode(record: &LogRecord) -> Option<QueueEntry> {
        match serde_json::from_slice::<NewQueueEntry>(&record.payload) {
            Ok(entry) => Some(QueueEntry::from_new(entry, record.sequence)),
            Err(e) => {
                warn!(
                    sequence = record.sequence,
                    error = %e,
                    "skipping undecodable telemetry record"
                );
                None
            }
        }
    }
}

#[async_trait]
impl TelemetryQueue for JetStreamTelemetryQueue {
    fn backend(&self) -> QueueBackend {
        QueueBackend::Durable
    }

    /// Appends never evict. Old messages age out server-side under the
    /// stream limits and are not counted here.
    fn evictions(&self) -> u64 {
        0
    }

    async fn enqueue(&self, entry: NewQueueEntry) -> DomainResult<u64> {
        let payload = serde_json::to_vec(&entry)
            .map_err(|e| DomainError::RepositoryError(anyhow::anyhow!(e)))?;

        self.publisher
            .publish(self.subject.clone(), payload.into())
            .await
            .map_err(|e| {
                error!(error = %e, device_id = %entry.envelope.device_id, "append to stream failed");
                DomainError::QueueUnavailable(e.to_string())
            })
    }

    async fn dequeue(&self) -> DomainResult<Option<QueueEntry>> {
        let _guard = self.read_lock.lock().await;

        let records = self
            .consumer
            .fetch_records(1, self.fetch_wait)
            .await
            .map_err(|e| DomainError::QueueUnavailable(e.to_string()))?;
        let Some(record) = records.into_iter().next() else {
            return Ok(None);
        };

        self.consumer
            .ack_through(record.sequence)
            .await
            .map_err(|e| DomainError::QueueUnavailable(e.to_string()))?;

        Ok(Self::decode(&record))
    }

    async fn size(&self) -> DomainResult<u64> {
        self.consumer
            .pending()
            .await
            .map_err(|e| DomainError::QueueUnavailable(e.to_string()))
    }

    async fn read_batch(&self, max: usize) -> DomainResult<Option<QueueBatch>> {
        let _guard = self.read_lock.lock().await;

        let records = self
            .consumer
            .fetch_records(max, self.fetch_wait)
            .await
            .map_err(|e| DomainError::QueueUnavailable(e.to_string()))?;

        let last_sequence = records.iter().map(|record| record.sequence).max();
        let entries = records.iter().filter_map(Self::decode).collect();

        Ok(Some(QueueBatch {
            entries,
            last_sequence,
        }))
    }

    async fn commit(&self, batch: &QueueBatch) -> DomainResult<()> {
        let Some(sequence) = batch.last_sequence else {
            return Ok(());
        };

        self.consumer
            .ack_through(sequence)
            .await
            .map_err(|e| DomainError::QueueUnavailable(e.to_string()))?;

        debug!(sequence, "committed telemetry cursor");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Metric, TelemetryEnvelope};
    use crate::nats::{MockJetStreamConsumer, MockJetStreamPublisher, MockPullConsumer};
    use bytes::Bytes;
    use chrono::Utc;

    fn config() -> JetStreamQueueConfig {
        JetStreamQueueConfig {
            stream: "telemetry".to_string(),
            subject: "telemetry.ingest".to_string(),
            consumer_name: "telemetry-worker".to_string(),
            fetch_wait: Duration::from_millis(100),
        }
    }

    fn new_entry(device_id: &str) -> NewQueueEntry {
        NewQueueEntry {
            envelope: TelemetryEnvelope {
                version: "1.0".to_string(),
                device_id: device_id.to_string(),
                ts: "2025-01-07T12:00:00.000Z".to_string(),
                metrics: vec![Metric {
                    name: "power_active_w".to_string(),
                    value: 900.0,
                    unit: "W".to_string(),
                }],
                tags: None,
            },
            received_at: Utc::now(),
        }
    }

    fn record(sequence: u64, entry: &NewQueueEntry) -> LogRecord {
        LogRecord {
            sequence,
            payload: Bytes::from(serde_json::to_vec(entry).unwrap()),
        }
    }

    async fn queue_with(
        consumer: MockPullConsumer,
        publisher: MockJetStreamPublisher,
    ) -> JetStreamTelemetryQueue {
        let mut consumer_client = MockJetStreamConsumer::new();
        consumer_client
            .expect_create_consumer()
            .withf(
                |config: &jetstream::consumer::pull::Config, stream_name: &str| {
                    config.durable_name.as_deref() == Some("telemetry-worker")
                        && config.ack_policy == jetstream::consumer::AckPolicy::All
                        && config.filter_subject == "telemetry.ingest"
                        && stream_name == "telemetry"
                },
            )
            .times(1)
            .return_once(move |_, _| Ok(Box::new(consumer)));

        JetStreamTelemetryQueue::new(Arc::new(consumer_client), Arc::new(publisher), config())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_returns_stream_sequence() {
        // Arrange
        let mut publisher = MockJetStreamPublisher::new();
        publisher
            .expect_publish()
            .withf(|subject: &String, payload: &Bytes| {
                let decoded: NewQueueEntry = serde_json::from_slice(payload).unwrap();
                subject == "telemetry.ingest" && decoded.envelope.device_id == "dev-001"
            })
            .times(1)
            .returning(|_, _| Ok(42));
        let queue = queue_with(MockPullConsumer::new(), publisher).await;

        // Act
        let sequence = queue.enqueue(new_entry("dev-001")).await;

        // Assert
        assert_eq!(sequence.unwrap(), 42);
        assert_eq!(queue.backend(), QueueBackend::Durable);
    }

    #[tokio::test]
    async fn test_enqueue_failure_is_queue_unavailable() {
        let mut publisher = MockJetStreamPublisher::new();
        publisher
            .expect_publish()
            .times(1)
            .returning(|_, _| Err(anyhow::anyhow!("no responders")));
        let queue = queue_with(MockPullConsumer::new(), publisher).await;

        let result = queue.enqueue(new_entry("dev-001")).await;

        assert!(matches!(result, Err(DomainError::QueueUnavailable(_))));
    }

    #[tokio::test]
    async fn test_read_batch_skips_undecodable_but_covers_them() {
        // Arrange
        let good = new_entry("dev-001");
        let records = vec![
            record(7, &good),
            LogRecord {
                sequence: 8,
                payload: Bytes::from_static(b"not json"),
            },
        ];
        let mut consumer = MockPullConsumer::new();
        consumer
            .expect_fetch_records()
            .withf(|max, _| *max == 50)
            .times(1)
            .return_once(move |_, _| Ok(records));
        consumer
            .expect_ack_through()
            .with(mockall::predicate::eq(8))
            .times(1)
            .returning(|_| Ok(()));
        let queue = queue_with(consumer, MockJetStreamPublisher::new()).await;

        // Act
        let batch = queue.read_batch(50).await.unwrap().unwrap();
        queue.commit(&batch).await.unwrap();

        // Assert
        assert_eq!(batch.entries.len(), 1);
        assert_eq!(batch.entries[0].sequence, 7);
        assert_eq!(batch.last_sequence, Some(8));
    }

    #[tokio::test]
    async fn test_commit_of_empty_batch_does_not_ack() {
        let mut consumer = MockPullConsumer::new();
        consumer.expect_ack_through().times(0);
        let queue = queue_with(consumer, MockJetStreamPublisher::new()).await;

        queue.commit(&QueueBatch::default()).await.unwrap();
    }

    #[tokio::test]
    async fn test_dequeue_acks_single_record() {
        let entry = new_entry("dev-002");
        let records = vec![record(3, &entry)];
        let mut consumer = MockPullConsumer::new();
        consumer
            .expect_fetch_records()
            .withf(|max, _| *max == 1)
            .times(1)
            .return_once(move |_, _| Ok(records));
        consumer
            .expect_ack_through()
            .with(mockall::predicate::eq(3))
            .times(1)
            .returning(|_| Ok(()));
        let queue = queue_with(consumer, MockJetStreamPublisher::new()).await;

        let dequeued = queue.dequeue().await.unwrap().unwrap();

        assert_eq!(dequeued.envelope.device_id, "dev-002");
        assert_eq!(dequeued.sequence, 3);
    }

    #[tokio::test]
    async fn test_size_reports_pending() {
        let mut consumer = MockPullConsumer::new();
        consumer.expect_pending().times(1).returning(|| Ok(12));
        let queue = queue_with(consumer, MockJetStreamPublisher::new()).await;

        assert_eq!(queue.size().await.unwrap(), 12);
    }
}
