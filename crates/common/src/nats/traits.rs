use anyhow::Result;
use async_nats::jetstream;
use async_trait::async_trait;
use bytes::Bytes;

/// A message read from a stream, identified by its stream sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub sequence: u64,
    pub payload: Bytes,
}

/// Trait for JetStream consumer operations
/// Abstracts the operations needed to create a NATS JetStream consumer
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait JetStreamConsumer: Send + Sync {
    /// Create (or bind to) a durable pull consumer on a stream
    async fn create_consumer(
        &self,
        config: jetstream::consumer::pull::Config,
        stream_name: &str,
    ) -> Result<Box<dyn PullConsumer>>;
}

/// Trait for pull consumer operations
/// Abstracts fetch, cumulative ack and backlog inspection on a durable consumer
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait PullConsumer: Send + Sync {
    /// Fetch up to max_messages, waiting up to expires for the batch to fill
    async fn fetch_records(
        &self,
        max_messages: usize,
        expires: std::time::Duration,
    ) -> Result<Vec<LogRecord>>;

    /// Acknowledge every fetched record up to and including `sequence`
    async fn ack_through(&self, sequence: u64) -> Result<()>;

    /// Records not yet acknowledged by this consumer
    async fn pending(&self) -> Result<u64>;
}

/// Trait for JetStream publisher operations
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait JetStreamPublisher: Send + Sync {
    /// Publish a message and await the server acknowledgment.
    /// Returns the stream sequence assigned to the message.
    async fn publish(&self, subject: String, payload: Bytes) -> Result<u64>;
}
