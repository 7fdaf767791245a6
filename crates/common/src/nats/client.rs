use crate::nats::traits::{JetStreamConsumer, JetStreamPublisher, LogRecord, PullConsumer};
use anyhow::{Context, Result};
use async_nats::jetstream::{self, stream::Config as StreamConfig};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument};

pub struct NatsClient {
    jetstream: jetstream::Context,
}

impl NatsClient {
    pub async fn connect(url: &str, timeout: std::time::Duration) -> Result<Self> {
        info!(url = %url, timeout_ms = timeout.as_millis(), "Connecting to NATS");

        // Configure connection timeout for establishing the TCP connection
        let client = async_nats::ConnectOptions::new()
            .connection_timeout(timeout)
            .connect(url)
            .await
            .context("Failed to connect to NATS")?;

        let jetstream = jetstream::new(client);

        info!("Successfully connected to NATS");
        Ok(Self { jetstream })
    }

    /// Create the stream if it is missing. Messages are retained until they
    /// exceed `limits`, so acknowledged entries stay replayable for a while
    /// without the stream growing forever.
    pub async fn ensure_stream(
        &self,
        stream_name: &str,
        subject: &str,
        limits: StreamLimits,
    ) -> Result<()> {
        info!(
            stream = %stream_name,
            subject = %subject,
            max_age_secs = limits.max_age.as_secs(),
            max_bytes = limits.max_bytes,
            "Ensuring stream exists"
        );

        let stream_config = stream_config(stream_name, subject, limits);

        match self.jetstream.get_stream(stream_name).await {
            Ok(_) => {
                info!(stream = %stream_name, "Stream already exists");
            }
            Err(_) => {
                self.jetstream
                    .create_stream(stream_config)
                    .await
                    .context("Failed to create stream")?;
                info!(stream = %stream_name, "Created stream");
            }
        }

        Ok(())
    }

    /// Create a JetStreamConsumer trait object from this client
    pub fn create_consumer_client(&self) -> Arc<dyn JetStreamConsumer> {
        Arc::new(NatsJetStreamConsumer::new(self.jetstream.clone()))
    }

    /// Create a JetStreamPublisher trait object from this client
    pub fn create_publisher_client(&self) -> Arc<dyn JetStreamPublisher> {
        Arc::new(NatsJetStreamPublisher::new(self.jetstream.clone()))
    }

    pub async fn close(self) {
        info!("Closing NATS connection");
        // Connection closes automatically when dropped
    }
}

/// Retention bounds for the telemetry stream. The oldest messages are
/// discarded once either bound is exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamLimits {
    pub max_age: Duration,
    pub max_bytes: i64,
}

impl Default for StreamLimits {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(7 * 24 * 60 * 60),
            max_bytes: 1024 * 1024 * 1024,
        }
    }
}

fn stream_config(stream_name: &str, subject: &str, limits: StreamLimits) -> StreamConfig {
    StreamConfig {
        name: stream_name.to_string(),
        subjects: vec![subject.to_string()],
        description: Some("Signed device telemetry awaiting persistence".to_string()),
        retention: jetstream::stream::RetentionPolicy::Limits,
        discard: jetstream::stream::DiscardPolicy::Old,
        max_age: limits.max_age,
        max_bytes: limits.max_bytes,
        ..Default::default()
    }
}

/// Concrete implementation of JetStreamConsumer using async-nats
pub struct NatsJetStreamConsumer {
    context: jetstream::Context,
}

impl NatsJetStreamConsumer {
    pub fn new(context: jetstream::Context) -> Self {
        Self { context }
    }
}

#[async_trait]
impl JetStreamConsumer for NatsJetStreamConsumer {
    async fn create_consumer(
        &self,
        config: jetstream::consumer::pull::Config,
        stream_name: &str,
    ) -> Result<Box<dyn PullConsumer>> {
        let consumer = self
            .context
            .create_consumer_on_stream(config, stream_name)
            .await
            .context("Failed to create consumer")?;

        Ok(Box::new(NatsPullConsumer {
            consumer,
            in_flight: Mutex::new(BTreeMap::new()),
        }))
    }
}

/// Concrete implementation of PullConsumer using async-nats
///
/// Fetched messages are held until acknowledged so that a cumulative ack
/// can be sent on the highest one.
pub struct NatsPullConsumer {
    consumer: jetstream::consumer::PullConsumer,
    in_flight: Mutex<BTreeMap<u64, jetstream::Message>>,
}

#[async_trait]
impl PullConsumer for NatsPullConsumer {
    async fn fetch_records(
        &self,
        max_messages: usize,
        expires: std::time::Duration,
    ) -> Result<Vec<LogRecord>> {
        use futures::StreamExt;

        let mut messages = self
            .consumer
            .fetch()
            .max_messages(max_messages)
            .expires(expires)
            .messages()
            .await
            .context("Failed to fetch messages")?;

        let mut records = Vec::new();
        let mut in_flight = self.in_flight.lock().await;
        while let Some(msg) = messages.next().await {
            match msg {
                Ok(message) => {
                    let sequence = match message.info() {
                        Ok(info) => info.stream_sequence,
                        Err(e) => {
                            error!(error = %e, "Message without JetStream metadata");
                            continue;
                        }
                    };
                    records.push(LogRecord {
                        sequence,
                        payload: message.payload.clone(),
                    });
                    in_flight.insert(sequence, message);
                }
                Err(e) => {
                    error!(error = %e, "Error receiving message");
                    // Continue processing other messages
                }
            }
        }

        debug!(count = records.len(), "Fetched records");
        Ok(records)
    }

    async fn ack_through(&self, sequence: u64) -> Result<()> {
        let mut in_flight = self.in_flight.lock().await;

        let Some(message) = in_flight.get(&sequence) else {
            anyhow::bail!("No in-flight message with sequence {}", sequence);
        };

        // AckPolicy::All: acking the highest sequence acknowledges everything before it
        message
            .ack()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to ack message {}: {}", sequence, e))?;

        let still_pending = in_flight.split_off(&(sequence + 1));
        *in_flight = still_pending;
        Ok(())
    }

    async fn pending(&self) -> Result<u64> {
        let mut consumer = self.consumer.clone();
        let info = consumer
            .info()
            .await
            .context("Failed to read consumer info")?;

        Ok(info.num_pending + info.num_ack_pending as u64)
    }
}

/// Concrete implementation of JetStreamPublisher using async-nats
pub struct NatsJetStreamPublisher {
    context: jetstream::Context,
}

impl NatsJetStreamPublisher {
    pub fn new(context: jetstream::Context) -> Self {
        Self { context }
    }
}

#[async_trait]
impl JetStreamPublisher for NatsJetStreamPublisher {
    #[instrument(skip(self, payload), fields(subject = %subject, payload_size = payload.len()))]
    async fn publish(&self, subject: String, payload: bytes::Bytes) -> Result<u64> {
        let ack = self
            .context
            .publish(subject, payload)
            .await
            .context("Failed to publish message to JetStream")?;

        let ack = ack
            .await
            .context("Failed to receive JetStream acknowledgment")?;
        Ok(ack.sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_config_is_bounded() {
        let limits = StreamLimits {
            max_age: Duration::from_secs(3600),
            max_bytes: 4096,
        };

        let config = stream_config("telemetry", "telemetry.ingest", limits);

        assert_eq!(config.name, "telemetry");
        assert_eq!(config.subjects, vec!["telemetry.ingest".to_string()]);
        assert_eq!(config.max_age, Duration::from_secs(3600));
        assert_eq!(config.max_bytes, 4096);
        assert_eq!(config.discard, jetstream::stream::DiscardPolicy::Old);
    }

    #[test]
    fn test_default_limits_are_finite() {
        let limits = StreamLimits::default();

        assert!(limits.max_age > Duration::ZERO);
        assert!(limits.max_bytes > 0);
    }
}
