use crate::buffer::LocalBuffer;
use crate::error::{AgentError, AgentResult};
use chrono::{SecondsFormat, Utc};
use common::auth::{canonical_json, HmacSignatureService, SignatureService};
use common::domain::TelemetryEnvelope;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEVICE_ID_HEADER: &str = "x-device-id";
pub const TIMESTAMP_HEADER: &str = "x-timestamp";
pub const SIGNATURE_HEADER: &str = "x-signature";

#[derive(Debug, Clone)]
pub struct EdgeAgentConfig {
    /// Full URL of the ingestion endpoint, e.g. `http://localhost:3000/api/telemetry`
    pub endpoint: String,
    pub org_secret: String,
    pub device_id: String,
    pub device_secret: String,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted { sequence: u64 },
    /// The gateway could not take the reading now; it was kept locally.
    Buffered,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub sent: usize,
    pub remaining: usize,
}

#[derive(Debug, Deserialize)]
struct IngestAck {
    sequence: u64,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// Signs and posts envelopes for a single device.
pub struct EdgeAgent {
    client: Client,
    config: EdgeAgentConfig,
    signer: HmacSignatureService,
    buffer: LocalBuffer,
}

impl EdgeAgent {
    pub fn new(config: EdgeAgentConfig, buffer: LocalBuffer) -> AgentResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            client,
            config,
            signer: HmacSignatureService::new(),
            buffer,
        })
    }

    pub fn buffer(&self) -> &LocalBuffer {
        &self.buffer
    }

    /// Post one envelope. When the gateway signals backpressure or cannot
    /// be reached the envelope goes to the local buffer instead.
    pub async fn submit(&self, envelope: &TelemetryEnvelope) -> AgentResult<SubmitOutcome> {
        match self.send(envelope).await {
            Ok(sequence) => {
                info!(
                    device_id = %envelope.device_id,
                    sequence,
                    metrics = envelope.metrics.len(),
                    "telemetry accepted"
                );
                Ok(SubmitOutcome::Accepted { sequence })
            }
            Err(e) if e.is_retryable() => {
                let buffered = self.buffer.append(envelope).await?;
                warn!(error = %e, buffered, "telemetry buffered for retry");
                Ok(SubmitOutcome::Buffered)
            }
            Err(e) => Err(e),
        }
    }

    /// Resubmit buffered envelopes oldest first, each with a fresh
    /// timestamp and signature.
    ///
    /// Stops at the first retryable failure so ordering is kept; envelopes
    /// the gateway rejects outright stay buffered as well.
    pub async fn flush_buffer(&self) -> AgentResult<FlushReport> {
        let pending = self.buffer.entries().await?;
        if pending.is_empty() {
            return Ok(FlushReport::default());
        }

        debug!(pending = pending.len(), "flushing local buffer");
        let mut report = FlushReport::default();

        for envelope in &pending {
            match self.send(envelope).await {
                Ok(_) => {
                    // Removed one at a time so a crash costs at most one resend
                    self.buffer.remove(envelope).await?;
                    report.sent += 1;
                }
                Err(e) if e.is_retryable() => break,
                Err(e) => {
                    warn!(error = %e, ts = %envelope.ts, "buffered telemetry rejected");
                }
            }
        }

        report.remaining = pending.len() - report.sent;

        if report.sent > 0 {
            info!(
                sent = report.sent,
                remaining = report.remaining,
                "buffered telemetry flushed"
            );
        }
        Ok(report)
    }

    async fn send(&self, envelope: &TelemetryEnvelope) -> AgentResult<u64> {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let body = canonical_json(envelope)?;
        let signature = self
            .signer
            .compute(&self.config.device_secret, &timestamp, &body)?;

        let response = self
            .client
            .post(&self.config.endpoint)
            .header(CONTENT_TYPE, "application/json")
            .bearer_auth(&self.config.org_secret)
            .header(DEVICE_ID_HEADER, &self.config.device_id)
            .header(TIMESTAMP_HEADER, &timestamp)
            .header(SIGNATURE_HEADER, signature)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            let ack: IngestAck = response.json().await?;
            return Ok(ack.sequence);
        }

        let message = match response.json::<ErrorBody>().await {
            Ok(body) => body.error,
            Err(_) => status.to_string(),
        };
        Err(AgentError::Rejected {
            status: status.as_u16(),
            message,
        })
    }
}
