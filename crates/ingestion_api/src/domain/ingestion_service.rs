use crate::domain::IngestionMetrics;
use common::auth::{canonical_json, ReplayWindow, SignatureService};
use common::domain::{
    with_timeout, DeviceRegistry, DomainError, DomainResult, NewQueueEntry, TelemetryEnvelope,
    TelemetryQueue,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq;
use tracing::{debug, info, instrument, warn};

const PAYLOAD_PREVIEW_CHARS: usize = 200;

/// A signed submission as it arrives at the gateway.
///
/// Header values are optional so that absence is reported by the service
/// rather than by the transport layer.
#[derive(Debug, Clone, Default)]
pub struct IngestTelemetryInput {
    pub authorization: Option<String>,
    pub device_id: Option<String>,
    pub timestamp: Option<String>,
    pub signature: Option<String>,
    /// Raw request body, decoded only once the headers have been checked.
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IngestTelemetryOutput {
    pub device_id: String,
    pub sequence: u64,
}

/// Authenticates, validates and enqueues device telemetry.
///
/// Checks run in a fixed order and the first failure ends the request:
/// 1. required headers present
/// 2. organization bearer secret
/// 3. replay window
/// 4. device secret resolvable
/// 5. body parses as JSON
/// 6. envelope structure
/// 7. payload device id matches header
/// 8. signature over the canonical payload
/// 9. enqueue, retried once
/// 10. best-effort "mark seen"
pub struct IngestionService {
    device_registry: Arc<dyn DeviceRegistry>,
    queue: Arc<dyn TelemetryQueue>,
    signature_service: Arc<dyn SignatureService>,
    replay_window: ReplayWindow,
    org_secret: String,
    io_timeout: Duration,
    metrics: Arc<IngestionMetrics>,
}

impl IngestionService {
    pub fn new(
        device_registry: Arc<dyn DeviceRegistry>,
        queue: Arc<dyn TelemetryQueue>,
        signature_service: Arc<dyn SignatureService>,
        replay_window: ReplayWindow,
        org_secret: String,
        io_timeout: Duration,
        metrics: Arc<IngestionMetrics>,
    ) -> Self {
        Self {
            device_registry,
            queue,
            signature_service,
            replay_window,
            org_secret,
            io_timeout,
            metrics,
        }
    }

    pub fn metrics(&self) -> &Arc<IngestionMetrics> {
        &self.metrics
    }

    #[instrument(skip(self, input), fields(device_id = input.device_id.as_deref().unwrap_or("")))]
    pub async fn ingest(&self, input: IngestTelemetryInput) -> DomainResult<IngestTelemetryOutput> {
        let started = Instant::now();

        let authorization = required(input.authorization, "Authorization")?;
        let device_id = required(input.device_id, "X-Device-Id")?;
        let timestamp = required(input.timestamp, "X-Timestamp")?;
        let signature = required(input.signature, "X-Signature")?;

        if !self.org_secret_matches(&authorization) {
            self.metrics.record_auth_failure();
            warn!(device_id = %device_id, "rejected request with invalid organization secret");
            return Err(DomainError::Unauthorized);
        }

        if let Err(e) = self.replay_window.check(&timestamp) {
            self.metrics.record_timestamp_failure();
            warn!(device_id = %device_id, timestamp = %timestamp, "timestamp outside replay window");
            return Err(e);
        }

        let device_secret = with_timeout(
            "device lookup",
            self.io_timeout,
            self.device_registry.resolve_secret(&device_id),
        )
        .await?;
        let Some(device_secret) = device_secret else {
            self.metrics.record_auth_failure();
            warn!(device_id = %device_id, "unknown device");
            return Err(DomainError::UnknownDevice(device_id));
        };

        let payload: serde_json::Value = serde_json::from_slice(&input.body)
            .map_err(|e| DomainError::InvalidJson(e.to_string()))?;

        let envelope = TelemetryEnvelope::try_from(&payload)?;

        if envelope.device_id != device_id {
            return Err(DomainError::DeviceIdMismatch {
                header: device_id,
                payload: envelope.device_id,
            });
        }

        let canonical = canonical_json(&payload)?;
        let expected = self
            .signature_service
            .compute(&device_secret, &timestamp, &canonical)?;
        if !self.signature_service.verify(&signature, &expected) {
            self.metrics.record_signature_failure();
            warn!(device_id = %device_id, "signature mismatch");
            return Err(DomainError::SignatureMismatch);
        }

        let sequence = self
            .enqueue_with_retry(NewQueueEntry {
                envelope,
                received_at: chrono::Utc::now(),
            })
            .await?;

        self.mark_seen_in_background(device_id.clone());

        self.metrics.record_received();
        info!(
            device_id = %device_id,
            sequence = sequence,
            latency_ms = started.elapsed().as_millis() as u64,
            "telemetry accepted"
        );
        debug!(
            device_id = %device_id,
            payload_preview = %preview(&canonical),
            "accepted payload"
        );

        Ok(IngestTelemetryOutput {
            device_id,
            sequence,
        })
    }

    fn org_secret_matches(&self, authorization: &str) -> bool {
        if self.org_secret.is_empty() {
            return false;
        }

        match authorization.strip_prefix("Bearer ") {
            Some(presented) => bool::from(
                presented
                    .trim()
                    .as_bytes()
                    .ct_eq(self.org_secret.as_bytes()),
            ),
            None => false,
        }
    }

    fn mark_seen_in_background(&self, device_id: String) {
        let registry = self.device_registry.clone();
        let io_timeout = self.io_timeout;

        tokio::spawn(async move {
            if let Err(e) =
                with_timeout("mark device seen", io_timeout, registry.mark_seen(&device_id)).await
            {
                warn!(device_id = %device_id, error = %e, "failed to mark device as seen");
            }
        });
    }

    async fn enqueue_with_retry(&self, entry: NewQueueEntry) -> DomainResult<u64> {
        let device_id = entry.envelope.device_id.clone();

        match with_timeout("enqueue", self.io_timeout, self.queue.enqueue(entry.clone())).await {
            Ok(sequence) => return Ok(sequence),
            Err(e) => {
                // Counted once per request, whether or not the retry succeeds
                self.metrics.record_queue_failure();
                warn!(device_id = %device_id, error = %e, "enqueue failed, retrying once");
            }
        }

        with_timeout("enqueue", self.io_timeout, self.queue.enqueue(entry))
            .await
            .map_err(|e| {
                warn!(device_id = %device_id, error = %e, "enqueue failed after retry");
                match e {
                    DomainError::QueueUnavailable(msg) => DomainError::QueueUnavailable(msg),
                    other => DomainError::QueueUnavailable(other.to_string()),
                }
            })
    }
}

/// Empty or blank header values count as missing.
fn required(value: Option<String>, name: &'static str) -> DomainResult<String> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or(DomainError::MissingHeader(name))
}

fn preview(payload: &str) -> String {
    payload.chars().take(PAYLOAD_PREVIEW_CHARS).collect()
}
