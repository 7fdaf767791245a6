use axum::{
    body::Bytes,
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use chrono::Utc;
use common::domain::{DomainError, QueueBackend, TelemetryQueue, WorkerControl};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, instrument};

use super::ApiError;
use crate::domain::{AggregatesQuery, AggregationService, IngestTelemetryInput, IngestionService};

pub const DEVICE_ID_HEADER: &str = "x-device-id";
pub const TIMESTAMP_HEADER: &str = "x-timestamp";
pub const SIGNATURE_HEADER: &str = "x-signature";

/// Shared state behind every route.
#[derive(Clone)]
pub struct AppState {
    pub ingestion: Arc<IngestionService>,
    pub aggregation: Arc<AggregationService>,
    pub queue: Arc<dyn TelemetryQueue>,
    /// Present only when a durable queue and a sink are both configured.
    pub worker: Option<Arc<dyn WorkerControl>>,
    pub sink_configured: bool,
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

/// `POST /api/telemetry`
pub async fn ingest_telemetry(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let input = IngestTelemetryInput {
        authorization: header(&headers, http::header::AUTHORIZATION.as_str()),
        device_id: header(&headers, DEVICE_ID_HEADER),
        timestamp: header(&headers, TIMESTAMP_HEADER),
        signature: header(&headers, SIGNATURE_HEADER),
        body: body.to_vec(),
    };

    let output = state.ingestion.ingest(input).await?;

    Ok(Json(json!({
        "status": "ok",
        "sequence": output.sequence,
    })))
}

/// `GET /api/telemetry`
pub async fn telemetry_metrics(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let counters = state.ingestion.metrics().snapshot();
    let queue_size = state.queue.size().await?;

    Ok(Json(json!({
        "metrics": {
            "totalTelemetryReceived": counters.total_telemetry_received,
            "authFailures": counters.auth_failures,
            "signatureFailures": counters.signature_failures,
            "timestampFailures": counters.timestamp_failures,
            "queueFailures": counters.queue_failures,
            "queueSize": queue_size,
            "queueEvictions": state.queue.evictions(),
        },
        "timestamp": Utc::now(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct AggregatesParams {
    pub device_id: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub interval: Option<String>,
}

/// `GET /api/telemetry/aggregates`
#[instrument(skip(state))]
pub async fn telemetry_aggregates(
    State(state): State<AppState>,
    Query(params): Query<AggregatesParams>,
) -> Result<Json<Value>, ApiError> {
    let report = state
        .aggregation
        .aggregates(AggregatesQuery {
            device_id: params.device_id,
            from: params.from,
            to: params.to,
            interval: params.interval,
        })
        .await?;

    let body = serde_json::to_value(&report)
        .map_err(|e| DomainError::RepositoryError(anyhow::anyhow!(e)))?;
    Ok(Json(body))
}

/// `POST /api/worker`
pub async fn start_worker(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let worker = state.worker.as_ref().ok_or(DomainError::WorkerUnavailable)?;
    let started = worker.start().await?;
    info!(started, "worker start requested");

    Ok(Json(json!({
        "status": if started { "Worker started" } else { "Worker already running" },
        "timestamp": Utc::now(),
    })))
}

/// `DELETE /api/worker`
pub async fn stop_worker(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let worker = state.worker.as_ref().ok_or(DomainError::WorkerUnavailable)?;
    let stopped = worker.stop().await;
    info!(stopped, "worker stop requested");

    Ok(Json(json!({
        "status": if stopped { "Worker stopped" } else { "Worker not running" },
        "timestamp": Utc::now(),
    })))
}

/// `GET /api/worker`
pub async fn worker_status(State(state): State<AppState>) -> Json<Value> {
    let stats = state.worker.as_ref().map(|w| w.stats()).unwrap_or_default();
    let backend = match state.queue.backend() {
        QueueBackend::Volatile => "memory",
        QueueBackend::Durable => "jetstream",
    };
    debug!(running = stats.running, "worker status requested");

    Json(json!({
        "running": stats.running,
        "queueBackend": backend,
        "sinkConfigured": state.sink_configured,
        "batchesWritten": stats.batches_written,
        "recordsWritten": stats.records_written,
        "batchesDropped": stats.batches_dropped,
    }))
}

/// `GET /health`
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
