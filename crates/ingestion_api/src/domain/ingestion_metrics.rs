use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-lifetime ingestion counters.
#[derive(Debug, Default)]
pub struct IngestionMetrics {
    received: AtomicU64,
    auth_failures: AtomicU64,
    signature_failures: AtomicU64,
    timestamp_failures: AtomicU64,
    queue_failures: AtomicU64,
}

/// Point-in-time copy of [`IngestionMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionMetricsSnapshot {
    pub total_telemetry_received: u64,
    pub auth_failures: u64,
    pub signature_failures: u64,
    pub timestamp_failures: u64,
    pub queue_failures: u64,
}

impl IngestionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_auth_failure(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_signature_failure(&self) {
        self.signature_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timestamp_failure(&self) {
        self.timestamp_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_queue_failure(&self) {
        self.queue_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> IngestionMetricsSnapshot {
        IngestionMetricsSnapshot {
            total_telemetry_received: self.received.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            signature_failures: self.signature_failures.load(Ordering::Relaxed),
            timestamp_failures: self.timestamp_failures.load(Ordering::Relaxed),
            queue_failures: self.queue_failures.load(Ordering::Relaxed),
        }
    }
}
