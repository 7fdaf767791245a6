use crate::domain::{DomainResult, QueueEntry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

pub const METRIC_POWER: &str = "power_active_w";
pub const METRIC_ENERGY: &str = "energy_kwh";
pub const METRIC_CO2: &str = "co2_kg";
pub const METRIC_WASTE: &str = "waste_kg";

/// CO2 assumed per kWh when a device does not report emissions.
pub const DEFAULT_CO2_KG_PER_KWH: f64 = 0.7;

/// Row appended to the time-series sink. Never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeriesRecord {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub power_w: f64,
    pub energy_kwh: f64,
    pub co2_kg: Option<f64>,
    pub waste_kg: Option<f64>,
}

impl From<&QueueEntry> for TimeSeriesRecord {
    /// Missing power and energy default to zero, missing CO2 and waste stay unset.
    /// Envelopes with an unparsable `ts` fall back to the receive time.
    fn from(entry: &QueueEntry) -> Self {
        let envelope = &entry.envelope;
        Self {
            device_id: envelope.device_id.clone(),
            timestamp: envelope.occurred_at().unwrap_or(entry.received_at),
            power_w: envelope.metric(METRIC_POWER).unwrap_or(0.0),
            energy_kwh: envelope.metric(METRIC_ENERGY).unwrap_or(0.0),
            co2_kg: envelope.metric(METRIC_CO2),
            waste_kg: envelope.metric(METRIC_WASTE),
        }
    }
}

/// Per-device rollup served in store-backed mode.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAggregate {
    pub device_id: String,
    pub current_power_w: f64,
    pub today_energy_kwh: f64,
    pub today_co2_kg: f64,
    pub today_waste_kg: f64,
    pub last_seen: Option<DateTime<Utc>>,
}

/// One time bucket of aggregated readings. Computed on read, never stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateBucket {
    pub bucket_start: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub avg_power_w: f64,
    pub sum_energy_kwh: f64,
    pub sum_co2_kg: f64,
    pub sum_waste_kg: f64,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeriesQuery {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub device_id: Option<String>,
}

/// Persistent time-series store the worker writes batches into.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    /// Create the target table if it does not exist yet.
    async fn ensure_schema(&self) -> DomainResult<()>;

    /// Append all records in a single batched call.
    async fn write_batch(&self, records: Vec<TimeSeriesRecord>) -> DomainResult<()>;
}

/// Read side of the time-series store.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait TelemetryAggregateStore: Send + Sync {
    /// Max power over all time plus today's (UTC) cumulative totals, per device.
    async fn device_aggregates(&self, device_id: Option<String>)
        -> DomainResult<Vec<DeviceAggregate>>;

    /// Five-minute buckets per device between `from` and `to`, newest first.
    async fn time_series(&self, query: TimeSeriesQuery) -> DomainResult<Vec<AggregateBucket>>;
}
