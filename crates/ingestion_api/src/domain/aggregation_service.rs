use crate::domain::{
    bucket_entries, ensure_bucket_budget, kpis_from_buckets, Kpis, MEMORY_BUCKET_SECS,
    STORE_BUCKET_SECS,
};
use chrono::{DateTime, TimeDelta, Utc};
use common::auth::parse_timestamp;
use common::domain::{
    with_timeout, AggregateBucket, DeviceAggregate, DomainError, DomainResult, RecentTelemetry,
    RecentTelemetryQuery, TelemetryAggregateStore, TimeSeriesQuery,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

const DEFAULT_INTERVAL: &str = "60s";

/// Where aggregates are computed from. Chosen once at startup.
pub enum AggregationSource {
    /// Persisted time-series store.
    Store(Arc<dyn TelemetryAggregateStore>),
    /// Retained window of the volatile queue.
    Memory {
        recent: Arc<dyn RecentTelemetry>,
        lookback: Duration,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateSourceKind {
    Store,
    Memory,
}

/// Raw query parameters; timestamps are RFC 3339.
#[derive(Debug, Clone, Default)]
pub struct AggregatesQuery {
    pub device_id: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub interval: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatesReport {
    pub kpis: Kpis,
    pub time_series: Vec<AggregateBucket>,
    pub devices: Vec<DeviceAggregate>,
    pub source: AggregateSourceKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    /// Echo of the requested interval. Buckets are always fixed width.
    pub interval: String,
    pub total_points: usize,
    pub timestamp: DateTime<Utc>,
}

/// Answers dashboard KPI and time-series queries.
pub struct AggregationService {
    source: AggregationSource,
    io_timeout: Duration,
    max_buckets: usize,
}

impl AggregationService {
    pub fn new(source: AggregationSource, io_timeout: Duration, max_buckets: usize) -> Self {
        Self {
            source,
            io_timeout,
            max_buckets,
        }
    }

    pub fn source_kind(&self) -> AggregateSourceKind {
        match self.source {
            AggregationSource::Store(_) => AggregateSourceKind::Store,
            AggregationSource::Memory { .. } => AggregateSourceKind::Memory,
        }
    }

    #[instrument(skip(self), fields(source = ?self.source_kind()))]
    pub async fn aggregates(&self, query: AggregatesQuery) -> DomainResult<AggregatesReport> {
        let now = Utc::now();
        let (from, to) = resolve_window(query.from.as_deref(), query.to.as_deref(), now)?;
        let interval = query
            .interval
            .filter(|i| !i.is_empty())
            .unwrap_or_else(|| DEFAULT_INTERVAL.to_string());

        let (kpis, time_series, devices) = match &self.source {
            AggregationSource::Store(store) => {
                ensure_bucket_budget(from, to, STORE_BUCKET_SECS, self.max_buckets)?;
                self.from_store(store.as_ref(), from, to, query.device_id.clone())
                    .await?
            }
            AggregationSource::Memory { recent, lookback } => {
                ensure_bucket_budget(from, to, MEMORY_BUCKET_SECS, self.max_buckets)?;
                let since = lookback_start(now, *lookback).max(from);
                let entries = with_timeout(
                    "recent telemetry",
                    self.io_timeout,
                    recent.recent(RecentTelemetryQuery {
                        since,
                        device_id: query.device_id.clone(),
                    }),
                )
                .await?;

                let buckets = bucket_entries(&entries, from, to, MEMORY_BUCKET_SECS);
                (kpis_from_buckets(&buckets), buckets, Vec::new())
            }
        };

        debug!(points = time_series.len(), "aggregates computed");

        Ok(AggregatesReport {
            kpis,
            total_points: time_series.len(),
            time_series,
            devices,
            source: self.source_kind(),
            device_id: query.device_id,
            from,
            to,
            interval,
            timestamp: Utc::now(),
        })
    }

    async fn from_store(
        &self,
        store: &dyn TelemetryAggregateStore,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        device_id: Option<String>,
    ) -> DomainResult<(Kpis, Vec<AggregateBucket>, Vec<DeviceAggregate>)> {
        let (devices, time_series) = tokio::try_join!(
            with_timeout(
                "device aggregates",
                self.io_timeout,
                store.device_aggregates(device_id.clone()),
            ),
            with_timeout(
                "time series",
                self.io_timeout,
                store.time_series(TimeSeriesQuery {
                    from,
                    to,
                    device_id,
                }),
            ),
        )?;

        let kpis = devices.iter().fold(Kpis::default(), |acc, device| Kpis {
            current_power_w: acc.current_power_w + device.current_power_w,
            today_energy_kwh: acc.today_energy_kwh + device.today_energy_kwh,
            today_co2_kg: acc.today_co2_kg + device.today_co2_kg,
            today_waste_kg: acc.today_waste_kg + device.today_waste_kg,
        });

        Ok((kpis, time_series, devices))
    }
}

/// `to` defaults to now and `from` to 24 hours before `to`.
fn resolve_window(
    from: Option<&str>,
    to: Option<&str>,
    now: DateTime<Utc>,
) -> DomainResult<(DateTime<Utc>, DateTime<Utc>)> {
    let to = match to.filter(|s| !s.is_empty()) {
        Some(raw) => parse_timestamp(raw)
            .ok_or_else(|| DomainError::InvalidQuery(format!("invalid 'to' timestamp: {}", raw)))?,
        None => now,
    };
    let from = match from.filter(|s| !s.is_empty()) {
        Some(raw) => parse_timestamp(raw).ok_or_else(|| {
            DomainError::InvalidQuery(format!("invalid 'from' timestamp: {}", raw))
        })?,
        None => to - TimeDelta::hours(24),
    };

    if from > to {
        return Err(DomainError::InvalidQuery(
            "'from' must not be after 'to'".to_string(),
        ));
    }

    Ok((from, to))
}

fn lookback_start(now: DateTime<Utc>, lookback: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(lookback)
        .ok()
        .and_then(|delta| now.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
