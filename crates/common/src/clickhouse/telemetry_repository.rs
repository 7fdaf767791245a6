use crate::clickhouse::ClickHouseClient;
use crate::domain::{
    AggregateBucket, DeviceAggregate, DomainError, DomainResult, TelemetryAggregateStore,
    TelemetrySink, TimeSeriesQuery, TimeSeriesRecord, DEFAULT_CO2_KG_PER_KWH,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clickhouse::Row;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

#[derive(Debug, Clone, Row, Serialize, Deserialize)]
pub struct TelemetryRow {
    pub device_id: String,
    #[serde(with = "clickhouse::serde::chrono::datetime64::millis")]
    pub timestamp: DateTime<Utc>,
    pub power_w: f64,
    pub energy_kwh: f64,
    pub co2_kg: Option<f64>,
    pub waste_kg: Option<f64>,
}

impl From<TimeSeriesRecord> for TelemetryRow {
    fn from(record: TimeSeriesRecord) -> Self {
        TelemetryRow {
            device_id: record.device_id,
            timestamp: record.timestamp,
            power_w: record.power_w,
            energy_kwh: record.energy_kwh,
            co2_kg: record.co2_kg,
            waste_kg: record.waste_kg,
        }
    }
}

#[derive(Debug, Row, Deserialize)]
struct DeviceAggregateRow {
    device_id: String,
    current_power_w: f64,
    today_energy_kwh: f64,
    today_co2_kg: f64,
    today_waste_kg: f64,
    #[serde(with = "clickhouse::serde::chrono::datetime64::millis")]
    last_seen: DateTime<Utc>,
}

#[derive(Debug, Row, Deserialize)]
struct BucketRow {
    #[serde(with = "clickhouse::serde::chrono::datetime")]
    bucket_start: DateTime<Utc>,
    device_id: String,
    avg_power_w: f64,
    sum_energy_kwh: f64,
    sum_co2_kg: f64,
    sum_waste_kg: f64,
    count: u64,
}

/// ClickHouse implementation of TelemetrySink and TelemetryAggregateStore
#[derive(Clone)]
pub struct ClickHouseTelemetryRepository {
    client: ClickHouseClient,
    table: String,
}

impl ClickHouseTelemetryRepository {
    pub fn new(client: ClickHouseClient, table: String) -> Self {
        Self { client, table }
    }

    fn create_table_sql(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (
                device_id String,
                timestamp DateTime64(3, 'UTC'),
                power_w Float64,
                energy_kwh Float64,
                co2_kg Nullable(Float64),
                waste_kg Nullable(Float64)
            )
            ENGINE = MergeTree
            ORDER BY (device_id, timestamp)",
            self.table
        )
    }

    fn device_aggregates_sql(&self, filter_device: bool) -> String {
        let today = "timestamp >= toStartOfDay(now('UTC'))";
        format!(
            "SELECT
                device_id,
                max(power_w) AS current_power_w,
                sumIf(energy_kwh, {today}) AS today_energy_kwh,
                sumIf(ifNull(co2_kg, energy_kwh * {co2}), {today}) AS today_co2_kg,
                sumIf(ifNull(waste_kg, 0.), {today}) AS today_waste_kg,
                max(timestamp) AS last_seen
            FROM {table}
            {filter}
            GROUP BY device_id
            ORDER BY last_seen DESC",
            today = today,
            co2 = DEFAULT_CO2_KG_PER_KWH,
            table = self.table,
            filter = if filter_device {
                "WHERE device_id = ?"
            } else {
                ""
            },
        )
    }

    fn time_series_sql(&self, filter_device: bool) -> String {
        format!(
            "SELECT
                toDateTime(toStartOfInterval(timestamp, INTERVAL 5 MINUTE), 'UTC') AS bucket_start,
                device_id,
                avg(power_w) AS avg_power_w,
                sum(energy_kwh) AS sum_energy_kwh,
                sum(ifNull(co2_kg, energy_kwh * {co2})) AS sum_co2_kg,
                sum(ifNull(waste_kg, 0.)) AS sum_waste_kg,
                count() AS count
            FROM {table}
            WHERE timestamp >= fromUnixTimestamp64Milli(?, 'UTC')
              AND timestamp <= fromUnixTimestamp64Milli(?, 'UTC')
              {filter}
            GROUP BY bucket_start, device_id
            ORDER BY bucket_start DESC, device_id",
            co2 = DEFAULT_CO2_KG_PER_KWH,
            table = self.table,
            filter = if filter_device {
                "AND device_id = ?"
            } else {
                ""
            },
        )
    }
}

#[async_trait]
impl TelemetrySink for ClickHouseTelemetryRepository {
    async fn ensure_schema(&self) -> DomainResult<()> {
        self.client
            .inner()
            .query(&self.create_table_sql())
            .execute()
            .await
            .map_err(|e| {
                error!("failed to create telemetry table: {}", e);
                DomainError::SinkWrite(e.to_string())
            })?;

        info!(table = %self.table, "telemetry table ready");
        Ok(())
    }

    async fn write_batch(&self, records: Vec<TimeSeriesRecord>) -> DomainResult<()> {
        if records.is_empty() {
            debug!("no telemetry records to store, skipping");
            return Ok(());
        }

        let row_count = records.len();
        debug!(
            record_count = row_count,
            table = %self.table,
            "storing telemetry batch to ClickHouse"
        );

        let mut insert = self
            .client
            .inner()
            .insert::<TelemetryRow>(&self.table)
            .await
            .map_err(|e| {
                error!("failed to create ClickHouse inserter: {}", e);
                DomainError::SinkWrite(e.to_string())
            })?;

        for record in records {
            insert.write(&TelemetryRow::from(record)).await.map_err(|e| {
                error!("failed to write row to ClickHouse: {}", e);
                DomainError::SinkWrite(e.to_string())
            })?;
        }

        insert.end().await.map_err(|e| {
            error!("failed to finalize ClickHouse insert: {}", e);
            DomainError::SinkWrite(e.to_string())
        })?;

        debug!(rows_inserted = row_count, "successfully stored telemetry batch");
        Ok(())
    }
}

#[async_trait]
impl TelemetryAggregateStore for ClickHouseTelemetryRepository {
    async fn device_aggregates(
        &self,
        device_id: Option<String>,
    ) -> DomainResult<Vec<DeviceAggregate>> {
        let sql = self.device_aggregates_sql(device_id.is_some());
        let mut query = self.client.inner().query(&sql);
        if let Some(device_id) = device_id {
            query = query.bind(device_id);
        }

        let rows = query
            .fetch_all::<DeviceAggregateRow>()
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        Ok(rows
            .into_iter()
            .map(|row| DeviceAggregate {
                device_id: row.device_id,
                current_power_w: row.current_power_w,
                today_energy_kwh: row.today_energy_kwh,
                today_co2_kg: row.today_co2_kg,
                today_waste_kg: row.today_waste_kg,
                last_seen: Some(row.last_seen),
            })
            .collect())
    }

    async fn time_series(&self, input: TimeSeriesQuery) -> DomainResult<Vec<AggregateBucket>> {
        let sql = self.time_series_sql(input.device_id.is_some());
        let mut query = self
            .client
            .inner()
            .query(&sql)
            .bind(input.from.timestamp_millis())
            .bind(input.to.timestamp_millis());
        if let Some(device_id) = input.device_id {
            query = query.bind(device_id);
        }

        let rows = query
            .fetch_all::<BucketRow>()
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        Ok(rows
            .into_iter()
            .map(|row| AggregateBucket {
                bucket_start: row.bucket_start,
                device_id: Some(row.device_id),
                avg_power_w: row.avg_power_w,
                sum_energy_kwh: row.sum_energy_kwh,
                sum_co2_kg: row.sum_co2_kg,
                sum_waste_kg: row.sum_waste_kg,
                count: row.count,
            })
            .collect())
    }
}
