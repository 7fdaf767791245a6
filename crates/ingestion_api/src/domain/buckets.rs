//! Fixed-interval bucketing over queued telemetry.

use chrono::{DateTime, TimeDelta, Utc};
use common::domain::{AggregateBucket, DomainError, DomainResult, QueueEntry, TimeSeriesRecord};
use serde::Serialize;
use std::collections::BTreeMap;

/// Width of a fallback bucket. Only one granularity exists.
pub const MEMORY_BUCKET_SECS: i64 = 60;

/// Width of a bucket produced by the time-series store.
pub const STORE_BUCKET_SECS: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Kpis {
    pub current_power_w: f64,
    pub today_energy_kwh: f64,
    pub today_co2_kg: f64,
    pub today_waste_kg: f64,
}

/// Start of the bucket containing `t`: `floor(t / interval) * interval`.
pub fn bucket_start(t: DateTime<Utc>, interval_secs: i64) -> DateTime<Utc> {
    let millis = t.timestamp_millis();
    let width = interval_secs * 1000;
    let aligned = millis.div_euclid(width) * width;
    DateTime::from_timestamp_millis(aligned).unwrap_or(t)
}

/// Number of buckets needed to cover `[from, to]`.
pub fn bucket_count(from: DateTime<Utc>, to: DateTime<Utc>, interval_secs: i64) -> i64 {
    let first = bucket_start(from, interval_secs);
    let last = bucket_start(to, interval_secs);
    (last - first).num_seconds() / interval_secs + 1
}

/// Reject windows that would need more than `max_buckets` buckets.
pub fn ensure_bucket_budget(
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    interval_secs: i64,
    max_buckets: usize,
) -> DomainResult<()> {
    let needed = bucket_count(from, to, interval_secs);
    if needed > max_buckets as i64 {
        return Err(DomainError::InvalidQuery(format!(
            "window needs {} buckets, at most {} allowed",
            needed, max_buckets
        )));
    }
    Ok(())
}

#[derive(Default)]
struct Accumulator {
    power_sum: f64,
    energy: f64,
    co2: f64,
    waste: f64,
    count: u64,
}

/// Group entries into aligned buckets covering `[from, to]`.
///
/// Every bucket in the window is returned, empty ones included, oldest
/// first. Power is averaged over the samples in a bucket; energy, CO2
/// and waste are summed.
pub fn bucket_entries(
    entries: &[QueueEntry],
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    interval_secs: i64,
) -> Vec<AggregateBucket> {
    let step = TimeDelta::seconds(interval_secs);
    let mut buckets: BTreeMap<DateTime<Utc>, Accumulator> = BTreeMap::new();

    let mut start = bucket_start(from, interval_secs);
    while start <= to {
        buckets.insert(start, Accumulator::default());
        start += step;
    }

    for entry in entries {
        let record = TimeSeriesRecord::from(entry);
        if record.timestamp < from || record.timestamp > to {
            continue;
        }

        if let Some(acc) = buckets.get_mut(&bucket_start(record.timestamp, interval_secs)) {
            acc.power_sum += record.power_w;
            acc.energy += record.energy_kwh;
            acc.co2 += record.co2_kg.unwrap_or_default();
            acc.waste += record.waste_kg.unwrap_or_default();
            acc.count += 1;
        }
    }

    buckets
        .into_iter()
        .map(|(bucket_start, acc)| AggregateBucket {
            bucket_start,
            device_id: None,
            avg_power_w: if acc.count > 0 {
                acc.power_sum / acc.count as f64
            } else {
                0.0
            },
            sum_energy_kwh: acc.energy,
            sum_co2_kg: acc.co2,
            sum_waste_kg: acc.waste,
            count: acc.count,
        })
        .collect()
}

/// KPIs over fallback buckets.
///
/// Current power is the highest bucket average in the window rather than
/// the latest bucket.
pub fn kpis_from_buckets(buckets: &[AggregateBucket]) -> Kpis {
    buckets.iter().fold(Kpis::default(), |acc, bucket| Kpis {
        current_power_w: acc.current_power_w.max(bucket.avg_power_w),
        today_energy_kwh: acc.today_energy_kwh + bucket.sum_energy_kwh,
        today_co2_kg: acc.today_co2_kg + bucket.sum_co2_kg,
        today_waste_kg: acc.today_waste_kg + bucket.sum_waste_kg,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::domain::{Metric, TelemetryEnvelope};

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn entry(ts: &str, metrics: &[(&str, f64)]) -> QueueEntry {
        QueueEntry {
            envelope: TelemetryEnvelope {
                version: "1.0".to_string(),
                device_id: "dev-001".to_string(),
                ts: ts.to_string(),
                metrics: metrics
                    .iter()
                    .map(|(name, value)| Metric {
                        name: name.to_string(),
                        value: *value,
                        unit: String::new(),
                    })
                    .collect(),
                tags: None,
            },
            received_at: at(ts),
            sequence: 0,
        }
    }

    #[test]
    fn test_bucket_start_aligns_to_interval() {
        assert_eq!(
            bucket_start(at("2025-01-07T12:00:59.999Z"), 60),
            at("2025-01-07T12:00:00Z")
        );
        assert_eq!(
            bucket_start(at("2025-01-07T12:07:30Z"), 300),
            at("2025-01-07T12:05:00Z")
        );
    }

    #[test]
    fn test_power_is_averaged_within_bucket() {
        let entries = vec![
            entry("2025-01-07T12:00:10Z", &[("power_active_w", 100.0)]),
            entry("2025-01-07T12:00:40Z", &[("power_active_w", 300.0)]),
        ];

        let buckets = bucket_entries(
            &entries,
            at("2025-01-07T12:00:00Z"),
            at("2025-01-07T12:00:59Z"),
            MEMORY_BUCKET_SECS,
        );

        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].avg_power_w, 200.0);
        assert_eq!(buckets[0].count, 2);
    }

    #[test]
    fn test_energy_is_summed_within_bucket() {
        let entries = vec![
            entry("2025-01-07T12:00:10Z", &[("energy_kwh", 1.0)]),
            entry("2025-01-07T12:00:40Z", &[("energy_kwh", 2.0)]),
        ];

        let buckets = bucket_entries(
            &entries,
            at("2025-01-07T12:00:00Z"),
            at("2025-01-07T12:00:59Z"),
            MEMORY_BUCKET_SECS,
        );

        assert_eq!(buckets[0].sum_energy_kwh, 3.0);
    }

    #[test]
    fn test_empty_buckets_are_kept_and_out_of_range_dropped() {
        let entries = vec![
            entry("2025-01-07T11:59:00Z", &[("power_active_w", 999.0)]),
            entry("2025-01-07T12:02:05Z", &[("power_active_w", 50.0), ("waste_kg", 0.5)]),
        ];

        let buckets = bucket_entries(
            &entries,
            at("2025-01-07T12:00:30Z"),
            at("2025-01-07T12:03:00Z"),
            MEMORY_BUCKET_SECS,
        );

        let starts: Vec<_> = buckets.iter().map(|b| b.bucket_start).collect();
        assert_eq!(
            starts,
            vec![
                at("2025-01-07T12:00:00Z"),
                at("2025-01-07T12:01:00Z"),
                at("2025-01-07T12:02:00Z"),
                at("2025-01-07T12:03:00Z"),
            ]
        );
        assert_eq!(buckets[0].count, 0);
        assert_eq!(buckets[2].avg_power_w, 50.0);
        assert_eq!(buckets[2].sum_waste_kg, 0.5);
        assert_eq!(buckets.iter().map(|b| b.count).sum::<u64>(), 1);
    }

    #[test]
    fn test_current_power_is_max_bucket_average() {
        let entries = vec![
            entry("2025-01-07T12:00:10Z", &[("power_active_w", 100.0), ("energy_kwh", 1.0)]),
            entry("2025-01-07T12:01:10Z", &[("power_active_w", 400.0), ("energy_kwh", 1.5)]),
            entry("2025-01-07T12:02:10Z", &[("power_active_w", 150.0), ("co2_kg", 0.2)]),
        ];
        let buckets = bucket_entries(
            &entries,
            at("2025-01-07T12:00:00Z"),
            at("2025-01-07T12:02:59Z"),
            MEMORY_BUCKET_SECS,
        );

        let kpis = kpis_from_buckets(&buckets);

        assert_eq!(kpis.current_power_w, 400.0);
        assert_eq!(kpis.today_energy_kwh, 2.5);
        assert_eq!(kpis.today_co2_kg, 0.2);
        assert_eq!(kpis.today_waste_kg, 0.0);
    }

    #[test]
    fn test_bucket_budget() {
        let from = at("2025-01-07T00:00:00Z");
        let to = at("2025-01-07T01:00:00Z");

        assert_eq!(bucket_count(from, to, 60), 61);
        assert!(ensure_bucket_budget(from, to, 60, 61).is_ok());
        assert!(matches!(
            ensure_bucket_budget(from, to, 60, 60),
            Err(DomainError::InvalidQuery(_))
        ));
    }
}
