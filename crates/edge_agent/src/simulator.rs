use chrono::{DateTime, SecondsFormat, Utc};
use common::domain::{Metric, TelemetryEnvelope};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::time::Duration;

/// Grid emission factor used for the simulated CO2 figure.
pub const CO2_KG_PER_KWH: f64 = 0.7;

const POWER_JITTER_W: f64 = 100.0;
const WASTE_PROBABILITY: f64 = 0.1;
const MAX_WASTE_KG: f64 = 0.5;

/// Produces plausible machine readings for a single device.
pub struct ReadingSimulator {
    device_id: String,
    power_base_w: f64,
    interval: Duration,
    pending_waste_kg: f64,
    rng: StdRng,
}

impl ReadingSimulator {
    pub fn new(device_id: impl Into<String>, power_base_w: f64, interval: Duration) -> Self {
        Self::with_rng(device_id, power_base_w, interval, StdRng::from_entropy())
    }

    pub fn with_rng(
        device_id: impl Into<String>,
        power_base_w: f64,
        interval: Duration,
        rng: StdRng,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            power_base_w,
            interval,
            pending_waste_kg: 0.0,
            rng,
        }
    }

    /// Next reading. Energy covers one interval at the sampled power; waste
    /// accumulates at random and is reported once, then reset.
    pub fn next_envelope(&mut self, now: DateTime<Utc>) -> TelemetryEnvelope {
        let jitter = self.rng.gen_range(-POWER_JITTER_W..=POWER_JITTER_W);
        let power_w = (self.power_base_w + jitter).max(0.0);
        let energy_kwh = power_w * (self.interval.as_secs_f64() / 3600.0) / 1000.0;
        let co2_kg = energy_kwh * CO2_KG_PER_KWH;

        if self.rng.gen_bool(WASTE_PROBABILITY) {
            self.pending_waste_kg += self.rng.gen_range(0.0..MAX_WASTE_KG);
        }

        let mut metrics = vec![
            metric("power_active_w", round_to(power_w, 2), "W"),
            metric("energy_kwh", round_to(energy_kwh, 6), "kWh"),
            metric("co2_kg", round_to(co2_kg, 6), "kg"),
        ];
        if self.pending_waste_kg > 0.0 {
            metrics.push(metric("waste_kg", round_to(self.pending_waste_kg, 3), "kg"));
            self.pending_waste_kg = 0.0;
        }

        let tags = BTreeMap::from([
            ("agent_version".to_string(), env!("CARGO_PKG_VERSION").to_string()),
            ("location".to_string(), "factory-floor-a".to_string()),
            ("production_line".to_string(), "line-1".to_string()),
        ]);

        TelemetryEnvelope {
            version: "1.0".to_string(),
            device_id: self.device_id.clone(),
            ts: now.to_rfc3339_opts(SecondsFormat::Millis, true),
            metrics,
            tags: Some(tags),
        }
    }
}

fn metric(name: &str, value: f64, unit: &str) -> Metric {
    Metric {
        name: name.to_string(),
        value,
        unit: unit.to_string(),
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}
