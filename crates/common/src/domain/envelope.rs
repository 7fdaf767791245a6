use crate::domain::{DomainError, DomainResult};
use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// One signed telemetry submission from a device.
///
/// Immutable once received. `(device_id, ts)` identifies a reading but is
/// not unique; downstream consumers tolerate duplicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct TelemetryEnvelope {
    #[serde(deserialize_with = "string_or_number")]
    #[garde(length(min = 1))]
    pub version: String,
    #[garde(length(min = 1))]
    pub device_id: String,
    #[garde(length(min = 1))]
    pub ts: String,
    #[garde(dive)]
    pub metrics: Vec<Metric>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(skip)]
    pub tags: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct Metric {
    #[garde(length(min = 1))]
    pub name: String,
    #[garde(skip)]
    pub value: f64,
    #[serde(default)]
    #[garde(skip)]
    pub unit: String,
}

impl TelemetryEnvelope {
    /// Value of the named metric. The last occurrence wins.
    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics
            .iter()
            .rev()
            .find(|metric| metric.name == name)
            .map(|metric| metric.value)
    }

    pub fn occurred_at(&self) -> Option<DateTime<Utc>> {
        crate::auth::parse_timestamp(&self.ts)
    }
}

impl TryFrom<&serde_json::Value> for TelemetryEnvelope {
    type Error = DomainError;

    /// Structural validation of a parsed request body.
    fn try_from(value: &serde_json::Value) -> DomainResult<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| DomainError::SchemaViolation("payload must be an object".to_string()))?;

        let missing: Vec<&str> = ["version", "device_id", "ts"]
            .into_iter()
            .filter(|field| object.get(*field).map_or(true, serde_json::Value::is_null))
            .collect();
        if !missing.is_empty() {
            return Err(DomainError::SchemaViolation(format!(
                "missing required fields: {}",
                missing.join(", ")
            )));
        }

        if !object.get("metrics").is_some_and(serde_json::Value::is_array) {
            return Err(DomainError::SchemaViolation(
                "metrics must be an array".to_string(),
            ));
        }

        let envelope: TelemetryEnvelope = serde_json::from_value(value.clone())
            .map_err(|e| DomainError::SchemaViolation(e.to_string()))?;
        crate::garde::validate_struct(&envelope)?;

        Ok(envelope)
    }
}

/// An envelope accepted by the gateway, before the queue assigns a position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewQueueEntry {
    pub envelope: TelemetryEnvelope,
    pub received_at: DateTime<Utc>,
}

/// An envelope as held by a queue backend.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub envelope: TelemetryEnvelope,
    pub received_at: DateTime<Utc>,
    /// Monotonic position assigned by the backend (stream sequence for the durable log).
    pub sequence: u64,
}

impl QueueEntry {
    pub fn from_new(entry: NewQueueEntry, sequence: u64) -> Self {
        Self {
            envelope: entry.envelope,
            received_at: entry.received_at,
            sequence,
        }
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Version {
        Text(String),
        Number(serde_json::Number),
    }

    Ok(match Version::deserialize(deserializer)? {
        Version::Text(text) => text,
        Version::Number(number) => number.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid_body() -> serde_json::Value {
        json!({
            "version": "1.0",
            "device_id": "dev-001",
            "ts": "2025-01-07T12:00:00.000Z",
            "metrics": [
                {"name": "power_active_w", "value": 1500.5, "unit": "W"},
                {"name": "energy_kwh", "value": 2, "unit": "kWh"}
            ],
            "tags": {"line": "A"}
        })
    }

    #[test]
    fn test_parse_valid_envelope() {
        let envelope = TelemetryEnvelope::try_from(&valid_body()).unwrap();

        assert_eq!(envelope.device_id, "dev-001");
        assert_eq!(envelope.metrics.len(), 2);
        assert_eq!(envelope.metric("energy_kwh"), Some(2.0));
        assert_eq!(
            envelope.tags.unwrap().get("line").map(String::as_str),
            Some("A")
        );
    }

    #[test]
    fn test_numeric_version_is_accepted() {
        let mut body = valid_body();
        body["version"] = json!(1);

        let envelope = TelemetryEnvelope::try_from(&body).unwrap();
        assert_eq!(envelope.version, "1");
    }

    #[test]
    fn test_missing_fields_are_listed() {
        let body = json!({"device_id": "dev-001", "metrics": []});

        match TelemetryEnvelope::try_from(&body) {
            Err(DomainError::SchemaViolation(msg)) => {
                assert!(msg.contains("version"));
                assert!(msg.contains("ts"));
                assert!(!msg.contains("device_id"));
            }
            other => panic!("Expected SchemaViolation, got {:?}", other),
        }
    }

    #[test]
    fn test_metrics_must_be_a_list() {
        let mut body = valid_body();
        body["metrics"] = json!({"power_active_w": 10});

        assert!(matches!(
            TelemetryEnvelope::try_from(&body),
            Err(DomainError::SchemaViolation(_))
        ));
    }

    #[test]
    fn test_metric_value_must_be_numeric() {
        let mut body = valid_body();
        body["metrics"] = json!([{"name": "power_active_w", "value": "high"}]);

        assert!(matches!(
            TelemetryEnvelope::try_from(&body),
            Err(DomainError::SchemaViolation(_))
        ));
    }

    #[test]
    fn test_empty_device_id_is_rejected() {
        let mut body = valid_body();
        body["device_id"] = json!("");

        assert!(matches!(
            TelemetryEnvelope::try_from(&body),
            Err(DomainError::SchemaViolation(_))
        ));
    }

    #[test]
    fn test_non_object_is_rejected() {
        assert!(matches!(
            TelemetryEnvelope::try_from(&json!([1, 2])),
            Err(DomainError::SchemaViolation(_))
        ));
    }

    #[test]
    fn test_last_metric_occurrence_wins() {
        let mut body = valid_body();
        body["metrics"] = json!([
            {"name": "power_active_w", "value": 1},
            {"name": "power_active_w", "value": 2}
        ]);

        let envelope = TelemetryEnvelope::try_from(&body).unwrap();
        assert_eq!(envelope.metric("power_active_w"), Some(2.0));
        assert_eq!(envelope.metric("waste_kg"), None);
    }
}
