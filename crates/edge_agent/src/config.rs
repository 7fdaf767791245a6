use config::{Config, ConfigError, Environment};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AgentConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Ingestion endpoint URL
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    #[serde(default)]
    pub org_secret: String,

    #[serde(default = "default_device_id")]
    pub device_id: String,

    #[serde(default)]
    pub device_secret: String,

    /// Interval between simulated readings in milliseconds
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Interval between buffer flush attempts in seconds
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// JSON-lines file holding readings the gateway has not accepted yet
    #[serde(default)]
    pub buffer_path: Option<String>,

    #[serde(default = "default_buffer_max_entries")]
    pub buffer_max_entries: usize,

    /// Mean simulated power draw in watts
    #[serde(default = "default_power_base_w")]
    pub power_base_w: f64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_endpoint() -> String {
    "http://localhost:3000/api/telemetry".to_string()
}

fn default_device_id() -> String {
    "dev-001".to_string()
}

fn default_interval_ms() -> u64 {
    5000
}

fn default_flush_interval_secs() -> u64 {
    30
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_buffer_max_entries() -> usize {
    edge_agent::DEFAULT_BUFFER_MAX_ENTRIES
}

fn default_power_base_w() -> f64 {
    1000.0
}

impl AgentConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(Environment::with_prefix("EDGE_AGENT"))
            .build()?
            .try_deserialize()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_secret.is_empty() {
            return Err(ConfigError::Message(
                "device_secret is required to sign telemetry".to_string(),
            ));
        }
        if self.interval_ms == 0 {
            return Err(ConfigError::Message(
                "interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Buffer location, defaulting to `<device_id>-buffer.jsonl` in the working directory.
    pub fn buffer_path(&self) -> String {
        self.buffer_path
            .as_deref()
            .map(str::trim)
            .filter(|path| !path.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}-buffer.jsonl", self.device_id))
    }
}
