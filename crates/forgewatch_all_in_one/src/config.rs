use config::{Config, ConfigError, Environment};
use serde::{Deserialize, Serialize};

/// Queue implementation selected at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Memory,
    JetStream,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServiceConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    // HTTP configuration
    #[serde(default = "default_http_host")]
    pub http_host: String,

    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// CORS allowed origins (comma-separated list, "*" for all origins)
    #[serde(default = "default_cors_allowed_origins")]
    pub cors_allowed_origins: String,

    /// Path prefixes excluded from request logging (comma-separated)
    #[serde(default = "default_http_ignored_paths")]
    pub http_ignored_paths: String,

    // Ingestion configuration
    /// Organization-wide bearer secret. Empty rejects every submission.
    #[serde(default)]
    pub org_secret: String,

    /// Seed for the device registry: `device_id:secret` pairs, comma-separated
    #[serde(default = "default_devices")]
    pub devices: String,

    /// Accepted clock skew between device and server in milliseconds
    #[serde(default = "default_replay_window_ms")]
    pub replay_window_ms: u64,

    /// Bound on registry, queue and sink calls in milliseconds
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,

    // Queue configuration
    /// `memory` or `jetstream`
    #[serde(default = "default_queue_backend")]
    pub queue_backend: String,

    /// Capacity of the in-memory queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    // NATS configuration
    #[serde(default = "default_nats_url")]
    pub nats_url: String,

    #[serde(default = "default_nats_stream")]
    pub nats_stream: String,

    #[serde(default = "default_nats_subject")]
    pub nats_subject: String,

    /// Durable consumer name holding the worker's cursor
    #[serde(default = "default_nats_consumer")]
    pub nats_consumer: String,

    /// Committed entries older than this are dropped from the stream
    #[serde(default = "default_nats_max_age_secs")]
    pub nats_max_age_secs: u64,

    #[serde(default = "default_nats_max_bytes")]
    pub nats_max_bytes: i64,

    /// Startup timeout for connecting to NATS in seconds
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,

    // ClickHouse configuration
    /// ClickHouse HTTP URL. When unset, aggregates are served from memory.
    #[serde(default)]
    pub clickhouse_url: Option<String>,

    #[serde(default = "default_clickhouse_database")]
    pub clickhouse_database: String,

    #[serde(default = "default_clickhouse_username")]
    pub clickhouse_username: String,

    #[serde(default)]
    pub clickhouse_password: String,

    #[serde(default = "default_clickhouse_table")]
    pub clickhouse_table: String,

    // Worker configuration
    #[serde(default = "default_worker_batch_size")]
    pub worker_batch_size: usize,

    #[serde(default = "default_worker_interval_ms")]
    pub worker_interval_ms: u64,

    /// Start the batch worker together with the service
    #[serde(default = "default_worker_autostart")]
    pub worker_autostart: bool,

    // Aggregation configuration
    /// How far back the in-memory aggregation looks, in seconds
    #[serde(default = "default_memory_lookback_secs")]
    pub memory_lookback_secs: u64,

    /// Largest number of buckets a single aggregates query may produce
    #[serde(default = "default_max_buckets")]
    pub max_buckets: usize,

    /// Closer timeout on shutdown in seconds
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    // OpenTelemetry configuration
    /// OpenTelemetry OTLP endpoint (gRPC)
    #[serde(default = "default_otel_endpoint")]
    pub otel_endpoint: String,

    /// Enable OpenTelemetry export
    #[serde(default)]
    pub otel_enabled: bool,

    /// Service name for OpenTelemetry resource
    #[serde(default = "default_otel_service_name")]
    pub otel_service_name: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_http_host() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    3000
}

fn default_cors_allowed_origins() -> String {
    "*".to_string()
}

fn default_http_ignored_paths() -> String {
    "/health".to_string()
}

fn default_devices() -> String {
    "dev-001:secret-001,dev-002:secret-002".to_string()
}

fn default_replay_window_ms() -> u64 {
    300_000
}

fn default_io_timeout_ms() -> u64 {
    5000
}

fn default_queue_backend() -> String {
    "memory".to_string()
}

fn default_queue_capacity() -> usize {
    10_000
}

fn default_nats_url() -> String {
    "nats://localhost:4222".to_string()
}

fn default_nats_stream() -> String {
    "telemetry".to_string()
}

fn default_nats_subject() -> String {
    "telemetry.ingest".to_string()
}

fn default_nats_consumer() -> String {
    "telemetry-worker".to_string()
}

fn default_nats_max_age_secs() -> u64 {
    7 * 24 * 60 * 60
}

fn default_nats_max_bytes() -> i64 {
    1024 * 1024 * 1024
}

fn default_startup_timeout_secs() -> u64 {
    10
}

fn default_clickhouse_database() -> String {
    "default".to_string()
}

fn default_clickhouse_username() -> String {
    "default".to_string()
}

fn default_clickhouse_table() -> String {
    "telemetry".to_string()
}

fn default_worker_batch_size() -> usize {
    50
}

fn default_worker_interval_ms() -> u64 {
    5000
}

fn default_worker_autostart() -> bool {
    true
}

fn default_memory_lookback_secs() -> u64 {
    86_400
}

fn default_max_buckets() -> usize {
    10_080
}

fn default_shutdown_timeout_secs() -> u64 {
    10
}

fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_otel_service_name() -> String {
    "forgewatch".to_string()
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(Environment::with_prefix("FORGEWATCH"))
            .build()?
            .try_deserialize()
    }

    pub fn queue_kind(&self) -> Result<QueueKind, ConfigError> {
        match self.queue_backend.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(QueueKind::Memory),
            "jetstream" => Ok(QueueKind::JetStream),
            other => Err(ConfigError::Message(format!(
                "unknown queue_backend '{}', expected 'memory' or 'jetstream'",
                other
            ))),
        }
    }

    /// ClickHouse URL, ignoring blank values.
    pub fn clickhouse_url(&self) -> Option<&str> {
        self.clickhouse_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }

    /// Reject backend combinations the service cannot run with.
    pub fn validate(&self) -> Result<QueueKind, ConfigError> {
        let kind = self.queue_kind()?;
        if kind == QueueKind::JetStream && self.clickhouse_url().is_none() {
            return Err(ConfigError::Message(
                "queue_backend 'jetstream' requires clickhouse_url: nothing would drain the stream"
                    .to_string(),
            ));
        }
        if kind == QueueKind::JetStream && (self.nats_max_age_secs == 0 || self.nats_max_bytes <= 0)
        {
            return Err(ConfigError::Message(
                "nats_max_age_secs and nats_max_bytes must be greater than zero".to_string(),
            ));
        }
        if self.worker_batch_size == 0 {
            return Err(ConfigError::Message(
                "worker_batch_size must be greater than zero".to_string(),
            ));
        }
        Ok(kind)
    }

    pub fn ignored_paths(&self) -> Vec<String> {
        self.http_ignored_paths
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Mutex to ensure tests run serially and don't interfere with each other
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    const VARS: &[&str] = &[
        "FORGEWATCH_LOG_LEVEL",
        "FORGEWATCH_HTTP_PORT",
        "FORGEWATCH_QUEUE_BACKEND",
        "FORGEWATCH_CLICKHOUSE_URL",
        "FORGEWATCH_WORKER_AUTOSTART",
        "FORGEWATCH_NATS_MAX_AGE_SECS",
    ];

    fn clear_env() {
        for var in VARS {
            // SAFETY: Test runs with mutex lock to prevent concurrent env access
            unsafe {
                std::env::remove_var(var);
            }
        }
    }

    #[test]
    fn test_default_config() {
        let _lock = TEST_LOCK.lock().unwrap();
        clear_env();

        let config = ServiceConfig::from_env().unwrap();

        assert_eq!(config.log_level, "info");
        assert_eq!(config.http_port, 3000);
        assert_eq!(config.replay_window_ms, 300_000);
        assert_eq!(config.queue_capacity, 10_000);
        assert_eq!(config.worker_batch_size, 50);
        assert_eq!(config.worker_interval_ms, 5000);
        assert_eq!(config.nats_max_age_secs, 604_800);
        assert_eq!(config.nats_max_bytes, 1_073_741_824);
        assert!(config.clickhouse_url().is_none());
        assert_eq!(config.validate().unwrap(), QueueKind::Memory);
    }

    #[test]
    fn test_custom_config() {
        let _lock = TEST_LOCK.lock().unwrap();
        clear_env();

        // SAFETY: Test runs with mutex lock to prevent concurrent env access
        unsafe {
            std::env::set_var("FORGEWATCH_LOG_LEVEL", "debug");
            std::env::set_var("FORGEWATCH_HTTP_PORT", "8080");
            std::env::set_var("FORGEWATCH_QUEUE_BACKEND", "jetstream");
            std::env::set_var("FORGEWATCH_CLICKHOUSE_URL", "http://localhost:8123");
            std::env::set_var("FORGEWATCH_WORKER_AUTOSTART", "false");
        }

        let config = ServiceConfig::from_env().unwrap();
        clear_env();

        assert_eq!(config.log_level, "debug");
        assert_eq!(config.http_port, 8080);
        assert!(!config.worker_autostart);
        assert_eq!(config.validate().unwrap(), QueueKind::JetStream);
    }

    #[test]
    fn test_jetstream_without_sink_is_rejected() {
        let _lock = TEST_LOCK.lock().unwrap();
        clear_env();

        // SAFETY: Test runs with mutex lock to prevent concurrent env access
        unsafe {
            std::env::set_var("FORGEWATCH_QUEUE_BACKEND", "jetstream");
        }

        let config = ServiceConfig::from_env().unwrap();
        clear_env();

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unbounded_stream_is_rejected() {
        let _lock = TEST_LOCK.lock().unwrap();
        clear_env();

        // SAFETY: Test runs with mutex lock to prevent concurrent env access
        unsafe {
            std::env::set_var("FORGEWATCH_QUEUE_BACKEND", "jetstream");
            std::env::set_var("FORGEWATCH_CLICKHOUSE_URL", "http://localhost:8123");
            std::env::set_var("FORGEWATCH_NATS_MAX_AGE_SECS", "0");
        }

        let config = ServiceConfig::from_env().unwrap();
        clear_env();

        assert_eq!(config.nats_max_age_secs, 0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_backend_is_rejected() {
        let _lock = TEST_LOCK.lock().unwrap();
        clear_env();

        // SAFETY: Test runs with mutex lock to prevent concurrent env access
        unsafe {
            std::env::set_var("FORGEWATCH_QUEUE_BACKEND", "redis");
        }

        let config = ServiceConfig::from_env().unwrap();
        clear_env();

        assert!(config.queue_kind().is_err());
    }
}
