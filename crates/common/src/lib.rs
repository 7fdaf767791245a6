pub mod auth;
pub mod clickhouse;
pub mod domain;
pub mod garde;
pub mod nats;
pub mod telemetry;
