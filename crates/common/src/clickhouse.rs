mod client;
mod telemetry_repository;

pub use client::*;
pub use telemetry_repository::*;
