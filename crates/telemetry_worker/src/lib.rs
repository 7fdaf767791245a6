pub mod domain;
pub mod telemetry_worker;

pub use domain::*;
pub use telemetry_worker::*;
