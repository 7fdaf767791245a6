//! Device-side telemetry submission.
//!
//! Signs envelopes the same way the ingestion gateway verifies them and
//! keeps a local JSON-lines buffer for readings the gateway could not
//! accept yet.

pub mod agent;
pub mod buffer;
pub mod error;
pub mod simulator;

pub use agent::*;
pub use buffer::*;
pub use error::*;
pub use simulator::*;
