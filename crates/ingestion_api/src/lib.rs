pub mod domain;
pub mod rest;
pub mod ingestion_api;

pub use domain::*;
pub use ingestion_api::*;
