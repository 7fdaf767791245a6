mod aggregation_service;
mod buckets;
mod ingestion_metrics;
mod ingestion_service;

pub use aggregation_service::*;
pub use buckets::*;
pub use ingestion_metrics::*;
pub use ingestion_service::*;
