use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

#[derive(Error, Debug)]
pub enum DomainError {
    #[error("Missing required header: {0}")]
    MissingHeader(&'static str),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Timestamp outside replay window: {0}")]
    ReplayRejected(String),

    #[error("Invalid signature")]
    SignatureMismatch,

    #[error("Invalid JSON payload: {0}")]
    InvalidJson(String),

    #[error("Invalid payload structure: {0}")]
    SchemaViolation(String),

    #[error("Device ID mismatch: header {header}, payload {payload}")]
    DeviceIdMismatch { header: String, payload: String },

    #[error("Unknown device ID: {0}")]
    UnknownDevice(String),

    #[error("Queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("Sink write failed: {0}")]
    SinkWrite(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Operation timed out: {0}")]
    Timeout(&'static str),

    #[error("Batch worker is not configured")]
    WorkerUnavailable,

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Repository error: {0}")]
    RepositoryError(#[from] anyhow::Error),
}

/// Run `future`, mapping an elapsed deadline to `DomainError::Timeout`.
pub async fn with_timeout<T, F>(
    operation: &'static str,
    timeout: std::time::Duration,
    future: F,
) -> DomainResult<T>
where
    F: std::future::Future<Output = DomainResult<T>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => Err(DomainError::Timeout(operation)),
    }
}
