use thiserror::Error;

/// Errors raised while submitting or buffering telemetry.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("gateway rejected telemetry ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("buffer I/O failed: {0}")]
    Buffer(#[from] std::io::Error),

    #[error("buffer encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("signing failed: {0}")]
    Signing(#[from] common::domain::DomainError),
}

impl AgentError {
    /// Whether the gateway asked the device to hold the reading and retry.
    ///
    /// Transport failures and upstream outages qualify; rejections of the
    /// reading itself do not.
    pub fn is_retryable(&self) -> bool {
        match self {
            AgentError::Http(e) => !e.is_decode(),
            AgentError::Rejected { status, .. } => matches!(status, 502 | 504),
            _ => false,
        }
    }
}

pub type AgentResult<T> = Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_gateway_is_retryable() {
        let err = AgentError::Rejected {
            status: 502,
            message: "Queue temporarily unavailable".to_string(),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn test_client_errors_are_not_retryable() {
        for status in [400, 401] {
            let err = AgentError::Rejected {
                status,
                message: "nope".to_string(),
            };
            assert!(!err.is_retryable(), "status {} should not be retried", status);
        }
    }
}
