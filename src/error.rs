// Error types for the oracle reliability node
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("Connection timed out after {0}ms")]
    ConnectionTimeout(u64),

    #[error("No provider available ({attempted} endpoints attempted)")]
    NoProviderAvailable { attempted: usize },

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Provider {endpoint} failed: {message}")]
    Provider { endpoint: String, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl OracleError {
    pub fn provider(endpoint: &str, message: impl Into<String>) -> Self {
        OracleError::Provider {
            endpoint: endpoint.to_string(),
            message: message.into(),
        }
    }

    /// Transient failures are retried locally and never stop the monitor.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OracleError::ConnectionTimeout(_) | OracleError::Provider { .. } | OracleError::Http(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, OracleError>;
