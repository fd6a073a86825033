use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Result type for fetch layer operations
pub type Result<T> = std::result::Result<T, FetchError>;

/// Fetch layer error types
///
/// Errors are `Clone` because coalesced scheduler waiters share one outcome.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    #[error("Circuit open for {endpoint}, retry in {retry_after_ms}ms")]
    CircuitOpen { endpoint: String, retry_after_ms: u64 },

    #[error("Upstream failure from {provider}: {message}")]
    Upstream {
        provider: String,
        status: Option<u16>,
        latency_ms: u64,
        message: String,
    },

    #[error("Timeout after {timeout_ms}ms waiting on {provider}")]
    Timeout { provider: String, timeout_ms: u64 },

    #[error("All sources unavailable for {key} (attempted: {attempted:?})")]
    AllSourcesUnavailable {
        key: String,
        attempted: Vec<String>,
        connectivity_only: bool,
    },

    #[error("Offline request {id} abandoned after {attempts} attempts")]
    OfflineQueueExhausted { id: String, attempts: u32 },

    #[error("Request deferred to offline queue as {id}")]
    QueuedOffline { id: String },

    #[error("Request cancelled: {0}")]
    Cancelled(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid cache pattern: {0}")]
    InvalidPattern(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FetchError {
    /// Build an upstream failure without an HTTP status (transport level)
    pub fn transport(provider: impl Into<String>, message: impl Into<String>) -> Self {
        FetchError::Upstream {
            provider: provider.into(),
            status: None,
            latency_ms: 0,
            message: message.into(),
        }
    }

    /// Whether the failure indicates the network (not the provider) is the problem
    pub fn is_connectivity(&self) -> bool {
        match self {
            FetchError::Timeout { .. } => true,
            FetchError::Upstream { status, .. } => status.is_none(),
            FetchError::AllSourcesUnavailable {
                connectivity_only, ..
            } => *connectivity_only,
            _ => false,
        }
    }

    /// Whether a scheduler retry could change the outcome
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Upstream {
                status: Some(status),
                ..
            } => *status == 429 || *status >= 500,
            other => other.is_connectivity(),
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            FetchError::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            FetchError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            FetchError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            FetchError::AllSourcesUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            FetchError::OfflineQueueExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            FetchError::QueuedOffline { .. } => StatusCode::ACCEPTED,
            FetchError::Cancelled(_) => StatusCode::CONFLICT,
            FetchError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            FetchError::InvalidPattern(_) => StatusCode::BAD_REQUEST,
            FetchError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            FetchError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
            FetchError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(e: serde_json::Error) -> Self {
        FetchError::Serialization(e.to_string())
    }
}

impl IntoResponse for FetchError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            FetchError::CircuitOpen {
                endpoint: "a".to_string(),
                retry_after_ms: 10
            }
            .status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            FetchError::Timeout {
                provider: "a".to_string(),
                timeout_ms: 10
            }
            .status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            FetchError::InvalidPattern("(".to_string()).status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_error_display() {
        let err = FetchError::Cancelled("quote:symbol=AAPL".to_string());
        assert_eq!(err.to_string(), "Request cancelled: quote:symbol=AAPL");
    }

    #[test]
    fn test_connectivity_classification() {
        assert!(FetchError::transport("a", "connection refused").is_connectivity());
        assert!(FetchError::Timeout {
            provider: "a".to_string(),
            timeout_ms: 5
        }
        .is_connectivity());

        let http_failure = FetchError::Upstream {
            provider: "a".to_string(),
            status: Some(503),
            latency_ms: 12,
            message: "unavailable".to_string(),
        };
        assert!(!http_failure.is_connectivity());
        assert!(http_failure.is_retryable());

        let not_found = FetchError::Upstream {
            provider: "a".to_string(),
            status: Some(404),
            latency_ms: 3,
            message: "missing".to_string(),
        };
        assert!(!not_found.is_retryable());
    }

    #[test]
    fn test_exhausted_sources_inherit_connectivity() {
        let err = FetchError::AllSourcesUnavailable {
            key: "k".to_string(),
            attempted: vec!["a".to_string()],
            connectivity_only: true,
        };
        assert!(err.is_connectivity());
        assert!(err.is_retryable());
    }
}
