// Error types for the Stevedore server

use http::StatusCode;
use stevedore_config::ConfigError;
use stevedore_queue::QueueError;
use stevedore_supervisor::SupervisorError;
use thiserror::Error;

/// Errors that stop an instance from starting or running.
#[derive(Error, Debug)]
pub enum ServerError {
    /// The listen address could not be bound
    #[error("Failed to bind listener: {0}")]
    Bind(String),

    /// Broker connection or worker pool failure
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The listener passed down by the supervisor was unusable
    #[error("Listener handoff error: {0}")]
    Handoff(#[from] SupervisorError),

    /// Socket setup failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for instance startup and shutdown.
pub type Result<T> = std::result::Result<T, ServerError>;

/// Errors returned to HTTP clients.
#[derive(Error, Debug)]
pub enum ApiError {
    /// Malformed or invalid request (400)
    #[error("{0}")]
    BadRequest(String),

    /// Unknown route (404)
    #[error("Not found")]
    NotFound,

    /// The broker is unreachable (503)
    #[error("{0}")]
    ServiceUnavailable(String),

    /// Anything else (500). The detail is logged, never sent.
    #[error("Internal server error")]
    Internal(String),
}

impl ApiError {
    /// HTTP status for the error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Body sent to the client. Internal details stay in the logs.
    pub fn body(&self) -> serde_json::Value {
        serde_json::json!({ "error": self.to_string() })
    }
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        if err.is_client_error() {
            ApiError::BadRequest(err.to_string())
        } else if err.is_broker_error() {
            ApiError::ServiceUnavailable(err.to_string())
        } else {
            ApiError::Internal(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_errors_map_to_status() {
        let err: ApiError = QueueError::Validation("message is required".into()).into();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.body()["error"], "Validation error: message is required");

        let err: ApiError = QueueError::BrokerUnavailable("connection refused".into()).into();
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);

        let err: ApiError = QueueError::Serialization("bad".into()).into();
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.body()["error"], "Internal server error");
    }

    #[test]
    fn test_not_found_body() {
        assert_eq!(ApiError::NotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::NotFound.body(), serde_json::json!({"error": "Not found"}));
    }
}
