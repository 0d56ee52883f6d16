// Error handling module
// Relay error taxonomy and control API response conversion

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Errors raised along the acquisition and delivery paths
#[derive(Error, Debug)]
pub enum RelayError {
    /// Credential source unreachable or value absent
    #[error("Credential acquisition failed: {0}")]
    Acquisition(String),

    /// Persisted store unreachable
    #[error("Config store unavailable: {0}")]
    ConfigUnavailable(String),

    /// Collector answered with a non-2xx status
    #[error("Delivery rejected: {status} - {body}")]
    DeliveryRejected { status: u16, body: String },

    /// Network-level failure talking to the collector
    #[error("Transport failure: {0}")]
    Transport(String),

    /// Configured endpoint is not a valid URL
    #[error("Invalid relay endpoint: {0}")]
    InvalidEndpoint(String),

    /// Forced delivery requested without a token
    #[error("No token to deliver")]
    EmptyToken,
}

impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            "timeout"
        } else if err.is_connect() {
            "connection_failed"
        } else if err.is_request() {
            "request_error"
        } else if err.is_body() {
            "body_error"
        } else {
            "unknown"
        };
        RelayError::Transport(format!("{} (kind: {})", err, kind))
    }
}

/// Errors returned by the control API
#[derive(Error, Debug)]
pub enum ApiError {
    /// Authentication failed
    #[error("Authentication failed: {0}")]
    AuthError(String),

    /// Request validation error
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Relay failure surfaced to a caller
    #[error(transparent)]
    Relay(#[from] RelayError),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            ApiError::AuthError(msg) => (StatusCode::UNAUTHORIZED, "auth_error", msg),
            ApiError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg),
            ApiError::Relay(err) => {
                let status = match err {
                    RelayError::Acquisition(_)
                    | RelayError::ConfigUnavailable(_)
                    | RelayError::EmptyToken => StatusCode::SERVICE_UNAVAILABLE,
                    RelayError::InvalidEndpoint(_) => StatusCode::BAD_REQUEST,
                    _ => StatusCode::BAD_GATEWAY,
                };
                (status, "relay_error", err.to_string())
            }
            ApiError::Internal(err) => {
                tracing::error!("Internal error: {:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "Internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "message": message,
                "type": error_type,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;
