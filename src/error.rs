use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

/// The main error type for paygate operations.
#[derive(Debug, thiserror::Error)]
pub enum PaygateError {
    #[error("Authentication required: {0}")]
    AuthenticationRequired(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    /// The payment provider timed out or errored. Retryable; the caller may
    /// fall back to the last-known profile state on read paths.
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Too many requests: {0}")]
    RateLimited(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, PaygateError>;

impl PaygateError {
    pub fn authentication_required(msg: impl Into<String>) -> Self {
        Self::AuthenticationRequired(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn upstream_unavailable(msg: impl Into<String>) -> Self {
        Self::UpstreamUnavailable(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn rate_limited(msg: impl Into<String>) -> Self {
        Self::RateLimited(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether retrying the operation may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::UpstreamUnavailable(_) | Self::ServiceUnavailable(_) | Self::RateLimited(_)
        )
    }

    /// HTTP status code for this error.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::AuthenticationRequired(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::UpstreamUnavailable(_) | Self::ServiceUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Internal(_) | Self::Anyhow(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to expose to clients in production.
    ///
    /// Internal and upstream errors are collapsed to a generic message to
    /// prevent information disclosure; client-caused errors keep their detail.
    #[must_use]
    pub fn safe_message(&self) -> String {
        match self {
            Self::Internal(_) | Self::Anyhow(_) => "Internal server error".to_string(),
            Self::UpstreamUnavailable(_) | Self::ServiceUnavailable(_) => {
                "Service temporarily unavailable".to_string()
            }
            other => other.to_string(),
        }
    }

    /// Convert to an HTTP response, exposing full detail only in dev mode.
    pub fn into_response_with_mode(self, dev_mode: bool) -> Response {
        let status = self.status_code();
        let message = if dev_mode {
            self.to_string()
        } else {
            self.safe_message()
        };

        let error_id = uuid::Uuid::new_v4().to_string();

        tracing::error!(
            target: "paygate::error",
            status = status.as_u16(),
            error_id = %error_id,
            error = %self,
            "Request failed"
        );

        let body = Json(ErrorResponse {
            error: message,
            error_id,
        });

        (status, body).into_response()
    }
}

/// Standard error response body.
#[derive(Serialize)]
pub struct ErrorResponse {
    error: String,
    error_id: String,
}

impl IntoResponse for PaygateError {
    fn into_response(self) -> Response {
        self.into_response_with_mode(false)
    }
}
