//! Service-specific error types
//!
//! Wraps errors from the core crates plus the HTTP-layer concerns that sit
//! outside their scope (config loading, listener binding). The core itself
//! never speaks HTTP (spec.md §7); this is where that translation happens.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to bind listener: {0}")]
    ListenerBind(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Executor(#[from] cloud_code_executor::Error),

    #[error(transparent)]
    Pool(#[from] cloud_code_pool::Error),

    #[error(transparent)]
    Auth(#[from] cloud_code_auth::Error),
}

/// Result alias
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Anthropic-style error `type` string, used in the JSON body and as the
    /// `proxy_upstream_errors_total` metric label.
    pub(crate) fn error_type(&self) -> &'static str {
        match self {
            Error::Executor(cloud_code_executor::Error::RateLimited { .. }) => "rate_limit_error",
            Error::Executor(cloud_code_executor::Error::AuthInvalidPermanent(_)) => {
                "authentication_error"
            }
            Error::Executor(cloud_code_executor::Error::NoAccountsAvailable(_))
            | Error::Executor(cloud_code_executor::Error::MaxRetriesExceeded) => "overloaded_error",
            Error::Executor(cloud_code_executor::Error::Cancelled) => "overloaded_error",
            Error::Executor(cloud_code_executor::Error::Upstream(_)) => "api_error",
            Error::Executor(cloud_code_executor::Error::Pool(_)) | Error::Pool(_) => "api_error",
            Error::Auth(_) => "authentication_error",
            Error::InvalidRequest(_) => "invalid_request_error",
            Error::Config(_) | Error::ListenerBind(_) => "api_error",
        }
    }

    pub(crate) fn status(&self) -> StatusCode {
        match self {
            Error::Executor(cloud_code_executor::Error::RateLimited { .. }) => {
                StatusCode::TOO_MANY_REQUESTS
            }
            Error::Executor(cloud_code_executor::Error::AuthInvalidPermanent(_)) => {
                StatusCode::UNAUTHORIZED
            }
            Error::Executor(cloud_code_executor::Error::NoAccountsAvailable(_))
            | Error::Executor(cloud_code_executor::Error::MaxRetriesExceeded) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Error::Executor(cloud_code_executor::Error::Cancelled) => StatusCode::BAD_REQUEST,
            Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = serde_json::json!({
            "type": "error",
            "error": {
                "type": self.error_type(),
                "message": self.to_string(),
            }
        });
        (status, axum::Json(body)).into_response()
    }
}
