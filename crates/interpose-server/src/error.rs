//! API error types.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use interpose_core::{CommandError, RequestError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// API errors.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The coordinator rejected or failed the request.
    #[error(transparent)]
    Request(#[from] RequestError),

    /// Malformed request body.
    #[error("bad request: {0}")]
    BadRequest(String),
}

/// Error response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Request(RequestError::InvalidTarget(_)) => StatusCode::BAD_REQUEST,
            ApiError::Request(RequestError::Cancelled) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Request(RequestError::Command(e)) => match e {
                CommandError::PermissionDenied(_) => StatusCode::FORBIDDEN,
                CommandError::CommandFailed { .. }
                | CommandError::IncompleteRuleSet { .. }
                | CommandError::Channel(_) => StatusCode::BAD_GATEWAY,
            },
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::Request(e) => e.kind(),
            ApiError::BadRequest(_) => "bad_request",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: self.to_string(),
            code: self.code().to_string(),
        };

        (self.status(), axum::Json(body)).into_response()
    }
}

/// Result type for API operations.
pub type Result<T> = std::result::Result<T, ApiError>;
