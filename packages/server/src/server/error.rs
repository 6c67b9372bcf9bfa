//! HTTP error taxonomy. Every handler error maps onto a status code and a
//! JSON `{"message": ...}` body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::kernel::PaymentError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Missing or malformed input.
    #[error("{0}")]
    BadRequest(String),
    /// Missing cookie or unknown session.
    #[error("{0}")]
    Unauthorized(String),
    /// Unknown ride id.
    #[error("{0}")]
    NotFound(String),
    /// Duplicate active ride.
    #[error("{0}")]
    Conflict(String),
    /// Payment gateway kept failing after retries.
    #[error(transparent)]
    PaymentGateway(#[from] PaymentError),
    /// Database or KV-store failure.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::PaymentGateway(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        ApiError::Internal(e.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match &self {
            ApiError::Internal(e) => {
                tracing::error!(error = %format!("{e:#}"), "internal error response");
                format!("{e:#}")
            }
            ApiError::PaymentGateway(e) => {
                tracing::error!(error = %e, "payment gateway error response");
                e.to_string()
            }
            other => {
                tracing::warn!(status = %status, error = %other, "error response");
                other.to_string()
            }
        };
        (status, Json(json!({ "message": message }))).into_response()
    }
}
