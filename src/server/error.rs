//! Mapping of engine errors onto HTTP responses.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::tree::core::errors::{ErrorKind, TreeError};

/// Error body shared by JSON responses and SSE `error` events.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Error category.
    pub kind: &'static str,
    /// Message suitable for a notification.
    pub message: String,
    /// Technical detail.
    pub detail: String,
    /// Seconds to wait before retrying, for rate limits.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl From<&TreeError> for ErrorBody {
    fn from(err: &TreeError) -> Self {
        let retry_after_secs = match err {
            TreeError::ProviderRateLimited {
                retry_after_secs, ..
            } => *retry_after_secs,
            _ => None,
        };
        Self {
            kind: err.kind().as_str(),
            message: err.user_message(),
            detail: err.to_string(),
            retry_after_secs,
        }
    }
}

/// HTTP status for an error category.
#[must_use]
pub const fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Invalid => StatusCode::BAD_REQUEST,
        ErrorKind::Busy => StatusCode::CONFLICT,
        ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::QuotaExceeded => StatusCode::PAYMENT_REQUIRED,
        ErrorKind::Transport => StatusCode::BAD_GATEWAY,
        ErrorKind::Persistence => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Engine error returned from a handler.
#[derive(Debug)]
pub struct ApiError(pub TreeError);

impl From<TreeError> for ApiError {
    fn from(err: TreeError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(self.0.kind());
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self.0);
        } else {
            tracing::debug!("Request rejected: {}", self.0);
        }
        (status, Json(ErrorBody::from(&self.0))).into_response()
    }
}
