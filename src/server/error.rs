//! HTTP error responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

/// Error rendered as `{"detail": message}` with `status`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: msg.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.message }))).into_response()
    }
}

/// Every pipeline failure surfaces as a generic processing failure.
impl From<crate::Error> for ApiError {
    fn from(err: crate::Error) -> Self {
        if err.is_client_error() {
            tracing::warn!("request rejected: {err}");
        } else {
            tracing::error!("request failed: {err}");
        }
        ApiError::internal(format!("Audio processing failed: {err}"))
    }
}
