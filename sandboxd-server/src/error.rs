//! Mapping from the error taxonomy to HTTP responses.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use sandboxd_shared::SandboxError;

/// Wrapper making the library errors usable as axum rejections.
#[derive(Debug)]
pub struct ApiError(pub SandboxError);

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        ApiError(SandboxError::InvalidRequest(message.into()))
    }

    pub fn status(&self) -> StatusCode {
        match &self.0 {
            SandboxError::NotFound(_) => StatusCode::NOT_FOUND,
            SandboxError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            SandboxError::NotRunning(_) | SandboxError::Conflict(_) => StatusCode::CONFLICT,
            SandboxError::Unsupported(_) => StatusCode::NOT_IMPLEMENTED,
            SandboxError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            SandboxError::Upstream(_)
            | SandboxError::Canceled(_)
            | SandboxError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<SandboxError> for ApiError {
    fn from(err: SandboxError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}
