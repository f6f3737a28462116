//! Maps `OrchestratorError` onto the `{success, error:{kind, message}}`
//! envelope of spec.md §7, with the HTTP status each `kind` implies.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use orchestrator::OrchestratorError;
use serde_json::json;

pub struct ApiError(pub OrchestratorError);

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            OrchestratorError::Forbidden => StatusCode::FORBIDDEN,
            OrchestratorError::NotFound => StatusCode::NOT_FOUND,
            OrchestratorError::UnsupportedLanguage(_) => StatusCode::BAD_REQUEST,
            OrchestratorError::TooManyConcurrent | OrchestratorError::RateLimited => {
                StatusCode::TOO_MANY_REQUESTS
            }
            OrchestratorError::QuotaExceeded => StatusCode::PAYMENT_REQUIRED,
            OrchestratorError::SandboxUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            OrchestratorError::SetupFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            OrchestratorError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(json!({
            "success": false,
            "error": { "kind": self.0.kind(), "message": self.0.to_string() },
        }));
        (status, body).into_response()
    }
}
