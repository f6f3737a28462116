//! Minimal bearer-token extraction against the `Tokens` collaborator
//! (spec.md §6.3). Issuing/refreshing tokens, OAuth linking, and the
//! browser login flow are out of scope here (spec.md §1) — this extractor
//! only answers "who is making this call" for the handlers below.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use store::{Claims, Tokens};

use crate::app_state::AppState;

pub struct AuthUser(pub Claims);

pub struct AuthError;

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "success": false,
            "error": { "kind": "Forbidden", "message": "missing or invalid bearer token" },
        }));
        (StatusCode::UNAUTHORIZED, body).into_response()
    }
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(AuthError)?;
        let token = header.strip_prefix("Bearer ").ok_or(AuthError)?;
        let claims = state.tokens.validate(token).map_err(|_| AuthError)?;
        Ok(AuthUser(claims))
    }
}
