use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::error;

use crate::error::MonitorError;

/// Map a pipeline error onto the HTTP surface. Validation details are safe
/// to echo; everything else is logged server-side and answered generically
/// so internals never leak into a response body.
pub fn respond(context: &str, err: MonitorError) -> Response {
    match &err {
        MonitorError::Validation(msg) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": msg })),
        )
            .into_response(),
        MonitorError::Auth(_) => (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "Unauthorized" })),
        )
            .into_response(),
        _ => internal_error(context, err),
    }
}

/// Return a generic 500 response, logging the real error server-side.
pub fn internal_error(context: &str, err: impl std::fmt::Display) -> Response {
    error!(context = context, error = %err, "Internal error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": "Internal server error" })),
    )
        .into_response()
}
