mod admin;
mod health;
mod jobs;
mod transcribe;

pub use admin::{admin_errors_handler, admin_health_handler};
pub use health::{health_handler, root_handler};
pub use jobs::list_jobs_handler;
pub use transcribe::{cancel_handler, job_status_handler, submit_handler};

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

pub(crate) fn bad_request(detail: impl Into<String>) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "detail": detail.into() }))).into_response()
}

pub(crate) fn not_found(detail: impl Into<String>) -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "detail": detail.into() }))).into_response()
}

pub(crate) fn internal_error(error: impl std::fmt::Display) -> Response {
    tracing::error!(error = %error, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "detail": format!("internal error: {}", error) })),
    )
        .into_response()
}
