use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use crate::server::app::AppState;

pub async fn root_handler() -> impl IntoResponse {
    Json(json!({ "status": "healthy", "service": "scribe" }))
}

/// Basic liveness: the service is up and the database answers.
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let db_ok = tokio::time::timeout(std::time::Duration::from_secs(5), state.store.ping())
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false);

    let status = if db_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if db_ok { "healthy" } else { "degraded" },
            "database": if db_ok { "connected" } else { "disconnected" },
            "service": "transcription-api",
        })),
    )
}
