//! Admin endpoints: aggregate health and the unresolved-error page.
//! Both sit behind the API-key middleware.

use axum::{
    extract::{Query, State},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use super::internal_error;
use crate::domains::transcription::JobStatus;
use crate::server::app::AppState;

pub async fn admin_health_handler(State(state): State<AppState>) -> Response {
    let db_ok = tokio::time::timeout(std::time::Duration::from_secs(5), state.store.ping())
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false);

    let one_hour_ago = Utc::now() - chrono::Duration::hours(1);

    let counts = match state.store.counts_by_status(Some(one_hour_ago)).await {
        Ok(counts) => counts,
        Err(e) => return internal_error(e),
    };
    let recent_jobs: i64 = counts.values().sum();

    let recent_errors = match state.store.unresolved_error_count_since(one_hour_ago).await {
        Ok(count) => count,
        Err(e) => return internal_error(e),
    };

    let error_rate = if recent_jobs > 0 {
        recent_errors as f64 / recent_jobs as f64
    } else {
        0.0
    };

    let all_counts = match state.store.counts_by_status(None).await {
        Ok(counts) => counts,
        Err(e) => return internal_error(e),
    };

    let queue_depths = match state.broker.depths().await {
        Ok(depths) => depths,
        Err(e) => return internal_error(e),
    };

    let healthy = db_ok && error_rate < 0.1;

    Json(json!({
        "status": if healthy { "healthy" } else { "degraded" },
        "database": if db_ok { "connected" } else { "disconnected" },
        "queues": {
            "pending": all_counts.get(&JobStatus::Pending).copied().unwrap_or(0),
            "processing": all_counts.get(&JobStatus::Processing).copied().unwrap_or(0),
            "depths": queue_depths,
        },
        "model_pool": state.pool.stats(),
        "error_rate_1h": format!("{:.2}%", error_rate * 100.0),
        "unresolved_errors": recent_errors,
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
pub struct ErrorsQuery {
    pub limit: Option<i64>,
    pub resolved: Option<bool>,
}

pub async fn admin_errors_handler(
    State(state): State<AppState>,
    Query(query): Query<ErrorsQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(50).clamp(1, 100);
    let include_resolved = query.resolved.unwrap_or(false);

    let errors = match state.store.list_errors(limit, include_resolved).await {
        Ok(errors) => errors,
        Err(e) => return internal_error(e),
    };

    let errors: Vec<_> = errors
        .iter()
        .map(|error| {
            json!({
                "id": error.id,
                "job_id": error.job_id,
                "type": error.error_kind,
                "message": error.message,
                "created_at": error.created_at,
                "resolved": error.resolved,
            })
        })
        .collect();

    Json(json!({ "total": errors.len(), "errors": errors })).into_response()
}
