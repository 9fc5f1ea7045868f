use axum::{
    extract::{Query, State},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;

use super::{bad_request, internal_error};
use crate::domains::transcription::JobStatus;
use crate::server::app::AppState;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
}

pub async fn list_jobs_handler(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Response {
    let status = match query.status.as_deref().filter(|s| !s.is_empty()) {
        Some(raw) => match raw.parse::<JobStatus>() {
            Ok(status) => Some(status),
            Err(_) => return bad_request(format!("invalid status '{}'", raw)),
        },
        None => None,
    };
    let limit = query.limit.unwrap_or(50).clamp(1, 100);

    let jobs = match state.store.list(status, limit).await {
        Ok(jobs) => jobs,
        Err(e) => return internal_error(e),
    };

    let jobs: Vec<_> = jobs
        .iter()
        .map(|job| {
            json!({
                "job_id": job.id,
                "filename": job.original_filename,
                "status": job.status,
                "progress": job.progress_percent,
                "model_size": job.model_tier,
                "created_at": job.created_at,
            })
        })
        .collect();

    Json(json!({ "total": jobs.len(), "jobs": jobs })).into_response()
}
