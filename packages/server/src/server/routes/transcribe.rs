//! Submission, status, and cancellation endpoints.

use std::path::Path;

use axum::{
    extract::{Multipart, Path as UrlPath, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use super::{bad_request, internal_error, not_found};
use crate::domains::transcription::NewJob;
use crate::kernel::audit::{Actor, AuditEvent};
use crate::kernel::broker::queue_for_priority;
use crate::kernel::engine::ModelTier;
use crate::kernel::worker::envelope_for_job;
use crate::server::app::AppState;

/// Uploads from the public API run at top priority.
const API_PRIORITY: u8 = 9;

const RESOURCE_TYPE: &str = "transcription_job";

fn acceptable_content_type(content_type: Option<&str>) -> bool {
    match content_type {
        Some(ct) => {
            ct.starts_with("audio/")
                || ct.starts_with("video/")
                || ct == "application/octet-stream"
        }
        None => false,
    }
}

struct Upload {
    filename: String,
    content_type: Option<String>,
    bytes: Bytes,
}

pub async fn submit_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Response {
    let mut upload: Option<Upload> = None;
    let mut model_size: Option<String> = None;
    let mut language: Option<String> = None;

    loop {
        match multipart.next_field().await {
            Ok(Some(field)) => match field.name().map(str::to_string).as_deref() {
                Some("file") => {
                    let filename = field
                        .file_name()
                        .map(str::to_string)
                        .unwrap_or_else(|| "upload.bin".to_string());
                    let content_type = field.content_type().map(str::to_string);
                    match field.bytes().await {
                        Ok(bytes) => {
                            upload = Some(Upload {
                                filename,
                                content_type,
                                bytes,
                            })
                        }
                        Err(e) => return bad_request(format!("failed to read upload: {}", e)),
                    }
                }
                Some("model_size") => model_size = field.text().await.ok(),
                Some("language") => language = field.text().await.ok(),
                _ => {}
            },
            Ok(None) => break,
            Err(e) => return bad_request(format!("malformed multipart body: {}", e)),
        }
    }

    let Some(upload) = upload else {
        return bad_request("missing 'file' field");
    };

    if !acceptable_content_type(upload.content_type.as_deref()) {
        return bad_request("Uploaded file must be an audio or video file");
    }

    if upload.bytes.len() as u64 > state.config.max_upload_size_bytes() {
        return (
            StatusCode::PAYLOAD_TOO_LARGE,
            Json(json!({
                "detail": format!(
                    "File too large. Maximum size is {}MB",
                    state.config.max_upload_size_mb
                )
            })),
        )
            .into_response();
    }

    let model_tier = match model_size.as_deref().filter(|s| !s.is_empty()) {
        Some(raw) => match raw.parse::<ModelTier>() {
            Ok(tier) => tier,
            Err(_) => return bad_request(format!("invalid model_size '{}'", raw)),
        },
        None => state.config.model_tier,
    };
    let language = language.filter(|l| !l.is_empty() && l != "auto");

    // Uploads land under a per-job directory before the row exists.
    let job_id = Uuid::new_v4();
    let safe_name = Path::new(&upload.filename)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("upload.bin")
        .to_string();
    let upload_dir = state
        .config
        .work_folder
        .join("uploads")
        .join(job_id.to_string());
    if let Err(e) = tokio::fs::create_dir_all(&upload_dir).await {
        return internal_error(e);
    }
    let file_path = upload_dir.join(&safe_name);
    if let Err(e) = tokio::fs::write(&file_path, &upload.bytes).await {
        return internal_error(e);
    }

    let job = match state
        .store
        .create_job(NewJob {
            id: job_id,
            original_filename: safe_name,
            file_path: file_path.display().to_string(),
            file_size_bytes: upload.bytes.len() as i64,
            model_tier,
            language,
            priority: API_PRIORITY as i32,
            max_retries: state.config.max_retries,
        })
        .await
    {
        Ok(job) => job,
        Err(e) => return internal_error(e),
    };

    let envelope = envelope_for_job(&job);
    if let Err(e) = state
        .broker
        .publish(
            &envelope,
            queue_for_priority(API_PRIORITY),
            API_PRIORITY,
            None,
        )
        .await
    {
        return internal_error(e);
    }

    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let audit_event = AuditEvent::new("job.create", RESOURCE_TYPE)
        .resource_id(job.id)
        .actor(Actor {
            user_agent,
            ..Default::default()
        })
        .states(
            None,
            Some(json!({
                "status": "pending",
                "model_tier": job.model_tier,
                "file_size_bytes": job.file_size_bytes,
            })),
        );
    if let Err(e) = state.audit.log(audit_event).await {
        tracing::error!(error = %e, "failed to audit job.create");
    }

    info!(job_id = %job.id, size = job.file_size_bytes, "job submitted");

    (
        StatusCode::ACCEPTED,
        Json(json!({
            "job_id": job.id,
            "status": "pending",
            "message": "Transcription job submitted. Poll GET /transcribe/{job_id} for status.",
        })),
    )
        .into_response()
}

pub async fn job_status_handler(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<Uuid>,
) -> Response {
    let job = match state.store.get(id).await {
        Ok(Some(job)) if job.deleted_at.is_none() => job,
        Ok(_) => return not_found("Job not found"),
        Err(e) => return internal_error(e),
    };

    let mut body = json!({
        "job_id": job.id,
        "status": job.status,
        "progress": job.progress_percent,
        "current_step": job.current_step,
        "model_size": job.model_tier,
        "created_at": job.created_at,
    });

    if let Some(started_at) = job.started_at {
        body["started_at"] = json!(started_at);
    }

    match job.status {
        crate::domains::transcription::JobStatus::Completed => {
            match state.store.result_for(id).await {
                Ok(Some(result)) => {
                    body["transcription"] = json!(result.transcript_text);
                    body["language"] = json!(result.detected_language);
                    body["duration"] = json!(result.duration_seconds);
                    body["word_count"] =
                        json!(result.transcript_text.split_whitespace().count());
                    body["completed_at"] = json!(job.completed_at);
                }
                Ok(None) => {}
                Err(e) => return internal_error(e),
            }
        }
        crate::domains::transcription::JobStatus::Failed => {
            body["error_type"] = json!(job.error_kind);
            body["error_message"] = json!(job.error_message);
            body["completed_at"] = json!(job.completed_at);
        }
        _ => {}
    }

    Json(body).into_response()
}

pub async fn cancel_handler(State(state): State<AppState>, UrlPath(id): UrlPath<Uuid>) -> Response {
    let job = match state.store.get(id).await {
        Ok(Some(job)) if job.deleted_at.is_none() => job,
        Ok(_) => return not_found("Job not found"),
        Err(e) => return internal_error(e),
    };

    if job.status.is_terminal() {
        return bad_request(format!("Cannot cancel job with status: {}", job.status));
    }

    let was_processing = job.status == crate::domains::transcription::JobStatus::Processing;

    match state.store.cancel(id).await {
        Ok(outcome) if outcome.is_applied() => {}
        Ok(_) => return bad_request(format!("Cannot cancel job with status: {}", job.status)),
        Err(e) => return internal_error(e),
    }

    // Advisory: ask the broker to drop the in-flight task. Correctness
    // rests on the CAS guard, not on this.
    if was_processing {
        if let Some(task_id) = job.worker_id.as_deref().and_then(|w| w.parse::<Uuid>().ok()) {
            let _ = state.broker.revoke(task_id).await;
        }
    }

    let audit_event = AuditEvent::new("job.cancel", RESOURCE_TYPE)
        .resource_id(id)
        .states(Some(json!({ "status": job.status })), Some(json!({ "status": "cancelled" })));
    if let Err(e) = state.audit.log(audit_event).await {
        tracing::error!(error = %e, "failed to audit job.cancel");
    }

    Json(json!({
        "job_id": id,
        "status": "cancelled",
        "message": "Job cancelled successfully",
    }))
    .into_response()
}
