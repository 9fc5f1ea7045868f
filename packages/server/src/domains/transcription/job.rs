//! Job lifecycle models and the status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::FromRow;
use uuid::Uuid;

use crate::kernel::engine::{ErrorKind, ModelTier};

/// Error messages surfaced on the job row are capped at this length;
/// full messages live in the error log.
const ERROR_MESSAGE_LIMIT: usize = 500;

// ============================================================================
// Status state machine
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
    Retry,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Allowed transitions. The `processing -> processing` self-edge is a
    /// re-assertion, not a transition: progress checkpoints and
    /// crash-redelivery re-claims CAS on it so a concurrent cancel is
    /// observed instead of overwritten.
    pub fn can_transition(from: JobStatus, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (from, to),
            (Pending, Processing)
                | (Pending, Cancelled)
                | (Processing, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Retry)
                | (Processing, Cancelled)
                | (Retry, Processing)
                | (Retry, Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Retry => "retry",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            "retry" => Ok(JobStatus::Retry),
            other => Err(anyhow::anyhow!("unknown job status '{}'", other)),
        }
    }
}

// ============================================================================
// Job
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Job {
    pub id: Uuid,
    pub status: JobStatus,
    pub priority: i32,

    pub model_tier: ModelTier,
    pub language: Option<String>,

    pub original_filename: String,
    pub file_path: String,
    pub file_size_bytes: i64,

    pub worker_id: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,

    pub progress_percent: f64,
    pub current_step: Option<String>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,

    pub deleted_at: Option<DateTime<Utc>>,
    pub deletion_policy: Option<String>,
    pub legal_hold_id: Option<Uuid>,
    pub retention_until: Option<DateTime<Utc>>,
}

impl Job {
    pub fn duration_seconds(&self) -> Option<f64> {
        match (self.started_at, self.completed_at) {
            (Some(started), Some(completed)) => {
                Some((completed - started).num_milliseconds() as f64 / 1000.0)
            }
            _ => None,
        }
    }

    /// Soft-deleted jobs under an active legal hold are never purged.
    pub fn purge_eligible(&self, now: DateTime<Utc>) -> bool {
        self.deleted_at.is_some()
            && self.legal_hold_id.is_none()
            && self.retention_until.map(|until| until < now).unwrap_or(false)
    }
}

/// Inputs for a new submission. The id is caller-assigned so the upload
/// can be stored under it before the row exists.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: Uuid,
    pub original_filename: String,
    pub file_path: String,
    pub file_size_bytes: i64,
    pub model_tier: ModelTier,
    pub language: Option<String>,
    pub priority: i32,
    pub max_retries: i32,
}

impl NewJob {
    pub fn into_job(self) -> Job {
        Job {
            id: self.id,
            status: JobStatus::Pending,
            priority: self.priority.clamp(0, 9),
            model_tier: self.model_tier,
            language: self.language,
            original_filename: self.original_filename,
            file_path: self.file_path,
            file_size_bytes: self.file_size_bytes,
            worker_id: None,
            retry_count: 0,
            max_retries: self.max_retries,
            progress_percent: 0.0,
            current_step: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_kind: None,
            error_message: None,
            deleted_at: None,
            deletion_policy: None,
            legal_hold_id: None,
            retention_until: None,
        }
    }
}

// ============================================================================
// Transitions
// ============================================================================

/// Field updates applied together with a status transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionPatch {
    pub worker_id: Option<String>,
    pub progress_percent: Option<f64>,
    pub current_step: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub model_tier: Option<ModelTier>,
    pub retry_count: Option<i32>,
    pub file_path: Option<String>,
}

/// Result of a compare-and-set write: either the updated row, or the
/// status actually observed when the expected one did not match.
#[derive(Debug, Clone)]
pub enum CasOutcome {
    Applied(Job),
    Conflict(JobStatus),
}

impl CasOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, CasOutcome::Applied(_))
    }
}

/// Apply a validated transition to an in-memory row. Shared by the
/// Postgres adapter (inside its row-locked transaction) and the in-memory
/// store, so both enforce identical semantics:
///
/// - `started_at` is set once, on first entry into processing;
/// - `completed_at` is set on entry into any terminal status;
/// - progress is non-decreasing, except an explicit retry resets it to 0;
/// - error messages are bounded.
pub fn apply_transition(job: &mut Job, to: JobStatus, patch: TransitionPatch, now: DateTime<Utc>) {
    job.status = to;

    if let Some(worker_id) = patch.worker_id {
        job.worker_id = Some(worker_id);
    }
    if let Some(step) = patch.current_step {
        job.current_step = Some(step);
    }
    if let Some(kind) = patch.error_kind {
        job.error_kind = Some(kind);
    }
    if let Some(message) = patch.error_message {
        job.error_message = Some(bound_error_message(&message));
    }
    if let Some(tier) = patch.model_tier {
        job.model_tier = tier;
    }
    if let Some(retry_count) = patch.retry_count {
        job.retry_count = retry_count.min(job.max_retries);
    }
    if let Some(file_path) = patch.file_path {
        job.file_path = file_path;
    }

    if to == JobStatus::Retry {
        job.progress_percent = 0.0;
    } else if let Some(progress) = patch.progress_percent {
        job.progress_percent = progress.max(job.progress_percent).clamp(0.0, 100.0);
    }

    if to == JobStatus::Processing && job.started_at.is_none() {
        job.started_at = Some(now);
    }
    if to.is_terminal() {
        job.completed_at = Some(now);
    }
}

pub fn bound_error_message(message: &str) -> String {
    if message.chars().count() <= ERROR_MESSAGE_LIMIT {
        message.to_string()
    } else {
        message.chars().take(ERROR_MESSAGE_LIMIT).collect()
    }
}

/// Dedupe key for error-log idempotency across retried DLQ deliveries.
pub fn message_hash(message: &str) -> String {
    hex::encode(Sha256::digest(message.as_bytes()))
}

// ============================================================================
// Result and error log
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TranscriptionResult {
    pub id: Uuid,
    pub job_id: Uuid,
    pub transcript_text: String,
    pub detected_language: Option<String>,
    pub duration_seconds: Option<f64>,
    pub segments: Option<serde_json::Value>,
    pub output_file_path: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewResult {
    pub transcript_text: String,
    pub detected_language: Option<String>,
    pub duration_seconds: Option<f64>,
    pub segments: Option<serde_json::Value>,
    pub output_file_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ErrorLog {
    pub id: Uuid,
    pub job_id: Uuid,
    pub error_kind: ErrorKind,
    pub message: String,
    pub message_hash: String,
    pub stack_trace: Option<String>,
    pub context: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub resolution_note: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewErrorLog {
    pub error_kind: ErrorKind,
    pub message: String,
    pub stack_trace: Option<String>,
    pub context: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> Job {
        NewJob {
            id: Uuid::new_v4(),
            original_filename: "meeting.wav".to_string(),
            file_path: "/work/uploads/meeting.wav".to_string(),
            file_size_bytes: 1024,
            model_tier: ModelTier::Tiny,
            language: None,
            priority: 9,
            max_retries: 3,
        }
        .into_job()
    }

    #[test]
    fn new_job_starts_pending_with_zero_progress() {
        let job = sample_job();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress_percent, 0.0);
        assert_eq!(job.retry_count, 0);
        assert!(job.started_at.is_none());
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(!JobStatus::Retry.is_terminal());
    }

    #[test]
    fn state_machine_permits_the_documented_edges() {
        use JobStatus::*;
        assert!(JobStatus::can_transition(Pending, Processing));
        assert!(JobStatus::can_transition(Pending, Cancelled));
        assert!(JobStatus::can_transition(Processing, Completed));
        assert!(JobStatus::can_transition(Processing, Failed));
        assert!(JobStatus::can_transition(Processing, Retry));
        assert!(JobStatus::can_transition(Processing, Cancelled));
        assert!(JobStatus::can_transition(Retry, Processing));
        assert!(JobStatus::can_transition(Retry, Cancelled));
    }

    #[test]
    fn state_machine_rejects_everything_else() {
        use JobStatus::*;
        for terminal in [Completed, Failed, Cancelled] {
            for to in [Pending, Processing, Completed, Failed, Cancelled, Retry] {
                assert!(
                    !JobStatus::can_transition(terminal, to),
                    "{terminal} -> {to} must be forbidden"
                );
            }
        }
        assert!(!JobStatus::can_transition(Pending, Completed));
        assert!(!JobStatus::can_transition(Pending, Failed));
        assert!(!JobStatus::can_transition(Pending, Retry));
        assert!(!JobStatus::can_transition(Retry, Completed));
        assert!(!JobStatus::can_transition(Retry, Failed));
    }

    #[test]
    fn started_at_is_set_once_and_never_cleared() {
        let mut job = sample_job();
        let t0 = Utc::now();
        apply_transition(&mut job, JobStatus::Processing, TransitionPatch::default(), t0);
        assert_eq!(job.started_at, Some(t0));

        let t1 = t0 + chrono::Duration::seconds(5);
        apply_transition(&mut job, JobStatus::Retry, TransitionPatch::default(), t1);
        apply_transition(&mut job, JobStatus::Processing, TransitionPatch::default(), t1);
        assert_eq!(job.started_at, Some(t0));
    }

    #[test]
    fn completed_at_set_on_terminal_and_not_before_started() {
        let mut job = sample_job();
        let t0 = Utc::now();
        apply_transition(&mut job, JobStatus::Processing, TransitionPatch::default(), t0);
        let t1 = t0 + chrono::Duration::seconds(3);
        apply_transition(&mut job, JobStatus::Completed, TransitionPatch::default(), t1);

        assert_eq!(job.completed_at, Some(t1));
        assert!(job.completed_at >= job.started_at);
        assert_eq!(job.duration_seconds(), Some(3.0));
    }

    #[test]
    fn progress_is_monotone_except_retry_reset() {
        let mut job = sample_job();
        let now = Utc::now();
        apply_transition(
            &mut job,
            JobStatus::Processing,
            TransitionPatch {
                progress_percent: Some(30.0),
                ..Default::default()
            },
            now,
        );
        // A lower value never rolls progress back.
        apply_transition(
            &mut job,
            JobStatus::Processing,
            TransitionPatch {
                progress_percent: Some(10.0),
                ..Default::default()
            },
            now,
        );
        assert_eq!(job.progress_percent, 30.0);

        apply_transition(&mut job, JobStatus::Retry, TransitionPatch::default(), now);
        assert_eq!(job.progress_percent, 0.0);
    }

    #[test]
    fn retry_count_never_exceeds_max() {
        let mut job = sample_job();
        let now = Utc::now();
        apply_transition(&mut job, JobStatus::Processing, TransitionPatch::default(), now);
        apply_transition(
            &mut job,
            JobStatus::Failed,
            TransitionPatch {
                retry_count: Some(99),
                ..Default::default()
            },
            now,
        );
        assert_eq!(job.retry_count, job.max_retries);
    }

    #[test]
    fn error_message_is_bounded() {
        let long = "x".repeat(2000);
        assert_eq!(bound_error_message(&long).len(), 500);
        assert_eq!(bound_error_message("short"), "short");
    }

    #[test]
    fn purge_protects_legal_holds() {
        let now = Utc::now();
        let mut job = sample_job();
        job.deleted_at = Some(now - chrono::Duration::days(30));
        job.retention_until = Some(now - chrono::Duration::days(1));
        assert!(job.purge_eligible(now));

        job.legal_hold_id = Some(Uuid::new_v4());
        assert!(!job.purge_eligible(now));

        job.legal_hold_id = None;
        job.deleted_at = None;
        assert!(!job.purge_eligible(now));
    }

    #[test]
    fn message_hash_is_stable() {
        assert_eq!(message_hash("boom"), message_hash("boom"));
        assert_ne!(message_hash("boom"), message_hash("bang"));
        assert_eq!(message_hash("boom").len(), 64);
    }
}
