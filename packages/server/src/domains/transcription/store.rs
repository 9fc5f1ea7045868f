//! Durable job store over PostgreSQL.
//!
//! All status writes are compare-and-set: the row is locked, the expected
//! status checked, and the shared transition logic applied, so concurrent
//! workers observing the same message see exactly one successful write.

use std::collections::HashMap;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::job::{
    apply_transition, message_hash, CasOutcome, ErrorLog, Job, JobStatus, NewErrorLog, NewJob,
    NewResult, TranscriptionResult, TransitionPatch,
};

/// Window within which identical errors for a job are treated as one,
/// tolerating retried DLQ deliveries.
const ERROR_DEDUPE_WINDOW_MINUTES: i32 = 10;

const JOB_COLUMNS: &str = "id, status, priority, model_tier, language, original_filename, \
     file_path, file_size_bytes, worker_id, retry_count, max_retries, progress_percent, \
     current_step, created_at, started_at, completed_at, error_kind, error_message, \
     deleted_at, deletion_policy, legal_hold_id, retention_until";

const ERROR_COLUMNS: &str = "id, job_id, error_kind, message, message_hash, stack_trace, \
     context, created_at, resolved, resolved_at, resolved_by, resolution_note";

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Liveness probe for health checks.
    async fn ping(&self) -> Result<()>;

    /// Insert a pending job in a single transaction.
    async fn create_job(&self, new_job: NewJob) -> Result<Job>;

    async fn get(&self, id: Uuid) -> Result<Option<Job>>;

    /// Compare-and-set status write. Rejects transitions the state machine
    /// forbids; returns `Conflict` with the observed status when the
    /// expected `from` does not match.
    async fn transition(
        &self,
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
        patch: TransitionPatch,
    ) -> Result<CasOutcome>;

    /// Move a processing job to completed atomically with its result
    /// insert. A job has at most one result.
    async fn attach_result(&self, id: Uuid, result: NewResult) -> Result<CasOutcome>;

    /// Append an error row. Idempotent by `(job_id, error_kind,
    /// message_hash)` within a short window; returns the surviving row id.
    async fn append_error(&self, id: Uuid, error: NewErrorLog) -> Result<Uuid>;

    /// Mark all unresolved errors for a job resolved. Returns the number
    /// of rows updated. The `resolved_*` fields are the only error-log
    /// mutation ever performed.
    async fn resolve_errors(&self, job_id: Uuid, resolved_by: &str, note: &str) -> Result<u64>;

    /// CAS from {pending, processing, retry} to cancelled.
    async fn cancel(&self, id: Uuid) -> Result<CasOutcome>;

    /// Most recent jobs first; limit is clamped to 100.
    async fn list(&self, status: Option<JobStatus>, limit: i64) -> Result<Vec<Job>>;

    async fn counts_by_status(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<HashMap<JobStatus, i64>>;

    async fn unresolved_error_count_since(&self, since: DateTime<Utc>) -> Result<i64>;

    async fn list_errors(&self, limit: i64, include_resolved: bool) -> Result<Vec<ErrorLog>>;

    async fn result_for(&self, job_id: Uuid) -> Result<Option<TranscriptionResult>>;

    /// Remove soft-deleted jobs past retention, honoring legal holds.
    /// Returns the number of jobs purged.
    async fn purge_eligible(&self, now: DateTime<Utc>) -> Result<u64>;
}

// ============================================================================
// Postgres adapter
// ============================================================================

pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn lock_job(
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
    ) -> Result<Option<Job>> {
        let query = format!(
            "SELECT {} FROM transcription_jobs WHERE id = $1 FOR UPDATE",
            JOB_COLUMNS
        );
        let job = sqlx::query_as::<_, Job>(&query)
            .bind(id)
            .fetch_optional(&mut **tx)
            .await?;
        Ok(job)
    }

    async fn write_job(tx: &mut Transaction<'_, Postgres>, job: &Job) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE transcription_jobs SET
                status = $1,
                worker_id = $2,
                retry_count = $3,
                progress_percent = $4,
                current_step = $5,
                started_at = $6,
                completed_at = $7,
                error_kind = $8,
                error_message = $9,
                model_tier = $10,
                file_path = $11
            WHERE id = $12
            "#,
        )
        .bind(job.status)
        .bind(&job.worker_id)
        .bind(job.retry_count)
        .bind(job.progress_percent)
        .bind(&job.current_step)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.error_kind)
        .bind(&job.error_message)
        .bind(job.model_tier)
        .bind(&job.file_path)
        .bind(job.id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Lock, check the expected status, apply, write. Shared by
    /// `transition`, `attach_result`, and `cancel`.
    async fn cas_write(
        &self,
        id: Uuid,
        accept_from: &[JobStatus],
        to: JobStatus,
        patch: TransitionPatch,
        result: Option<NewResult>,
    ) -> Result<CasOutcome> {
        let mut tx = self.pool.begin().await?;

        let Some(mut job) = Self::lock_job(&mut tx, id).await? else {
            bail!("job {} not found", id);
        };

        if !accept_from.contains(&job.status) {
            return Ok(CasOutcome::Conflict(job.status));
        }
        if !JobStatus::can_transition(job.status, to) {
            bail!("forbidden transition {} -> {} for job {}", job.status, to, id);
        }

        apply_transition(&mut job, to, patch, Utc::now());
        Self::write_job(&mut tx, &job).await?;

        if let Some(result) = result {
            sqlx::query(
                r#"
                INSERT INTO transcription_results (
                    id, job_id, transcript_text, detected_language,
                    duration_seconds, segments, output_file_path, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(job.id)
            .bind(&result.transcript_text)
            .bind(&result.detected_language)
            .bind(result.duration_seconds)
            .bind(&result.segments)
            .bind(&result.output_file_path)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(CasOutcome::Applied(job))
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn create_job(&self, new_job: NewJob) -> Result<Job> {
        let job = new_job.into_job();

        sqlx::query(
            r#"
            INSERT INTO transcription_jobs (
                id, status, priority, model_tier, language, original_filename,
                file_path, file_size_bytes, retry_count, max_retries,
                progress_percent, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(job.id)
        .bind(job.status)
        .bind(job.priority)
        .bind(job.model_tier)
        .bind(&job.language)
        .bind(&job.original_filename)
        .bind(&job.file_path)
        .bind(job.file_size_bytes)
        .bind(job.retry_count)
        .bind(job.max_retries)
        .bind(job.progress_percent)
        .bind(job.created_at)
        .execute(&self.pool)
        .await?;

        Ok(job)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>> {
        let query = format!("SELECT {} FROM transcription_jobs WHERE id = $1", JOB_COLUMNS);
        let job = sqlx::query_as::<_, Job>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    async fn transition(
        &self,
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
        patch: TransitionPatch,
    ) -> Result<CasOutcome> {
        if !JobStatus::can_transition(from, to) {
            bail!("forbidden transition {} -> {}", from, to);
        }
        self.cas_write(id, &[from], to, patch, None).await
    }

    async fn attach_result(&self, id: Uuid, result: NewResult) -> Result<CasOutcome> {
        let patch = TransitionPatch {
            progress_percent: Some(100.0),
            current_step: Some("done".to_string()),
            ..Default::default()
        };
        self.cas_write(
            id,
            &[JobStatus::Processing],
            JobStatus::Completed,
            patch,
            Some(result),
        )
        .await
    }

    async fn append_error(&self, id: Uuid, error: NewErrorLog) -> Result<Uuid> {
        let hash = message_hash(&error.message);
        let context = error
            .context
            .as_ref()
            .map(crate::common::pii::redact_value);

        let existing: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM error_logs
            WHERE job_id = $1
              AND error_kind = $2
              AND message_hash = $3
              AND created_at > NOW() - make_interval(mins => $4)
            LIMIT 1
            "#,
        )
        .bind(id)
        .bind(error.error_kind)
        .bind(&hash)
        .bind(ERROR_DEDUPE_WINDOW_MINUTES)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(existing) = existing {
            return Ok(existing);
        }

        let error_id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO error_logs (
                id, job_id, error_kind, message, message_hash,
                stack_trace, context, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            "#,
        )
        .bind(error_id)
        .bind(id)
        .bind(error.error_kind)
        .bind(&error.message)
        .bind(&hash)
        .bind(&error.stack_trace)
        .bind(&context)
        .execute(&self.pool)
        .await?;

        Ok(error_id)
    }

    async fn resolve_errors(&self, job_id: Uuid, resolved_by: &str, note: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE error_logs
            SET resolved = TRUE,
                resolved_at = NOW(),
                resolved_by = $2,
                resolution_note = $3
            WHERE job_id = $1 AND NOT resolved
            "#,
        )
        .bind(job_id)
        .bind(resolved_by)
        .bind(note)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn cancel(&self, id: Uuid) -> Result<CasOutcome> {
        self.cas_write(
            id,
            &[JobStatus::Pending, JobStatus::Processing, JobStatus::Retry],
            JobStatus::Cancelled,
            TransitionPatch::default(),
            None,
        )
        .await
    }

    async fn list(&self, status: Option<JobStatus>, limit: i64) -> Result<Vec<Job>> {
        let limit = limit.clamp(1, 100);

        // Listing reads a consistent snapshot.
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            .execute(&mut *tx)
            .await?;

        let jobs = match status {
            Some(status) => {
                let query = format!(
                    "SELECT {} FROM transcription_jobs \
                     WHERE deleted_at IS NULL AND status = $1 \
                     ORDER BY created_at DESC LIMIT $2",
                    JOB_COLUMNS
                );
                sqlx::query_as::<_, Job>(&query)
                    .bind(status)
                    .bind(limit)
                    .fetch_all(&mut *tx)
                    .await?
            }
            None => {
                let query = format!(
                    "SELECT {} FROM transcription_jobs \
                     WHERE deleted_at IS NULL \
                     ORDER BY created_at DESC LIMIT $1",
                    JOB_COLUMNS
                );
                sqlx::query_as::<_, Job>(&query)
                    .bind(limit)
                    .fetch_all(&mut *tx)
                    .await?
            }
        };

        tx.commit().await?;
        Ok(jobs)
    }

    async fn counts_by_status(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<HashMap<JobStatus, i64>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            .execute(&mut *tx)
            .await?;

        let rows: Vec<(JobStatus, i64)> = match since {
            Some(since) => {
                sqlx::query_as(
                    "SELECT status, COUNT(*) FROM transcription_jobs \
                     WHERE created_at >= $1 GROUP BY status",
                )
                .bind(since)
                .fetch_all(&mut *tx)
                .await?
            }
            None => {
                sqlx::query_as("SELECT status, COUNT(*) FROM transcription_jobs GROUP BY status")
                    .fetch_all(&mut *tx)
                    .await?
            }
        };

        tx.commit().await?;
        Ok(rows.into_iter().collect())
    }

    async fn unresolved_error_count_since(&self, since: DateTime<Utc>) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM error_logs WHERE created_at >= $1 AND NOT resolved",
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn list_errors(&self, limit: i64, include_resolved: bool) -> Result<Vec<ErrorLog>> {
        let limit = limit.clamp(1, 100);

        let errors = if include_resolved {
            let query = format!(
                "SELECT {} FROM error_logs ORDER BY created_at DESC LIMIT $1",
                ERROR_COLUMNS
            );
            sqlx::query_as::<_, ErrorLog>(&query)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
        } else {
            let query = format!(
                "SELECT {} FROM error_logs WHERE NOT resolved \
                 ORDER BY created_at DESC LIMIT $1",
                ERROR_COLUMNS
            );
            sqlx::query_as::<_, ErrorLog>(&query)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
        };

        Ok(errors)
    }

    async fn result_for(&self, job_id: Uuid) -> Result<Option<TranscriptionResult>> {
        let result = sqlx::query_as::<_, TranscriptionResult>(
            "SELECT id, job_id, transcript_text, detected_language, duration_seconds, \
             segments, output_file_path, created_at \
             FROM transcription_results WHERE job_id = $1",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(result)
    }

    async fn purge_eligible(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        let doomed: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM transcription_jobs
            WHERE deleted_at IS NOT NULL
              AND legal_hold_id IS NULL
              AND retention_until < $1
            "#,
        )
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        if doomed.is_empty() {
            return Ok(0);
        }

        sqlx::query("DELETE FROM error_logs WHERE job_id = ANY($1)")
            .bind(&doomed)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM transcription_results WHERE job_id = ANY($1)")
            .bind(&doomed)
            .execute(&mut *tx)
            .await?;
        let purged = sqlx::query("DELETE FROM transcription_jobs WHERE id = ANY($1)")
            .bind(&doomed)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        Ok(purged)
    }
}
