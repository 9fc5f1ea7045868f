//! Worker runtime: consumes task deliveries, drives jobs through the
//! lifecycle, and converts engine failures into retries, repairs, tier
//! fallbacks, or dead-letter routing.
//!
//! Redelivery safety comes from the store, not the broker: every status
//! write is a CAS, so a redelivered message either re-claims a crashed
//! job or observes a terminal status and drops. The original message is
//! acked only after the terminal action (a re-publish counts as one).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::domains::transcription::{
    transcript, CasOutcome, Job, JobStatus, JobStore, NewErrorLog, NewResult, TransitionPatch,
};
use crate::kernel::audit::{AuditEvent, AuditLog, AuditOutcome};
use crate::kernel::broker::{Delivery, TaskBroker, TaskEnvelope, QUEUE_DLQ, WORKER_QUEUES};
use crate::kernel::engine::{ErrorKind, SpeechEngine, TranscribeRequest};
use crate::kernel::model_pool::{ModelPool, PoolError};
use crate::kernel::repair::AudioRepairer;

const RESOURCE_TYPE: &str = "transcription_job";

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    /// Number of task executors running in parallel.
    pub concurrency: usize,
    /// Hard limit: the executor abandons the task and lets the broker
    /// lease expire, so the message is redelivered elsewhere.
    pub hard_timeout: Duration,
    /// Soft limit: the engine's cancellation token fires, asking it to
    /// stop gracefully.
    pub soft_timeout: Duration,
    pub acquire_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Uniform jitter applied as a `1 +/- jitter` factor.
    pub backoff_jitter: f64,
    pub poll_interval: Duration,
    pub output_folder: PathBuf,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            concurrency: 4,
            hard_timeout: Duration::from_secs(3600),
            soft_timeout: Duration::from_secs(3540),
            acquire_timeout: Duration::from_secs(300),
            backoff_base: Duration::from_secs(60),
            backoff_cap: Duration::from_secs(600),
            backoff_jitter: 0.25,
            poll_interval: Duration::from_secs(1),
            output_folder: PathBuf::from("./transcribed"),
        }
    }
}

/// `min(cap, base * 2^attempt)` with uniform jitter in `1 +/- jitter`.
pub fn retry_backoff(attempt: u32, base: Duration, cap: Duration, jitter: f64) -> Duration {
    let exp = base.as_secs_f64() * 2f64.powi(attempt.min(16) as i32);
    let capped = exp.min(cap.as_secs_f64());
    let factor = if jitter > 0.0 {
        1.0 + rand::thread_rng().gen_range(-jitter..=jitter)
    } else {
        1.0
    };
    Duration::from_secs_f64((capped * factor).max(0.0))
}

pub struct Worker {
    store: Arc<dyn JobStore>,
    broker: Arc<dyn TaskBroker>,
    audit: Arc<dyn AuditLog>,
    pool: Arc<ModelPool>,
    engine: Arc<dyn SpeechEngine>,
    repairer: Arc<dyn AudioRepairer>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        store: Arc<dyn JobStore>,
        broker: Arc<dyn TaskBroker>,
        audit: Arc<dyn AuditLog>,
        pool: Arc<ModelPool>,
        engine: Arc<dyn SpeechEngine>,
        repairer: Arc<dyn AudioRepairer>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            broker,
            audit,
            pool,
            engine,
            repairer,
            config,
        }
    }

    /// Run the configured number of executor slots until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            worker_id = %self.config.worker_id,
            concurrency = self.config.concurrency,
            "worker starting"
        );

        let mut handles = Vec::with_capacity(self.config.concurrency);
        for slot in 0..self.config.concurrency {
            let worker = Arc::clone(&self);
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                worker.run_slot(slot, shutdown).await;
            }));
        }

        futures::future::join_all(handles).await;
        info!(worker_id = %self.config.worker_id, "worker stopped");
    }

    async fn run_slot(&self, slot: usize, shutdown: CancellationToken) {
        let slot_id = format!("{}-{}", self.config.worker_id, slot);

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self.broker.claim(&WORKER_QUEUES, &slot_id).await {
                Ok(Some(delivery)) => {
                    if let Err(e) = self.process_delivery(&delivery).await {
                        error!(
                            task_id = %delivery.task_id,
                            job_id = %delivery.envelope.job_id,
                            error = %e,
                            "delivery processing failed"
                        );
                    }
                }
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Err(e) => {
                    error!(error = %e, "failed to claim task");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// Process one claimed delivery to a terminal action.
    pub async fn process_delivery(&self, delivery: &Delivery) -> Result<()> {
        let envelope = &delivery.envelope;
        let job_id = envelope.job_id;

        // 1. Load the job; a missing row means nothing to do.
        let Some(job) = self.store.get(job_id).await? else {
            warn!(job_id = %job_id, "no job for delivery, dropping");
            return self.broker.ack(delivery).await;
        };

        // 2. Terminal status: redelivered message, drop it.
        if job.status.is_terminal() {
            debug!(job_id = %job_id, status = %job.status, "job already terminal, dropping");
            return self.broker.ack(delivery).await;
        }

        // 3. Claim the job. Exactly one concurrent worker wins this CAS.
        let claim = self
            .store
            .transition(
                job_id,
                job.status,
                JobStatus::Processing,
                TransitionPatch {
                    worker_id: Some(delivery.task_id.to_string()),
                    progress_percent: Some(10.0),
                    current_step: Some("acquiring model".to_string()),
                    ..Default::default()
                },
            )
            .await?;
        let job = match claim {
            CasOutcome::Applied(job) => job,
            CasOutcome::Conflict(actual) => {
                debug!(job_id = %job_id, status = %actual, "lost processing CAS, dropping");
                return self.broker.ack(delivery).await;
            }
        };

        self.audit_event(
            AuditEvent::new("job.process.start", RESOURCE_TYPE).resource_id(job_id),
        )
        .await;

        // 4. Borrow a model; the pool falls back internally on OOM loads.
        let lease = match self
            .pool
            .acquire(envelope.model_tier, self.config.acquire_timeout)
            .await
        {
            Ok(lease) => lease,
            Err(PoolError::OutOfMemory(tier)) => {
                // Fallback already walked every smaller tier.
                self.append_failure(&job, delivery, ErrorKind::OutOfMemory, &format!(
                    "out of memory loading {} and every smaller tier",
                    tier
                ))
                .await?;
                return self
                    .fail_terminal(
                        delivery,
                        &job,
                        ErrorKind::OutOfMemory,
                        format!("out of memory loading {} and every smaller tier", tier),
                    )
                    .await;
            }
            Err(PoolError::AcquireTimeout(tier)) => {
                let message = format!("timed out acquiring {} model", tier);
                return self
                    .handle_failure(delivery, &job, ErrorKind::EngineError, message)
                    .await;
            }
            Err(PoolError::Load(message)) => {
                return self
                    .handle_failure(delivery, &job, ErrorKind::EngineError, message)
                    .await;
            }
        };

        // Checkpoint at 30%. A conflict here means the job was cancelled;
        // the model goes back and the message is dropped.
        let mut checkpoint = TransitionPatch {
            progress_percent: Some(30.0),
            current_step: Some("transcribing".to_string()),
            ..Default::default()
        };
        if lease.tier != envelope.model_tier {
            // The pool downgraded the tier; the job row records what ran.
            checkpoint.model_tier = Some(lease.tier);
        }
        let job = match self
            .store
            .transition(job_id, JobStatus::Processing, JobStatus::Processing, checkpoint)
            .await?
        {
            CasOutcome::Applied(job) => job,
            CasOutcome::Conflict(actual) => {
                debug!(job_id = %job_id, status = %actual, "job no longer processing, dropping");
                self.pool.release(lease);
                return self.broker.ack(delivery).await;
            }
        };

        // 5. Run the engine under the soft/hard timeouts.
        let cancel = CancellationToken::new();
        let soft_cancel = cancel.clone();
        let soft_timeout = self.config.soft_timeout;
        let soft_watcher = tokio::spawn(async move {
            tokio::time::sleep(soft_timeout).await;
            soft_cancel.cancel();
        });

        let request = TranscribeRequest {
            file_path: PathBuf::from(&job.file_path),
            language: job
                .language
                .clone()
                .filter(|language| language != "auto"),
        };
        let engine_result = tokio::time::timeout(
            self.config.hard_timeout,
            self.engine.transcribe(&lease, &request, &cancel),
        )
        .await;
        soft_watcher.abort();

        let transcription = match engine_result {
            Err(_) => {
                // Hard timeout: abandon without ack so the broker lease
                // redelivers to another slot.
                self.pool.release(lease);
                warn!(job_id = %job_id, "hard timeout, abandoning delivery");
                return Ok(());
            }
            Ok(Err(engine_error)) => {
                self.pool.release(lease);
                return self
                    .handle_failure(delivery, &job, engine_error.kind, engine_error.message)
                    .await;
            }
            Ok(Ok(transcription)) => {
                self.pool.release(lease);
                transcription
            }
        };

        // 6. Persist the result. Checkpoint at 90% first (cancellation
        // observed here means no result is ever written).
        let job = match self
            .store
            .transition(
                job_id,
                JobStatus::Processing,
                JobStatus::Processing,
                TransitionPatch {
                    progress_percent: Some(90.0),
                    current_step: Some("saving results".to_string()),
                    ..Default::default()
                },
            )
            .await?
        {
            CasOutcome::Applied(job) => job,
            CasOutcome::Conflict(actual) => {
                debug!(job_id = %job_id, status = %actual, "job no longer processing, dropping");
                return self.broker.ack(delivery).await;
            }
        };

        let output_path = match transcript::write_transcript(
            &self.config.output_folder,
            &job,
            &transcription,
        )
        .await
        {
            Ok(path) => path,
            Err(e) => {
                return self
                    .handle_failure(delivery, &job, ErrorKind::EngineError, e.to_string())
                    .await;
            }
        };

        let segments = match transcription.segments.as_ref() {
            Some(segments) => Some(serde_json::to_value(segments)?),
            None => None,
        };
        let attach = self
            .store
            .attach_result(
                job_id,
                NewResult {
                    transcript_text: transcription.text.clone(),
                    detected_language: Some(transcription.language.clone()),
                    duration_seconds: Some(transcription.duration_seconds),
                    segments,
                    output_file_path: Some(output_path.display().to_string()),
                },
            )
            .await?;

        match attach {
            CasOutcome::Applied(_) => {}
            CasOutcome::Conflict(actual) => {
                debug!(job_id = %job_id, status = %actual, "result write blocked by CAS, dropping");
                return self.broker.ack(delivery).await;
            }
        }

        // A successful retry settles the earlier error rows.
        if envelope.retry_count > 0 {
            if let Err(e) = self
                .store
                .resolve_errors(job_id, "worker", "resolved by successful retry")
                .await
            {
                warn!(job_id = %job_id, error = %e, "failed to resolve error rows");
            }
        }

        self.audit_event(AuditEvent::new("job.complete", RESOURCE_TYPE).resource_id(job_id))
            .await;
        info!(job_id = %job_id, "job completed");
        self.broker.ack(delivery).await
    }

    /// Classify-and-act on a failed attempt: OOM substitutes a smaller
    /// tier, corrupt audio schedules a repair, recoverable kinds back off,
    /// everything else goes terminal.
    async fn handle_failure(
        &self,
        delivery: &Delivery,
        job: &Job,
        kind: ErrorKind,
        message: String,
    ) -> Result<()> {
        let envelope = &delivery.envelope;
        self.append_failure(job, delivery, kind, &message).await?;

        match kind {
            ErrorKind::OutOfMemory => {
                // Substitute the next-smaller tier without spending a
                // retry. Bounded by reaching tiny.
                if let Some(smaller) = envelope.model_tier.next_smaller() {
                    warn!(
                        job_id = %job.id,
                        from = %envelope.model_tier,
                        to = %smaller,
                        "OOM during transcription, substituting smaller tier"
                    );
                    let moved = self
                        .store
                        .transition(
                            job.id,
                            JobStatus::Processing,
                            JobStatus::Retry,
                            TransitionPatch {
                                model_tier: Some(smaller),
                                error_kind: Some(kind),
                                error_message: Some(format!(
                                    "OOM with {}, retrying with {}",
                                    envelope.model_tier, smaller
                                )),
                                current_step: Some("retrying with smaller model".to_string()),
                                ..Default::default()
                            },
                        )
                        .await?;
                    if !moved.is_applied() {
                        return self.broker.ack(delivery).await;
                    }

                    let mut next = envelope.clone();
                    next.model_tier = smaller;
                    self.broker
                        .publish(
                            &next,
                            crate::kernel::broker::QUEUE_RETRY,
                            5,
                            Some(self.config.backoff_base),
                        )
                        .await?;
                    return self.broker.ack(delivery).await;
                }
                self.fail_terminal(delivery, job, kind, message).await
            }
            ErrorKind::CorruptAudioFile => {
                let next_count = envelope.retry_count + 1;
                if next_count < job.max_retries {
                    match self.repairer.repair(std::path::Path::new(&job.file_path)).await {
                        Ok(repaired) => {
                            let repaired = repaired.display().to_string();
                            let moved = self
                                .store
                                .transition(
                                    job.id,
                                    JobStatus::Processing,
                                    JobStatus::Retry,
                                    TransitionPatch {
                                        retry_count: Some(next_count),
                                        file_path: Some(repaired.clone()),
                                        error_kind: Some(kind),
                                        error_message: Some(message),
                                        current_step: Some(
                                            "retrying with repaired audio".to_string(),
                                        ),
                                        ..Default::default()
                                    },
                                )
                                .await?;
                            if !moved.is_applied() {
                                return self.broker.ack(delivery).await;
                            }

                            let mut next = envelope.clone();
                            next.file_path = repaired;
                            self.broker
                                .retry(&next, self.config.backoff_base)
                                .await?;
                            return self.broker.ack(delivery).await;
                        }
                        Err(repair_error) => {
                            let message =
                                format!("{} (repair failed: {})", message, repair_error);
                            return self.fail_terminal(delivery, job, kind, message).await;
                        }
                    }
                }
                self.fail_terminal(delivery, job, kind, message).await
            }
            _ if kind.retryable() => {
                let next_count = envelope.retry_count + 1;
                if next_count < job.max_retries {
                    let delay = retry_backoff(
                        envelope.retry_count.max(0) as u32,
                        self.config.backoff_base,
                        self.config.backoff_cap,
                        self.config.backoff_jitter,
                    );
                    let moved = self
                        .store
                        .transition(
                            job.id,
                            JobStatus::Processing,
                            JobStatus::Retry,
                            TransitionPatch {
                                retry_count: Some(next_count),
                                error_kind: Some(kind),
                                error_message: Some(message),
                                current_step: Some("waiting to retry".to_string()),
                                ..Default::default()
                            },
                        )
                        .await?;
                    if !moved.is_applied() {
                        return self.broker.ack(delivery).await;
                    }

                    self.broker.retry(envelope, delay).await?;
                    return self.broker.ack(delivery).await;
                }
                self.fail_terminal(delivery, job, kind, message).await
            }
            _ => self.fail_terminal(delivery, job, kind, message).await,
        }
    }

    /// Record the failure row for this attempt.
    async fn append_failure(
        &self,
        job: &Job,
        delivery: &Delivery,
        kind: ErrorKind,
        message: &str,
    ) -> Result<()> {
        self.store
            .append_error(
                job.id,
                NewErrorLog {
                    error_kind: kind,
                    message: message.to_string(),
                    stack_trace: None,
                    context: Some(json!({
                        "task_id": delivery.task_id,
                        "queue": delivery.queue,
                        "worker_id": job.worker_id,
                        "attempt": delivery.envelope.retry_count,
                        "model_tier": delivery.envelope.model_tier,
                    })),
                },
            )
            .await?;
        Ok(())
    }

    /// Terminal failure: fail the job, copy the envelope to the DLQ for
    /// human review, audit, ack.
    async fn fail_terminal(
        &self,
        delivery: &Delivery,
        job: &Job,
        kind: ErrorKind,
        message: String,
    ) -> Result<()> {
        let moved = self
            .store
            .transition(
                job.id,
                JobStatus::Processing,
                JobStatus::Failed,
                TransitionPatch {
                    error_kind: Some(kind),
                    error_message: Some(message.clone()),
                    current_step: Some("failed".to_string()),
                    ..Default::default()
                },
            )
            .await?;
        if !moved.is_applied() {
            return self.broker.ack(delivery).await;
        }

        if let Err(e) = self
            .broker
            .publish(&delivery.envelope, QUEUE_DLQ, 0, None)
            .await
        {
            error!(job_id = %job.id, error = %e, "failed to copy envelope to DLQ");
        }

        self.audit_event(
            AuditEvent::new("job.fail", RESOURCE_TYPE)
                .resource_id(job.id)
                .outcome(AuditOutcome::Failure)
                .reason(crate::domains::transcription::bound_error_message(&message)),
        )
        .await;

        warn!(job_id = %job.id, kind = %kind, "job failed terminally");
        self.broker.ack(delivery).await
    }

    async fn audit_event(&self, event: AuditEvent) {
        if let Err(e) = self.audit.log(event).await {
            error!(error = %e, "audit write failed");
        }
    }
}

/// Convenience for the submission path: the envelope for a job's first
/// delivery.
pub fn envelope_for_job(job: &Job) -> TaskEnvelope {
    TaskEnvelope {
        job_id: job.id,
        file_path: job.file_path.clone(),
        model_tier: job.model_tier,
        language: job.language.clone(),
        retry_count: job.retry_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_within_bounds() {
        let base = Duration::from_secs(60);
        let cap = Duration::from_secs(600);

        for attempt in 0..8u32 {
            let delay = retry_backoff(attempt, base, cap, 0.25);
            let ideal = (60.0 * 2f64.powi(attempt as i32)).min(600.0);
            let low = ideal * 0.75;
            let high = ideal * 1.25;
            let secs = delay.as_secs_f64();
            assert!(
                secs >= low - 1e-9 && secs <= high + 1e-9,
                "attempt {}: {}s outside [{}, {}]",
                attempt,
                secs,
                low,
                high
            );
        }
    }

    #[test]
    fn backoff_is_capped() {
        let delay = retry_backoff(
            30,
            Duration::from_secs(60),
            Duration::from_secs(600),
            0.0,
        );
        assert_eq!(delay, Duration::from_secs(600));
    }

    #[test]
    fn backoff_without_jitter_is_deterministic() {
        let base = Duration::from_secs(60);
        let cap = Duration::from_secs(600);
        assert_eq!(retry_backoff(0, base, cap, 0.0), Duration::from_secs(60));
        assert_eq!(retry_backoff(1, base, cap, 0.0), Duration::from_secs(120));
        assert_eq!(retry_backoff(2, base, cap, 0.0), Duration::from_secs(240));
        assert_eq!(retry_backoff(3, base, cap, 0.0), Duration::from_secs(480));
        assert_eq!(retry_backoff(4, base, cap, 0.0), Duration::from_secs(600));
    }
}
