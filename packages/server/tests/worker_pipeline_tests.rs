//! End-to-end pipeline behavior over the in-memory doubles: submission,
//! redelivery idempotency, OOM fallback, audio repair, cancellation, and
//! terminal failure routing.

mod common;

use common::Pipeline;

use scribe_core::domains::transcription::{JobStatus, JobStore};
use scribe_core::kernel::audit::AuditLog;
use scribe_core::kernel::broker::{TaskBroker, QUEUE_DLQ, QUEUE_HIGH, QUEUE_RETRY, WORKER_QUEUES};
use scribe_core::kernel::engine::{EngineError, ErrorKind, ModelTier};
use scribe_core::kernel::worker::envelope_for_job;

#[tokio::test]
async fn submitted_job_completes_with_artifact_and_audit_trail() {
    let pipeline = Pipeline::new();

    let job = pipeline.submit(ModelTier::Tiny).await;
    assert_eq!(pipeline.drain().await, 1);

    let job = pipeline.store.job(job.id).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress_percent, 100.0);
    assert!(job.started_at.is_some());
    assert!(job.completed_at >= job.started_at);

    let result = pipeline.store.result_for(job.id).await.unwrap().unwrap();
    assert_eq!(result.transcript_text, "stub transcript");
    assert_eq!(result.detected_language.as_deref(), Some("en"));

    let output_path = result.output_file_path.unwrap();
    assert!(std::path::Path::new(&output_path).exists());
    let artifact = std::fs::read_to_string(&output_path).unwrap();
    assert!(artifact.starts_with("# Transcription Metadata"));
    assert!(artifact.contains("stub transcript"));

    assert_eq!(
        pipeline.audit.actions_for(&job.id.to_string()),
        vec!["job.create", "job.process.start", "job.complete"]
    );
    assert!(pipeline.audit.verify_chain(1, 16).await.unwrap().is_valid());
}

#[tokio::test]
async fn second_job_reuses_the_loaded_model() {
    let pipeline = Pipeline::new();

    pipeline.submit(ModelTier::Tiny).await;
    pipeline.submit(ModelTier::Tiny).await;
    assert_eq!(pipeline.drain().await, 2);

    let stats = pipeline.pool.stats();
    assert_eq!(stats.misses, 1, "first acquire cold-loads");
    assert_eq!(stats.hits, 1, "second acquire is a cache hit");
    assert_eq!(stats.total_loaded, 1);
}

#[tokio::test]
async fn redelivered_message_after_completion_is_dropped() {
    let pipeline = Pipeline::new();

    let job = pipeline.submit(ModelTier::Tiny).await;
    assert_eq!(pipeline.drain().await, 1);

    // The broker redelivers the same envelope once.
    pipeline
        .broker
        .publish(
            &envelope_for_job(&pipeline.store.job(job.id).unwrap()),
            QUEUE_HIGH,
            9,
            None,
        )
        .await
        .unwrap();
    assert_eq!(pipeline.drain().await, 1);

    // Exactly one result; the duplicate wrote nothing.
    assert_eq!(pipeline.store.result_count(), 1);
    assert!(pipeline.store.error_rows(job.id).is_empty());
    assert_eq!(pipeline.engine.call_count(), 1);
    assert_eq!(
        pipeline.store.job(job.id).unwrap().status,
        JobStatus::Completed
    );
}

#[tokio::test]
async fn redelivery_after_worker_crash_takes_over_the_job() {
    let pipeline = Pipeline::new();
    let job = pipeline.submit(ModelTier::Tiny).await;

    // First delivery is claimed, then the worker dies mid-task: the job
    // row is stuck in processing and the message is never acked.
    let delivery = pipeline
        .broker
        .claim(&WORKER_QUEUES, "doomed-slot")
        .await
        .unwrap()
        .unwrap();
    use scribe_core::domains::transcription::TransitionPatch;
    pipeline
        .store
        .transition(
            job.id,
            JobStatus::Pending,
            JobStatus::Processing,
            TransitionPatch {
                worker_id: Some(delivery.task_id.to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // Lease expiry hands the message to another slot.
    assert!(pipeline.broker.redeliver(delivery.task_id));
    assert_eq!(pipeline.drain().await, 1);

    let job = pipeline.store.job(job.id).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(pipeline.store.result_count(), 1);
}

#[tokio::test]
async fn oom_on_load_falls_back_to_smaller_tier() {
    let pipeline = Pipeline::new();
    pipeline.loader.deny(ModelTier::Large);
    pipeline.loader.deny(ModelTier::Medium);

    let job = pipeline.submit(ModelTier::Large).await;
    assert_eq!(pipeline.drain().await, 1);

    let job = pipeline.store.job(job.id).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.model_tier, ModelTier::Small, "job records the tier that ran");
    assert!(pipeline.pool.stats().oom_fallbacks >= 2);

    // The engine saw the downgraded model.
    assert_eq!(pipeline.engine.calls()[0].0, ModelTier::Small);
}

#[tokio::test]
async fn engine_oom_substitutes_smaller_tier_without_spending_a_retry() {
    let pipeline = Pipeline::new();
    pipeline.engine.push_outcome(Err(EngineError::new(
        ErrorKind::OutOfMemory,
        "CUDA out of memory",
    )));

    let job = pipeline.submit(ModelTier::Small).await;
    assert_eq!(pipeline.drain().await, 2);

    let job = pipeline.store.job(job.id).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.model_tier, ModelTier::Base);

    let retries = pipeline.broker.published_to(QUEUE_RETRY);
    assert_eq!(retries.len(), 1);
    assert_eq!(retries[0].envelope.model_tier, ModelTier::Base);
    assert_eq!(
        retries[0].envelope.retry_count, 0,
        "tier substitution does not count as a retry"
    );
}

#[tokio::test]
async fn corrupt_audio_is_repaired_and_retried() {
    let pipeline = Pipeline::new();
    pipeline.engine.push_outcome(Err(EngineError::classified(
        "cannot reshape tensor of 0 elements",
    )));

    let job = pipeline.submit(ModelTier::Tiny).await;
    assert_eq!(pipeline.drain().await, 2);

    let job = pipeline.store.job(job.id).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.file_path.ends_with("_repaired.mp3"));

    assert_eq!(pipeline.repairer.calls().len(), 1);

    let retries = pipeline.broker.published_to(QUEUE_RETRY);
    assert_eq!(retries.len(), 1);
    assert!(retries[0].envelope.file_path.ends_with("_repaired.mp3"));
    assert_eq!(retries[0].envelope.retry_count, 1);

    // One resolved-by-retry error row remains as the record of the repair.
    let errors = pipeline.store.error_rows(job.id);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].error_kind, ErrorKind::CorruptAudioFile);
    assert!(errors[0].resolved);
    assert_eq!(
        errors[0].resolution_note.as_deref(),
        Some("resolved by successful retry")
    );
}

#[tokio::test]
async fn cancel_before_processing_is_observed_by_the_worker() {
    let pipeline = Pipeline::new();

    let job = pipeline.submit(ModelTier::Tiny).await;
    pipeline.cancel(job.id).await;

    assert_eq!(pipeline.drain().await, 1);

    let job = pipeline.store.job(job.id).unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.completed_at.is_some());
    assert!(job.started_at.is_none());

    // No result was written and the engine never ran.
    assert_eq!(pipeline.store.result_count(), 0);
    assert_eq!(pipeline.engine.call_count(), 0);

    assert_eq!(
        pipeline.audit.actions_for(&job.id.to_string()),
        vec!["job.create", "job.cancel"]
    );
}

#[tokio::test]
async fn transient_errors_back_off_then_dead_letter_on_exhaustion() {
    let pipeline = Pipeline::new();
    for _ in 0..3 {
        pipeline.engine.push_outcome(Err(EngineError::classified(
            "connection reset by peer",
        )));
    }

    let job = pipeline.submit(ModelTier::Tiny).await;
    // Initial attempt plus two retries; the third failure exhausts
    // max_retries = 3.
    assert_eq!(pipeline.drain().await, 3);

    let job = pipeline.store.job(job.id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_kind, Some(ErrorKind::TransientNetworkError));
    assert_eq!(job.retry_count, 2);

    assert_eq!(pipeline.broker.publish_count_for(QUEUE_RETRY), 2);
    assert_eq!(pipeline.broker.publish_count_for(QUEUE_DLQ), 1);

    let actions = pipeline.audit.actions_for(&job.id.to_string());
    assert_eq!(actions.last().map(String::as_str), Some("job.fail"));
}

#[tokio::test]
async fn file_not_found_fails_immediately_without_retry() {
    let pipeline = Pipeline::new();
    pipeline
        .engine
        .push_outcome(Err(EngineError::classified("No such file or directory")));

    let job = pipeline.submit(ModelTier::Tiny).await;
    assert_eq!(pipeline.drain().await, 1);

    let job = pipeline.store.job(job.id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_kind, Some(ErrorKind::FileNotFound));

    assert_eq!(pipeline.broker.publish_count_for(QUEUE_RETRY), 0);
    assert_eq!(pipeline.broker.publish_count_for(QUEUE_DLQ), 1);

    let errors = pipeline.store.error_rows(job.id);
    assert_eq!(errors.len(), 1);
    assert!(!errors[0].resolved);
}

#[tokio::test]
async fn repair_failure_goes_terminal() {
    let pipeline = Pipeline::new();
    pipeline.repairer.set_fail(true);
    pipeline.engine.push_outcome(Err(EngineError::classified(
        "cannot reshape tensor of 0 elements",
    )));

    let job = pipeline.submit(ModelTier::Tiny).await;
    assert_eq!(pipeline.drain().await, 1);

    let job = pipeline.store.job(job.id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_kind, Some(ErrorKind::CorruptAudioFile));
    assert_eq!(pipeline.broker.publish_count_for(QUEUE_DLQ), 1);
}

#[tokio::test]
async fn duplicate_failure_rows_are_deduped() {
    let pipeline = Pipeline::new();
    for _ in 0..3 {
        pipeline
            .engine
            .push_outcome(Err(EngineError::classified("connection reset by peer")));
    }

    let job = pipeline.submit(ModelTier::Tiny).await;
    pipeline.drain().await;

    // Three identical failures collapse into one error-log row.
    let errors = pipeline.store.error_rows(job.id);
    assert_eq!(errors.len(), 1);
}
