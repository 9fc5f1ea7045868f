//! In-memory doubles for the capability contracts, used by unit and
//! integration tests. They enforce the same semantics as the Postgres
//! adapters by sharing the pure transition and hash-chain logic.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::domains::transcription::{
    apply_transition, message_hash, CasOutcome, ErrorLog, Job, JobStatus, JobStore, NewErrorLog,
    NewJob, NewResult, TranscriptionResult, TransitionPatch,
};
use crate::kernel::audit::{
    compute_record_hash, verify_records, AuditEvent, AuditLog, AuditRecord, ChainVerification,
    SENTINEL_HASH,
};
use crate::kernel::broker::{Delivery, TaskBroker, TaskEnvelope};
use crate::kernel::engine::{
    EngineError, ModelTier, SpeechEngine, TranscribeRequest, Transcription,
};
use crate::kernel::model_pool::{LoadError, LoadedModel, ModelLease, ModelLoader};
use crate::kernel::repair::AudioRepairer;

fn lock<'a, T>(mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ============================================================================
// Job store
// ============================================================================

#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<Uuid, Job>>,
    results: Mutex<HashMap<Uuid, TranscriptionResult>>,
    errors: Mutex<Vec<ErrorLog>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job(&self, id: Uuid) -> Option<Job> {
        lock(&self.jobs).get(&id).cloned()
    }

    pub fn error_rows(&self, job_id: Uuid) -> Vec<ErrorLog> {
        lock(&self.errors)
            .iter()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect()
    }

    pub fn result_count(&self) -> usize {
        lock(&self.results).len()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn create_job(&self, new_job: NewJob) -> Result<Job> {
        let job = new_job.into_job();
        lock(&self.jobs).insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>> {
        Ok(lock(&self.jobs).get(&id).cloned())
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
        let mut jobs = lock(&self.jobs);
        let Some(job) = jobs.get_mut(&id) else {
            bail!("job {} not found", id);
        };
        if job.status != from {
            return Ok(CasOutcome::Conflict(job.status));
        }
        apply_transition(job, to, patch, Utc::now());
        Ok(CasOutcome::Applied(job.clone()))
    }

    async fn attach_result(&self, id: Uuid, result: NewResult) -> Result<CasOutcome> {
        let mut jobs = lock(&self.jobs);
        let Some(job) = jobs.get_mut(&id) else {
            bail!("job {} not found", id);
        };
        if job.status != JobStatus::Processing {
            return Ok(CasOutcome::Conflict(job.status));
        }

        apply_transition(
            job,
            JobStatus::Completed,
            TransitionPatch {
                progress_percent: Some(100.0),
                current_step: Some("done".to_string()),
                ..Default::default()
            },
            Utc::now(),
        );

        lock(&self.results).insert(
            id,
            TranscriptionResult {
                id: Uuid::new_v4(),
                job_id: id,
                transcript_text: result.transcript_text,
                detected_language: result.detected_language,
                duration_seconds: result.duration_seconds,
                segments: result.segments,
                output_file_path: result.output_file_path,
                created_at: Utc::now(),
            },
        );

        Ok(CasOutcome::Applied(job.clone()))
    }

    async fn append_error(&self, id: Uuid, error: NewErrorLog) -> Result<Uuid> {
        let hash = message_hash(&error.message);
        let mut errors = lock(&self.errors);

        let window = Utc::now() - chrono::Duration::minutes(10);
        if let Some(existing) = errors.iter().find(|e| {
            e.job_id == id
                && e.error_kind == error.error_kind
                && e.message_hash == hash
                && e.created_at > window
        }) {
            return Ok(existing.id);
        }

        let row = ErrorLog {
            id: Uuid::new_v4(),
            job_id: id,
            error_kind: error.error_kind,
            message: error.message,
            message_hash: hash,
            stack_trace: error.stack_trace,
            context: error
                .context
                .as_ref()
                .map(crate::common::pii::redact_value),
            created_at: Utc::now(),
            resolved: false,
            resolved_at: None,
            resolved_by: None,
            resolution_note: None,
        };
        let error_id = row.id;
        errors.push(row);
        Ok(error_id)
    }

    async fn resolve_errors(&self, job_id: Uuid, resolved_by: &str, note: &str) -> Result<u64> {
        let mut errors = lock(&self.errors);
        let mut updated = 0;
        for error in errors.iter_mut().filter(|e| e.job_id == job_id && !e.resolved) {
            error.resolved = true;
            error.resolved_at = Some(Utc::now());
            error.resolved_by = Some(resolved_by.to_string());
            error.resolution_note = Some(note.to_string());
            updated += 1;
        }
        Ok(updated)
    }

    async fn cancel(&self, id: Uuid) -> Result<CasOutcome> {
        let mut jobs = lock(&self.jobs);
        let Some(job) = jobs.get_mut(&id) else {
            bail!("job {} not found", id);
        };
        if !matches!(
            job.status,
            JobStatus::Pending | JobStatus::Processing | JobStatus::Retry
        ) {
            return Ok(CasOutcome::Conflict(job.status));
        }
        apply_transition(job, JobStatus::Cancelled, TransitionPatch::default(), Utc::now());
        Ok(CasOutcome::Applied(job.clone()))
    }

    async fn list(&self, status: Option<JobStatus>, limit: i64) -> Result<Vec<Job>> {
        let limit = limit.clamp(1, 100) as usize;
        let mut jobs: Vec<Job> = lock(&self.jobs)
            .values()
            .filter(|j| j.deleted_at.is_none())
            .filter(|j| status.map(|s| j.status == s).unwrap_or(true))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn counts_by_status(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<HashMap<JobStatus, i64>> {
        let mut counts = HashMap::new();
        for job in lock(&self.jobs).values() {
            if since.map(|s| job.created_at >= s).unwrap_or(true) {
                *counts.entry(job.status).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    async fn unresolved_error_count_since(&self, since: DateTime<Utc>) -> Result<i64> {
        Ok(lock(&self.errors)
            .iter()
            .filter(|e| e.created_at >= since && !e.resolved)
            .count() as i64)
    }

    async fn list_errors(&self, limit: i64, include_resolved: bool) -> Result<Vec<ErrorLog>> {
        let limit = limit.clamp(1, 100) as usize;
        let mut errors: Vec<ErrorLog> = lock(&self.errors)
            .iter()
            .filter(|e| include_resolved || !e.resolved)
            .cloned()
            .collect();
        errors.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        errors.truncate(limit);
        Ok(errors)
    }

    async fn result_for(&self, job_id: Uuid) -> Result<Option<TranscriptionResult>> {
        Ok(lock(&self.results).get(&job_id).cloned())
    }

    async fn purge_eligible(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut jobs = lock(&self.jobs);
        let doomed: Vec<Uuid> = jobs
            .values()
            .filter(|j| j.purge_eligible(now))
            .map(|j| j.id)
            .collect();
        for id in &doomed {
            jobs.remove(id);
            lock(&self.results).remove(id);
            lock(&self.errors).retain(|e| e.job_id != *id);
        }
        Ok(doomed.len() as u64)
    }
}

// ============================================================================
// Broker
// ============================================================================

#[derive(Debug, Clone)]
pub struct QueuedTask {
    pub task_id: Uuid,
    pub queue: String,
    pub priority: u8,
    pub envelope: TaskEnvelope,
    pub delay: Option<Duration>,
    pub claimed: bool,
}

/// Broker double: records every publish for inspection and serves claims
/// by priority. Delays are recorded but not waited on, so tests stay
/// deterministic.
#[derive(Default)]
pub struct MemoryBroker {
    tasks: Mutex<Vec<QueuedTask>>,
    published_log: Mutex<Vec<QueuedTask>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything ever published, including acked messages.
    pub fn published(&self) -> Vec<QueuedTask> {
        lock(&self.published_log).clone()
    }

    pub fn published_to(&self, queue: &str) -> Vec<QueuedTask> {
        lock(&self.published_log)
            .iter()
            .filter(|t| t.queue == queue)
            .cloned()
            .collect()
    }

    pub fn publish_count_for(&self, queue: &str) -> usize {
        self.published_to(queue).len()
    }

    /// Simulate a lease expiry: the task becomes claimable again.
    pub fn redeliver(&self, task_id: Uuid) -> bool {
        let mut tasks = lock(&self.tasks);
        for task in tasks.iter_mut() {
            if task.task_id == task_id {
                task.claimed = false;
                return true;
            }
        }
        false
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.tasks).len()
    }
}

#[async_trait]
impl TaskBroker for MemoryBroker {
    async fn publish(
        &self,
        envelope: &TaskEnvelope,
        queue: &str,
        priority: u8,
        delay: Option<Duration>,
    ) -> Result<Uuid> {
        let task = QueuedTask {
            task_id: Uuid::new_v4(),
            queue: queue.to_string(),
            priority,
            envelope: envelope.clone(),
            delay,
            claimed: false,
        };
        lock(&self.published_log).push(task.clone());
        let task_id = task.task_id;
        lock(&self.tasks).push(task);
        Ok(task_id)
    }

    async fn claim(&self, queues: &[&str], _worker_id: &str) -> Result<Option<Delivery>> {
        let mut tasks = lock(&self.tasks);
        let candidate = tasks
            .iter_mut()
            .filter(|t| !t.claimed && queues.contains(&t.queue.as_str()))
            .max_by_key(|t| t.priority);

        Ok(candidate.map(|task| {
            task.claimed = true;
            Delivery {
                task_id: task.task_id,
                queue: task.queue.clone(),
                envelope: task.envelope.clone(),
            }
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        lock(&self.tasks).retain(|t| t.task_id != delivery.task_id);
        Ok(())
    }

    async fn revoke(&self, task_id: Uuid) -> Result<bool> {
        let mut tasks = lock(&self.tasks);
        let before = tasks.len();
        tasks.retain(|t| t.task_id != task_id);
        Ok(tasks.len() < before)
    }

    async fn depths(&self) -> Result<HashMap<String, i64>> {
        let mut depths = HashMap::new();
        for task in lock(&self.tasks).iter() {
            *depths.entry(task.queue.clone()).or_insert(0) += 1;
        }
        Ok(depths)
    }
}

// ============================================================================
// Audit log
// ============================================================================

/// Hash-chained audit log held in memory. Shares the chain computation
/// with the Postgres adapter, and exposes a tamper hook for verifier
/// tests.
#[derive(Default)]
pub struct MemoryAuditLog {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        lock(&self.records).clone()
    }

    pub fn actions(&self) -> Vec<String> {
        lock(&self.records).iter().map(|r| r.action.clone()).collect()
    }

    pub fn actions_for(&self, resource_id: &str) -> Vec<String> {
        lock(&self.records)
            .iter()
            .filter(|r| r.resource_id.as_deref() == Some(resource_id))
            .map(|r| r.action.clone())
            .collect()
    }

    /// Corrupt a stored record in place, for verifier tests.
    pub fn tamper(&self, sequence_number: i64, mutate: impl FnOnce(&mut AuditRecord)) {
        let mut records = lock(&self.records);
        if let Some(record) = records
            .iter_mut()
            .find(|r| r.sequence_number == sequence_number)
        {
            mutate(record);
        }
    }
}

#[async_trait]
impl AuditLog for MemoryAuditLog {
    async fn log(&self, event: AuditEvent) -> Result<Uuid> {
        let mut records = lock(&self.records);

        let sequence_number = records.len() as i64 + 1;
        let previous_hash = records
            .last()
            .map(|r| r.record_hash.clone())
            .unwrap_or_else(|| SENTINEL_HASH.to_string());

        let event_id = Uuid::new_v4();
        let event_timestamp = Utc::now();
        let record_hash = compute_record_hash(
            event_id,
            &event_timestamp,
            &event.action,
            &event.resource_type,
            event.resource_id.as_deref(),
            event.actor.user_id.as_deref(),
            event.outcome.as_str(),
            &previous_hash,
        );

        records.push(AuditRecord {
            sequence_number,
            event_id,
            event_timestamp,
            action: event.action,
            resource_type: event.resource_type,
            resource_id: event.resource_id,
            user_id: event.actor.user_id,
            user_email: event.actor.user_email,
            user_role: event.actor.user_role,
            agency_id: event.actor.agency_id,
            api_key_id: event.actor.api_key_id,
            ip_address: event.actor.ip_address,
            user_agent: event.actor.user_agent,
            request_id: event.actor.request_id,
            session_id: event.actor.session_id,
            outcome: event.outcome.as_str().to_string(),
            outcome_reason: event.outcome_reason,
            previous_state: event.previous_state,
            new_state: event.new_state,
            previous_hash,
            record_hash,
        });

        Ok(event_id)
    }

    async fn verify_chain(&self, start_seq: i64, batch_size: i64) -> Result<ChainVerification> {
        let batch_size = batch_size.max(1);
        let records = lock(&self.records);

        let mut expected_prev = if start_seq > 1 {
            records
                .iter()
                .find(|r| r.sequence_number == start_seq - 1)
                .map(|r| r.record_hash.clone())
        } else {
            Some(SENTINEL_HASH.to_string())
        };

        let mut current = start_seq;
        loop {
            let batch: Vec<AuditRecord> = records
                .iter()
                .filter(|r| r.sequence_number >= current && r.sequence_number < current + batch_size)
                .cloned()
                .collect();
            if batch.is_empty() {
                break;
            }
            if let Some(bad) = verify_records(&batch, &mut expected_prev) {
                return Ok(ChainVerification::BrokenAt(bad));
            }
            current += batch_size;
        }

        Ok(ChainVerification::Valid)
    }

    async fn chain_of_custody(
        &self,
        resource_type: &str,
        resource_id: &str,
    ) -> Result<Vec<AuditRecord>> {
        Ok(lock(&self.records)
            .iter()
            .filter(|r| {
                r.resource_type == resource_type && r.resource_id.as_deref() == Some(resource_id)
            })
            .cloned()
            .collect())
    }

    async fn failed_auth_attempts(&self, hours: i32, limit: i64) -> Result<Vec<AuditRecord>> {
        let cutoff = Utc::now() - chrono::Duration::hours(hours as i64);
        let mut attempts: Vec<AuditRecord> = lock(&self.records)
            .iter()
            .filter(|r| {
                r.action.starts_with("auth.")
                    && r.outcome == "failure"
                    && r.event_timestamp > cutoff
            })
            .cloned()
            .collect();
        attempts.sort_by(|a, b| b.event_timestamp.cmp(&a.event_timestamp));
        attempts.truncate(limit.max(0) as usize);
        Ok(attempts)
    }
}

// ============================================================================
// Engine, loader, repairer
// ============================================================================

/// Scripted engine: outcomes are served in order; when the script runs
/// dry, a canned success is returned.
#[derive(Default)]
pub struct StubEngine {
    script: Mutex<VecDeque<Result<Transcription, EngineError>>>,
    calls: Mutex<Vec<(ModelTier, PathBuf)>>,
}

impl StubEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stub_transcription() -> Transcription {
        Transcription {
            text: "stub transcript".to_string(),
            language: "en".to_string(),
            duration_seconds: 3.0,
            segments: None,
        }
    }

    pub fn with_outcome(self, outcome: Result<Transcription, EngineError>) -> Self {
        lock(&self.script).push_back(outcome);
        self
    }

    pub fn push_outcome(&self, outcome: Result<Transcription, EngineError>) {
        lock(&self.script).push_back(outcome);
    }

    pub fn calls(&self) -> Vec<(ModelTier, PathBuf)> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }
}

#[async_trait]
impl SpeechEngine for StubEngine {
    async fn transcribe(
        &self,
        model: &ModelLease,
        request: &TranscribeRequest,
        _cancel: &CancellationToken,
    ) -> Result<Transcription, EngineError> {
        lock(&self.calls).push((model.tier, request.file_path.clone()));
        lock(&self.script)
            .pop_front()
            .unwrap_or_else(|| Ok(Self::stub_transcription()))
    }
}

/// Loader that OOMs for tiers in the deny set.
#[derive(Default)]
pub struct StubLoader {
    deny: Mutex<HashSet<ModelTier>>,
    loads: Mutex<Vec<ModelTier>>,
}

impl StubLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny(&self, tier: ModelTier) {
        lock(&self.deny).insert(tier);
    }

    pub fn allow(&self, tier: ModelTier) {
        lock(&self.deny).remove(&tier);
    }

    pub fn loads(&self) -> Vec<ModelTier> {
        lock(&self.loads).clone()
    }
}

#[async_trait]
impl ModelLoader for StubLoader {
    async fn load(&self, tier: ModelTier) -> Result<LoadedModel, LoadError> {
        lock(&self.loads).push(tier);
        if lock(&self.deny).contains(&tier) {
            return Err(LoadError::OutOfMemory(tier));
        }
        Ok(LoadedModel {
            tier,
            memory_bytes: 1,
        })
    }
}

/// Repairer that fabricates a repaired path without touching ffmpeg.
#[derive(Default)]
pub struct StubRepairer {
    fail: Mutex<bool>,
    calls: Mutex<Vec<PathBuf>>,
}

impl StubRepairer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail(&self, fail: bool) {
        *lock(&self.fail) = fail;
    }

    pub fn calls(&self) -> Vec<PathBuf> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl AudioRepairer for StubRepairer {
    async fn repair(&self, source: &Path) -> Result<PathBuf> {
        lock(&self.calls).push(source.to_path_buf());
        if *lock(&self.fail) {
            bail!("repair failed");
        }
        let stem = source
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("audio");
        Ok(source.with_file_name(format!("{}_repaired.mp3", stem)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_job() -> NewJob {
        NewJob {
            id: Uuid::new_v4(),
            original_filename: "clip.wav".to_string(),
            file_path: "/work/uploads/clip.wav".to_string(),
            file_size_bytes: 1024,
            model_tier: ModelTier::Tiny,
            language: None,
            priority: 5,
            max_retries: 3,
        }
    }

    #[tokio::test]
    async fn cas_conflict_reports_the_observed_status() {
        let store = MemoryJobStore::new();
        let job = store.create_job(new_job()).await.unwrap();

        store
            .transition(
                job.id,
                JobStatus::Pending,
                JobStatus::Processing,
                TransitionPatch::default(),
            )
            .await
            .unwrap();

        // A second claimer expecting pending loses the race.
        let outcome = store
            .transition(
                job.id,
                JobStatus::Pending,
                JobStatus::Processing,
                TransitionPatch::default(),
            )
            .await
            .unwrap();
        match outcome {
            CasOutcome::Conflict(actual) => assert_eq!(actual, JobStatus::Processing),
            CasOutcome::Applied(_) => panic!("expected conflict"),
        }
    }

    #[tokio::test]
    async fn forbidden_transitions_are_rejected_outright() {
        let store = MemoryJobStore::new();
        let job = store.create_job(new_job()).await.unwrap();

        let err = store
            .transition(
                job.id,
                JobStatus::Pending,
                JobStatus::Completed,
                TransitionPatch::default(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("forbidden transition"));
    }

    #[tokio::test]
    async fn attach_result_requires_processing_and_is_unique() {
        let store = MemoryJobStore::new();
        let job = store.create_job(new_job()).await.unwrap();

        let result = NewResult {
            transcript_text: "text".to_string(),
            detected_language: None,
            duration_seconds: None,
            segments: None,
            output_file_path: None,
        };

        // Not yet processing: blocked.
        let outcome = store.attach_result(job.id, result.clone()).await.unwrap();
        assert!(!outcome.is_applied());

        store
            .transition(
                job.id,
                JobStatus::Pending,
                JobStatus::Processing,
                TransitionPatch::default(),
            )
            .await
            .unwrap();
        assert!(store.attach_result(job.id, result.clone()).await.unwrap().is_applied());

        // Second write observes completed and is blocked.
        assert!(!store.attach_result(job.id, result).await.unwrap().is_applied());
        assert_eq!(store.result_count(), 1);
    }

    #[tokio::test]
    async fn purge_honors_retention_and_legal_holds() {
        let store = MemoryJobStore::new();
        let now = Utc::now();

        let expired = store.create_job(new_job()).await.unwrap();
        let held = store.create_job(new_job()).await.unwrap();
        let live = store.create_job(new_job()).await.unwrap();

        {
            let mut jobs = lock(&store.jobs);
            let e = jobs.get_mut(&expired.id).unwrap();
            e.deleted_at = Some(now - chrono::Duration::days(30));
            e.retention_until = Some(now - chrono::Duration::days(1));

            let h = jobs.get_mut(&held.id).unwrap();
            h.deleted_at = Some(now - chrono::Duration::days(30));
            h.retention_until = Some(now - chrono::Duration::days(1));
            h.legal_hold_id = Some(Uuid::new_v4());
        }

        assert_eq!(store.purge_eligible(now).await.unwrap(), 1);
        assert!(store.job(expired.id).is_none());
        assert!(store.job(held.id).is_some());
        assert!(store.job(live.id).is_some());
    }

    #[tokio::test]
    async fn list_clamps_the_limit_and_orders_newest_first() {
        let store = MemoryJobStore::new();
        for _ in 0..5 {
            store.create_job(new_job()).await.unwrap();
        }

        let jobs = store.list(None, 1000).await.unwrap();
        assert_eq!(jobs.len(), 5);
        for window in jobs.windows(2) {
            assert!(window[0].created_at >= window[1].created_at);
        }

        let jobs = store.list(None, 2).await.unwrap();
        assert_eq!(jobs.len(), 2);
    }
}
