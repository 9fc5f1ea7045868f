// Shared test harness: the full pipeline wired over in-memory doubles.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use uuid::Uuid;

use scribe_core::config::{Config, LogFormat};
use scribe_core::domains::transcription::{Job, JobStore, NewJob};
use scribe_core::kernel::audit::{AuditEvent, AuditLog};
use scribe_core::kernel::broker::{TaskBroker, QUEUE_HIGH, WORKER_QUEUES};
use scribe_core::kernel::engine::ModelTier;
use scribe_core::kernel::engine::SpeechEngine;
use scribe_core::kernel::model_pool::{ModelLoader, ModelPool, PoolConfig};
use scribe_core::kernel::repair::AudioRepairer;
use scribe_core::kernel::testing::{
    MemoryAuditLog, MemoryBroker, MemoryJobStore, StubEngine, StubLoader, StubRepairer,
};
use scribe_core::kernel::worker::{envelope_for_job, Worker, WorkerConfig};

pub const RESOURCE_TYPE: &str = "transcription_job";

pub struct Pipeline {
    pub store: Arc<MemoryJobStore>,
    pub broker: Arc<MemoryBroker>,
    pub audit: Arc<MemoryAuditLog>,
    pub loader: Arc<StubLoader>,
    pub pool: Arc<ModelPool>,
    pub engine: Arc<StubEngine>,
    pub repairer: Arc<StubRepairer>,
    pub worker: Worker,
    pub output_dir: TempDir,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::with_pool_config(PoolConfig {
            pool_size: 2,
            max_pool_size: 4,
        })
    }

    pub fn with_pool_config(pool_config: PoolConfig) -> Self {
        let store = Arc::new(MemoryJobStore::new());
        let broker = Arc::new(MemoryBroker::new());
        let audit = Arc::new(MemoryAuditLog::new());
        let loader = Arc::new(StubLoader::new());
        let pool = Arc::new(ModelPool::new(
            Arc::clone(&loader) as Arc<dyn ModelLoader>,
            pool_config,
        ));
        let engine = Arc::new(StubEngine::new());
        let repairer = Arc::new(StubRepairer::new());
        let output_dir = tempfile::tempdir().expect("tempdir");

        let worker = Worker::new(
            Arc::clone(&store) as Arc<dyn JobStore>,
            Arc::clone(&broker) as Arc<dyn TaskBroker>,
            Arc::clone(&audit) as Arc<dyn AuditLog>,
            Arc::clone(&pool),
            Arc::clone(&engine) as Arc<dyn SpeechEngine>,
            Arc::clone(&repairer) as Arc<dyn AudioRepairer>,
            WorkerConfig {
                worker_id: "test-worker".to_string(),
                concurrency: 1,
                hard_timeout: Duration::from_secs(5),
                soft_timeout: Duration::from_secs(4),
                acquire_timeout: Duration::from_secs(1),
                backoff_base: Duration::from_millis(1),
                backoff_cap: Duration::from_millis(10),
                backoff_jitter: 0.0,
                poll_interval: Duration::from_millis(10),
                output_folder: output_dir.path().to_path_buf(),
            },
        );

        Self {
            store,
            broker,
            audit,
            loader,
            pool,
            engine,
            repairer,
            worker,
            output_dir,
        }
    }

    /// Submission as the API performs it: job row, publish to the high
    /// queue at priority 9, audit `job.create`.
    pub async fn submit(&self, tier: ModelTier) -> Job {
        let id = Uuid::new_v4();
        let job = self
            .store
            .create_job(NewJob {
                id,
                original_filename: format!("clip_{}.wav", id.simple()),
                file_path: format!("/work/uploads/{}/clip.wav", id),
                file_size_bytes: 1024 * 1024,
                model_tier: tier,
                language: None,
                priority: 9,
                max_retries: 3,
            })
            .await
            .expect("create job");

        self.broker
            .publish(&envelope_for_job(&job), QUEUE_HIGH, 9, None)
            .await
            .expect("publish");
        self.audit
            .log(AuditEvent::new("job.create", RESOURCE_TYPE).resource_id(job.id))
            .await
            .expect("audit");

        job
    }

    /// Cancellation as the API performs it.
    pub async fn cancel(&self, job_id: Uuid) {
        self.store.cancel(job_id).await.expect("cancel");
        self.audit
            .log(AuditEvent::new("job.cancel", RESOURCE_TYPE).resource_id(job_id))
            .await
            .expect("audit");
    }

    /// Claim and process messages until the queues are empty. Returns the
    /// number of deliveries processed.
    pub async fn drain(&self) -> usize {
        let mut processed = 0;
        while let Some(delivery) = self
            .broker
            .claim(&WORKER_QUEUES, "test-slot")
            .await
            .expect("claim")
        {
            self.worker
                .process_delivery(&delivery)
                .await
                .expect("process delivery");
            processed += 1;
            assert!(processed <= 50, "drain did not converge");
        }
        processed
    }
}

/// Config over temp folders, for API handler tests.
pub fn test_config(work_dir: &TempDir, output_dir: &TempDir, max_upload_mb: u64) -> Config {
    Config {
        database_url: "postgres://unused".to_string(),
        port: 0,
        model_tier: ModelTier::Tiny,
        max_upload_size_mb: max_upload_mb,
        worker_concurrency: 1,
        task_timeout: Duration::from_secs(120),
        max_retries: 3,
        model_pool_size: 2,
        model_pool_max_size: 4,
        model_acquire_timeout: Duration::from_secs(1),
        api_keys: vec!["test-key".to_string()],
        rate_limit_requests: 100,
        rate_limit_window: Duration::from_secs(60),
        log_level: "info".to_string(),
        log_format: LogFormat::Json,
        work_folder: work_dir.path().to_path_buf(),
        output_folder: output_dir.path().to_path_buf(),
        engine_command: vec!["true".to_string()],
    }
}
