// Worker entry point: N task executors over the durable queue.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;

use scribe_core::common::logging;
use scribe_core::domains::transcription::PgJobStore;
use scribe_core::kernel::audit::PgAuditLog;
use scribe_core::kernel::broker::PgBroker;
use scribe_core::kernel::engine::CommandEngine;
use scribe_core::kernel::model_pool::{ModelPool, PoolConfig, StaticModelLoader};
use scribe_core::kernel::repair::FfmpegRepairer;
use scribe_core::kernel::worker::{Worker, WorkerConfig};
use scribe_core::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;
    logging::init(&config);

    tracing::info!(concurrency = config.worker_concurrency, "Starting transcription worker");

    let pool = PgPoolOptions::new()
        .max_connections(30)
        .test_before_acquire(true)
        .max_lifetime(Duration::from_secs(3600))
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;

    let broker_lease = config.task_timeout + Duration::from_secs(300);
    let worker = Arc::new(Worker::new(
        Arc::new(PgJobStore::new(pool.clone())),
        Arc::new(PgBroker::new(pool.clone()).with_lease(broker_lease)),
        Arc::new(PgAuditLog::new(pool.clone())),
        Arc::new(ModelPool::new(
            Arc::new(StaticModelLoader),
            PoolConfig {
                pool_size: config.model_pool_size,
                max_pool_size: config.model_pool_max_size,
            },
        )),
        Arc::new(CommandEngine::new(config.engine_command.clone())),
        Arc::new(FfmpegRepairer::new(config.work_folder.clone())),
        WorkerConfig {
            concurrency: config.worker_concurrency,
            hard_timeout: config.task_timeout,
            soft_timeout: config.soft_timeout(),
            acquire_timeout: config.model_acquire_timeout,
            output_folder: config.output_folder.clone(),
            ..Default::default()
        },
    ));

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            signal_token.cancel();
        }
    });

    worker.run(shutdown).await;
    Ok(())
}
