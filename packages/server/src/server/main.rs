// HTTP API entry point.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;

use scribe_core::common::logging;
use scribe_core::domains::transcription::PgJobStore;
use scribe_core::kernel::audit::PgAuditLog;
use scribe_core::kernel::broker::PgBroker;
use scribe_core::kernel::model_pool::{ModelPool, PoolConfig, StaticModelLoader};
use scribe_core::server::middleware::{ApiKeyValidator, RateLimiter};
use scribe_core::server::{build_app, AppState};
use scribe_core::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;
    logging::init(&config);

    tracing::info!("Starting transcription API");

    // 10 base + 20 overflow connections; pre-ping and hourly recycle.
    let pool = PgPoolOptions::new()
        .max_connections(30)
        .test_before_acquire(true)
        .max_lifetime(Duration::from_secs(3600))
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connected");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;
    tracing::info!("Migrations complete");

    let broker_lease = config.task_timeout + Duration::from_secs(300);
    let state = AppState {
        store: Arc::new(PgJobStore::new(pool.clone())),
        broker: Arc::new(PgBroker::new(pool.clone()).with_lease(broker_lease)),
        audit: Arc::new(PgAuditLog::new(pool.clone())),
        pool: Arc::new(ModelPool::new(
            Arc::new(StaticModelLoader),
            PoolConfig {
                pool_size: config.model_pool_size,
                max_pool_size: config.model_pool_max_size,
            },
        )),
        auth: Arc::new(ApiKeyValidator::new(&config.api_keys)),
        limiter: Arc::new(RateLimiter::new(
            config.rate_limit_requests,
            config.rate_limit_window,
        )),
        config: Arc::new(config.clone()),
    };

    let app = build_app(state);

    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;
    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}
