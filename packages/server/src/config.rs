use anyhow::{bail, Context, Result};
use dotenvy::dotenv;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::kernel::engine::ModelTier;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,

    pub model_tier: ModelTier,
    pub max_upload_size_mb: u64,

    pub worker_concurrency: usize,
    pub task_timeout: Duration,
    pub max_retries: i32,

    pub model_pool_size: usize,
    pub model_pool_max_size: usize,
    pub model_acquire_timeout: Duration,

    pub api_keys: Vec<String>,
    pub rate_limit_requests: u32,
    pub rate_limit_window: Duration,

    pub log_level: String,
    pub log_format: LogFormat,

    pub work_folder: PathBuf,
    pub output_folder: PathBuf,

    /// External speech engine invocation, e.g. `whisper-cli --json`.
    /// The audio path is appended as the final argument.
    pub engine_command: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Human,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let model_tier = env::var("MODEL_SIZE")
            .unwrap_or_else(|_| "large".to_string())
            .parse::<ModelTier>()
            .context("MODEL_SIZE must be one of: tiny, base, small, medium, large")?;

        let task_timeout_seconds: u64 = parse_env("TASK_TIMEOUT_SECONDS", 3600)?;
        if task_timeout_seconds <= 60 {
            bail!("TASK_TIMEOUT_SECONDS must be greater than 60");
        }

        let model_pool_size: usize = parse_env("MODEL_POOL_SIZE", 2)?;
        let model_pool_max_size: usize = parse_env("MODEL_POOL_MAX_SIZE", 4)?;
        if model_pool_max_size == 0 || model_pool_max_size < model_pool_size {
            bail!("MODEL_POOL_MAX_SIZE must be >= MODEL_POOL_SIZE and >= 1");
        }

        let log_format = match env::var("LOG_FORMAT").as_deref() {
            Ok("human") => LogFormat::Human,
            Ok("json") | Err(_) => LogFormat::Json,
            Ok(other) => bail!("LOG_FORMAT must be 'json' or 'human', got '{}'", other),
        };

        let api_keys: Vec<String> = env::var("API_KEYS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .collect();

        let engine_command: Vec<String> = env::var("ENGINE_COMMAND")
            .unwrap_or_else(|_| "whisper-cli --output-json".to_string())
            .split_whitespace()
            .map(str::to_string)
            .collect();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            port: parse_env("PORT", 8080)?,
            model_tier,
            max_upload_size_mb: parse_env("MAX_UPLOAD_SIZE_MB", 500)?,
            worker_concurrency: parse_env("WORKER_CONCURRENCY", 4)?,
            task_timeout: Duration::from_secs(task_timeout_seconds),
            max_retries: parse_env("MAX_RETRIES", 3)?,
            model_pool_size,
            model_pool_max_size,
            model_acquire_timeout: Duration::from_secs(parse_env(
                "MODEL_ACQUIRE_TIMEOUT_SECONDS",
                300,
            )?),
            api_keys,
            rate_limit_requests: parse_env("RATE_LIMIT_REQUESTS", 100)?,
            rate_limit_window: Duration::from_secs(parse_env("RATE_LIMIT_WINDOW_SECONDS", 60)?),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            log_format,
            work_folder: env::var("WORK_FOLDER")
                .unwrap_or_else(|_| "./work".to_string())
                .into(),
            output_folder: env::var("OUTPUT_FOLDER")
                .unwrap_or_else(|_| "./transcribed".to_string())
                .into(),
            engine_command,
        })
    }

    pub fn max_upload_size_bytes(&self) -> u64 {
        self.max_upload_size_mb * 1024 * 1024
    }

    /// Soft timeout fires one minute before the hard task timeout so the
    /// engine gets a chance to stop gracefully.
    pub fn soft_timeout(&self) -> Duration {
        self.task_timeout - Duration::from_secs(60)
    }
}

fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .with_context(|| format!("{} must be a valid value (got '{}')", key, raw)),
        Err(_) => Ok(default),
    }
}
