//! Durable task broker: queue routing, priorities, late acknowledgement.
//!
//! Delivery is at-least-once. A claim takes a lease; the message is only
//! removed on [`TaskBroker::ack`], so a worker that dies mid-task loses its
//! lease and the message becomes claimable again. Handlers must therefore
//! be idempotent with respect to the job store.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

use crate::kernel::engine::ModelTier;

pub const QUEUE_HIGH: &str = "jobs.high";
pub const QUEUE_NORMAL: &str = "jobs.normal";
pub const QUEUE_RETRY: &str = "jobs.retry";
pub const QUEUE_DLQ: &str = "jobs.dlq";

/// Queues a worker consumes from. The DLQ is deliberately absent: it is
/// drained by humans, never by workers.
pub const WORKER_QUEUES: [&str; 3] = [QUEUE_HIGH, QUEUE_RETRY, QUEUE_NORMAL];

/// Priority 8 and above routes to the high queue at submission time.
pub fn queue_for_priority(priority: u8) -> &'static str {
    if priority >= 8 {
        QUEUE_HIGH
    } else {
        QUEUE_NORMAL
    }
}

/// Wire payload carried for each transcription task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub job_id: Uuid,
    pub file_path: String,
    pub model_tier: ModelTier,
    pub language: Option<String>,
    pub retry_count: i32,
}

/// A claimed message. Hold it for the duration of processing and `ack`
/// only after the terminal action.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub task_id: Uuid,
    pub queue: String,
    pub envelope: TaskEnvelope,
}

#[async_trait]
pub trait TaskBroker: Send + Sync {
    /// Enqueue a task. Blocks until the broker accepts it; returns the
    /// broker-assigned task id. `delay` defers availability.
    async fn publish(
        &self,
        envelope: &TaskEnvelope,
        queue: &str,
        priority: u8,
        delay: Option<Duration>,
    ) -> Result<Uuid>;

    /// Claim at most one message from the given queues, highest priority
    /// first. `None` when nothing is ready.
    async fn claim(&self, queues: &[&str], worker_id: &str) -> Result<Option<Delivery>>;

    /// Late acknowledgement: remove the message after processing reached a
    /// terminal action.
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Re-publish with `retry_count` incremented, onto the retry queue.
    async fn retry(&self, envelope: &TaskEnvelope, delay: Duration) -> Result<Uuid> {
        let mut next = envelope.clone();
        next.retry_count += 1;
        self.publish(&next, QUEUE_RETRY, 5, Some(delay)).await
    }

    /// Best-effort cancellation of a published task.
    async fn revoke(&self, task_id: Uuid) -> Result<bool>;

    /// Message counts per queue, for admin health.
    async fn depths(&self) -> Result<HashMap<String, i64>>;
}

// ============================================================================
// Postgres adapter
// ============================================================================

/// Broker over a `task_queue` table: `FOR UPDATE SKIP LOCKED` claims with a
/// lease, so concurrent workers never double-claim and abandoned messages
/// are redelivered once their lease expires.
pub struct PgBroker {
    pool: PgPool,
    lease: Duration,
}

impl PgBroker {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            // Must outlast the hard task timeout, or a slow task would be
            // redelivered while still running.
            lease: Duration::from_secs(3900),
        }
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }
}

#[async_trait]
impl TaskBroker for PgBroker {
    async fn publish(
        &self,
        envelope: &TaskEnvelope,
        queue: &str,
        priority: u8,
        delay: Option<Duration>,
    ) -> Result<Uuid> {
        let task_id = Uuid::new_v4();
        let delay_seconds = delay.map(|d| d.as_secs_f64()).unwrap_or(0.0);

        sqlx::query(
            r#"
            INSERT INTO task_queue (id, queue, priority, payload, available_at)
            VALUES ($1, $2, $3, $4, NOW() + ($5 || ' seconds')::INTERVAL)
            "#,
        )
        .bind(task_id)
        .bind(queue)
        .bind(priority as i16)
        .bind(serde_json::to_value(envelope)?)
        .bind(delay_seconds.to_string())
        .execute(&self.pool)
        .await?;

        debug!(task_id = %task_id, queue = %queue, priority, "task published");
        Ok(task_id)
    }

    async fn claim(&self, queues: &[&str], worker_id: &str) -> Result<Option<Delivery>> {
        let queues: Vec<String> = queues.iter().map(|q| q.to_string()).collect();

        let row: Option<(Uuid, String, serde_json::Value)> = sqlx::query_as(
            r#"
            WITH next_task AS (
                SELECT id
                FROM task_queue
                WHERE queue = ANY($1)
                  AND available_at <= NOW()
                  AND (lease_expires_at IS NULL OR lease_expires_at < NOW())
                ORDER BY priority DESC, available_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE task_queue
            SET claimed_by = $2,
                lease_expires_at = NOW() + ($3 || ' seconds')::INTERVAL
            WHERE id IN (SELECT id FROM next_task)
            RETURNING id, queue, payload
            "#,
        )
        .bind(&queues)
        .bind(worker_id)
        .bind(self.lease.as_secs().to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((task_id, queue, payload)) => Ok(Some(Delivery {
                task_id,
                queue,
                envelope: serde_json::from_value(payload)?,
            })),
            None => Ok(None),
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        sqlx::query("DELETE FROM task_queue WHERE id = $1")
            .bind(delivery.task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn revoke(&self, task_id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM task_queue WHERE id = $1")
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn depths(&self) -> Result<HashMap<String, i64>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT queue, COUNT(*) FROM task_queue GROUP BY queue")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().collect())
    }
}
