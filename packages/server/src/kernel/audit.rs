//! Append-only audit log with a cryptographic hash chain.
//!
//! Every record links to its predecessor through `previous_hash`, so any
//! after-the-fact modification breaks the chain and is detectable by
//! [`AuditLog::verify_chain`]. Writers are serialized by a log-wide
//! advisory lock; sequence numbers are gap-free and start at 1. The
//! storage layer additionally rejects UPDATE/DELETE via trigger.

use async_trait::async_trait;
use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

/// `previous_hash` of the first record in the chain.
pub const SENTINEL_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Advisory lock key serializing audit writers. Arbitrary but stable.
const AUDIT_CHAIN_LOCK: i64 = 0x5343_5249_4245_4c47;

// ============================================================================
// Event and record types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditOutcome {
    Success,
    Failure,
    Denied,
    Error,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Success => "success",
            AuditOutcome::Failure => "failure",
            AuditOutcome::Denied => "denied",
            AuditOutcome::Error => "error",
        }
    }
}

/// Who performed the action. All fields optional; worker-internal events
/// carry none of them.
#[derive(Debug, Clone, Default)]
pub struct Actor {
    pub user_id: Option<String>,
    pub user_email: Option<String>,
    pub user_role: Option<String>,
    pub agency_id: Option<String>,
    /// First 8 hex chars of the hashed API key, when API-key authenticated.
    pub api_key_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub request_id: Option<String>,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub action: String,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub actor: Actor,
    pub outcome: AuditOutcome,
    pub outcome_reason: Option<String>,
    pub previous_state: Option<serde_json::Value>,
    pub new_state: Option<serde_json::Value>,
}

impl AuditEvent {
    /// `action` follows the `<resource>.<verb>` convention, e.g. `job.create`.
    pub fn new(action: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            resource_type: resource_type.into(),
            resource_id: None,
            actor: Actor::default(),
            outcome: AuditOutcome::Success,
            outcome_reason: None,
            previous_state: None,
            new_state: None,
        }
    }

    pub fn resource_id(mut self, id: impl ToString) -> Self {
        self.resource_id = Some(id.to_string());
        self
    }

    pub fn actor(mut self, actor: Actor) -> Self {
        self.actor = actor;
        self
    }

    pub fn outcome(mut self, outcome: AuditOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.outcome_reason = Some(reason.into());
        self
    }

    /// State snapshots are redacted on the way in; reserved keys never
    /// reach the audit stream.
    pub fn states(
        mut self,
        previous: Option<serde_json::Value>,
        new: Option<serde_json::Value>,
    ) -> Self {
        self.previous_state = previous.as_ref().map(crate::common::pii::redact_value);
        self.new_state = new.as_ref().map(crate::common::pii::redact_value);
        self
    }
}

/// A stored audit record, as read back for verification and reporting.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AuditRecord {
    pub sequence_number: i64,
    pub event_id: Uuid,
    pub event_timestamp: DateTime<Utc>,
    pub action: String,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub user_id: Option<String>,
    pub user_email: Option<String>,
    pub user_role: Option<String>,
    pub agency_id: Option<String>,
    pub api_key_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub request_id: Option<String>,
    pub session_id: Option<String>,
    pub outcome: String,
    pub outcome_reason: Option<String>,
    pub previous_state: Option<serde_json::Value>,
    pub new_state: Option<serde_json::Value>,
    pub previous_hash: String,
    pub record_hash: String,
}

// ============================================================================
// Hash chain
// ============================================================================

/// Canonical timestamp form used in the hash input.
fn canonical_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Hash of the chained fields. Absent values serialize as the empty string.
#[allow(clippy::too_many_arguments)]
pub fn compute_record_hash(
    event_id: Uuid,
    event_timestamp: &DateTime<Utc>,
    action: &str,
    resource_type: &str,
    resource_id: Option<&str>,
    user_id: Option<&str>,
    outcome: &str,
    previous_hash: &str,
) -> String {
    let input = format!(
        "{}|{}|{}|{}|{}|{}|{}|{}",
        event_id,
        canonical_timestamp(event_timestamp),
        action,
        resource_type,
        resource_id.unwrap_or(""),
        user_id.unwrap_or(""),
        outcome,
        previous_hash,
    );
    hex::encode(Sha256::digest(input.as_bytes()))
}

fn recompute_hash(record: &AuditRecord) -> String {
    compute_record_hash(
        record.event_id,
        &record.event_timestamp,
        &record.action,
        &record.resource_type,
        record.resource_id.as_deref(),
        record.user_id.as_deref(),
        &record.outcome,
        &record.previous_hash,
    )
}

/// Verify one ordered batch, carrying `expected_prev` across batches.
/// Returns the first offending sequence number, if any.
pub fn verify_records(
    records: &[AuditRecord],
    expected_prev: &mut Option<String>,
) -> Option<i64> {
    for record in records {
        if let Some(expected) = expected_prev.as_deref() {
            if record.previous_hash != expected {
                return Some(record.sequence_number);
            }
        }
        if recompute_hash(record) != record.record_hash {
            return Some(record.sequence_number);
        }
        *expected_prev = Some(record.record_hash.clone());
    }
    None
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainVerification {
    Valid,
    BrokenAt(i64),
}

impl ChainVerification {
    pub fn is_valid(&self) -> bool {
        matches!(self, ChainVerification::Valid)
    }
}

// ============================================================================
// Contract + Postgres adapter
// ============================================================================

/// One append stream per database; instantiate once at process init and
/// share the handle.
#[async_trait]
pub trait AuditLog: Send + Sync {
    /// Append an event; returns its `event_id`. Concurrent callers are
    /// serialized, so sequence numbers are totally ordered and gap-free.
    async fn log(&self, event: AuditEvent) -> Result<Uuid>;

    /// Scan `[start_seq, ..)` in batches, checking the chain linkage and
    /// recomputing every record hash.
    async fn verify_chain(&self, start_seq: i64, batch_size: i64) -> Result<ChainVerification>;

    /// Ordered access history for one resource.
    async fn chain_of_custody(
        &self,
        resource_type: &str,
        resource_id: &str,
    ) -> Result<Vec<AuditRecord>>;

    /// Recent failed authentication attempts.
    async fn failed_auth_attempts(&self, hours: i32, limit: i64) -> Result<Vec<AuditRecord>>;
}

const RECORD_COLUMNS: &str = "sequence_number, event_id, event_timestamp, action, resource_type, \
     resource_id, user_id, user_email, user_role, agency_id, api_key_id, ip_address, user_agent, \
     request_id, session_id, outcome, outcome_reason, previous_state, new_state, previous_hash, \
     record_hash";

pub struct PgAuditLog {
    pool: PgPool,
}

impl PgAuditLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditLog for PgAuditLog {
    async fn log(&self, event: AuditEvent) -> Result<Uuid> {
        let mut tx = self.pool.begin().await?;

        // Log-wide lock: writers serialize at commit, sequence stays gap-free.
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(AUDIT_CHAIN_LOCK)
            .execute(&mut *tx)
            .await?;

        let prev: Option<(i64, String)> = sqlx::query_as(
            "SELECT sequence_number, record_hash FROM audit_log \
             ORDER BY sequence_number DESC LIMIT 1",
        )
        .fetch_optional(&mut *tx)
        .await?;

        let (sequence_number, previous_hash) = match prev {
            Some((seq, hash)) => (seq + 1, hash),
            None => (1, SENTINEL_HASH.to_string()),
        };

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

        sqlx::query(
            r#"
            INSERT INTO audit_log (
                event_id, event_timestamp, user_id, user_email, user_role,
                agency_id, api_key_id, action, resource_type, resource_id,
                ip_address, user_agent, request_id, session_id,
                outcome, outcome_reason, previous_state, new_state,
                sequence_number, previous_hash, record_hash
            )
            VALUES (
                $1, $2, $3, $4, $5,
                $6, $7, $8, $9, $10,
                $11, $12, $13, $14,
                $15, $16, $17, $18,
                $19, $20, $21
            )
            "#,
        )
        .bind(event_id)
        .bind(event_timestamp)
        .bind(&event.actor.user_id)
        .bind(&event.actor.user_email)
        .bind(&event.actor.user_role)
        .bind(&event.actor.agency_id)
        .bind(&event.actor.api_key_id)
        .bind(&event.action)
        .bind(&event.resource_type)
        .bind(&event.resource_id)
        .bind(&event.actor.ip_address)
        .bind(&event.actor.user_agent)
        .bind(&event.actor.request_id)
        .bind(&event.actor.session_id)
        .bind(event.outcome.as_str())
        .bind(&event.outcome_reason)
        .bind(&event.previous_state)
        .bind(&event.new_state)
        .bind(sequence_number)
        .bind(&previous_hash)
        .bind(&record_hash)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(
            event_id = %event_id,
            action = %event.action,
            sequence_number,
            "audit event logged"
        );

        Ok(event_id)
    }

    async fn verify_chain(&self, start_seq: i64, batch_size: i64) -> Result<ChainVerification> {
        let batch_size = batch_size.max(1);

        let mut expected_prev = if start_seq > 1 {
            sqlx::query_scalar::<_, String>(
                "SELECT record_hash FROM audit_log WHERE sequence_number = $1",
            )
            .bind(start_seq - 1)
            .fetch_optional(&self.pool)
            .await?
        } else {
            Some(SENTINEL_HASH.to_string())
        };

        let mut current = start_seq;
        loop {
            let query = format!(
                "SELECT {} FROM audit_log \
                 WHERE sequence_number >= $1 AND sequence_number < $2 \
                 ORDER BY sequence_number ASC",
                RECORD_COLUMNS
            );
            let records: Vec<AuditRecord> = sqlx::query_as(&query)
                .bind(current)
                .bind(current + batch_size)
                .fetch_all(&self.pool)
                .await?;

            if records.is_empty() {
                break;
            }
            if let Some(bad) = verify_records(&records, &mut expected_prev) {
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
        let query = format!(
            "SELECT {} FROM audit_log \
             WHERE resource_type = $1 AND resource_id = $2 \
             ORDER BY sequence_number ASC",
            RECORD_COLUMNS
        );
        let records = sqlx::query_as(&query)
            .bind(resource_type)
            .bind(resource_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(records)
    }

    async fn failed_auth_attempts(&self, hours: i32, limit: i64) -> Result<Vec<AuditRecord>> {
        let query = format!(
            "SELECT {} FROM audit_log \
             WHERE action LIKE 'auth.%' \
               AND outcome = 'failure' \
               AND event_timestamp > NOW() - make_interval(hours => $1) \
             ORDER BY event_timestamp DESC \
             LIMIT $2",
            RECORD_COLUMNS
        );
        let records = sqlx::query_as(&query)
            .bind(hours)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(records)
    }
}
