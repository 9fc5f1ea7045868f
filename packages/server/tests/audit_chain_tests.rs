//! Hash-chain verification behavior against a populated log.

use scribe_core::kernel::audit::{
    AuditEvent, AuditLog, AuditOutcome, ChainVerification, SENTINEL_HASH,
};
use scribe_core::kernel::testing::MemoryAuditLog;

async fn populated_log(events: usize) -> MemoryAuditLog {
    let audit = MemoryAuditLog::new();
    for i in 0..events {
        let event = AuditEvent::new(
            if i % 3 == 0 { "job.create" } else { "job.complete" },
            "transcription_job",
        )
        .resource_id(format!("job-{}", i));
        audit.log(event).await.unwrap();
    }
    audit
}

#[tokio::test]
async fn sequences_are_gap_free_and_chained() {
    let audit = populated_log(25).await;
    let records = audit.records();

    for (i, record) in records.iter().enumerate() {
        assert_eq!(record.sequence_number, i as i64 + 1);
        if i == 0 {
            assert_eq!(record.previous_hash, SENTINEL_HASH);
        } else {
            assert_eq!(record.previous_hash, records[i - 1].record_hash);
        }
    }
}

#[tokio::test]
async fn untampered_log_verifies_for_any_batch_size() {
    let audit = populated_log(100).await;
    for batch_size in [1, 2, 7, 16, 100, 1000] {
        assert_eq!(
            audit.verify_chain(1, batch_size).await.unwrap(),
            ChainVerification::Valid,
            "batch size {}",
            batch_size
        );
    }
}

#[tokio::test]
async fn corrupting_record_57_is_detected_and_later_suffix_still_verifies() {
    let audit = populated_log(100).await;

    audit.tamper(57, |record| {
        record.outcome = "denied".to_string();
    });

    assert_eq!(
        audit.verify_chain(1, 16).await.unwrap(),
        ChainVerification::BrokenAt(57)
    );
    // The suffix after the corruption is internally consistent.
    assert_eq!(
        audit.verify_chain(58, 16).await.unwrap(),
        ChainVerification::Valid
    );
}

#[tokio::test]
async fn rewriting_a_hash_breaks_the_link_to_the_successor() {
    let audit = populated_log(10).await;

    // Recompute record 4's hash over altered content so the record itself
    // looks valid; the successor's previous_hash then exposes it.
    audit.tamper(4, |record| {
        record.action = "job.delete".to_string();
        record.record_hash = scribe_core::kernel::audit::compute_record_hash(
            record.event_id,
            &record.event_timestamp,
            &record.action,
            &record.resource_type,
            record.resource_id.as_deref(),
            record.user_id.as_deref(),
            &record.outcome,
            &record.previous_hash,
        );
    });

    assert_eq!(
        audit.verify_chain(1, 16).await.unwrap(),
        ChainVerification::BrokenAt(5)
    );
}

#[tokio::test]
async fn chain_of_custody_is_scoped_and_ordered() {
    let audit = MemoryAuditLog::new();
    for action in ["job.create", "job.process.start", "job.complete"] {
        audit
            .log(AuditEvent::new(action, "transcription_job").resource_id("job-a"))
            .await
            .unwrap();
    }
    audit
        .log(AuditEvent::new("job.create", "transcription_job").resource_id("job-b"))
        .await
        .unwrap();

    let custody = audit
        .chain_of_custody("transcription_job", "job-a")
        .await
        .unwrap();
    let actions: Vec<&str> = custody.iter().map(|r| r.action.as_str()).collect();
    assert_eq!(actions, vec!["job.create", "job.process.start", "job.complete"]);
}

#[tokio::test]
async fn failed_auth_report_only_includes_auth_failures() {
    let audit = MemoryAuditLog::new();
    audit
        .log(
            AuditEvent::new("auth.api_key", "api")
                .outcome(AuditOutcome::Failure)
                .reason("invalid API key"),
        )
        .await
        .unwrap();
    audit
        .log(AuditEvent::new("auth.api_key", "api"))
        .await
        .unwrap();
    audit
        .log(
            AuditEvent::new("job.fail", "transcription_job")
                .outcome(AuditOutcome::Failure),
        )
        .await
        .unwrap();

    let attempts = audit.failed_auth_attempts(24, 100).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].outcome_reason.as_deref(), Some("invalid API key"));
}
