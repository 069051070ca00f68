/// End-to-end batch tests against the in-memory store and a scripted bureau.
mod common;

use chrono::Utc;
use rust_prescreen_api::bureau_client::ProbeStatus;
use rust_prescreen_api::coordinator::{CoordinatorSettings, SubmitBatch};
use rust_prescreen_api::errors::AppError;
use rust_prescreen_api::models::*;
use rust_prescreen_api::retry_queue::RetryQueueManager;
use rust_prescreen_api::store::PrescreenStore;
use std::time::Duration;

use common::{actor, records, FakeBureau, Harness};

fn submit(program_id: uuid::Uuid, names: &[&str]) -> SubmitBatch {
    SubmitBatch {
        program_id,
        name: Some("October mailer".to_string()),
        records: records(names),
        retry_of: None,
    }
}

#[tokio::test]
async fn single_record_batch_is_rejected_before_any_bureau_call() {
    let h = Harness::new().await;

    let err = h
        .coordinator
        .submit(&actor(), submit(h.program.id, &["Solo"]))
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::Validation(_)), "got {:?}", err);
    assert_eq!(h.bureau.calls(), 0);
    assert_eq!(h.bureau.probes.load(std::sync::atomic::Ordering::SeqCst), 0);
    let batches = h.store.list_batches(&BatchFilter::default()).await.unwrap();
    assert_eq!(batches.total, 0);
}

#[tokio::test]
async fn clean_batch_completes_with_tiers() {
    let h = Harness::new().await;
    h.bureau.scores.lock().unwrap().insert("Low".to_string(), 450);
    h.bureau.no_hit.lock().unwrap().insert("Ghost".to_string());

    let batch = h
        .coordinator
        .submit(&actor(), submit(h.program.id, &["High", "Low", "Ghost"]))
        .await
        .unwrap();

    assert_eq!(batch.status, BatchStatus::Completed);
    assert_eq!(batch.total_records, 3);
    assert_eq!(batch.qualified_count, 2);
    assert_eq!(batch.failed_count, 1);
    assert_eq!(batch.error_count, 0);
    assert!(batch.completed_at.is_some());
    assert_eq!(h.bureau.calls(), 9);

    let leads = h.store.leads_for_batch(batch.id).await.unwrap();
    let tier_of = |name: &str| leads.iter().find(|l| l.last_name == name).unwrap().tier;
    assert_eq!(tier_of("High"), Tier::Tier1);
    assert_eq!(tier_of("Low"), Tier::Below);
    assert_eq!(tier_of("Ghost"), Tier::Filtered);
    assert!(leads.iter().all(|l| !l.retry_flag));
}

#[tokio::test]
async fn partial_failures_flag_exactly_the_failed_records() {
    let h = Harness::new().await;
    h.bureau.fail_for(&["Err1", "Err2", "Err3"]);

    let batch = h
        .coordinator
        .submit(
            &actor(),
            submit(h.program.id, &["Ok1", "Err1", "Ok2", "Err2", "Err3"]),
        )
        .await
        .unwrap();

    assert_eq!(batch.status, BatchStatus::Partial);
    assert_eq!(batch.error_count, 3);
    assert_eq!(batch.failed_count, 3);
    assert_eq!(batch.qualified_count, 2);
    assert_eq!(
        batch.error_message.as_deref(),
        Some("3 of 5 records failed with api_error")
    );

    let leads = h.store.leads_for_batch(batch.id).await.unwrap();
    let flagged: Vec<_> = leads.iter().filter(|l| l.retry_flag).collect();
    assert_eq!(flagged.len(), 3);
    assert!(flagged
        .iter()
        .all(|l| l.match_status == MatchStatus::ApiError && l.tier == Tier::Pending));
    assert!(leads.iter().all(|l| l.match_status != MatchStatus::Pending));
}

#[tokio::test]
async fn every_record_failing_fails_the_batch() {
    let h = Harness::new().await;
    h.bureau.fail_for(&["A", "B"]);

    let batch = h
        .coordinator
        .submit(&actor(), submit(h.program.id, &["A", "B"]))
        .await
        .unwrap();

    assert_eq!(batch.status, BatchStatus::Failed);
    assert_eq!(batch.error_count, 2);
}

#[tokio::test]
async fn unreachable_bureau_fails_batch_without_creating_leads() {
    let h = Harness::new().await;
    h.bureau.set_probe(ProbeStatus::Blocked);

    let batch = h
        .coordinator
        .submit(&actor(), submit(h.program.id, &["A", "B"]))
        .await
        .unwrap();

    assert_eq!(batch.status, BatchStatus::Failed);
    assert!(batch
        .error_message
        .as_deref()
        .unwrap()
        .starts_with("bureau API unavailable (blocked)"));
    assert_eq!(h.bureau.calls(), 0);
    assert!(h.store.leads_for_batch(batch.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn unknown_or_inactive_program_is_a_configuration_error() {
    let h = Harness::new().await;
    let err = h
        .coordinator
        .submit(&actor(), submit(uuid::Uuid::new_v4(), &["A", "B"]))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Configuration(_)));

    let mut inactive = h.program.clone();
    inactive.active = false;
    h.store.update_program(&inactive).await.unwrap();
    let err = h
        .coordinator
        .submit(&actor(), submit(h.program.id, &["A", "B"]))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Configuration(_)));
}

#[tokio::test]
async fn stored_pii_is_encrypted_and_fingerprinted() {
    let h = Harness::new().await;
    let batch = h
        .coordinator
        .submit(&actor(), submit(h.program.id, &["A", "B"]))
        .await
        .unwrap();

    let leads = h.store.leads_for_batch(batch.id).await.unwrap();
    let lead = leads.iter().find(|l| l.position == 0).unwrap();
    let token = lead.ssn_encrypted.as_deref().unwrap();
    assert_ne!(token, "123451000");
    assert_eq!(h.vault.decrypt(token).unwrap(), "123451000");
    assert_eq!(lead.ssn_last_four.as_deref(), Some("1000"));
    assert_eq!(
        lead.ssn_fingerprint.as_deref(),
        Some(h.vault.ssn_fingerprint("123451000").unwrap().as_str())
    );
}

#[tokio::test]
async fn retry_batch_resubmits_only_api_error_leads() {
    let h = Harness::new().await;
    h.bureau.fail_for(&["Err1", "Err2", "Err3"]);
    let original = h
        .coordinator
        .submit(
            &actor(),
            submit(h.program.id, &["Ok1", "Err1", "Ok2", "Err2", "Err3"]),
        )
        .await
        .unwrap();

    h.bureau.fail_for(&[]);
    let retry = RetryQueueManager::new(h.dyn_store(), h.vault.clone(), h.coordinator.clone());
    let prepared = retry.retry_batch(&actor(), original.id).await.unwrap();
    assert_eq!(prepared.batch.total_records, 3);
    assert_eq!(prepared.batch.retry_of, Some(original.id));
    assert_eq!(
        prepared.batch.name.as_deref(),
        Some("Retry of October mailer")
    );

    let rerun = h.coordinator.run(&actor(), prepared).await.unwrap();
    assert_eq!(rerun.status, BatchStatus::Completed);
    assert_eq!(rerun.qualified_count, 3);

    // Original rows keep their outcome; only the queue flag is cleared.
    let old_leads = h.store.leads_for_batch(original.id).await.unwrap();
    assert_eq!(
        old_leads
            .iter()
            .filter(|l| l.match_status == MatchStatus::ApiError)
            .count(),
        3
    );
    assert!(old_leads.iter().all(|l| !l.retry_flag));

    let new_names: Vec<String> = h
        .store
        .leads_for_batch(rerun.id)
        .await
        .unwrap()
        .into_iter()
        .map(|l| l.last_name)
        .collect();
    assert!(new_names.iter().all(|n| n.starts_with("Err")));
}

#[tokio::test]
async fn retry_of_batch_without_errors_is_rejected() {
    let h = Harness::new().await;
    let batch = h
        .coordinator
        .submit(&actor(), submit(h.program.id, &["A", "B"]))
        .await
        .unwrap();

    let retry = RetryQueueManager::new(h.dyn_store(), h.vault.clone(), h.coordinator.clone());
    let err = retry.retry_batch(&actor(), batch.id).await.unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
}

#[tokio::test]
async fn processing_batch_cannot_be_retried() {
    let h = Harness::new().await;
    let prepared = h
        .coordinator
        .prepare(&actor(), submit(h.program.id, &["A", "B"]))
        .await
        .unwrap();

    let retry = RetryQueueManager::new(h.dyn_store(), h.vault.clone(), h.coordinator.clone());
    let err = retry
        .retry_batch(&actor(), prepared.batch.id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
}

#[tokio::test]
async fn stale_processing_batch_is_reconciled() {
    let h = Harness::new().await;
    let prepared = h
        .coordinator
        .prepare(&actor(), submit(h.program.id, &["A", "B", "C"]))
        .await
        .unwrap();
    let batch_id = prepared.batch.id;

    // Nothing is stale yet.
    let none = h
        .coordinator
        .reconcile_stale_batches(Utc::now())
        .await
        .unwrap();
    assert!(none.is_empty());

    let later = Utc::now() + chrono::Duration::hours(2);
    let reconciled = h.coordinator.reconcile_stale_batches(later).await.unwrap();
    assert_eq!(reconciled.len(), 1);
    assert_eq!(reconciled[0].status, BatchStatus::Failed);
    assert_eq!(
        reconciled[0].error_message.as_deref(),
        Some("processing interrupted")
    );
    assert_eq!(reconciled[0].error_count, 3);

    let leads = h.store.leads_for_batch(batch_id).await.unwrap();
    assert!(leads
        .iter()
        .all(|l| l.match_status == MatchStatus::ApiError && l.retry_flag));

    let audit = h
        .store
        .audit_entries(&AuditFilter {
            batch_id: Some(batch_id),
            ..Default::default()
        })
        .await
        .unwrap();
    let entry = audit
        .iter()
        .find(|e| e.action == AuditAction::BatchReconciled)
        .unwrap();
    assert_eq!(entry.actor_id, "system");
}

#[tokio::test]
async fn queued_leads_resubmit_as_one_batch() {
    let h = Harness::new().await;
    h.bureau.no_hit.lock().unwrap().extend(["A".to_string(), "B".to_string()]);
    let batch = h
        .coordinator
        .submit(&actor(), submit(h.program.id, &["A", "B"]))
        .await
        .unwrap();
    let ids: Vec<_> = h
        .store
        .leads_for_batch(batch.id)
        .await
        .unwrap()
        .into_iter()
        .map(|l| l.id)
        .collect();

    let retry = RetryQueueManager::new(h.dyn_store(), h.vault.clone(), h.coordinator.clone());
    let change = retry.enqueue(&actor(), &ids).await.unwrap();
    assert_eq!(change.updated.len(), 2);
    assert_eq!(retry.list_queue().await.unwrap().len(), 2);

    let prepared = retry.resubmit(&actor(), &ids, None).await.unwrap();
    assert_eq!(prepared.batch.retry_of, Some(batch.id));
    assert!(retry.list_queue().await.unwrap().is_empty());

    for id in &ids {
        let audit = h.audit_for_lead(*id).await;
        assert!(audit.iter().any(|e| e.action == AuditAction::RetryEnqueued));
        assert!(audit.iter().any(|e| e.action == AuditAction::RetryMaterialized));
    }
}

#[tokio::test]
async fn retrying_the_same_batch_twice_resends_nothing() {
    let h = Harness::new().await;
    h.bureau.fail_for(&["Err1", "Err2", "Err3"]);
    let original = h
        .coordinator
        .submit(
            &actor(),
            submit(h.program.id, &["Ok1", "Err1", "Ok2", "Err2", "Err3"]),
        )
        .await
        .unwrap();

    let retry = RetryQueueManager::new(h.dyn_store(), h.vault.clone(), h.coordinator.clone());
    let first = retry.retry_batch(&actor(), original.id).await.unwrap();
    assert_eq!(first.batch.total_records, 3);

    let err = retry.retry_batch(&actor(), original.id).await.unwrap_err();
    assert!(matches!(err, AppError::Validation(_)), "got {:?}", err);

    let retries = h
        .store
        .list_batches(&BatchFilter::default())
        .await
        .unwrap()
        .items
        .into_iter()
        .filter(|b| b.retry_of == Some(original.id))
        .count();
    assert_eq!(retries, 1);
}

#[tokio::test]
async fn dequeued_api_error_leads_are_not_retried() {
    let h = Harness::new().await;
    h.bureau.fail_for(&["Err1", "Err2", "Err3"]);
    let original = h
        .coordinator
        .submit(&actor(), submit(h.program.id, &["Ok1", "Err1", "Err2", "Err3"]))
        .await
        .unwrap();
    let dropped = h
        .store
        .leads_for_batch(original.id)
        .await
        .unwrap()
        .into_iter()
        .find(|l| l.last_name == "Err1")
        .unwrap();

    let retry = RetryQueueManager::new(h.dyn_store(), h.vault.clone(), h.coordinator.clone());
    retry.dequeue(&actor(), &[dropped.id]).await.unwrap();

    let prepared = retry.retry_batch(&actor(), original.id).await.unwrap();
    assert_eq!(prepared.batch.total_records, 2);
    let names: Vec<String> = h
        .store
        .leads_for_batch(prepared.batch.id)
        .await
        .unwrap()
        .into_iter()
        .map(|l| l.last_name)
        .collect();
    assert!(!names.contains(&"Err1".to_string()), "{:?}", names);
}

#[tokio::test]
async fn blocked_resubmission_leaves_leads_queued() {
    let h = Harness::new().await;
    h.bureau.fail_for(&["A", "B"]);
    let batch = h
        .coordinator
        .submit(&actor(), submit(h.program.id, &["A", "B"]))
        .await
        .unwrap();
    let ids: Vec<_> = h
        .store
        .leads_for_batch(batch.id)
        .await
        .unwrap()
        .into_iter()
        .map(|l| l.id)
        .collect();

    let retry = RetryQueueManager::new(h.dyn_store(), h.vault.clone(), h.coordinator.clone());
    assert_eq!(retry.list_queue().await.unwrap().len(), 2);

    h.bureau.set_probe(ProbeStatus::Blocked);
    let prepared = retry.resubmit(&actor(), &ids, None).await.unwrap();
    assert_eq!(prepared.batch.status, BatchStatus::Failed);
    assert!(!prepared.is_runnable());
    assert_eq!(retry.list_queue().await.unwrap().len(), 2);

    let prepared = retry.retry_batch(&actor(), batch.id).await.unwrap();
    assert!(!prepared.is_runnable());
    assert_eq!(retry.list_queue().await.unwrap().len(), 2);

    h.bureau.set_probe(ProbeStatus::Connected);
    h.bureau.fail_for(&[]);
    let prepared = retry.resubmit(&actor(), &ids, None).await.unwrap();
    assert!(prepared.is_runnable());
    assert!(retry.list_queue().await.unwrap().is_empty());
    let rerun = h.coordinator.run(&actor(), prepared).await.unwrap();
    assert_eq!(rerun.status, BatchStatus::Completed);
}

#[tokio::test]
async fn bureau_calls_never_exceed_the_in_flight_limit() {
    let settings = CoordinatorSettings {
        max_in_flight: 2,
        ..Default::default()
    };
    let h = Harness::with_settings(FakeBureau::default(), settings).await;
    let names = ["A", "B", "C", "D"];
    h.bureau.delay_for(&names, Duration::from_millis(20));

    let batch = h
        .coordinator
        .submit(&actor(), submit(h.program.id, &names))
        .await
        .unwrap();

    assert_eq!(batch.status, BatchStatus::Completed);
    assert_eq!(h.bureau.calls(), 12);
    assert_eq!(h.bureau.peak_in_flight(), 2);
}

#[tokio::test]
async fn slow_bureau_call_times_out_as_api_error() {
    let settings = CoordinatorSettings {
        call_timeout: Duration::from_millis(100),
        ..Default::default()
    };
    let h = Harness::with_settings(FakeBureau::default(), settings).await;
    h.bureau.delay_for(&["Slow"], Duration::from_secs(5));

    let batch = h
        .coordinator
        .submit(&actor(), submit(h.program.id, &["Fast", "Slow"]))
        .await
        .unwrap();

    assert_eq!(batch.status, BatchStatus::Partial);
    assert_eq!(batch.error_count, 1);
    assert!(batch.completed_at.is_some());

    let leads = h.store.leads_for_batch(batch.id).await.unwrap();
    let slow = leads.iter().find(|l| l.last_name == "Slow").unwrap();
    assert_eq!(slow.match_status, MatchStatus::ApiError);
    assert!(slow.retry_flag);
    assert!(slow.error_message.as_deref().unwrap().contains("timed out"));
}

#[tokio::test]
async fn run_does_not_overwrite_a_reconciled_batch() {
    let h = Harness::new().await;
    let prepared = h
        .coordinator
        .prepare(&actor(), submit(h.program.id, &["A", "B"]))
        .await
        .unwrap();
    let batch_id = prepared.batch.id;

    let later = Utc::now() + chrono::Duration::hours(2);
    let reconciled = h.coordinator.reconcile_stale_batches(later).await.unwrap();
    assert_eq!(reconciled.len(), 1);

    let after_run = h.coordinator.run(&actor(), prepared).await.unwrap();
    assert_eq!(after_run.status, BatchStatus::Failed);
    assert_eq!(
        after_run.error_message.as_deref(),
        Some("processing interrupted")
    );
    assert_eq!(after_run.error_count, 2);

    let finalized = h
        .store
        .audit_entries(&AuditFilter {
            batch_id: Some(batch_id),
            ..Default::default()
        })
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.action == AuditAction::BatchFinalized)
        .count();
    assert_eq!(finalized, 0);

    // A second finalize is a no-op.
    let again = h
        .store
        .finalize_batch(batch_id, BatchStatus::Completed, None)
        .await
        .unwrap();
    assert!(again.is_none());
}
