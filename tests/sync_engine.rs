//! End-to-end sync scenarios against an in-memory artifact source
//!
//! Run with: cargo test --test sync_engine

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use catalog_sync::storage::catalog::{compute_state_hash, load_records};
use catalog_sync::storage::Storage;
use catalog_sync::sync::{
    Artifact, ApplyRequest, ArtifactRef, PlanReason, PlanStep, SyncCoordinator, SyncOutcome,
    TransactionalApplier,
};
use catalog_sync::types::{ApplyOutcome, CatalogRecord, SnapshotPayload, Strategy, SyncConfig};

use common::{label, FakeSource, Lineage, DATASET};

fn config(max_attempts: u32) -> SyncConfig {
    SyncConfig {
        client_id: "test-client".to_string(),
        max_attempts,
        retry_backoff_ms: 1,
        apply_batch_size: 7,
        ..Default::default()
    }
}

fn coordinator(storage: &Storage, source: &Arc<FakeSource>, max_attempts: u32) -> SyncCoordinator {
    SyncCoordinator::new(storage.clone(), source.clone(), config(max_attempts)).unwrap()
}

fn stored(storage: &Storage) -> (Vec<CatalogRecord>, String) {
    storage
        .with_connection(|conn| Ok((load_records(conn, DATASET)?, compute_state_hash(conn, DATASET)?)))
        .unwrap()
}

fn sorted(mut records: Vec<CatalogRecord>) -> Vec<CatalogRecord> {
    records.sort_by(|a, b| a.id.cmp(&b.id));
    records
}

/// Replica at version index `at`, synced with a full snapshot
async fn replica_at(lineage: Lineage, at: usize) -> (Storage, Arc<FakeSource>, SyncCoordinator) {
    let storage = Storage::open_in_memory().unwrap();
    let source = FakeSource::new(lineage, at);
    let coordinator = coordinator(&storage, &source, 3);
    let report = coordinator.run(DATASET).await.unwrap();
    assert_eq!(report.outcome, SyncOutcome::Synced);
    assert_eq!(report.strategy, Some(Strategy::Full));
    (storage, source, coordinator)
}

#[tokio::test]
async fn test_fresh_replica_syncs_full_then_noop() {
    let (storage, source, coordinator) = replica_at(Lineage::generate(4), 3).await;
    let lineage = source.lineage().clone();

    let (records, hash) = stored(&storage);
    assert_eq!(records, sorted(lineage.versions[3].records.clone()));
    assert_eq!(hash, lineage.versions[3].hash);

    let history_before = coordinator.state_store().history(DATASET, 100).unwrap().len();
    let report = coordinator.run(DATASET).await.unwrap();
    assert_eq!(report.outcome, SyncOutcome::UpToDate);
    assert_eq!(report.steps_applied, 0);
    assert_eq!(source.snapshot_calls.load(Ordering::SeqCst), 1);
    assert_eq!(source.patch_calls.load(Ordering::SeqCst), 0);

    // Noop runs leave the ledger and rows untouched
    assert_eq!(
        coordinator.state_store().history(DATASET, 100).unwrap().len(),
        history_before
    );
    assert_eq!(stored(&storage).1, hash);
}

#[tokio::test]
async fn test_chain_matches_full_snapshot() {
    let (chained, source, coordinator) = replica_at(Lineage::generate(6), 0).await;

    source.publish(4);
    let report = coordinator.run(DATASET).await.unwrap();
    assert_eq!(report.outcome, SyncOutcome::Synced);
    assert_eq!(report.strategy, Some(Strategy::Chain));
    assert_eq!(report.reason, Some(PlanReason::WithinChainWindow));
    assert_eq!(report.steps_applied, 4);
    assert_eq!(report.from_version.as_deref(), Some(label(0).as_str()));
    assert_eq!(report.current_version.as_deref(), Some(label(4).as_str()));
    assert_eq!(source.patch_calls.load(Ordering::SeqCst), 4);

    let (fresh, _, _) = replica_at(source.lineage().clone(), 4).await;
    assert_eq!(stored(&chained), stored(&fresh));
    assert_eq!(stored(&chained).1, source.lineage().versions[4].hash);

    let history = coordinator.state_store().history(DATASET, 100).unwrap();
    let chain_rows: Vec<_> = history
        .iter()
        .filter(|h| h.strategy == Some(Strategy::Chain))
        .collect();
    assert_eq!(chain_rows.len(), 4);
    assert!(chain_rows.iter().all(|h| h.result == ApplyOutcome::Success));
}

#[tokio::test]
async fn test_compacted_patch_used_when_far_behind() {
    let lineage = Lineage::generate(9).with_compacted(0, 8);
    let (storage, source, coordinator) = replica_at(lineage, 0).await;

    source.publish(8);
    let plan = coordinator.plan(DATASET).await.unwrap();
    assert_eq!(plan.strategy, Strategy::Compacted);
    assert_eq!(plan.missed, Some(8));

    let report = coordinator.run(DATASET).await.unwrap();
    assert_eq!(report.outcome, SyncOutcome::Synced);
    assert_eq!(report.strategy, Some(Strategy::Compacted));
    assert_eq!(report.steps_applied, 1);
    assert_eq!(source.patch_calls.load(Ordering::SeqCst), 1);
    assert_eq!(stored(&storage).1, source.lineage().versions[8].hash);
}

#[tokio::test]
async fn test_missing_compacted_falls_back_to_full() {
    let (storage, source, coordinator) = replica_at(Lineage::generate(9), 0).await;

    source.publish(8);
    let report = coordinator.run(DATASET).await.unwrap();
    assert_eq!(report.strategy, Some(Strategy::Full));
    assert_eq!(report.reason, Some(PlanReason::NoCompactedCoverage));
    assert_eq!(source.patch_calls.load(Ordering::SeqCst), 0);
    assert_eq!(stored(&storage).1, source.lineage().versions[8].hash);
}

#[tokio::test]
async fn test_invalid_row_rolls_back_step() {
    let (storage, source, coordinator) = replica_at(Lineage::generate(3), 0).await;
    let before = stored(&storage);

    *source.invalid_patch_to.lock() = Some(label(1));
    source.publish(2);
    let report = coordinator.run(DATASET).await.unwrap();

    assert_eq!(report.outcome, SyncOutcome::Failed);
    assert_eq!(report.error_kind.as_deref(), Some("apply"));
    assert_eq!(report.attempts, 1);
    assert_eq!(report.steps_applied, 0);

    // No partial rows, and the recorded version still matches the data
    assert_eq!(stored(&storage), before);
    let state = coordinator.state_store().load(DATASET).unwrap().unwrap();
    assert_eq!(state.current_version.as_deref(), Some(label(0).as_str()));
    assert_eq!(state.state_hash.as_deref(), Some(before.1.as_str()));

    let last = coordinator.state_store().last_attempt(DATASET).unwrap().unwrap();
    assert_eq!(last.result, ApplyOutcome::Error);
    assert_eq!(last.error_kind.as_deref(), Some("apply"));
}

#[tokio::test]
async fn test_hash_mismatch_retries_with_full() {
    let (storage, source, coordinator) = replica_at(Lineage::generate(4), 0).await;

    *source.corrupt_patch_to.lock() = Some(label(2));
    source.publish(3);
    let report = coordinator.run(DATASET).await.unwrap();

    assert_eq!(report.outcome, SyncOutcome::Synced);
    assert_eq!(report.strategy, Some(Strategy::Full));
    assert_eq!(report.attempts, 2);
    assert_eq!(source.snapshot_calls.load(Ordering::SeqCst), 2);
    assert_eq!(stored(&storage).1, source.lineage().versions[3].hash);

    let kinds: Vec<Option<String>> = coordinator
        .state_store()
        .history(DATASET, 3)
        .unwrap()
        .into_iter()
        .map(|h| h.error_kind)
        .collect();
    assert_eq!(kinds, vec![None, Some("hash_mismatch".to_string()), None]);
    assert!(!coordinator.state_store().needs_full_resync(DATASET).unwrap());
    assert_eq!(coordinator.diagnostics(DATASET).retry_count, 1);
}

#[tokio::test]
async fn test_exhausted_hash_mismatch_forces_full_next_run() {
    let storage = Storage::open_in_memory().unwrap();
    let source = FakeSource::new(Lineage::generate(3), 0);
    let coordinator = coordinator(&storage, &source, 1);
    coordinator.run(DATASET).await.unwrap();

    *source.corrupt_patch_to.lock() = Some(label(1));
    source.publish(2);
    let report = coordinator.run(DATASET).await.unwrap();
    assert_eq!(report.outcome, SyncOutcome::Failed);
    assert_eq!(report.error_kind.as_deref(), Some("hash_mismatch"));
    assert!(coordinator.state_store().needs_full_resync(DATASET).unwrap());

    let plan = coordinator.plan(DATASET).await.unwrap();
    assert_eq!(plan.strategy, Strategy::Full);
    assert_eq!(plan.reason, PlanReason::ForcedFull);

    let report = coordinator.run(DATASET).await.unwrap();
    assert_eq!(report.outcome, SyncOutcome::Synced);
    assert_eq!(report.strategy, Some(Strategy::Full));
    assert!(!coordinator.state_store().needs_full_resync(DATASET).unwrap());
    assert_eq!(stored(&storage).1, source.lineage().versions[2].hash);
}

/// Another writer moves the replica to version `at` with a snapshot
fn write_snapshot_behind_coordinator(storage: &Storage, lineage: &Lineage, at: usize) {
    let version = &lineage.versions[at];
    let request = ApplyRequest {
        dataset: DATASET.to_string(),
        source_id: "other-writer".to_string(),
        strategy: Strategy::Full,
        step: PlanStep {
            artifact: ArtifactRef::Snapshot {
                version: version.label.clone(),
            },
            from_version: None,
            to_version: version.label.clone(),
            expected_hash: version.hash.clone(),
        },
        artifact: Artifact::Snapshot(SnapshotPayload {
            version: version.label.clone(),
            snapshot_hash: Some(version.hash.clone()),
            records: version.records.clone(),
        }),
    };
    TransactionalApplier::new(storage.clone(), "test-client", 50)
        .apply(&request, None)
        .unwrap();
}

#[tokio::test]
async fn test_version_conflict_re_resolves_and_retries() {
    let (storage, source, coordinator) = replica_at(Lineage::generate(3), 0).await;

    let writer = storage.clone();
    let lineage = source.lineage().clone();
    source.on_patch(move |calls| {
        if calls == 1 {
            write_snapshot_behind_coordinator(&writer, &lineage, 1);
        }
    });
    source.publish(2);

    let report = coordinator.run(DATASET).await.unwrap();
    assert_eq!(report.outcome, SyncOutcome::Synced);
    assert_eq!(report.strategy, Some(Strategy::Chain));
    assert_eq!(report.attempts, 2);
    // The second attempt starts from where the other writer left off
    assert_eq!(report.steps_applied, 1);
    assert_eq!(source.patch_calls.load(Ordering::SeqCst), 2);
    assert_eq!(stored(&storage).1, source.lineage().versions[2].hash);

    let kinds: Vec<Option<String>> = coordinator
        .state_store()
        .history(DATASET, 2)
        .unwrap()
        .into_iter()
        .map(|h| h.error_kind)
        .collect();
    assert_eq!(kinds, vec![None, Some("version_conflict".to_string())]);
    assert_eq!(coordinator.diagnostics(DATASET).retry_count, 1);
}

#[tokio::test]
async fn test_exhausted_version_conflict_is_retryable() {
    let storage = Storage::open_in_memory().unwrap();
    let source = FakeSource::new(Lineage::generate(3), 0);
    let coordinator = coordinator(&storage, &source, 1);
    coordinator.run(DATASET).await.unwrap();

    let writer = storage.clone();
    let lineage = source.lineage().clone();
    source.on_patch(move |_| write_snapshot_behind_coordinator(&writer, &lineage, 1));
    source.publish(2);

    let report = coordinator.run(DATASET).await.unwrap();
    assert_eq!(report.outcome, SyncOutcome::Retryable);
    assert_eq!(report.error_kind.as_deref(), Some("version_conflict"));
    assert_eq!(report.steps_applied, 0);

    // The other writer's commit stands untouched
    let state = coordinator.state_store().load(DATASET).unwrap().unwrap();
    assert_eq!(state.current_version.as_deref(), Some(label(1).as_str()));
    assert_eq!(stored(&storage).1, source.lineage().versions[1].hash);
}

#[tokio::test]
async fn test_failed_index_rebuild_keeps_sync() {
    let (storage, source, coordinator) = replica_at(Lineage::generate(2), 0).await;
    storage
        .with_connection(|conn| {
            conn.execute_batch("DROP TABLE catalog_set_summary;")?;
            Ok(())
        })
        .unwrap();

    source.publish(1);
    let report = coordinator.run(DATASET).await.unwrap();
    assert_eq!(report.outcome, SyncOutcome::Synced);
    assert_eq!(report.error_kind, None);
    assert_eq!(report.steps_applied, 1);

    let state = coordinator.state_store().load(DATASET).unwrap().unwrap();
    assert_eq!(state.current_version.as_deref(), Some(label(1).as_str()));
    assert_eq!(stored(&storage).1, source.lineage().versions[1].hash);
    assert_eq!(
        coordinator.state_store().last_attempt(DATASET).unwrap().unwrap().result,
        ApplyOutcome::Success
    );
    assert_eq!(coordinator.diagnostics(DATASET).last_outcome, Some(SyncOutcome::Synced));
}

#[tokio::test]
async fn test_network_failures_are_retried() {
    let storage = Storage::open_in_memory().unwrap();
    let source = FakeSource::new(Lineage::generate(2), 1);
    source.network_failures.store(2, Ordering::SeqCst);

    let coordinator = coordinator(&storage, &source, 3);
    let report = coordinator.run(DATASET).await.unwrap();

    assert_eq!(report.outcome, SyncOutcome::Synced);
    assert_eq!(report.attempts, 3);
    assert_eq!(source.manifest_calls.load(Ordering::SeqCst), 3);
    assert_eq!(coordinator.diagnostics(DATASET).retry_count, 2);
}

#[tokio::test]
async fn test_exhausted_network_failures_are_retryable() {
    let storage = Storage::open_in_memory().unwrap();
    let source = FakeSource::new(Lineage::generate(2), 1);
    source.network_failures.store(10, Ordering::SeqCst);

    let coordinator = coordinator(&storage, &source, 2);
    let report = coordinator.run(DATASET).await.unwrap();

    assert_eq!(report.outcome, SyncOutcome::Retryable);
    assert_eq!(report.error_kind.as_deref(), Some("network"));
    assert_eq!(report.attempts, 2);
    assert!(coordinator.state_store().load(DATASET).unwrap().is_none());

    let history = coordinator.state_store().history(DATASET, 10).unwrap();
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|h| h.error_kind.as_deref() == Some("network")));
}

#[tokio::test]
async fn test_cancel_mid_chain_keeps_completed_steps() {
    let lineage = Lineage::generate(8).with_compacted_threshold(6);
    let (storage, source, coordinator) = replica_at(lineage, 0).await;

    let canceler = coordinator.clone();
    source.on_patch(move |calls| {
        if calls == 3 {
            canceler.cancel(DATASET);
        }
    });
    source.publish(5);

    let report = coordinator.run(DATASET).await.unwrap();
    assert_eq!(report.outcome, SyncOutcome::Canceled);
    assert_eq!(report.strategy, Some(Strategy::Chain));
    assert_eq!(report.steps_applied, 2);
    assert_eq!(report.current_version.as_deref(), Some(label(2).as_str()));

    // Local state is exactly the last fully applied step
    let state = coordinator.state_store().load(DATASET).unwrap().unwrap();
    assert_eq!(state.current_version.as_deref(), Some(label(2).as_str()));
    let (records, hash) = stored(&storage);
    assert_eq!(hash, source.lineage().versions[2].hash);
    assert_eq!(records, sorted(source.lineage().versions[2].records.clone()));

    let last = coordinator.state_store().last_attempt(DATASET).unwrap().unwrap();
    assert_eq!(last.result, ApplyOutcome::Canceled);
    let history = coordinator.state_store().history(DATASET, 100).unwrap();
    assert!(history.iter().all(|h| h.result != ApplyOutcome::Error));
    assert_eq!(coordinator.diagnostics(DATASET).cancel_count, 1);

    // The next run resumes from where the canceled one stopped
    let report = coordinator.run(DATASET).await.unwrap();
    assert_eq!(report.outcome, SyncOutcome::Synced);
    assert_eq!(report.steps_applied, 3);
    assert_eq!(stored(&storage).1, source.lineage().versions[5].hash);
}

#[tokio::test]
async fn test_concurrent_callers_share_one_run() {
    let storage = Storage::open_in_memory().unwrap();
    let source = FakeSource::new(Lineage::generate(3), 2);
    *source.manifest_delay.lock() = Duration::from_millis(100);
    let coordinator = coordinator(&storage, &source, 3);

    let first = coordinator.start(DATASET).unwrap();
    let second = coordinator.start("  Default_Cards ").unwrap();
    assert!(!first.joined());
    assert!(second.joined());
    assert_eq!(first.run_id(), second.run_id());
    let others: Vec<_> = (0..3).map(|_| coordinator.start(DATASET).unwrap()).collect();
    assert!(others.iter().all(|h| h.joined()));

    let (a, b) = tokio::join!(first.wait(), second.wait());
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a, b);
    for report in futures::future::join_all(others.into_iter().map(|h| h.wait())).await {
        assert_eq!(report.unwrap(), a);
    }
    assert_eq!(a.outcome, SyncOutcome::Synced);
    assert_eq!(source.manifest_calls.load(Ordering::SeqCst), 1);
    assert_eq!(source.snapshot_calls.load(Ordering::SeqCst), 1);
    assert_eq!(coordinator.state_store().history(DATASET, 10).unwrap().len(), 1);

    let diagnostics = coordinator.diagnostics(DATASET);
    assert_eq!(diagnostics.runs_started, 1);
    assert_eq!(diagnostics.joined_callers, 4);
    assert!(diagnostics.in_flight.is_none());

    // Once finished, a new caller starts a fresh run
    let third = coordinator.start(DATASET).unwrap();
    assert!(!third.joined());
    assert_ne!(third.run_id(), a.run_id);
    assert_eq!(third.wait().await.unwrap().outcome, SyncOutcome::UpToDate);
}

#[tokio::test]
async fn test_status_after_sync() {
    let (_storage, source, coordinator) = replica_at(Lineage::generate(2), 1).await;

    let status = coordinator.status(DATASET).unwrap();
    assert_eq!(status.client_id, "test-client");
    assert_eq!(status.current_version.as_deref(), Some(label(1).as_str()));
    assert_eq!(
        status.record_count,
        source.lineage().versions[1].records.len() as i64
    );
    let last = status.last_attempt.unwrap();
    assert_eq!(last.result, ApplyOutcome::Success);
    assert_eq!(last.strategy, Some(Strategy::Full));
    assert_eq!(status.diagnostics.last_outcome, Some(SyncOutcome::Synced));
}
