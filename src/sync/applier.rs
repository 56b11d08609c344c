//! Transactional applier
//!
//! One artifact is applied inside one database transaction: row writes,
//! state hash verification, the client state update, and the success history
//! row commit together or not at all. Failures roll back first and are then
//! recorded in the ledger on their own.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use rusqlite::Connection;
use serde::Serialize;

use super::fetcher::{check_patch_disjoint, Artifact};
use super::resolver::PlanStep;
use crate::error::{Result, SyncError};
use crate::storage::catalog::{
    clear_dataset, compute_state_hash, count_records, delete_record, upsert_record,
};
use crate::storage::sync_state::{append_history, load_state, record_dataset_version, write_state};
use crate::storage::{HistoryRecord, Storage};
use crate::types::{ApplyOutcome, DatasetVersion, Strategy};

/// Progress checkpoint emitted while rows are written
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ApplyProgress {
    pub rows_written: usize,
    pub rows_total: usize,
}

/// Callback receiving apply checkpoints (runs on the blocking thread)
pub type ProgressFn = Arc<dyn Fn(ApplyProgress) + Send + Sync>;

/// Everything the applier needs for one step
#[derive(Debug, Clone)]
pub struct ApplyRequest {
    pub dataset: String,
    pub source_id: String,
    pub strategy: Strategy,
    pub step: PlanStep,
    pub artifact: Artifact,
}

/// Result of a committed apply
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApplySummary {
    pub from_version: Option<String>,
    pub to_version: String,
    pub state_hash: String,
    pub record_count: i64,
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub duration_ms: i64,
}

#[derive(Default)]
struct RowCounts {
    added: usize,
    updated: usize,
    removed: usize,
}

/// Applies artifacts to the catalog tables
#[derive(Clone)]
pub struct TransactionalApplier {
    storage: Storage,
    client_id: String,
    batch_size: usize,
}

impl TransactionalApplier {
    pub fn new(storage: Storage, client_id: impl Into<String>, batch_size: usize) -> Self {
        Self {
            storage,
            client_id: client_id.into(),
            batch_size: batch_size.max(1),
        }
    }

    /// Apply on the blocking pool; the transaction is never split across
    /// an await point.
    pub async fn apply_async(
        &self,
        request: ApplyRequest,
        progress: Option<ProgressFn>,
    ) -> Result<ApplySummary> {
        let applier = self.clone();
        tokio::task::spawn_blocking(move || applier.apply(&request, progress.as_deref()))
            .await
            .map_err(|e| SyncError::Internal(format!("Apply task failed: {}", e)))?
    }

    /// Apply one artifact (blocking)
    pub fn apply(
        &self,
        request: &ApplyRequest,
        progress: Option<&(dyn Fn(ApplyProgress) + Send + Sync)>,
    ) -> Result<ApplySummary> {
        let started = Instant::now();
        let result = self
            .storage
            .with_transaction(|conn| self.apply_in_transaction(conn, request, progress, started));

        match result {
            Ok(summary) => {
                tracing::info!(
                    dataset = %request.dataset,
                    strategy = %request.strategy,
                    to = %summary.to_version,
                    added = summary.added,
                    updated = summary.updated,
                    removed = summary.removed,
                    duration_ms = summary.duration_ms,
                    "Applied artifact"
                );
                Ok(summary)
            }
            Err(err) => {
                let (added, updated, removed) = planned_counts(&request.artifact);
                let record = HistoryRecord {
                    dataset: request.dataset.clone(),
                    from_version: request.step.from_version.clone(),
                    to_version: Some(request.step.to_version.clone()),
                    strategy: Some(request.strategy),
                    duration_ms: elapsed_ms(started),
                    result: Some(ApplyOutcome::Error),
                    error_kind: Some(err.kind().to_string()),
                    error_message: Some(err.to_string()),
                    patch_hash: patch_hash(&request.artifact),
                    added_count: added as i64,
                    updated_count: updated as i64,
                    removed_count: removed as i64,
                };
                if let Err(log_err) = self
                    .storage
                    .with_connection(|conn| append_history(conn, &self.client_id, &record))
                {
                    tracing::warn!(error = %log_err, "Failed to record apply failure");
                }
                tracing::warn!(
                    dataset = %request.dataset,
                    to = %request.step.to_version,
                    error = %err,
                    "Apply rolled back"
                );
                Err(err)
            }
        }
    }

    fn apply_in_transaction(
        &self,
        conn: &Connection,
        request: &ApplyRequest,
        progress: Option<&(dyn Fn(ApplyProgress) + Send + Sync)>,
        started: Instant,
    ) -> Result<ApplySummary> {
        let dataset = request.dataset.as_str();
        let state = load_state(conn, &self.client_id, dataset)?;
        let current = state.and_then(|s| s.current_version);

        let rows_total = request.artifact.row_count();
        let mut written = 0usize;
        let checkpoint = |written: usize| {
            if let Some(report) = progress {
                if written % self.batch_size == 0 || written == rows_total {
                    report(ApplyProgress {
                        rows_written: written,
                        rows_total,
                    });
                }
            }
        };

        let counts = match &request.artifact {
            Artifact::Patch(patch) => {
                if current.as_deref() != Some(patch.from_version.as_str()) {
                    return Err(SyncError::VersionConflict {
                        expected: patch.from_version.clone(),
                        actual: current.clone().unwrap_or_else(|| "none".to_string()),
                    });
                }
                check_patch_disjoint(patch)?;

                for record in patch.added.iter().chain(patch.updated.iter()) {
                    upsert_record(conn, dataset, record)?;
                    written += 1;
                    checkpoint(written);
                }
                for id in &patch.removed {
                    delete_record(conn, dataset, id)?;
                    written += 1;
                    checkpoint(written);
                }
                RowCounts {
                    added: patch.added.len(),
                    updated: patch.updated.len(),
                    removed: patch.removed.len(),
                }
            }
            Artifact::Snapshot(snapshot) => {
                if let Some(declared) = snapshot
                    .snapshot_hash
                    .as_ref()
                    .filter(|h| **h != request.step.expected_hash)
                {
                    return Err(SyncError::HashMismatch {
                        version: snapshot.version.clone(),
                        expected: request.step.expected_hash.clone(),
                        actual: declared.clone(),
                    });
                }
                // A snapshot replaces whatever the replica held
                let removed = clear_dataset(conn, dataset)?;
                for record in &snapshot.records {
                    upsert_record(conn, dataset, record)?;
                    written += 1;
                    checkpoint(written);
                }
                RowCounts {
                    added: snapshot.records.len(),
                    updated: 0,
                    removed,
                }
            }
        };

        let actual = compute_state_hash(conn, dataset)?;
        if actual != request.step.expected_hash {
            return Err(SyncError::HashMismatch {
                version: request.step.to_version.clone(),
                expected: request.step.expected_hash.clone(),
                actual,
            });
        }

        let record_count = count_records(conn, dataset)?;
        let to_version = request.step.to_version.as_str();
        write_state(conn, &self.client_id, dataset, to_version, &actual)?;
        record_dataset_version(
            conn,
            &DatasetVersion {
                source_id: request.source_id.clone(),
                dataset: dataset.to_string(),
                version: to_version.to_string(),
                state_hash: actual.clone(),
                record_count,
                created_at: Utc::now(),
            },
        )?;

        let duration_ms = elapsed_ms(started);
        append_history(
            conn,
            &self.client_id,
            &HistoryRecord {
                dataset: dataset.to_string(),
                from_version: current.clone(),
                to_version: Some(to_version.to_string()),
                strategy: Some(request.strategy),
                duration_ms,
                result: Some(ApplyOutcome::Success),
                error_kind: None,
                error_message: None,
                patch_hash: patch_hash(&request.artifact),
                added_count: counts.added as i64,
                updated_count: counts.updated as i64,
                removed_count: counts.removed as i64,
            },
        )?;

        Ok(ApplySummary {
            from_version: current,
            to_version: to_version.to_string(),
            state_hash: actual,
            record_count,
            added: counts.added,
            updated: counts.updated,
            removed: counts.removed,
            duration_ms,
        })
    }
}

fn planned_counts(artifact: &Artifact) -> (usize, usize, usize) {
    match artifact {
        Artifact::Patch(p) => (p.added.len(), p.updated.len(), p.removed.len()),
        Artifact::Snapshot(s) => (s.records.len(), 0, 0),
    }
}

fn patch_hash(artifact: &Artifact) -> Option<String> {
    match artifact {
        Artifact::Patch(p) => p.patch_hash.clone(),
        Artifact::Snapshot(s) => s.snapshot_hash.clone(),
    }
}

fn elapsed_ms(started: Instant) -> i64 {
    i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX)
}
