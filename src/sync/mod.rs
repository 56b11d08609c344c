//! Catalog sync pipeline
//!
//! A run goes manifest -> strategy -> artifacts -> transactional apply:
//!
//! ```text
//! Idle -> CheckingManifest -> Resolving -> (Fetching -> Applying)* -> RebuildingIndexes -> Complete
//!                                   \-> Complete (noop)
//! any non-terminal phase -> Canceled | Failed
//! ```

mod applier;
mod coordinator;
mod fetcher;
mod manifest;
mod resolver;
mod source;

pub use applier::{
    ApplyProgress, ApplyRequest, ApplySummary, ProgressFn, TransactionalApplier,
};
pub use coordinator::{DatasetStatus, InFlightRun, SyncCoordinator, SyncDiagnostics, SyncHandle};
pub use fetcher::{check_patch_disjoint, Artifact, ArtifactFetcher};
pub use manifest::ManifestClient;
pub use resolver::{
    missed_versions, resolve_strategy, ArtifactRef, LocalVersion, PlanReason, PlanStep, SyncPlan,
};
pub use source::{ArtifactSource, HttpArtifactSource};

use serde::{Deserialize, Serialize};

use crate::types::Strategy;

/// Coordinator state machine phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    CheckingManifest,
    Resolving,
    Fetching,
    Applying,
    RebuildingIndexes,
    Complete,
    Canceled,
    Failed,
}

impl SyncPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Idle => "idle",
            SyncPhase::CheckingManifest => "checking_manifest",
            SyncPhase::Resolving => "resolving",
            SyncPhase::Fetching => "fetching",
            SyncPhase::Applying => "applying",
            SyncPhase::RebuildingIndexes => "rebuilding_indexes",
            SyncPhase::Complete => "complete",
            SyncPhase::Canceled => "canceled",
            SyncPhase::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SyncPhase::Complete | SyncPhase::Canceled | SyncPhase::Failed
        )
    }
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    /// At least one artifact applied and the replica is at the target
    Synced,
    /// Nothing to do
    UpToDate,
    /// Stopped by a cancel request
    Canceled,
    /// Transient failure after exhausting retries; try again later
    Retryable,
    /// Apply or unclassified failure
    Failed,
}

impl SyncOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOutcome::Synced => "synced",
            SyncOutcome::UpToDate => "up_to_date",
            SyncOutcome::Canceled => "canceled",
            SyncOutcome::Retryable => "retryable",
            SyncOutcome::Failed => "failed",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, SyncOutcome::Synced | SyncOutcome::UpToDate)
    }
}

impl std::fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Step and row progress of the current run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncProgress {
    /// 1-based index of the artifact being fetched or applied
    pub step: usize,
    pub total_steps: usize,
    pub rows_written: usize,
    pub rows_total: usize,
}

/// Final report of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub run_id: String,
    pub dataset: String,
    pub outcome: SyncOutcome,
    pub strategy: Option<Strategy>,
    pub reason: Option<PlanReason>,
    /// Version the replica was at when the run started
    pub from_version: Option<String>,
    /// Version the replica is at now
    pub current_version: Option<String>,
    pub target_version: Option<String>,
    pub steps_applied: usize,
    pub attempts: u32,
    pub duration_ms: i64,
    pub error_kind: Option<String>,
    pub error: Option<String>,
}

/// Observable state of a run, published over a watch channel
#[derive(Debug, Clone, PartialEq)]
pub struct RunStatus {
    pub run_id: String,
    pub phase: SyncPhase,
    pub progress: SyncProgress,
    /// Set exactly once, when the run reaches a terminal phase
    pub report: Option<SyncReport>,
}

impl RunStatus {
    fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            phase: SyncPhase::Idle,
            progress: SyncProgress::default(),
            report: None,
        }
    }
}
