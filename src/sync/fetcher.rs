//! Artifact fetcher

use std::collections::HashSet;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::resolver::{ArtifactRef, PlanStep};
use super::source::ArtifactSource;
use crate::error::{Result, SyncError};
use crate::types::{normalize_record_id, PatchPayload, SnapshotPayload};

/// A fully downloaded artifact
#[derive(Debug, Clone)]
pub enum Artifact {
    Patch(PatchPayload),
    Snapshot(SnapshotPayload),
}

impl Artifact {
    /// Rows the applier will write or delete
    pub fn row_count(&self) -> usize {
        match self {
            Artifact::Patch(p) => p.added.len() + p.updated.len() + p.removed.len(),
            Artifact::Snapshot(s) => s.records.len(),
        }
    }
}

/// Downloads the artifact for a plan step and checks it describes that step
#[derive(Clone)]
pub struct ArtifactFetcher {
    source: Arc<dyn ArtifactSource>,
}

impl ArtifactFetcher {
    pub fn new(source: Arc<dyn ArtifactSource>) -> Self {
        Self { source }
    }

    pub async fn fetch(
        &self,
        dataset: &str,
        step: &PlanStep,
        cancel: &CancellationToken,
    ) -> Result<Artifact> {
        if cancel.is_cancelled() {
            return Err(SyncError::Canceled);
        }

        let request = async {
            match &step.artifact {
                ArtifactRef::Patch { from, to } => self
                    .source
                    .fetch_patch(dataset, from, to)
                    .await
                    .map(Artifact::Patch),
                ArtifactRef::Snapshot { version } => self
                    .source
                    .fetch_snapshot(dataset, version)
                    .await
                    .map(Artifact::Snapshot),
            }
        };

        let artifact = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SyncError::Canceled),
            result = request => result?,
        };

        check_artifact(step, &artifact)?;

        tracing::debug!(
            dataset,
            to = %step.to_version,
            rows = artifact.row_count(),
            "Fetched artifact"
        );
        Ok(artifact)
    }
}

fn check_artifact(step: &PlanStep, artifact: &Artifact) -> Result<()> {
    match (&step.artifact, artifact) {
        (ArtifactRef::Patch { from, to }, Artifact::Patch(patch)) => {
            if &patch.from_version != from || &patch.to_version != to {
                return Err(SyncError::InvalidInput(format!(
                    "Requested patch {} -> {}, received {} -> {}",
                    from, to, patch.from_version, patch.to_version
                )));
            }
            check_patch_disjoint(patch)
        }
        (ArtifactRef::Snapshot { version }, Artifact::Snapshot(snapshot)) => {
            if &snapshot.version != version {
                return Err(SyncError::InvalidInput(format!(
                    "Requested snapshot {}, received {}",
                    version, snapshot.version
                )));
            }
            Ok(())
        }
        _ => Err(SyncError::Internal(
            "Artifact kind does not match plan step".to_string(),
        )),
    }
}

/// A row id may not be both written and removed by the same patch
pub fn check_patch_disjoint(patch: &PatchPayload) -> Result<()> {
    let removed: HashSet<String> = patch.removed.iter().map(|id| normalize_record_id(id)).collect();
    if let Some(record) = patch
        .added
        .iter()
        .chain(patch.updated.iter())
        .find(|r| removed.contains(&normalize_record_id(&r.id)))
    {
        return Err(SyncError::Apply(format!(
            "Patch {} -> {} both writes and removes {}",
            patch.from_version, patch.to_version, record.id
        )));
    }
    Ok(())
}
