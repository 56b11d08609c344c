//! Manifest client

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::source::ArtifactSource;
use crate::error::{Result, SyncError};
use crate::types::Manifest;

/// Fetches and validates the remote manifest for a dataset
#[derive(Clone)]
pub struct ManifestClient {
    source: Arc<dyn ArtifactSource>,
}

impl ManifestClient {
    pub fn new(source: Arc<dyn ArtifactSource>) -> Self {
        Self { source }
    }

    /// Fetch the manifest, aborting the request if the run is canceled
    pub async fn fetch(&self, dataset: &str, cancel: &CancellationToken) -> Result<Manifest> {
        if cancel.is_cancelled() {
            return Err(SyncError::Canceled);
        }

        let manifest = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SyncError::Canceled),
            result = self.source.fetch_manifest(dataset) => result?,
        };

        manifest.validate().map_err(SyncError::InvalidInput)?;
        if manifest.dataset != dataset {
            return Err(SyncError::InvalidInput(format!(
                "Manifest describes dataset '{}', expected '{}'",
                manifest.dataset, dataset
            )));
        }

        tracing::debug!(
            dataset,
            latest = %manifest.latest_version,
            versions = manifest.versions.len(),
            compacted = manifest.compacted_patches.len(),
            "Fetched manifest"
        );
        Ok(manifest)
    }
}
