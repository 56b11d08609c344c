//! Artifact sources: where manifests, patches, and snapshots come from

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;

use crate::error::{Result, SyncError};
use crate::types::{Manifest, PatchPayload, SnapshotPayload, SyncConfig};

/// Remote endpoints publishing a dataset's version lineage
///
/// Implementations return complete payloads or an error, never a partial
/// artifact.
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    /// Latest manifest for a dataset
    async fn fetch_manifest(&self, dataset: &str) -> Result<Manifest>;

    /// Incremental or compacted patch between two versions
    async fn fetch_patch(&self, dataset: &str, from: &str, to: &str) -> Result<PatchPayload>;

    /// Full snapshot of one version
    async fn fetch_snapshot(&self, dataset: &str, version: &str) -> Result<SnapshotPayload>;
}

/// HTTP source talking to the artifact server
///
/// Routes: `GET {base}/datasets/{dataset}/manifest`,
/// `GET {base}/datasets/{dataset}/patch?from=&to=`,
/// `GET {base}/datasets/{dataset}/snapshot?version=`.
pub struct HttpArtifactSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpArtifactSource {
    pub fn new(config: &SyncConfig) -> Result<Self> {
        let base_url = config.base_url.trim().trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(SyncError::Config(format!(
                "Base URL must start with http:// or https://: {}",
                config.base_url
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .user_agent(concat!("catalog-sync/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn dataset_url(&self, dataset: &str, endpoint: &str) -> String {
        format!("{}/datasets/{}/{}", self.base_url, dataset, endpoint)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str, query: &[(&str, &str)]) -> Result<T> {
        let response = self.client.get(url).query(query).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, url, &body));
        }

        // A truncated transfer is a network error; a body that arrived
        // whole but does not decode is not worth retrying
        let body = response.bytes().await?;
        let payload = serde_json::from_slice(&body)?;
        Ok(payload)
    }
}

fn classify_status(status: StatusCode, url: &str, body: &str) -> SyncError {
    let detail = format!("{} returned {}: {}", url, status, body.trim());
    if status == StatusCode::NOT_FOUND {
        SyncError::NotFound(detail)
    } else if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        SyncError::Network(detail)
    } else {
        SyncError::InvalidInput(detail)
    }
}

#[async_trait]
impl ArtifactSource for HttpArtifactSource {
    async fn fetch_manifest(&self, dataset: &str) -> Result<Manifest> {
        let url = self.dataset_url(dataset, "manifest");
        self.get_json(&url, &[]).await
    }

    async fn fetch_patch(&self, dataset: &str, from: &str, to: &str) -> Result<PatchPayload> {
        let url = self.dataset_url(dataset, "patch");
        self.get_json(&url, &[("from", from), ("to", to)]).await
    }

    async fn fetch_snapshot(&self, dataset: &str, version: &str) -> Result<SnapshotPayload> {
        let url = self.dataset_url(dataset, "snapshot");
        self.get_json(&url, &[("version", version)]).await
    }
}
