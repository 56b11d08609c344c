//! Producer data root: `<root>/<dataset>/manifest.json` plus the artifact
//! files it names by relative path

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Deserialize};

use crate::error::{Result, SyncError};
use crate::types::{CatalogRecord, Manifest, PatchPayload, SnapshotPayload};

struct CachedManifest {
    modified: SystemTime,
    manifest: Arc<Manifest>,
}

/// Snapshot files are either a full payload or a bare record array
#[derive(Deserialize)]
#[serde(untagged)]
enum SnapshotFile {
    Payload(SnapshotPayload),
    Records(Vec<CatalogRecord>),
}

/// Read-only access to published artifacts
pub struct DataRoot {
    root: PathBuf,
    manifests: Mutex<HashMap<String, CachedManifest>>,
}

impl DataRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            manifests: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Manifest of a dataset, re-read only when the file's mtime changes
    pub async fn manifest(&self, dataset: &str) -> Result<Arc<Manifest>> {
        let path = self.root.join(dataset).join("manifest.json");
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| io_error(e, &path))?;
        let modified = metadata.modified()?;

        let cached = self
            .manifests
            .lock()
            .get(dataset)
            .filter(|c| c.modified == modified)
            .map(|c| c.manifest.clone());
        if let Some(manifest) = cached {
            return Ok(manifest);
        }

        let manifest: Manifest = read_json(&path).await?;
        manifest.validate().map_err(SyncError::InvalidInput)?;
        let manifest = Arc::new(manifest);

        tracing::debug!(dataset, latest = %manifest.latest_version, "Loaded manifest");
        self.manifests.lock().insert(
            dataset.to_string(),
            CachedManifest {
                modified,
                manifest: manifest.clone(),
            },
        );
        Ok(manifest)
    }

    /// Exact incremental patch `from -> to`, or a compacted patch covering it
    pub async fn patch(&self, dataset: &str, from: &str, to: &str) -> Result<PatchPayload> {
        let manifest = self.manifest(dataset).await?;

        let sorted = manifest.sorted_versions();
        let incremental = sorted
            .iter()
            .position(|v| v.version == to)
            .filter(|&idx| idx > 0 && sorted[idx - 1].version == from)
            .and_then(|idx| sorted[idx].patch_from_previous.clone());

        let relative = match incremental {
            Some(path) => path,
            None => manifest
                .compacted_patches
                .iter()
                .find(|c| c.from_version == from && c.to_version == to)
                .and_then(|c| c.path.clone())
                .ok_or_else(|| {
                    SyncError::NotFound(format!("No patch {} -> {} for {}", from, to, dataset))
                })?,
        };

        let path = self.artifact_path(dataset, &relative)?;
        read_json(&path).await
    }

    /// Full snapshot of a listed version
    pub async fn snapshot(&self, dataset: &str, version: &str) -> Result<SnapshotPayload> {
        let manifest = self.manifest(dataset).await?;

        let entry = manifest.version_entry(version);
        let relative = entry
            .and_then(|v| v.snapshot.clone())
            .or_else(|| {
                (version == manifest.latest_version)
                    .then(|| manifest.latest_snapshot.clone())
                    .flatten()
            })
            .ok_or_else(|| {
                SyncError::NotFound(format!("No snapshot {} for {}", version, dataset))
            })?;

        let path = self.artifact_path(dataset, &relative)?;
        let declared = manifest.hash_for(version).map(String::from);
        let payload = match read_json::<SnapshotFile>(&path).await? {
            SnapshotFile::Payload(mut payload) => {
                if payload.snapshot_hash.is_none() {
                    payload.snapshot_hash = declared;
                }
                payload
            }
            SnapshotFile::Records(records) => SnapshotPayload {
                version: version.to_string(),
                snapshot_hash: declared,
                records,
            },
        };
        Ok(payload)
    }

    /// Resolve a manifest-relative path, refusing anything outside the dataset
    fn artifact_path(&self, dataset: &str, relative: &str) -> Result<PathBuf> {
        let relative = Path::new(relative);
        if !relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(SyncError::InvalidInput(format!(
                "Artifact path escapes the data root: {}",
                relative.display()
            )));
        }
        Ok(self.root.join(dataset).join(relative))
    }
}

fn io_error(err: std::io::Error, path: &Path) -> SyncError {
    if err.kind() == ErrorKind::NotFound {
        SyncError::NotFound(format!("{} not found", path.display()))
    } else {
        SyncError::Io(err)
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = tokio::fs::read(path).await.map_err(|e| io_error(e, path))?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &Path, relative: &str, value: serde_json::Value) {
        let path = dir.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, serde_json::to_vec_pretty(&value).unwrap()).unwrap();
    }

    fn fixture() -> TempDir {
        let dir = TempDir::new().unwrap();
        let ds = dir.path().join("default_cards");
        write(
            &ds,
            "manifest.json",
            serde_json::json!({
                "dataset": "default_cards",
                "latestVersion": "v250102",
                "latestHash": "h2",
                "versions": [
                    {"version": "v250101", "snapshot": "snapshots/v250101.json", "snapshotHash": "h1"},
                    {"version": "v250102", "snapshot": "snapshots/v250102.json", "snapshotHash": "h2",
                     "patchFromPrevious": "patches/v250101_to_v250102.json"}
                ]
            }),
        );
        write(
            &ds,
            "snapshots/v250101.json",
            serde_json::json!([{"scryfallId": "a", "name": "A", "marketPrice": 1.0}]),
        );
        write(
            &ds,
            "patches/v250101_to_v250102.json",
            serde_json::json!({
                "fromVersion": "v250101",
                "toVersion": "v250102",
                "added": [{"scryfallId": "b", "name": "B", "marketPrice": 2.0}]
            }),
        );
        dir
    }

    #[tokio::test]
    async fn test_manifest_and_artifacts() {
        let dir = fixture();
        let root = DataRoot::new(dir.path());

        let manifest = root.manifest("default_cards").await.unwrap();
        assert_eq!(manifest.latest_version, "v250102");
        let again = root.manifest("default_cards").await.unwrap();
        assert!(Arc::ptr_eq(&manifest, &again));

        let patch = root.patch("default_cards", "v250101", "v250102").await.unwrap();
        assert_eq!(patch.added.len(), 1);

        let snapshot = root.snapshot("default_cards", "v250101").await.unwrap();
        assert_eq!(snapshot.records.len(), 1);
        assert_eq!(snapshot.snapshot_hash.as_deref(), Some("h1"));
    }

    #[tokio::test]
    async fn test_missing_artifacts_are_not_found() {
        let dir = fixture();
        let root = DataRoot::new(dir.path());

        assert!(matches!(
            root.patch("default_cards", "v250101", "v250109").await,
            Err(SyncError::NotFound(_))
        ));
        // Listed, but the file was never published
        assert!(matches!(
            root.snapshot("default_cards", "v250102").await,
            Err(SyncError::NotFound(_))
        ));
        assert!(matches!(
            root.manifest("unknown").await,
            Err(SyncError::NotFound(_))
        ));
    }

    #[test]
    fn test_artifact_path_guard() {
        let root = DataRoot::new("/data");
        assert!(root.artifact_path("d", "patches/x.json").is_ok());
        assert!(root.artifact_path("d", "../other/x.json").is_err());
        assert!(root.artifact_path("d", "/etc/passwd").is_err());
    }
}
