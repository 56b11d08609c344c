//! Shared helpers for integration tests: a deterministic published lineage
//! and an in-memory artifact source with fault injection.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;

use catalog_sync::error::{Result, SyncError};
use catalog_sync::storage::catalog::state_hash;
use catalog_sync::sync::ArtifactSource;
use catalog_sync::types::{
    CatalogRecord, CompactedPatchEntry, Manifest, ManifestVersion, PatchPayload, SnapshotPayload,
    SyncPolicy, VersionLabel,
};

pub const DATASET: &str = "default_cards";

/// Version label `offset` days after 2025-01-01
pub fn label(offset: usize) -> String {
    let base = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
    VersionLabel::from_date(base + chrono::Duration::days(offset as i64)).to_string()
}

pub fn record(id: &str, price: f64) -> CatalogRecord {
    CatalogRecord {
        id: id.to_string(),
        name: format!("Card {}", id),
        set_code: if id.starts_with('n') { "m21" } else { "lea" }.to_string(),
        collector_number: id.trim_start_matches(|c: char| c.is_alphabetic()).to_string(),
        image_url: Some(format!("https://img.example/{}.jpg", id)),
        market_price: price,
        low_price: Some(price * 0.8),
        mid_price: None,
        high_price: Some(price * 1.5),
        updated_at: "2025-01-01".to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct PublishedVersion {
    pub label: String,
    pub records: Vec<CatalogRecord>,
    pub hash: String,
}

/// A producer's version history
#[derive(Debug, Clone)]
pub struct Lineage {
    pub dataset: String,
    pub versions: Vec<PublishedVersion>,
    pub policy: SyncPolicy,
    /// (from index, to index) pairs with a compacted patch
    pub compacted: Vec<(usize, usize)>,
}

impl Lineage {
    /// `count` daily versions; each one reprices a row, adds a row, and
    /// every third version removes a row
    pub fn generate(count: usize) -> Self {
        let mut current: BTreeMap<String, CatalogRecord> = (0..20)
            .map(|i| {
                let r = record(&format!("r{:03}", i), 1.0 + i as f64);
                (r.id.clone(), r)
            })
            .collect();

        let mut versions = Vec::with_capacity(count);
        for v in 0..count {
            if v > 0 {
                if let Some(r) = current.get_mut(&format!("r{:03}", v % 20)) {
                    r.market_price += 0.25;
                    r.updated_at = label(v);
                }
                let added = record(&format!("n{:03}", v), 0.5 * v as f64);
                current.insert(added.id.clone(), added);
                if v % 3 == 0 {
                    current.remove(&format!("r{:03}", 19 - (v / 3) % 20));
                }
            }
            let records: Vec<CatalogRecord> = current.values().cloned().collect();
            versions.push(PublishedVersion {
                label: label(v),
                hash: state_hash(DATASET, &records),
                records,
            });
        }

        Self {
            dataset: DATASET.to_string(),
            versions,
            policy: SyncPolicy::default(),
            compacted: Vec::new(),
        }
    }

    pub fn with_compacted(mut self, from: usize, to: usize) -> Self {
        self.compacted.push((from, to));
        self
    }

    pub fn with_compacted_threshold(mut self, threshold: u32) -> Self {
        self.policy.compacted_threshold_missed = threshold;
        self
    }

    pub fn index_of(&self, version: &str) -> Option<usize> {
        self.versions.iter().position(|v| v.label == version)
    }

    /// Manifest as published when `latest` was the newest version
    pub fn manifest(&self, latest: usize) -> Manifest {
        let versions = self.versions[..=latest]
            .iter()
            .enumerate()
            .map(|(i, v)| ManifestVersion {
                version: v.label.clone(),
                snapshot: Some(format!("snapshots/{}.json", v.label)),
                snapshot_hash: Some(v.hash.clone()),
                row_count: Some(v.records.len() as i64),
                patch_from_previous: (i > 0)
                    .then(|| format!("patches/{}_to_{}.json", self.versions[i - 1].label, v.label)),
                patch_hash: None,
                created_at: None,
            })
            .collect();

        let compacted_patches = self
            .compacted
            .iter()
            .filter(|(_, to)| *to == latest)
            .map(|(from, to)| CompactedPatchEntry {
                from_version: self.versions[*from].label.clone(),
                to_version: self.versions[*to].label.clone(),
                path: Some(format!(
                    "compacted/{}_to_{}.json",
                    self.versions[*from].label, self.versions[*to].label
                )),
                patch_hash: None,
                created_at: None,
            })
            .collect();

        let head = &self.versions[latest];
        Manifest {
            dataset: self.dataset.clone(),
            source_id: Some("test_source".to_string()),
            latest_version: head.label.clone(),
            latest_snapshot: Some(format!("snapshots/{}.json", head.label)),
            latest_hash: head.hash.clone(),
            generated_at: None,
            sync_policy: self.policy.clone(),
            versions,
            compacted_patches,
        }
    }

    /// Delta between two published versions
    pub fn diff(&self, from: usize, to: usize) -> PatchPayload {
        let old: BTreeMap<&str, &CatalogRecord> = self.versions[from]
            .records
            .iter()
            .map(|r| (r.id.as_str(), r))
            .collect();
        let new: BTreeMap<&str, &CatalogRecord> = self.versions[to]
            .records
            .iter()
            .map(|r| (r.id.as_str(), r))
            .collect();

        let mut added = Vec::new();
        let mut updated = Vec::new();
        for (id, record) in &new {
            match old.get(id) {
                None => added.push((*record).clone()),
                Some(prev) if prev != record => updated.push((*record).clone()),
                Some(_) => {}
            }
        }
        let removed = old
            .keys()
            .filter(|id| !new.contains_key(*id))
            .map(|id| id.to_string())
            .collect();

        PatchPayload {
            from_version: self.versions[from].label.clone(),
            to_version: self.versions[to].label.clone(),
            added,
            updated,
            removed,
            patch_hash: Some(format!("patch-{}-{}", from, to)),
        }
    }

    pub fn snapshot(&self, idx: usize) -> SnapshotPayload {
        SnapshotPayload {
            version: self.versions[idx].label.clone(),
            snapshot_hash: Some(self.versions[idx].hash.clone()),
            records: self.versions[idx].records.clone(),
        }
    }

    /// Write `<root>/<dataset>/...` as published when `latest` was newest
    pub fn write_data_root(&self, root: &Path, latest: usize) {
        let dir = root.join(&self.dataset);
        let write = |relative: String, value: serde_json::Value| {
            let path = dir.join(relative);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, serde_json::to_vec(&value).unwrap()).unwrap();
        };

        write(
            "manifest.json".to_string(),
            serde_json::to_value(self.manifest(latest)).unwrap(),
        );
        for i in 0..=latest {
            let label = &self.versions[i].label;
            // Bare record arrays, the way the producer publishes snapshots
            write(
                format!("snapshots/{}.json", label),
                serde_json::to_value(&self.versions[i].records).unwrap(),
            );
            if i > 0 {
                write(
                    format!("patches/{}_to_{}.json", self.versions[i - 1].label, label),
                    serde_json::to_value(self.diff(i - 1, i)).unwrap(),
                );
            }
        }
        for (from, to) in self.compacted.iter().filter(|(_, to)| *to == latest) {
            write(
                format!(
                    "compacted/{}_to_{}.json",
                    self.versions[*from].label, self.versions[*to].label
                ),
                serde_json::to_value(self.diff(*from, *to)).unwrap(),
            );
        }
    }
}

type PatchHook = Box<dyn Fn(usize) + Send + Sync>;

/// In-memory source over a lineage, with knobs for failure scenarios
pub struct FakeSource {
    lineage: Lineage,
    latest: AtomicUsize,
    pub manifest_delay: Mutex<Duration>,
    pub manifest_calls: AtomicUsize,
    pub patch_calls: AtomicUsize,
    pub snapshot_calls: AtomicUsize,
    /// Manifest fetches that fail with a network error before succeeding
    pub network_failures: AtomicUsize,
    /// Patch to this version carries an extra row (hash mismatch)
    pub corrupt_patch_to: Mutex<Option<String>>,
    /// Patch to this version ends with an invalid row (apply error)
    pub invalid_patch_to: Mutex<Option<String>>,
    patch_hook: Mutex<Option<PatchHook>>,
}

impl FakeSource {
    pub fn new(lineage: Lineage, latest: usize) -> Arc<Self> {
        Arc::new(Self {
            lineage,
            latest: AtomicUsize::new(latest),
            manifest_delay: Mutex::new(Duration::ZERO),
            manifest_calls: AtomicUsize::new(0),
            patch_calls: AtomicUsize::new(0),
            snapshot_calls: AtomicUsize::new(0),
            network_failures: AtomicUsize::new(0),
            corrupt_patch_to: Mutex::new(None),
            invalid_patch_to: Mutex::new(None),
            patch_hook: Mutex::new(None),
        })
    }

    pub fn lineage(&self) -> &Lineage {
        &self.lineage
    }

    /// Publish up to (and including) version index `latest`
    pub fn publish(&self, latest: usize) {
        self.latest.store(latest, Ordering::SeqCst);
    }

    /// Called with the 1-based count of patch fetches so far
    pub fn on_patch(&self, hook: impl Fn(usize) + Send + Sync + 'static) {
        *self.patch_hook.lock() = Some(Box::new(hook));
    }

    fn index(&self, version: &str) -> Result<usize> {
        self.lineage
            .index_of(version)
            .filter(|&i| i <= self.latest.load(Ordering::SeqCst))
            .ok_or_else(|| SyncError::NotFound(format!("Unknown version {}", version)))
    }
}

#[async_trait]
impl ArtifactSource for FakeSource {
    async fn fetch_manifest(&self, dataset: &str) -> Result<Manifest> {
        self.manifest_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.manifest_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self
            .network_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SyncError::Network("connection reset".to_string()));
        }
        if dataset != self.lineage.dataset {
            return Err(SyncError::NotFound(format!("Unknown dataset {}", dataset)));
        }
        Ok(self.lineage.manifest(self.latest.load(Ordering::SeqCst)))
    }

    async fn fetch_patch(&self, _dataset: &str, from: &str, to: &str) -> Result<PatchPayload> {
        let calls = self.patch_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(hook) = self.patch_hook.lock().as_ref() {
            hook(calls);
        }

        let from_idx = self.index(from)?;
        let to_idx = self.index(to)?;
        let published = to_idx == from_idx + 1 || self.lineage.compacted.contains(&(from_idx, to_idx));
        if !published {
            return Err(SyncError::NotFound(format!("No patch {} -> {}", from, to)));
        }

        let mut patch = self.lineage.diff(from_idx, to_idx);
        if self.corrupt_patch_to.lock().as_deref() == Some(to) {
            patch.added.push(record("bogus", 9.99));
        }
        if self.invalid_patch_to.lock().as_deref() == Some(to) {
            let mut bad = record("r000", 1.0);
            bad.market_price = f64::NAN;
            patch.updated.push(bad);
        }
        Ok(patch)
    }

    async fn fetch_snapshot(&self, _dataset: &str, version: &str) -> Result<SnapshotPayload> {
        self.snapshot_calls.fetch_add(1, Ordering::SeqCst);
        let idx = self.index(version)?;
        Ok(self.lineage.snapshot(idx))
    }
}
