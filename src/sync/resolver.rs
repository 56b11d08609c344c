//! Strategy resolution
//!
//! Pure decision over the local state and a fetched manifest. No I/O happens
//! here, so the policy is testable in isolation.
//!
//! | Condition                                              | Strategy  |
//! |--------------------------------------------------------|-----------|
//! | at latest version with the latest hash                 | noop      |
//! | forced, never synced, unknown version, or hash drift   | full      |
//! | missed < compacted threshold, every patch published    | chain     |
//! | compacted ≤ missed < full threshold, exact entry found | compacted |
//! | missed ≥ full threshold, or any fallback               | full      |

use serde::{Deserialize, Serialize};

use crate::types::{ClientSyncState, Manifest, Strategy};

/// Local side of the resolution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalVersion {
    pub version: Option<String>,
    pub state_hash: Option<String>,
}

impl LocalVersion {
    pub fn new(version: impl Into<String>, state_hash: impl Into<String>) -> Self {
        Self {
            version: Some(version.into()),
            state_hash: Some(state_hash.into()),
        }
    }
}

impl From<Option<&ClientSyncState>> for LocalVersion {
    fn from(state: Option<&ClientSyncState>) -> Self {
        match state {
            Some(s) => Self {
                version: s.current_version.clone(),
                state_hash: s.state_hash.clone(),
            },
            None => Self::default(),
        }
    }
}

/// Artifact a plan step needs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ArtifactRef {
    Patch { from: String, to: String },
    Snapshot { version: String },
}

/// One fetch + apply unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    pub artifact: ArtifactRef,
    /// Version the local state must be at before this step (None for snapshots)
    pub from_version: Option<String>,
    pub to_version: String,
    /// State hash the catalog must have once this step is applied
    pub expected_hash: String,
}

/// Why a strategy was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanReason {
    UpToDate,
    NeverSynced,
    MissingLocalHash,
    ForcedFull,
    HashDrift,
    UnknownVersion,
    AheadOfManifest,
    WithinChainWindow,
    ChainIncomplete,
    CompactedAvailable,
    NoCompactedCoverage,
    TooFarBehind,
}

impl PlanReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanReason::UpToDate => "up_to_date",
            PlanReason::NeverSynced => "never_synced",
            PlanReason::MissingLocalHash => "missing_local_hash",
            PlanReason::ForcedFull => "forced_full",
            PlanReason::HashDrift => "hash_drift",
            PlanReason::UnknownVersion => "unknown_version",
            PlanReason::AheadOfManifest => "ahead_of_manifest",
            PlanReason::WithinChainWindow => "within_chain_window",
            PlanReason::ChainIncomplete => "chain_incomplete",
            PlanReason::CompactedAvailable => "compacted_available",
            PlanReason::NoCompactedCoverage => "no_compacted_coverage",
            PlanReason::TooFarBehind => "too_far_behind",
        }
    }
}

/// Resolved strategy and the ordered artifacts that realize it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPlan {
    pub strategy: Strategy,
    pub reason: PlanReason,
    /// Versions behind latest, when the current version is listed
    pub missed: Option<u32>,
    pub current_version: Option<String>,
    pub target_version: String,
    pub target_hash: String,
    pub steps: Vec<PlanStep>,
}

impl SyncPlan {
    pub fn is_noop(&self) -> bool {
        self.strategy == Strategy::Noop
    }
}

/// Versions between `current` and the manifest's latest, if both are listed
pub fn missed_versions(manifest: &Manifest, current: &str) -> Option<u32> {
    let sorted = manifest.sorted_versions();
    let current_idx = sorted.iter().position(|v| v.version == current)?;
    let latest_idx = sorted
        .iter()
        .position(|v| v.version == manifest.latest_version)?;
    latest_idx
        .checked_sub(current_idx)
        .and_then(|n| u32::try_from(n).ok())
}

/// Choose how the local replica catches up to the manifest's latest version
pub fn resolve_strategy(local: &LocalVersion, manifest: &Manifest, force_full: bool) -> SyncPlan {
    let Some(current) = local.version.as_deref() else {
        return full_plan(local, manifest, PlanReason::NeverSynced, None);
    };

    if current == manifest.latest_version
        && local.state_hash.as_deref() == Some(manifest.latest_hash.as_str())
    {
        return SyncPlan {
            strategy: Strategy::Noop,
            reason: PlanReason::UpToDate,
            missed: Some(0),
            current_version: Some(current.to_string()),
            target_version: manifest.latest_version.clone(),
            target_hash: manifest.latest_hash.clone(),
            steps: Vec::new(),
        };
    }

    let missed = missed_versions(manifest, current);

    if force_full {
        return full_plan(local, manifest, PlanReason::ForcedFull, missed);
    }

    let Some(local_hash) = local.state_hash.as_deref() else {
        return full_plan(local, manifest, PlanReason::MissingLocalHash, missed);
    };

    if let Some(declared) = manifest.hash_for(current) {
        if declared != local_hash {
            return full_plan(local, manifest, PlanReason::HashDrift, missed);
        }
    }

    let sorted = manifest.sorted_versions();
    let Some(current_idx) = sorted.iter().position(|v| v.version == current) else {
        return full_plan(local, manifest, PlanReason::UnknownVersion, None);
    };
    let Some(latest_idx) = sorted
        .iter()
        .position(|v| v.version == manifest.latest_version)
    else {
        return full_plan(local, manifest, PlanReason::UnknownVersion, None);
    };
    if current_idx >= latest_idx {
        // At latest with a matching hash is handled above
        let reason = if current_idx == latest_idx {
            PlanReason::HashDrift
        } else {
            PlanReason::AheadOfManifest
        };
        return full_plan(local, manifest, reason, missed);
    }

    let behind = u32::try_from(latest_idx - current_idx).unwrap_or(u32::MAX);
    let policy = &manifest.sync_policy;

    if behind >= policy.force_full_threshold_missed {
        return full_plan(local, manifest, PlanReason::TooFarBehind, Some(behind));
    }

    if behind >= policy.compacted_threshold_missed {
        let entry = manifest
            .compacted_patches
            .iter()
            .find(|c| c.from_version == current && c.to_version == manifest.latest_version);
        return match entry {
            Some(entry) => SyncPlan {
                strategy: Strategy::Compacted,
                reason: PlanReason::CompactedAvailable,
                missed: Some(behind),
                current_version: Some(current.to_string()),
                target_version: manifest.latest_version.clone(),
                target_hash: manifest.latest_hash.clone(),
                steps: vec![PlanStep {
                    artifact: ArtifactRef::Patch {
                        from: entry.from_version.clone(),
                        to: entry.to_version.clone(),
                    },
                    from_version: Some(current.to_string()),
                    to_version: manifest.latest_version.clone(),
                    expected_hash: manifest.latest_hash.clone(),
                }],
            },
            None => full_plan(local, manifest, PlanReason::NoCompactedCoverage, Some(behind)),
        };
    }

    let mut steps = Vec::with_capacity(behind as usize);
    let mut previous = current;
    for entry in &sorted[current_idx + 1..=latest_idx] {
        let expected = manifest.hash_for(&entry.version);
        match (entry.patch_from_previous.as_ref(), expected) {
            (Some(_), Some(expected)) => {
                steps.push(PlanStep {
                    artifact: ArtifactRef::Patch {
                        from: previous.to_string(),
                        to: entry.version.clone(),
                    },
                    from_version: Some(previous.to_string()),
                    to_version: entry.version.clone(),
                    expected_hash: expected.to_string(),
                });
                previous = &entry.version;
            }
            _ => {
                return full_plan(local, manifest, PlanReason::ChainIncomplete, Some(behind));
            }
        }
    }

    SyncPlan {
        strategy: Strategy::Chain,
        reason: PlanReason::WithinChainWindow,
        missed: Some(behind),
        current_version: Some(current.to_string()),
        target_version: manifest.latest_version.clone(),
        target_hash: manifest.latest_hash.clone(),
        steps,
    }
}

fn full_plan(
    local: &LocalVersion,
    manifest: &Manifest,
    reason: PlanReason,
    missed: Option<u32>,
) -> SyncPlan {
    SyncPlan {
        strategy: Strategy::Full,
        reason,
        missed,
        current_version: local.version.clone(),
        target_version: manifest.latest_version.clone(),
        target_hash: manifest.latest_hash.clone(),
        steps: vec![PlanStep {
            artifact: ArtifactRef::Snapshot {
                version: manifest.latest_version.clone(),
            },
            from_version: None,
            to_version: manifest.latest_version.clone(),
            expected_hash: manifest.latest_hash.clone(),
        }],
    }
}
