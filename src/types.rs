//! Core types for the catalog sync engine

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Dataset synced when none is named
pub const DEFAULT_DATASET: &str = "default_cards";

/// Client identity used for the local replica
pub const DEFAULT_CLIENT_ID: &str = "local-desktop";

/// Source id recorded when a manifest does not name one
pub const DEFAULT_SOURCE_ID: &str = "scryfall_default_cards";

/// Maximum length of a dataset name
pub const MAX_DATASET_LENGTH: usize = 64;

// =============================================================================
// Dataset names
// =============================================================================

/// Dataset name validation error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatasetError {
    Empty,
    TooLong,
    InvalidChars,
}

impl fmt::Display for DatasetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatasetError::Empty => write!(f, "Dataset name cannot be empty"),
            DatasetError::TooLong => {
                write!(f, "Dataset name exceeds {} characters", MAX_DATASET_LENGTH)
            }
            DatasetError::InvalidChars => write!(
                f,
                "Dataset name can only contain lowercase letters, numbers, hyphens, and underscores"
            ),
        }
    }
}

impl std::error::Error for DatasetError {}

/// Normalize and validate a dataset name
///
/// Trims and lowercases the input. Names are used as path segments on the
/// artifact endpoints and as keys in the state tables, so only
/// `[a-z0-9_-]` is accepted.
pub fn normalize_dataset(s: &str) -> Result<String, DatasetError> {
    let normalized = s.trim().to_lowercase();

    if normalized.is_empty() {
        return Err(DatasetError::Empty);
    }

    if normalized.len() > MAX_DATASET_LENGTH {
        return Err(DatasetError::TooLong);
    }

    if !normalized
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
    {
        return Err(DatasetError::InvalidChars);
    }

    Ok(normalized)
}

// =============================================================================
// Version labels
// =============================================================================

/// Date-stamped dataset version label: `v` + `YYMMDD`
///
/// Lexical order equals chronological order, so labels compare as strings.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VersionLabel(String);

impl VersionLabel {
    /// Parse and validate a label
    pub fn parse(s: &str) -> Result<Self, String> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_prefix('v')
            .ok_or_else(|| format!("Version label must start with 'v': {}", s))?;
        if digits.len() != 6 || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(format!("Version label must be v + YYMMDD: {}", s));
        }
        NaiveDate::parse_from_str(digits, "%y%m%d")
            .map_err(|_| format!("Version label is not a calendar date: {}", s))?;
        Ok(Self(trimmed.to_string()))
    }

    /// Label for a calendar date
    pub fn from_date(date: NaiveDate) -> Self {
        Self(format!("v{}", date.format("%y%m%d")))
    }

    /// Calendar date encoded in the label
    pub fn to_date(&self) -> NaiveDate {
        // Validated on construction
        NaiveDate::parse_from_str(&self.0[1..], "%y%m%d").unwrap_or_default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VersionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for VersionLabel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for VersionLabel {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<VersionLabel> for String {
    fn from(value: VersionLabel) -> Self {
        value.0
    }
}

// =============================================================================
// Catalog records
// =============================================================================

/// One keyed row of a catalog dataset (card metadata + prices)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogRecord {
    #[serde(rename = "scryfallId", alias = "id")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub set_code: String,
    #[serde(default)]
    pub collector_number: String,
    #[serde(default)]
    pub image_url: Option<String>,
    pub market_price: f64,
    #[serde(default)]
    pub low_price: Option<f64>,
    #[serde(default)]
    pub mid_price: Option<f64>,
    #[serde(default)]
    pub high_price: Option<f64>,
    #[serde(default)]
    pub updated_at: String,
}

impl CatalogRecord {
    /// Normalize keys the way they are stored locally
    pub fn normalized(&self) -> Self {
        Self {
            id: normalize_record_id(&self.id),
            name: self.name.trim().to_string(),
            set_code: self.set_code.trim().to_lowercase(),
            collector_number: self.collector_number.trim().to_string(),
            image_url: self
                .image_url
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from),
            market_price: canonical_price(self.market_price),
            low_price: self.low_price.map(canonical_price),
            mid_price: self.mid_price.map(canonical_price),
            high_price: self.high_price.map(canonical_price),
            updated_at: self.updated_at.trim().to_string(),
        }
    }

    /// Reject rows that must never reach the catalog tables
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("Catalog row has empty scryfallId".to_string());
        }
        for (label, price) in [
            ("marketPrice", Some(self.market_price)),
            ("lowPrice", self.low_price),
            ("midPrice", self.mid_price),
            ("highPrice", self.high_price),
        ] {
            if let Some(value) = price {
                if !value.is_finite() || value < 0.0 {
                    return Err(format!(
                        "Catalog row {} has invalid {}: {}",
                        self.id, label, value
                    ));
                }
            }
        }
        Ok(())
    }

    /// Canonical line fed into the dataset state hash
    pub fn hash_line(&self) -> String {
        fn price(value: Option<f64>) -> String {
            value.map(|v| format!("{:.6}", v)).unwrap_or_default()
        }

        format!(
            "{}|{}|{}|{}|{}|{:.6}|{}|{}|{}|{}\n",
            self.id,
            self.name,
            self.set_code,
            self.collector_number,
            self.image_url.as_deref().unwrap_or(""),
            self.market_price,
            price(self.low_price),
            price(self.mid_price),
            price(self.high_price),
            self.updated_at
        )
    }
}

/// SQLite stores REAL -0.0 as 0, so negative zero is folded before hashing
fn canonical_price(value: f64) -> f64 {
    value + 0.0
}

/// Normalize a record identifier (trim + lowercase)
pub fn normalize_record_id(id: &str) -> String {
    id.trim().to_lowercase()
}

// =============================================================================
// Manifest & artifacts (wire format)
// =============================================================================

/// Thresholds the producer publishes alongside the manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPolicy {
    #[serde(default = "default_compacted_threshold")]
    pub compacted_threshold_missed: u32,
    #[serde(default = "default_force_full_threshold")]
    pub force_full_threshold_missed: u32,
    #[serde(default)]
    pub compacted_retention_days: Option<u32>,
    #[serde(default)]
    pub expected_publish_time_utc: Option<String>,
    #[serde(default)]
    pub refresh_unlock_lag_minutes: Option<u32>,
}

fn default_compacted_threshold() -> u32 {
    5
}

fn default_force_full_threshold() -> u32 {
    21
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            compacted_threshold_missed: default_compacted_threshold(),
            force_full_threshold_missed: default_force_full_threshold(),
            compacted_retention_days: None,
            expected_publish_time_utc: None,
            refresh_unlock_lag_minutes: None,
        }
    }
}

/// One published version listed in the manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestVersion {
    pub version: String,
    #[serde(default)]
    pub snapshot: Option<String>,
    #[serde(default)]
    pub snapshot_hash: Option<String>,
    #[serde(default)]
    pub row_count: Option<i64>,
    /// Artifact path of the incremental patch from the previous version
    #[serde(default)]
    pub patch_from_previous: Option<String>,
    #[serde(default)]
    pub patch_hash: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

/// A compacted patch spanning several versions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactedPatchEntry {
    pub from_version: String,
    pub to_version: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub patch_hash: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

/// Remote descriptor of the latest dataset version and available artifacts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default = "default_dataset")]
    pub dataset: String,
    #[serde(default)]
    pub source_id: Option<String>,
    pub latest_version: String,
    #[serde(default)]
    pub latest_snapshot: Option<String>,
    pub latest_hash: String,
    #[serde(default)]
    pub generated_at: Option<String>,
    #[serde(default)]
    pub sync_policy: SyncPolicy,
    #[serde(default)]
    pub versions: Vec<ManifestVersion>,
    #[serde(default)]
    pub compacted_patches: Vec<CompactedPatchEntry>,
}

fn default_dataset() -> String {
    DEFAULT_DATASET.to_string()
}

impl Manifest {
    /// Versions in ascending label order
    pub fn sorted_versions(&self) -> Vec<&ManifestVersion> {
        let mut versions: Vec<&ManifestVersion> = self.versions.iter().collect();
        versions.sort_by(|a, b| a.version.to_lowercase().cmp(&b.version.to_lowercase()));
        versions
    }

    /// Entry for a given version label
    pub fn version_entry(&self, version: &str) -> Option<&ManifestVersion> {
        self.versions.iter().find(|v| v.version == version)
    }

    /// State hash the manifest declares for a version
    pub fn hash_for(&self, version: &str) -> Option<&str> {
        if version == self.latest_version {
            return Some(self.latest_hash.as_str());
        }
        self.version_entry(version)
            .and_then(|v| v.snapshot_hash.as_deref())
    }

    /// Check structural consistency of a fetched manifest
    pub fn validate(&self) -> Result<(), String> {
        VersionLabel::parse(&self.latest_version)?;
        for entry in &self.versions {
            VersionLabel::parse(&entry.version)?;
        }
        if self.latest_hash.trim().is_empty() {
            return Err("Manifest has empty latestHash".to_string());
        }
        if !self.versions.is_empty() && self.version_entry(&self.latest_version).is_none() {
            return Err(format!(
                "Manifest latestVersion {} is not listed in versions",
                self.latest_version
            ));
        }
        Ok(())
    }

    pub fn source_id(&self) -> &str {
        self.source_id.as_deref().unwrap_or(DEFAULT_SOURCE_ID)
    }
}

/// Delta between two versions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchPayload {
    pub from_version: String,
    pub to_version: String,
    #[serde(default)]
    pub added: Vec<CatalogRecord>,
    #[serde(default)]
    pub updated: Vec<CatalogRecord>,
    #[serde(default)]
    pub removed: Vec<String>,
    #[serde(default)]
    pub patch_hash: Option<String>,
}

/// Complete dataset content for one version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotPayload {
    pub version: String,
    #[serde(default)]
    pub snapshot_hash: Option<String>,
    #[serde(default)]
    pub records: Vec<CatalogRecord>,
}

// =============================================================================
// Strategies & history
// =============================================================================

/// How a stale client catches up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Noop,
    Chain,
    Compacted,
    Full,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Noop => "noop",
            Strategy::Chain => "chain",
            Strategy::Compacted => "compacted",
            Strategy::Full => "full",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "noop" => Ok(Strategy::Noop),
            "chain" => Ok(Strategy::Chain),
            "compacted" => Ok(Strategy::Compacted),
            "full" => Ok(Strategy::Full),
            _ => Err(format!("Unknown strategy: {}", s)),
        }
    }
}

/// Result recorded for an apply attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplyOutcome {
    Success,
    Error,
    Canceled,
}

impl ApplyOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplyOutcome::Success => "success",
            ApplyOutcome::Error => "error",
            ApplyOutcome::Canceled => "canceled",
        }
    }
}

impl FromStr for ApplyOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(ApplyOutcome::Success),
            "error" => Ok(ApplyOutcome::Error),
            "canceled" => Ok(ApplyOutcome::Canceled),
            _ => Err(format!("Unknown apply outcome: {}", s)),
        }
    }
}

/// What the local replica currently reflects for one (client, dataset)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientSyncState {
    pub client_id: String,
    pub dataset: String,
    pub current_version: Option<String>,
    pub state_hash: Option<String>,
    pub synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One row of the append-only apply ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyHistoryEntry {
    pub id: i64,
    pub client_id: String,
    pub dataset: String,
    pub from_version: Option<String>,
    pub to_version: Option<String>,
    pub strategy: Option<Strategy>,
    pub duration_ms: i64,
    pub result: ApplyOutcome,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub patch_hash: Option<String>,
    pub added_count: i64,
    pub updated_count: i64,
    pub removed_count: i64,
    pub applied_at: DateTime<Utc>,
}

/// Published dataset state known to have been applied locally
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetVersion {
    pub source_id: String,
    pub dataset: String,
    pub version: String,
    pub state_hash: String,
    pub record_count: i64,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Configuration
// =============================================================================

/// SQLite storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to SQLite database
    pub db_path: String,
    /// Storage mode (local or cloud-safe)
    #[serde(default)]
    pub storage_mode: StorageMode,
}

impl StorageConfig {
    /// `<data_local_dir>/catalog-sync/catalog.db`, falling back to the
    /// working directory when the platform has no data dir
    pub fn default_db_path() -> String {
        dirs::data_local_dir()
            .map(|dir| dir.join("catalog-sync").join("catalog.db"))
            .unwrap_or_else(|| std::path::PathBuf::from("catalog.db"))
            .to_string_lossy()
            .into_owned()
    }
}

/// Journal mode selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageMode {
    #[default]
    Local,
    CloudSafe,
}

impl FromStr for StorageMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" | "wal" => Ok(StorageMode::Local),
            "cloud-safe" | "cloud_safe" => Ok(StorageMode::CloudSafe),
            _ => Err(format!("Unknown storage mode: {}", s)),
        }
    }
}

/// Sync engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Base URL of the artifact endpoints
    pub base_url: String,
    /// Client identity for the state rows
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Per-request timeout
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    /// Attempts per run before giving up on retryable errors
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay of the exponential retry backoff
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
    /// A run non-terminal for longer than this is reported as stuck
    #[serde(default = "default_stuck_timeout")]
    pub stuck_timeout_secs: u64,
    /// Rows written between apply progress checkpoints
    #[serde(default = "default_apply_batch_size")]
    pub apply_batch_size: usize,
}

fn default_client_id() -> String {
    DEFAULT_CLIENT_ID.to_string()
}

fn default_request_timeout() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_backoff() -> u64 {
    500
}

fn default_stuck_timeout() -> u64 {
    900
}

fn default_apply_batch_size() -> usize {
    500
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8787".to_string(),
            client_id: default_client_id(),
            request_timeout_ms: default_request_timeout(),
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff(),
            stuck_timeout_secs: default_stuck_timeout(),
            apply_batch_size: default_apply_batch_size(),
        }
    }
}
