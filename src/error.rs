//! Error types for the catalog sync engine

use thiserror::Error;

/// Result type alias for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Main error type for the sync engine
#[derive(Error, Debug)]
pub enum SyncError {
    /// Transport failure talking to the artifact endpoints
    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    /// Recomputed state hash did not match the hash declared for the target version
    #[error("Hash mismatch for {version}: expected {expected}, computed {actual}")]
    HashMismatch {
        version: String,
        expected: String,
        actual: String,
    },

    /// Local version did not match the artifact's base version inside the transaction
    #[error("Version conflict: local is {actual}, artifact expects {expected}")]
    VersionConflict { expected: String, actual: String },

    /// Unexpected failure while upserting/deleting catalog rows
    #[error("Apply error: {0}")]
    Apply(String),

    #[error("Sync canceled")]
    Canceled,

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Check if error is retryable within the same run
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Network(_)
                | SyncError::Http(_)
                | SyncError::VersionConflict { .. }
                | SyncError::HashMismatch { .. }
        )
    }

    /// Soft errors are reported to the user as a pending/retry state, not a failure
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            SyncError::Network(_) | SyncError::Http(_) | SyncError::Canceled
        )
    }

    /// Stable error kind persisted in the apply history
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Network(_) | SyncError::Http(_) => "network",
            SyncError::HashMismatch { .. } => "hash_mismatch",
            SyncError::VersionConflict { .. } => "version_conflict",
            SyncError::Apply(_) => "apply",
            SyncError::Canceled => "canceled",
            SyncError::Database(_) => "database",
            SyncError::Serialization(_) => "serialization",
            SyncError::Io(_) => "io",
            SyncError::Config(_) => "config",
            SyncError::InvalidInput(_) => "invalid_input",
            SyncError::NotFound(_) => "not_found",
            SyncError::Internal(_) => "internal",
        }
    }
}
