//! Catalog Sync - local catalog replica kept in step with a published dataset
//!
//! A local SQLite replica of a versioned catalog dataset (card metadata and
//! prices) is brought up to the latest published version by choosing between
//! incremental patches, a compacted patch, or a full snapshot, and applying
//! the chosen artifacts transactionally with hash verification.
//!
//! ```no_run
//! use catalog_sync::{Storage, SyncConfig, SyncCoordinator};
//!
//! # async fn example() -> catalog_sync::Result<()> {
//! let storage = Storage::open_in_memory()?;
//! let coordinator = SyncCoordinator::with_http(storage, SyncConfig::default())?;
//! let report = coordinator.run("default_cards").await?;
//! println!("{} -> {:?}", report.outcome, report.current_version);
//! # Ok(())
//! # }
//! ```

pub mod error;
#[cfg(feature = "server")]
pub mod server;
pub mod storage;
pub mod sync;
pub mod types;

pub use error::{Result, SyncError};
pub use storage::{CatalogStore, Storage, SyncStateStore};
pub use sync::{
    ArtifactSource, HttpArtifactSource, SyncCoordinator, SyncHandle, SyncOutcome, SyncPhase,
    SyncReport,
};
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
