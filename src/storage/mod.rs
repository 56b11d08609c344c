//! Storage engine for the local catalog replica
//!
//! Handles SQLite connection setup, schema migrations, the catalog tables,
//! and the sync state tables.

pub mod catalog;
mod connection;
mod migrations;
pub mod sync_state;

pub use catalog::{CatalogStore, SetSummary};
pub use connection::Storage;
pub use migrations::{current_schema_version, SCHEMA_VERSION};
pub use sync_state::{HistoryRecord, RunMarker, SyncStateStore};
