//! Sync state store: client sync state, the apply ledger, and run markers
//!
//! `sync_client_state` is the single source of truth for which version the
//! local catalog reflects. Only the transactional applier writes it, always
//! inside the same transaction as the catalog rows it describes.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::Storage;
use crate::error::Result;
use crate::types::{
    ApplyHistoryEntry, ApplyOutcome, ClientSyncState, DatasetVersion, Strategy,
};

/// A history row about to be appended
#[derive(Debug, Clone, Default)]
pub struct HistoryRecord {
    pub dataset: String,
    pub from_version: Option<String>,
    pub to_version: Option<String>,
    pub strategy: Option<Strategy>,
    pub duration_ms: i64,
    pub result: Option<ApplyOutcome>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub patch_hash: Option<String>,
    pub added_count: i64,
    pub updated_count: i64,
    pub removed_count: i64,
}

/// Persisted marker of a non-terminal coordinator run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMarker {
    pub dataset: String,
    pub run_id: String,
    pub client_id: String,
    pub phase: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn parse_ts(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_opt_ts(value: Option<String>) -> Option<DateTime<Utc>> {
    value.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    })
}

pub fn load_state(
    conn: &Connection,
    client_id: &str,
    dataset: &str,
) -> Result<Option<ClientSyncState>> {
    let state = conn
        .query_row(
            "SELECT client_id, dataset_name, current_version, state_hash, synced_at, created_at, updated_at
             FROM sync_client_state
             WHERE client_id = ?1 AND dataset_name = ?2",
            params![client_id, dataset],
            |row| {
                let synced_at: Option<String> = row.get(4)?;
                let created_at: String = row.get(5)?;
                let updated_at: String = row.get(6)?;
                Ok(ClientSyncState {
                    client_id: row.get(0)?,
                    dataset: row.get(1)?,
                    current_version: row.get(2)?,
                    state_hash: row.get(3)?,
                    synced_at: parse_opt_ts(synced_at),
                    created_at: parse_ts(&created_at),
                    updated_at: parse_ts(&updated_at),
                })
            },
        )
        .optional()?;
    Ok(state)
}

/// Advance the client state to a committed version (applier only)
pub(crate) fn write_state(
    conn: &Connection,
    client_id: &str,
    dataset: &str,
    version: &str,
    state_hash: &str,
) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO sync_client_state
             (client_id, dataset_name, current_version, state_hash, synced_at, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?5, ?5)
         ON CONFLICT(client_id, dataset_name) DO UPDATE SET
             current_version = excluded.current_version,
             state_hash = excluded.state_hash,
             synced_at = excluded.synced_at,
             updated_at = excluded.updated_at",
        params![client_id, dataset, version, state_hash, now],
    )?;
    Ok(())
}

/// Record a version as applied locally
pub(crate) fn record_dataset_version(conn: &Connection, version: &DatasetVersion) -> Result<()> {
    conn.execute(
        "INSERT INTO sync_dataset_versions
             (dataset_name, version, source_id, state_hash, record_count, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(dataset_name, version) DO UPDATE SET
             source_id = excluded.source_id,
             state_hash = excluded.state_hash,
             record_count = excluded.record_count",
        params![
            version.dataset,
            version.version,
            version.source_id,
            version.state_hash,
            version.record_count,
            version.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub fn known_versions(conn: &Connection, dataset: &str) -> Result<Vec<DatasetVersion>> {
    let mut stmt = conn.prepare(
        "SELECT source_id, dataset_name, version, state_hash, record_count, created_at
         FROM sync_dataset_versions
         WHERE dataset_name = ?1
         ORDER BY version",
    )?;
    let rows = stmt
        .query_map(params![dataset], |row| {
            let created_at: String = row.get(5)?;
            Ok(DatasetVersion {
                source_id: row.get(0)?,
                dataset: row.get(1)?,
                version: row.get(2)?,
                state_hash: row.get(3)?,
                record_count: row.get(4)?,
                created_at: parse_ts(&created_at),
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Append one row to the apply ledger
pub fn append_history(conn: &Connection, client_id: &str, record: &HistoryRecord) -> Result<i64> {
    let result = record.result.unwrap_or(ApplyOutcome::Error);
    conn.execute(
        "INSERT INTO sync_apply_history (
             client_id, dataset_name, from_version, to_version, strategy, duration_ms,
             result, error_kind, error_message, patch_hash,
             added_count, updated_count, removed_count, applied_at
         )
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            client_id,
            record.dataset,
            record.from_version,
            record.to_version,
            record.strategy.map(|s| s.as_str()),
            record.duration_ms,
            result.as_str(),
            record.error_kind,
            record.error_message,
            record.patch_hash,
            record.added_count,
            record.updated_count,
            record.removed_count,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn row_to_history(row: &Row) -> rusqlite::Result<ApplyHistoryEntry> {
    let strategy: Option<String> = row.get("strategy")?;
    let result: String = row.get("result")?;
    let applied_at: String = row.get("applied_at")?;
    Ok(ApplyHistoryEntry {
        id: row.get("id")?,
        client_id: row.get("client_id")?,
        dataset: row.get("dataset_name")?,
        from_version: row.get("from_version")?,
        to_version: row.get("to_version")?,
        strategy: strategy.and_then(|s| s.parse().ok()),
        duration_ms: row.get("duration_ms")?,
        result: result.parse().unwrap_or(ApplyOutcome::Error),
        error_kind: row.get("error_kind")?,
        error_message: row.get("error_message")?,
        patch_hash: row.get("patch_hash")?,
        added_count: row.get("added_count")?,
        updated_count: row.get("updated_count")?,
        removed_count: row.get("removed_count")?,
        applied_at: parse_ts(&applied_at),
    })
}

/// Most recent history rows, newest first
pub fn history(
    conn: &Connection,
    client_id: &str,
    dataset: &str,
    limit: i64,
) -> Result<Vec<ApplyHistoryEntry>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM sync_apply_history
         WHERE client_id = ?1 AND dataset_name = ?2
         ORDER BY id DESC
         LIMIT ?3",
    )?;
    let rows = stmt
        .query_map(params![client_id, dataset, limit], row_to_history)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn last_attempt(
    conn: &Connection,
    client_id: &str,
    dataset: &str,
) -> Result<Option<ApplyHistoryEntry>> {
    Ok(history(conn, client_id, dataset, 1)?.into_iter().next())
}

/// Whether the latest decisive attempt ended in a hash mismatch
///
/// Network and canceled rows are skipped: only a success clears the flag.
pub fn needs_full_resync(conn: &Connection, client_id: &str, dataset: &str) -> Result<bool> {
    let kind: Option<Option<String>> = conn
        .query_row(
            "SELECT error_kind FROM sync_apply_history
             WHERE client_id = ?1 AND dataset_name = ?2
               AND (result = 'success' OR error_kind = 'hash_mismatch')
             ORDER BY id DESC
             LIMIT 1",
            params![client_id, dataset],
            |row| row.get(0),
        )
        .optional()?;
    Ok(matches!(kind, Some(Some(ref k)) if k == "hash_mismatch"))
}

pub fn begin_run(conn: &Connection, marker: &RunMarker) -> Result<()> {
    conn.execute(
        "INSERT INTO sync_runs (dataset_name, run_id, client_id, phase, started_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(dataset_name) DO UPDATE SET
             run_id = excluded.run_id,
             client_id = excluded.client_id,
             phase = excluded.phase,
             started_at = excluded.started_at,
             updated_at = excluded.updated_at",
        params![
            marker.dataset,
            marker.run_id,
            marker.client_id,
            marker.phase,
            marker.started_at.to_rfc3339(),
            marker.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub fn update_run_phase(conn: &Connection, dataset: &str, run_id: &str, phase: &str) -> Result<()> {
    conn.execute(
        "UPDATE sync_runs SET phase = ?1, updated_at = ?2
         WHERE dataset_name = ?3 AND run_id = ?4",
        params![phase, Utc::now().to_rfc3339(), dataset, run_id],
    )?;
    Ok(())
}

pub fn finish_run(conn: &Connection, dataset: &str, run_id: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM sync_runs WHERE dataset_name = ?1 AND run_id = ?2",
        params![dataset, run_id],
    )?;
    Ok(())
}

/// Remove and return every run marker left behind by a previous process
pub fn take_leftover_runs(conn: &Connection) -> Result<Vec<RunMarker>> {
    let mut stmt = conn.prepare(
        "SELECT dataset_name, run_id, client_id, phase, started_at, updated_at
         FROM sync_runs ORDER BY dataset_name",
    )?;
    let markers = stmt
        .query_map([], |row| {
            let started_at: String = row.get(4)?;
            let updated_at: String = row.get(5)?;
            Ok(RunMarker {
                dataset: row.get(0)?,
                run_id: row.get(1)?,
                client_id: row.get(2)?,
                phase: row.get(3)?,
                started_at: parse_ts(&started_at),
                updated_at: parse_ts(&updated_at),
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    conn.execute("DELETE FROM sync_runs", [])?;
    Ok(markers)
}

/// Per-client view over the state tables
#[derive(Clone)]
pub struct SyncStateStore {
    storage: Storage,
    client_id: String,
}

impl SyncStateStore {
    pub fn new(storage: Storage, client_id: impl Into<String>) -> Self {
        Self {
            storage,
            client_id: client_id.into(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn load(&self, dataset: &str) -> Result<Option<ClientSyncState>> {
        self.storage
            .with_connection(|conn| load_state(conn, &self.client_id, dataset))
    }

    pub fn append(&self, record: &HistoryRecord) -> Result<i64> {
        self.storage
            .with_connection(|conn| append_history(conn, &self.client_id, record))
    }

    pub fn history(&self, dataset: &str, limit: i64) -> Result<Vec<ApplyHistoryEntry>> {
        self.storage
            .with_connection(|conn| history(conn, &self.client_id, dataset, limit))
    }

    pub fn last_attempt(&self, dataset: &str) -> Result<Option<ApplyHistoryEntry>> {
        self.storage
            .with_connection(|conn| last_attempt(conn, &self.client_id, dataset))
    }

    pub fn known_versions(&self, dataset: &str) -> Result<Vec<DatasetVersion>> {
        self.storage
            .with_connection(|conn| known_versions(conn, dataset))
    }

    pub fn needs_full_resync(&self, dataset: &str) -> Result<bool> {
        self.storage
            .with_connection(|conn| needs_full_resync(conn, &self.client_id, dataset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_state_roundtrip() {
        let storage = Storage::open_in_memory().unwrap();
        let store = SyncStateStore::new(storage.clone(), "client-a");
        assert!(store.load("default_cards").unwrap().is_none());

        storage
            .with_transaction(|conn| write_state(conn, "client-a", "default_cards", "v250101", "h1"))
            .unwrap();
        storage
            .with_transaction(|conn| write_state(conn, "client-a", "default_cards", "v250102", "h2"))
            .unwrap();

        let state = store.load("default_cards").unwrap().unwrap();
        assert_eq!(state.current_version.as_deref(), Some("v250102"));
        assert_eq!(state.state_hash.as_deref(), Some("h2"));
        assert!(state.synced_at.is_some());

        // Other clients are isolated
        let other = SyncStateStore::new(storage, "client-b");
        assert!(other.load("default_cards").unwrap().is_none());
    }

    #[test]
    fn test_history_newest_first() {
        let storage = Storage::open_in_memory().unwrap();
        let store = SyncStateStore::new(storage, "c");

        store
            .append(&HistoryRecord {
                dataset: "d".to_string(),
                to_version: Some("v250101".to_string()),
                strategy: Some(Strategy::Full),
                result: Some(ApplyOutcome::Success),
                added_count: 3,
                ..Default::default()
            })
            .unwrap();
        store
            .append(&HistoryRecord {
                dataset: "d".to_string(),
                from_version: Some("v250101".to_string()),
                to_version: Some("v250102".to_string()),
                strategy: Some(Strategy::Chain),
                result: Some(ApplyOutcome::Error),
                error_kind: Some("hash_mismatch".to_string()),
                error_message: Some("bad".to_string()),
                ..Default::default()
            })
            .unwrap();

        let rows = store.history("d", 10).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].result, ApplyOutcome::Error);
        assert_eq!(rows[0].error_kind.as_deref(), Some("hash_mismatch"));
        assert_eq!(rows[1].strategy, Some(Strategy::Full));
        assert_eq!(rows[1].added_count, 3);

        let last = store.last_attempt("d").unwrap().unwrap();
        assert_eq!(last.id, rows[0].id);
        assert!(store.last_attempt("other").unwrap().is_none());
    }

    #[test]
    fn test_needs_full_resync() {
        let storage = Storage::open_in_memory().unwrap();
        let store = SyncStateStore::new(storage, "c");
        assert!(!store.needs_full_resync("d").unwrap());

        let row = |result, kind: Option<&str>| HistoryRecord {
            dataset: "d".to_string(),
            result: Some(result),
            error_kind: kind.map(String::from),
            ..Default::default()
        };

        store
            .append(&row(ApplyOutcome::Error, Some("hash_mismatch")))
            .unwrap();
        assert!(store.needs_full_resync("d").unwrap());

        // A later network failure does not clear the flag
        store.append(&row(ApplyOutcome::Error, Some("network"))).unwrap();
        store.append(&row(ApplyOutcome::Canceled, Some("canceled"))).unwrap();
        assert!(store.needs_full_resync("d").unwrap());

        store.append(&row(ApplyOutcome::Success, None)).unwrap();
        assert!(!store.needs_full_resync("d").unwrap());
    }

    #[test]
    fn test_run_markers() {
        let storage = Storage::open_in_memory().unwrap();
        let marker = RunMarker {
            dataset: "d".to_string(),
            run_id: "r1".to_string(),
            client_id: "c".to_string(),
            phase: "checking_manifest".to_string(),
            started_at: Utc::now(),
            updated_at: Utc::now(),
        };
        storage
            .with_connection(|conn| {
                begin_run(conn, &marker)?;
                update_run_phase(conn, "d", "r1", "applying")?;
                // A different run id never touches the marker
                finish_run(conn, "d", "other")?;
                Ok(())
            })
            .unwrap();

        let leftovers = storage.with_connection(take_leftover_runs).unwrap();
        assert_eq!(leftovers.len(), 1);
        assert_eq!(leftovers[0].phase, "applying");
        assert!(storage.with_connection(take_leftover_runs).unwrap().is_empty());
    }
}
