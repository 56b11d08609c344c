//! Database migrations
//!
//! Migrations are an ordered list of steps. Each step runs exactly once,
//! inside its own transaction, and is recorded in `schema_version`. One-time
//! data backfills are steps too, so nothing is kept in sync by triggers.

use chrono::Utc;
use rusqlite::{params, Connection};

use crate::error::Result;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 4;

enum MigrationStep {
    Sql(&'static str),
    Backfill(fn(&Connection) -> Result<()>),
}

struct Migration {
    version: i32,
    name: &'static str,
    step: MigrationStep,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "catalog_tables",
        step: MigrationStep::Sql(
            r#"
            CREATE TABLE IF NOT EXISTS catalog_records (
                dataset_name TEXT NOT NULL,
                record_id TEXT NOT NULL,
                name TEXT NOT NULL,
                set_code TEXT NOT NULL DEFAULT '',
                collector_number TEXT NOT NULL DEFAULT '',
                image_url TEXT,
                market_price REAL NOT NULL,
                low_price REAL,
                mid_price REAL,
                high_price REAL,
                updated_at TEXT NOT NULL DEFAULT '',
                PRIMARY KEY (dataset_name, record_id)
            ) WITHOUT ROWID;

            CREATE INDEX IF NOT EXISTS idx_catalog_records_set
                ON catalog_records(dataset_name, set_code, collector_number);
            "#,
        ),
    },
    Migration {
        version: 2,
        name: "sync_state",
        step: MigrationStep::Sql(
            r#"
            CREATE TABLE IF NOT EXISTS sync_client_state (
                client_id TEXT NOT NULL,
                dataset_name TEXT NOT NULL,
                current_version TEXT,
                state_hash TEXT,
                synced_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (client_id, dataset_name)
            );

            CREATE TABLE IF NOT EXISTS sync_apply_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                client_id TEXT NOT NULL,
                dataset_name TEXT NOT NULL,
                from_version TEXT,
                to_version TEXT,
                strategy TEXT,
                duration_ms INTEGER NOT NULL DEFAULT 0,
                result TEXT NOT NULL CHECK (result IN ('success', 'error', 'canceled')),
                error_kind TEXT,
                error_message TEXT,
                patch_hash TEXT,
                added_count INTEGER NOT NULL DEFAULT 0,
                updated_count INTEGER NOT NULL DEFAULT 0,
                removed_count INTEGER NOT NULL DEFAULT 0,
                applied_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_sync_apply_history_dataset
                ON sync_apply_history(client_id, dataset_name, id);

            -- The apply ledger is append-only
            CREATE TRIGGER IF NOT EXISTS sync_apply_history_no_update
            BEFORE UPDATE ON sync_apply_history BEGIN
                SELECT RAISE(ABORT, 'sync_apply_history is append-only');
            END;

            CREATE TRIGGER IF NOT EXISTS sync_apply_history_no_delete
            BEFORE DELETE ON sync_apply_history BEGIN
                SELECT RAISE(ABORT, 'sync_apply_history is append-only');
            END;

            CREATE TABLE IF NOT EXISTS sync_dataset_versions (
                dataset_name TEXT NOT NULL,
                version TEXT NOT NULL,
                source_id TEXT NOT NULL,
                state_hash TEXT NOT NULL,
                record_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                PRIMARY KEY (dataset_name, version)
            );
            "#,
        ),
    },
    Migration {
        version: 3,
        name: "sync_runs_and_set_summary",
        step: MigrationStep::Sql(
            r#"
            CREATE TABLE IF NOT EXISTS sync_runs (
                dataset_name TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                client_id TEXT NOT NULL,
                phase TEXT NOT NULL,
                started_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS catalog_set_summary (
                dataset_name TEXT NOT NULL,
                set_code TEXT NOT NULL,
                record_count INTEGER NOT NULL,
                market_total REAL NOT NULL,
                PRIMARY KEY (dataset_name, set_code)
            );
            "#,
        ),
    },
    Migration {
        version: 4,
        name: "backfill_dataset_versions",
        step: MigrationStep::Backfill(backfill_dataset_versions),
    },
];

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL DEFAULT '',
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    let current_version = current_schema_version(conn)?;

    for migration in MIGRATIONS.iter().filter(|m| m.version > current_version) {
        let tx = conn.unchecked_transaction()?;
        match migration.step {
            MigrationStep::Sql(sql) => tx.execute_batch(sql)?,
            MigrationStep::Backfill(backfill) => backfill(&tx)?,
        }
        tx.execute(
            "INSERT INTO schema_version (version, name, applied_at) VALUES (?, ?, ?)",
            params![migration.version, migration.name, Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;

        tracing::debug!(
            version = migration.version,
            name = migration.name,
            "Applied migration"
        );
    }

    Ok(())
}

/// Highest applied schema version (0 for a fresh database)
pub fn current_schema_version(conn: &Connection) -> Result<i32> {
    let version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}

/// Seed the version ledger from replicas that were synced before it existed
fn backfill_dataset_versions(conn: &Connection) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO sync_dataset_versions
             (dataset_name, version, source_id, state_hash, record_count, created_at)
         SELECT s.dataset_name, s.current_version, ?1, s.state_hash,
                (SELECT COUNT(*) FROM catalog_records c WHERE c.dataset_name = s.dataset_name),
                COALESCE(s.synced_at, s.updated_at)
         FROM sync_client_state s
         WHERE s.current_version IS NOT NULL
           AND s.state_hash IS NOT NULL",
        params![crate::types::DEFAULT_SOURCE_ID],
    )?;
    Ok(())
}
