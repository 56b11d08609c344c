//! Database connection management with WAL mode support
//!
//! Wraps a single SQLite connection behind a mutex. The sync engine is the
//! only writer, so one connection plus per-artifact transactions is the whole
//! locking discipline.

use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use std::sync::Arc;

use super::migrations::run_migrations;
use crate::error::Result;
use crate::types::{StorageConfig, StorageMode};

/// Pragmas per storage mode
///
/// Local mode runs WAL so status reads are not blocked by a long apply.
/// Cloud-safe mode keeps a rollback journal so the file is self-contained
/// whenever a sync folder copies it.
fn pragmas(mode: StorageMode) -> &'static str {
    match mode {
        StorageMode::Local => {
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA wal_autocheckpoint=1000;
             PRAGMA busy_timeout=30000;
             PRAGMA cache_size=-64000;
             PRAGMA temp_store=MEMORY;
             PRAGMA foreign_keys=ON;"
        }
        StorageMode::CloudSafe => {
            "PRAGMA journal_mode=DELETE;
             PRAGMA synchronous=FULL;
             PRAGMA busy_timeout=30000;
             PRAGMA cache_size=-32000;
             PRAGMA temp_store=MEMORY;
             PRAGMA foreign_keys=ON;"
        }
    }
}

/// SQLite handle shared by the store facades and the applier
pub struct Storage {
    config: StorageConfig,
    conn: Arc<Mutex<Connection>>,
}

impl Storage {
    /// Open (creating if needed) and migrate to the current schema
    pub fn open(config: StorageConfig) -> Result<Self> {
        let conn = Self::create_connection(&config)?;
        run_migrations(&conn)?;
        Ok(Self {
            config,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (tests, dry runs)
    pub fn open_in_memory() -> Result<Self> {
        let config = StorageConfig {
            db_path: ":memory:".to_string(),
            storage_mode: StorageMode::Local,
        };
        Self::open(config)
    }

    fn create_connection(config: &StorageConfig) -> Result<Connection> {
        let conn = if config.db_path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            let path = Path::new(&config.db_path);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?
        };
        conn.execute_batch(pragmas(config.storage_mode))?;
        Ok(conn)
    }

    /// Execute a function with the connection
    pub fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Execute a function inside a transaction; any error rolls back
    pub fn with_transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    fn is_file_backed(&self) -> bool {
        self.config.db_path != ":memory:"
    }

    /// Fold the WAL back into the main file after a bulk replace
    ///
    /// No-op for in-memory and cloud-safe databases, which keep no WAL.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_file_backed() && self.config.storage_mode == StorageMode::Local {
            self.with_connection(|conn| {
                conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
                Ok(())
            })?;
        }
        Ok(())
    }

    /// Bytes used by the database pages, shown in dataset status
    pub fn db_size(&self) -> Result<i64> {
        self.with_connection(|conn| {
            Ok(conn.query_row(
                "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
                [],
                |row| row.get(0),
            )?)
        })
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }
}

impl Clone for Storage {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            conn: self.conn.clone(),
        }
    }
}
