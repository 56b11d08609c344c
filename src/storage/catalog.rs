//! Catalog tables: keyed dataset rows, the state hash, and read-only lookups
//!
//! The catalog holds exactly one version per dataset, the one named by the
//! client sync state. Writes only happen inside the applier's transaction.

use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::Storage;
use crate::error::{Result, SyncError};
use crate::types::{normalize_record_id, CatalogRecord};

/// Max identifiers per `IN (...)` lookup
const LOOKUP_CHUNK_SIZE: usize = 500;

const RECORD_COLUMNS: &str = "record_id, name, set_code, collector_number, image_url,
     market_price, low_price, mid_price, high_price, updated_at";

/// Per-set aggregate rebuilt after each successful sync
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetSummary {
    pub set_code: String,
    pub record_count: i64,
    pub market_total: f64,
}

fn row_to_record(row: &Row) -> rusqlite::Result<CatalogRecord> {
    Ok(CatalogRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        set_code: row.get(2)?,
        collector_number: row.get(3)?,
        image_url: row.get(4)?,
        market_price: row.get(5)?,
        low_price: row.get(6)?,
        mid_price: row.get(7)?,
        high_price: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

/// Insert or replace one record by primary key
pub fn upsert_record(conn: &Connection, dataset: &str, record: &CatalogRecord) -> Result<()> {
    let record = record.normalized();
    record.validate().map_err(SyncError::Apply)?;

    conn.execute(
        "INSERT INTO catalog_records (
             dataset_name, record_id, name, set_code, collector_number, image_url,
             market_price, low_price, mid_price, high_price, updated_at
         )
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT(dataset_name, record_id) DO UPDATE SET
             name = excluded.name,
             set_code = excluded.set_code,
             collector_number = excluded.collector_number,
             image_url = excluded.image_url,
             market_price = excluded.market_price,
             low_price = excluded.low_price,
             mid_price = excluded.mid_price,
             high_price = excluded.high_price,
             updated_at = excluded.updated_at",
        params![
            dataset,
            record.id,
            record.name,
            record.set_code,
            record.collector_number,
            record.image_url,
            record.market_price,
            record.low_price,
            record.mid_price,
            record.high_price,
            record.updated_at,
        ],
    )?;
    Ok(())
}

/// Delete one record; returns whether a row existed
pub fn delete_record(conn: &Connection, dataset: &str, record_id: &str) -> Result<bool> {
    let deleted = conn.execute(
        "DELETE FROM catalog_records WHERE dataset_name = ?1 AND record_id = ?2",
        params![dataset, normalize_record_id(record_id)],
    )?;
    Ok(deleted > 0)
}

/// Remove every record of a dataset (snapshot bulk-replace)
pub fn clear_dataset(conn: &Connection, dataset: &str) -> Result<usize> {
    let deleted = conn.execute(
        "DELETE FROM catalog_records WHERE dataset_name = ?1",
        params![dataset],
    )?;
    Ok(deleted)
}

pub fn count_records(conn: &Connection, dataset: &str) -> Result<i64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM catalog_records WHERE dataset_name = ?1",
        params![dataset],
        |row| row.get(0),
    )?;
    Ok(count)
}

pub fn get_record(
    conn: &Connection,
    dataset: &str,
    record_id: &str,
) -> Result<Option<CatalogRecord>> {
    let sql = format!(
        "SELECT {} FROM catalog_records WHERE dataset_name = ?1 AND record_id = ?2",
        RECORD_COLUMNS
    );
    let record = conn
        .query_row(&sql, params![dataset, normalize_record_id(record_id)], row_to_record)
        .optional()?;
    Ok(record)
}

/// All records of a dataset in primary key order
pub fn load_records(conn: &Connection, dataset: &str) -> Result<Vec<CatalogRecord>> {
    let sql = format!(
        "SELECT {} FROM catalog_records WHERE dataset_name = ?1 ORDER BY record_id",
        RECORD_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let records = stmt
        .query_map(params![dataset], row_to_record)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(records)
}

/// Batched read-only lookup by record id
///
/// Identifiers are normalized; unknown ids are skipped. Results come back
/// in primary key order.
pub fn lookup_records(
    conn: &Connection,
    dataset: &str,
    record_ids: &[String],
) -> Result<Vec<CatalogRecord>> {
    let mut ids: Vec<String> = record_ids
        .iter()
        .map(|id| normalize_record_id(id))
        .filter(|id| !id.is_empty())
        .collect();
    ids.sort();
    ids.dedup();

    let mut records = Vec::with_capacity(ids.len());
    for chunk in ids.chunks(LOOKUP_CHUNK_SIZE) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        let sql = format!(
            "SELECT {} FROM catalog_records
             WHERE dataset_name = ? AND record_id IN ({})
             ORDER BY record_id",
            RECORD_COLUMNS, placeholders
        );
        let mut stmt = conn.prepare(&sql)?;
        let params = std::iter::once(dataset).chain(chunk.iter().map(String::as_str));
        let rows = stmt
            .query_map(params_from_iter(params), row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        records.extend(rows);
    }
    Ok(records)
}

fn new_hasher(dataset: &str) -> Sha256 {
    let mut hasher = Sha256::new();
    hasher.update(dataset.as_bytes());
    hasher.update(b"\n");
    hasher
}

/// Deterministic state hash over a set of records
///
/// Producer-side counterpart of [`compute_state_hash`]: records are
/// normalized and ordered by id before hashing, so both sides agree.
pub fn state_hash(dataset: &str, records: &[CatalogRecord]) -> String {
    let mut normalized: Vec<CatalogRecord> = records.iter().map(|r| r.normalized()).collect();
    normalized.sort_by(|a, b| a.id.cmp(&b.id));

    let mut hasher = new_hasher(dataset);
    for record in &normalized {
        hasher.update(record.hash_line().as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Recompute the state hash from the stored rows
pub fn compute_state_hash(conn: &Connection, dataset: &str) -> Result<String> {
    let sql = format!(
        "SELECT {} FROM catalog_records WHERE dataset_name = ?1 ORDER BY record_id",
        RECORD_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params![dataset])?;

    let mut hasher = new_hasher(dataset);
    while let Some(row) = rows.next()? {
        let record = row_to_record(row)?.normalized();
        hasher.update(record.hash_line().as_bytes());
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Rebuild the per-set summary for a dataset; returns the number of sets
pub fn rebuild_set_summary(conn: &Connection, dataset: &str) -> Result<usize> {
    conn.execute(
        "DELETE FROM catalog_set_summary WHERE dataset_name = ?1",
        params![dataset],
    )?;
    let inserted = conn.execute(
        "INSERT INTO catalog_set_summary (dataset_name, set_code, record_count, market_total)
         SELECT dataset_name, set_code, COUNT(*), COALESCE(SUM(market_price), 0)
         FROM catalog_records
         WHERE dataset_name = ?1
         GROUP BY dataset_name, set_code",
        params![dataset],
    )?;
    Ok(inserted)
}

pub fn set_summary(conn: &Connection, dataset: &str) -> Result<Vec<SetSummary>> {
    let mut stmt = conn.prepare(
        "SELECT set_code, record_count, market_total
         FROM catalog_set_summary
         WHERE dataset_name = ?1
         ORDER BY set_code",
    )?;
    let rows = stmt
        .query_map(params![dataset], |row| {
            Ok(SetSummary {
                set_code: row.get(0)?,
                record_count: row.get(1)?,
                market_total: row.get(2)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Read-only view of the catalog tables for query collaborators
#[derive(Clone)]
pub struct CatalogStore {
    storage: Storage,
}

impl CatalogStore {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    pub fn lookup(&self, dataset: &str, record_ids: &[String]) -> Result<Vec<CatalogRecord>> {
        self.storage
            .with_connection(|conn| lookup_records(conn, dataset, record_ids))
    }

    pub fn get(&self, dataset: &str, record_id: &str) -> Result<Option<CatalogRecord>> {
        self.storage
            .with_connection(|conn| get_record(conn, dataset, record_id))
    }

    pub fn count(&self, dataset: &str) -> Result<i64> {
        self.storage
            .with_connection(|conn| count_records(conn, dataset))
    }

    pub fn state_hash(&self, dataset: &str) -> Result<String> {
        self.storage
            .with_connection(|conn| compute_state_hash(conn, dataset))
    }

    pub fn set_summary(&self, dataset: &str) -> Result<Vec<SetSummary>> {
        self.storage
            .with_connection(|conn| set_summary(conn, dataset))
    }
}
