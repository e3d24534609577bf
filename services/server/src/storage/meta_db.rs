//! Embedded metadata store for the file-backed backend.
//!
//! An ordered key-value table in SQLite keyed by `stream:<path>`; values are
//! serialized stream records. The metadata commit is the second half of the
//! durability contract: segment bytes are fsynced first, then the record is
//! written here, so an acknowledged append is both durable and observable.
//!
//! # SQLite durability settings
//! Applied at open: WAL, synchronous=FULL, wal_autocheckpoint=1000.
//! PRAGMA integrity_check runs at open; returns error if it fails.

use rusqlite::{params, Connection};
use std::path::Path;

/// Key prefix for stream records.
pub const STREAM_KEY_PREFIX: &str = "stream:";

/// Error type for metadata store operations.
#[derive(Debug, thiserror::Error)]
pub enum MetaDbError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("integrity check failed: {0}")]
    IntegrityCheckFailed(String),
}

impl From<MetaDbError> for super::StoreError {
    fn from(e: MetaDbError) -> Self {
        super::StoreError::Metadata(e.to_string())
    }
}

/// The metadata store for a single server instance.
pub struct MetaDb {
    conn: Connection,
}

impl MetaDb {
    /// Open (or create) the metadata store at the given path.
    ///
    /// Applies PRAGMAs, runs `PRAGMA integrity_check`, and creates the table
    /// if needed. Returns `Err` if integrity_check fails.
    pub fn open(path: &Path) -> Result<Self, MetaDbError> {
        let conn = Connection::open(path)?;
        apply_pragmas(&conn)?;
        run_integrity_check(&conn)?;
        apply_schema(&conn)?;
        Ok(MetaDb { conn })
    }

    /// In-memory store for unit tests.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, MetaDbError> {
        let conn = Connection::open_in_memory()?;
        apply_schema(&conn)?;
        Ok(MetaDb { conn })
    }

    pub fn get(&self, key: &str) -> Result<Option<String>, MetaDbError> {
        use rusqlite::OptionalExtension;
        let value = self
            .conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    /// Insert or replace a single key; atomic.
    pub fn put(&self, key: &str, value: &str) -> Result<(), MetaDbError> {
        self.conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    /// Delete a key. Returns true if a row existed.
    pub fn delete(&self, key: &str) -> Result<bool, MetaDbError> {
        let n = self
            .conn
            .execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(n > 0)
    }

    /// All `(key, value)` pairs under a prefix, in key order.
    pub fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, MetaDbError> {
        let mut stmt = self.conn.prepare(
            "SELECT key, value FROM kv WHERE key >= ?1 AND key < ?2 ORDER BY key ASC",
        )?;
        // ';' sorts just above ':' so `stream;` upper-bounds the scan.
        let upper = format!("{};", prefix.trim_end_matches(':'));
        let rows = stmt.query_map(params![prefix, upper], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Delete every key under a prefix. Returns the number of rows removed.
    pub fn clear_prefix(&self, prefix: &str) -> Result<usize, MetaDbError> {
        let upper = format!("{};", prefix.trim_end_matches(':'));
        let n = self.conn.execute(
            "DELETE FROM kv WHERE key >= ?1 AND key < ?2",
            params![prefix, upper],
        )?;
        Ok(n)
    }
}

fn apply_pragmas(conn: &Connection) -> Result<(), MetaDbError> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=FULL;
         PRAGMA wal_autocheckpoint=1000;",
    )?;
    Ok(())
}

fn run_integrity_check(conn: &Connection) -> Result<(), MetaDbError> {
    let result: String = conn.pragma_query_value(None, "integrity_check", |row| row.get(0))?;
    if result != "ok" {
        return Err(MetaDbError::IntegrityCheckFailed(result));
    }
    Ok(())
}

fn apply_schema(conn: &Connection) -> Result<(), MetaDbError> {
    conn.execute_batch(include_str!("schema.sql"))?;
    Ok(())
}
