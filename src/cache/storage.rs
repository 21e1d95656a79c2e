//! Partition store implementations: in-memory and SQLite.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use rusqlite::{params, types::Type, Connection, OptionalExtension};

use super::lock;
use super::traits::{CacheEntry, PartitionStore};
use crate::error::{CacheError, Result};

type Partition = HashMap<String, Arc<CacheEntry>>;

/// In-memory partition store.
///
/// Entries are held behind `Arc` and replaced whole on write, so a reader
/// that already holds an entry is unaffected by a concurrent overwrite or
/// eviction.
#[derive(Default)]
pub struct MemoryStorage {
  partitions: RwLock<BTreeMap<String, Partition>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }
}

impl PartitionStore for MemoryStorage {
  fn open(&self, partition: &str) -> Result<()> {
    lock::write(&self.partitions, "open")
      .entry(partition.to_string())
      .or_default();
    Ok(())
  }

  fn put(&self, partition: &str, key: &str, entry: CacheEntry) -> Result<()> {
    lock::write(&self.partitions, "put")
      .entry(partition.to_string())
      .or_default()
      .insert(key.to_string(), Arc::new(entry));
    Ok(())
  }

  fn match_entry(&self, partition: &str, key: &str) -> Result<Option<Arc<CacheEntry>>> {
    Ok(
      lock::read(&self.partitions, "match")
        .get(partition)
        .and_then(|p| p.get(key))
        .cloned(),
    )
  }

  fn delete(&self, partition: &str, key: &str) -> Result<bool> {
    Ok(
      lock::write(&self.partitions, "delete")
        .get_mut(partition)
        .and_then(|p| p.remove(key))
        .is_some(),
    )
  }

  fn delete_if_unchanged(
    &self,
    partition: &str,
    key: &str,
    expected: &CacheEntry,
  ) -> Result<bool> {
    let mut partitions = lock::write(&self.partitions, "delete_if_unchanged");
    let Some(entries) = partitions.get_mut(partition) else {
      return Ok(false);
    };
    match entries.get(key) {
      Some(current) if std::ptr::eq(Arc::as_ptr(current), expected) => {
        entries.remove(key);
        Ok(true)
      }
      _ => Ok(false),
    }
  }

  fn partition_names(&self) -> Result<Vec<String>> {
    Ok(
      lock::read(&self.partitions, "partition_names")
        .keys()
        .cloned()
        .collect(),
    )
  }

  fn keys(&self, partition: &str) -> Result<Vec<String>> {
    let partitions = lock::read(&self.partitions, "keys");
    let mut keys: Vec<String> = partitions
      .get(partition)
      .map(|p| p.keys().cloned().collect())
      .unwrap_or_default();
    keys.sort();
    Ok(keys)
  }

  fn len(&self, partition: &str) -> Result<usize> {
    Ok(
      lock::read(&self.partitions, "len")
        .get(partition)
        .map_or(0, |p| p.len()),
    )
  }

  fn delete_partition(&self, partition: &str) -> Result<bool> {
    Ok(
      lock::write(&self.partitions, "delete_partition")
        .remove(partition)
        .is_some(),
    )
  }

  fn delete_all_except(&self, keep: &[String]) -> Result<Vec<String>> {
    let mut partitions = lock::write(&self.partitions, "delete_all_except");
    let removed: Vec<String> = partitions
      .keys()
      .filter(|name| !keep.contains(name))
      .cloned()
      .collect();
    for name in &removed {
      partitions.remove(name);
    }
    Ok(removed)
  }
}

/// SQLite-based partition store.
///
/// Persists partitions across runs. Each entry is written with a single
/// `INSERT OR REPLACE`, so a reader sees either the previous row or the new
/// one.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS partitions (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS cache_entries (
    partition TEXT NOT NULL,
    cache_key TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    stored_at TEXT NOT NULL,
    PRIMARY KEY (partition, cache_key)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_stored
    ON cache_entries(partition, stored_at);
"#;

impl SqliteStorage {
  /// Open (or create) the store at the default location.
  pub fn open_default() -> Result<Self> {
    Self::open(&Self::default_path()?)
  }

  /// Open (or create) the store at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| CacheError::Config(format!("Failed to create cache directory: {}", e)))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| CacheError::storage("Failed to open cache database", e))?;
    Self::with_connection(conn)
  }

  /// Private in-memory database, mostly for tests.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| CacheError::storage("Failed to open in-memory database", e))?;
    Self::with_connection(conn)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| CacheError::Config("Could not determine data directory".to_string()))?;

    Ok(data_dir.join("marketcache").join("cache.db"))
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| CacheError::storage("Failed to run cache migrations", e))?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }
}

fn conversion_error(
  column: usize,
  err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
  rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(err))
}

impl PartitionStore for SqliteStorage {
  fn open(&self, partition: &str) -> Result<()> {
    let conn = lock::lock(&self.conn, "open");
    conn
      .execute(
        "INSERT OR IGNORE INTO partitions (name) VALUES (?)",
        params![partition],
      )
      .map_err(|e| CacheError::storage("Failed to open partition", e))?;
    Ok(())
  }

  fn put(&self, partition: &str, key: &str, entry: CacheEntry) -> Result<()> {
    let headers =
      serde_json::to_string(&entry.headers).map_err(|source| CacheError::Serialization {
        what: "headers",
        source,
      })?;

    let mut conn = lock::lock(&self.conn, "put");
    let tx = conn
      .transaction()
      .map_err(|e| CacheError::storage("Failed to begin transaction", e))?;

    tx.execute(
      "INSERT OR IGNORE INTO partitions (name) VALUES (?)",
      params![partition],
    )
    .map_err(|e| CacheError::storage("Failed to open partition", e))?;

    tx.execute(
      "INSERT OR REPLACE INTO cache_entries (partition, cache_key, status, headers, body, stored_at)
       VALUES (?, ?, ?, ?, ?, ?)",
      params![
        partition,
        key,
        entry.status,
        headers,
        entry.body,
        entry.stored_at.to_rfc3339()
      ],
    )
    .map_err(|e| CacheError::storage("Failed to store entry", e))?;

    tx.commit()
      .map_err(|e| CacheError::storage("Failed to commit transaction", e))?;
    Ok(())
  }

  fn match_entry(&self, partition: &str, key: &str) -> Result<Option<Arc<CacheEntry>>> {
    let conn = lock::lock(&self.conn, "match");
    let entry = conn
      .query_row(
        "SELECT status, headers, body, stored_at FROM cache_entries
         WHERE partition = ? AND cache_key = ?",
        params![partition, key],
        |row| {
          let headers: String = row.get(1)?;
          let headers = serde_json::from_str(&headers).map_err(|e| conversion_error(1, e))?;
          let stored_at: String = row.get(3)?;
          let stored_at = DateTime::parse_from_rfc3339(&stored_at)
            .map_err(|e| conversion_error(3, e))?
            .with_timezone(&Utc);
          Ok(CacheEntry {
            key: key.to_string(),
            status: row.get(0)?,
            headers,
            body: row.get(2)?,
            stored_at,
          })
        },
      )
      .optional()
      .map_err(|e| CacheError::storage("Failed to read entry", e))?;

    Ok(entry.map(Arc::new))
  }

  fn delete(&self, partition: &str, key: &str) -> Result<bool> {
    let conn = lock::lock(&self.conn, "delete");
    let removed = conn
      .execute(
        "DELETE FROM cache_entries WHERE partition = ? AND cache_key = ?",
        params![partition, key],
      )
      .map_err(|e| CacheError::storage("Failed to delete entry", e))?;
    Ok(removed > 0)
  }

  fn delete_if_unchanged(
    &self,
    partition: &str,
    key: &str,
    expected: &CacheEntry,
  ) -> Result<bool> {
    let conn = lock::lock(&self.conn, "delete_if_unchanged");
    let removed = conn
      .execute(
        "DELETE FROM cache_entries WHERE partition = ? AND cache_key = ? AND stored_at = ?",
        params![partition, key, expected.stored_at.to_rfc3339()],
      )
      .map_err(|e| CacheError::storage("Failed to delete entry", e))?;
    Ok(removed > 0)
  }

  fn partition_names(&self) -> Result<Vec<String>> {
    let conn = lock::lock(&self.conn, "partition_names");
    let mut stmt = conn
      .prepare("SELECT name FROM partitions ORDER BY name")
      .map_err(|e| CacheError::storage("Failed to prepare query", e))?;
    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| CacheError::storage("Failed to list partitions", e))?
      .collect::<std::result::Result<Vec<String>, _>>()
      .map_err(|e| CacheError::storage("Failed to list partitions", e))?;
    Ok(names)
  }

  fn keys(&self, partition: &str) -> Result<Vec<String>> {
    let conn = lock::lock(&self.conn, "keys");
    let mut stmt = conn
      .prepare("SELECT cache_key FROM cache_entries WHERE partition = ? ORDER BY cache_key")
      .map_err(|e| CacheError::storage("Failed to prepare query", e))?;
    let keys = stmt
      .query_map(params![partition], |row| row.get(0))
      .map_err(|e| CacheError::storage("Failed to list keys", e))?
      .collect::<std::result::Result<Vec<String>, _>>()
      .map_err(|e| CacheError::storage("Failed to list keys", e))?;
    Ok(keys)
  }

  fn len(&self, partition: &str) -> Result<usize> {
    let conn = lock::lock(&self.conn, "len");
    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM cache_entries WHERE partition = ?",
        params![partition],
        |row| row.get(0),
      )
      .map_err(|e| CacheError::storage("Failed to count entries", e))?;
    Ok(count as usize)
  }

  fn delete_partition(&self, partition: &str) -> Result<bool> {
    let mut conn = lock::lock(&self.conn, "delete_partition");
    let tx = conn
      .transaction()
      .map_err(|e| CacheError::storage("Failed to begin transaction", e))?;

    tx.execute(
      "DELETE FROM cache_entries WHERE partition = ?",
      params![partition],
    )
    .map_err(|e| CacheError::storage("Failed to delete entries", e))?;
    let removed = tx
      .execute("DELETE FROM partitions WHERE name = ?", params![partition])
      .map_err(|e| CacheError::storage("Failed to delete partition", e))?;

    tx.commit()
      .map_err(|e| CacheError::storage("Failed to commit transaction", e))?;
    Ok(removed > 0)
  }
}
