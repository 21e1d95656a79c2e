//! Core traits and types for the partition store.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::request::Response;

/// A stored response.
///
/// Entries are replaced as a whole, never mutated in place. Stores hand out
/// `Arc<CacheEntry>` so a reader keeps a complete entry even if it is
/// overwritten or evicted while in use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
  /// Method and URL of the request that produced the response
  pub key: String,
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
  /// When the entry was written. Age is always derived from this.
  pub stored_at: DateTime<Utc>,
}

impl CacheEntry {
  pub fn new(key: impl Into<String>, response: &Response, stored_at: DateTime<Utc>) -> Self {
    Self {
      key: key.into(),
      status: response.status,
      headers: response.headers.clone(),
      body: response.body.clone(),
      stored_at,
    }
  }

  pub fn age(&self, now: DateTime<Utc>) -> Duration {
    now - self.stored_at
  }

  pub fn to_response(&self) -> Response {
    Response {
      status: self.status,
      headers: self.headers.clone(),
      body: self.body.clone(),
    }
  }
}

/// Trait for partition store backends.
///
/// A partition is a named, independent map of cache key to entry. Writes
/// overwrite (last writer wins) and readers observe either a whole entry or
/// a miss.
pub trait PartitionStore: Send + Sync + 'static {
  /// Create the partition if needed. Repeated calls are no-ops.
  fn open(&self, partition: &str) -> Result<()>;

  /// Store an entry, opening the partition if needed.
  fn put(&self, partition: &str, key: &str, entry: CacheEntry) -> Result<()>;

  /// Latest entry for `key`, or `None` on a miss or unknown partition.
  fn match_entry(&self, partition: &str, key: &str) -> Result<Option<Arc<CacheEntry>>>;

  /// Remove one entry. Returns whether it existed.
  fn delete(&self, partition: &str, key: &str) -> Result<bool>;

  /// Remove `key` only if it still holds `expected`, an entry previously
  /// returned by `match_entry`. Returns whether it was removed.
  fn delete_if_unchanged(
    &self,
    partition: &str,
    key: &str,
    expected: &CacheEntry,
  ) -> Result<bool> {
    match self.match_entry(partition, key)? {
      Some(current) if current.stored_at == expected.stored_at => self.delete(partition, key),
      _ => Ok(false),
    }
  }

  /// Names of all partitions, sorted.
  fn partition_names(&self) -> Result<Vec<String>>;

  /// Keys stored in a partition.
  fn keys(&self, partition: &str) -> Result<Vec<String>>;

  /// Number of entries in a partition (0 for an unknown partition).
  fn len(&self, partition: &str) -> Result<usize>;

  /// Drop a whole partition. Returns whether it existed.
  fn delete_partition(&self, partition: &str) -> Result<bool>;

  /// Drop every partition not named in `keep`; returns the removed names.
  fn delete_all_except(&self, keep: &[String]) -> Result<Vec<String>> {
    let mut removed = Vec::new();
    for name in self.partition_names()? {
      if !keep.contains(&name) && self.delete_partition(&name)? {
        removed.push(name);
      }
    }
    Ok(removed)
  }
}

/// Result from serving a request, including where the data came from.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  /// Served from cache while a background refresh runs.
  pub fn revalidating(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Revalidating,
      cached_at: Some(cached_at),
    }
  }

  /// Network failed, cached copy served instead.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::CacheFallback,
      cached_at: Some(cached_at),
    }
  }

  pub fn synthetic(data: T, source: CacheSource) -> Self {
    Self {
      data,
      source,
      cached_at: None,
    }
  }
}

/// Indicates where served data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Cached entry, network not consulted
  Cache,
  /// Cached entry, refresh scheduled in the background
  Revalidating,
  /// Network unavailable, serving cached data
  CacheFallback,
  /// Bundled offline page
  OfflinePage,
  /// Generated failure response
  Synthetic,
}
