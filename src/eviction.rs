//! Age-based eviction.
//!
//! A sweep walks every partition and removes entries older than the
//! configured maximum age. Failures are isolated per entry: one unreadable
//! entry or partition is logged and counted, and the sweep carries on.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::cache::PartitionStore;
use crate::network::Network;
use crate::worker::CacheWorker;

/// Trigger tag for the periodic sweep.
pub const CLEANUP_TAG: &str = "cache-cleanup";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
  pub scanned: usize,
  pub evicted: usize,
  pub failed: usize,
}

/// Remove every entry whose age at `now` exceeds `max_age`.
pub fn sweep<S: PartitionStore + ?Sized>(
  storage: &S,
  max_age: chrono::Duration,
  now: DateTime<Utc>,
) -> SweepReport {
  let mut report = SweepReport::default();

  let partitions = match storage.partition_names() {
    Ok(names) => names,
    Err(e) => {
      warn!(error = %e, "eviction sweep could not list partitions");
      report.failed += 1;
      return report;
    }
  };

  for partition in &partitions {
    let keys = match storage.keys(partition) {
      Ok(keys) => keys,
      Err(e) => {
        warn!(partition = %partition, error = %e, "eviction sweep could not list keys");
        report.failed += 1;
        continue;
      }
    };

    for key in keys {
      report.scanned += 1;

      let entry = match storage.match_entry(partition, &key) {
        Ok(Some(entry)) => entry,
        // Removed since the key listing
        Ok(None) => continue,
        Err(e) => {
          warn!(
            partition = %partition,
            key = %key,
            error = %e,
            "eviction sweep could not read entry"
          );
          report.failed += 1;
          continue;
        }
      };

      if entry.age(now) <= max_age {
        continue;
      }

      match storage.delete_if_unchanged(partition, &key, &entry) {
        Ok(true) => {
          debug!(partition = %partition, key = %key, stored_at = %entry.stored_at, "evicted");
          report.evicted += 1;
        }
        Ok(false) => {
          debug!(partition = %partition, key = %key, "entry replaced during sweep, kept");
        }
        Err(e) => {
          warn!(
            partition = %partition,
            key = %key,
            error = %e,
            "eviction sweep could not delete entry"
          );
          report.failed += 1;
        }
      }
    }
  }

  info!(
    partitions = partitions.len(),
    scanned = report.scanned,
    evicted = report.evicted,
    failed = report.failed,
    "eviction sweep complete"
  );
  report
}

/// Handle to a running periodic sweep.
pub struct SweepTask {
  handle: JoinHandle<()>,
}

impl SweepTask {
  /// Stop the schedule and wait for the task to exit. A sweep already in
  /// progress runs to completion.
  pub async fn stop(self) {
    self.handle.abort();
    if let Err(e) = self.handle.await {
      if e.is_panic() {
        warn!(error = %e, "periodic sweep task panicked");
      }
    }
  }
}

/// Deliver the cleanup trigger to `worker` every `period`. The first sweep
/// runs one full period after the call.
pub fn spawn_periodic<S, N>(worker: Arc<CacheWorker<S, N>>, period: Duration) -> SweepTask
where
  S: PartitionStore,
  N: Network,
{
  let handle = tokio::spawn(async move {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
      ticker.tick().await;
      worker.handle_periodic_sweep(CLEANUP_TAG);
    }
  });

  SweepTask { handle }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheEntry, MemoryStorage};
  use crate::error::{CacheError, Result};
  use crate::request::Response;
  use crate::testing::{self, FakeNetwork};
  use chrono::Duration as ChronoDuration;

  const PARTITION: &str = "agrimarket-dynamic-v2";

  fn week() -> ChronoDuration {
    ChronoDuration::days(7)
  }

  fn store_aged(
    storage: &dyn PartitionStore,
    key: &str,
    now: DateTime<Utc>,
    age: ChronoDuration,
  ) {
    let entry = CacheEntry::new(key, &Response::ok(key), now - age);
    storage.put(PARTITION, key, entry).unwrap();
  }

  #[test]
  fn test_sweep_evicts_only_expired_entries() {
    let storage = MemoryStorage::new();
    let now = Utc::now();
    store_aged(&storage, "GET /old", now, ChronoDuration::days(8));
    store_aged(&storage, "GET /recent", now, ChronoDuration::days(1));

    let report = sweep(&storage, week(), now);

    assert_eq!(
      report,
      SweepReport {
        scanned: 2,
        evicted: 1,
        failed: 0
      }
    );
    assert_eq!(storage.keys(PARTITION).unwrap(), vec!["GET /recent"]);
  }

  #[test]
  fn test_entry_exactly_at_max_age_is_kept() {
    let storage = MemoryStorage::new();
    let now = Utc::now();
    store_aged(&storage, "GET /edge", now, week());

    let report = sweep(&storage, week(), now);
    assert_eq!(report.evicted, 0);
    assert_eq!(storage.len(PARTITION).unwrap(), 1);
  }

  #[test]
  fn test_sweep_covers_every_partition() {
    let storage = MemoryStorage::new();
    let now = Utc::now();
    let old = CacheEntry::new("GET /a.png", &Response::ok("a"), now - ChronoDuration::days(30));
    storage.put("agrimarket-images-v2", "GET /a.png", old.clone()).unwrap();
    storage.put("agrimarket-api-v2", "GET /a.png", old).unwrap();

    let report = sweep(&storage, week(), now);
    assert_eq!(report.evicted, 2);
  }

  type MatchHook = Box<dyn Fn(&MemoryStorage, &str) -> Result<()> + Send + Sync>;

  /// Memory store that runs `on_match` after every entry lookup.
  struct HookedStore {
    inner: MemoryStorage,
    on_match: MatchHook,
  }

  impl HookedStore {
    fn new(on_match: impl Fn(&MemoryStorage, &str) -> Result<()> + Send + Sync + 'static) -> Self {
      Self {
        inner: MemoryStorage::new(),
        on_match: Box::new(on_match),
      }
    }
  }

  impl PartitionStore for HookedStore {
    fn open(&self, partition: &str) -> Result<()> {
      self.inner.open(partition)
    }

    fn put(&self, partition: &str, key: &str, entry: CacheEntry) -> Result<()> {
      self.inner.put(partition, key, entry)
    }

    fn match_entry(&self, partition: &str, key: &str) -> Result<Option<Arc<CacheEntry>>> {
      let entry = self.inner.match_entry(partition, key)?;
      (self.on_match)(&self.inner, key)?;
      Ok(entry)
    }

    fn delete(&self, partition: &str, key: &str) -> Result<bool> {
      self.inner.delete(partition, key)
    }

    fn delete_if_unchanged(
      &self,
      partition: &str,
      key: &str,
      expected: &CacheEntry,
    ) -> Result<bool> {
      self.inner.delete_if_unchanged(partition, key, expected)
    }

    fn partition_names(&self) -> Result<Vec<String>> {
      self.inner.partition_names()
    }

    fn keys(&self, partition: &str) -> Result<Vec<String>> {
      self.inner.keys(partition)
    }

    fn len(&self, partition: &str) -> Result<usize> {
      self.inner.len(partition)
    }

    fn delete_partition(&self, partition: &str) -> Result<bool> {
      self.inner.delete_partition(partition)
    }
  }

  #[test]
  fn test_one_failing_entry_does_not_stop_the_sweep() {
    let storage = HookedStore::new(|_, key| {
      if key == "GET /broken" {
        return Err(CacheError::storage("read entry", rusqlite::Error::InvalidQuery));
      }
      Ok(())
    });
    let now = Utc::now();
    store_aged(&storage, "GET /broken", now, ChronoDuration::days(9));
    store_aged(&storage, "GET /old", now, ChronoDuration::days(9));
    store_aged(&storage, "GET /zzz", now, ChronoDuration::days(9));

    let report = sweep(&storage, week(), now);

    assert_eq!(report.scanned, 3);
    assert_eq!(report.failed, 1);
    assert_eq!(report.evicted, 2);
    assert_eq!(storage.keys(PARTITION).unwrap(), vec!["GET /broken"]);
  }

  #[test]
  fn test_entry_refreshed_during_sweep_is_kept() {
    // A background refresh overwrites the entry right after the sweep reads it
    let storage = HookedStore::new(|inner, key| {
      let fresh = CacheEntry::new(key, &Response::ok("fresh"), Utc::now());
      inner.put(PARTITION, key, fresh)
    });
    let now = Utc::now();
    store_aged(&storage, "GET /api/equipment", now, ChronoDuration::days(8));

    let report = sweep(&storage, week(), now);

    assert_eq!(report.evicted, 0);
    assert_eq!(report.failed, 0);
    let kept = storage
      .match_entry(PARTITION, "GET /api/equipment")
      .unwrap()
      .unwrap();
    assert_eq!(kept.body, b"fresh");
  }

  #[tokio::test(start_paused = true)]
  async fn test_periodic_sweep_runs_each_period_until_stopped() {
    let network = FakeNetwork::new();
    let worker = Arc::new(CacheWorker::new(
      Arc::new(testing::config()),
      Arc::new(MemoryStorage::new()),
      network,
    ));
    let storage = Arc::clone(worker.layer().storage());
    store_aged(&*storage, "GET /old", Utc::now(), ChronoDuration::days(8));

    let period = Duration::from_secs(60);
    let task = spawn_periodic(Arc::clone(&worker), period);

    // Nothing runs before the first full period
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(storage.len(PARTITION).unwrap(), 1);

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(storage.len(PARTITION).unwrap(), 0);

    task.stop().await;
    store_aged(&*storage, "GET /later", Utc::now(), ChronoDuration::days(8));
    tokio::time::sleep(period * 5).await;
    assert_eq!(storage.len(PARTITION).unwrap(), 1);
  }
}
