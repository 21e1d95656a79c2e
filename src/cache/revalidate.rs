//! Bounded task group for background revalidation.

use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::lock;

/// Runs refreshes detached from the request that triggered them, at most
/// `capacity` at a time. A refresh that would exceed the cap is dropped.
pub struct RevalidationPool {
  capacity: usize,
  permits: Arc<Semaphore>,
  tasks: Mutex<JoinSet<()>>,
}

impl RevalidationPool {
  pub fn new(capacity: usize) -> Self {
    let capacity = capacity.max(1);
    Self {
      capacity,
      permits: Arc::new(Semaphore::new(capacity)),
      tasks: Mutex::new(JoinSet::new()),
    }
  }

  /// Start `task` in the background. Returns `false` if the pool is full and
  /// the task was dropped.
  pub fn spawn<F>(&self, key: &str, task: F) -> bool
  where
    F: Future<Output = ()> + Send + 'static,
  {
    let permit = match Arc::clone(&self.permits).try_acquire_owned() {
      Ok(permit) => permit,
      Err(_) => {
        debug!(key, capacity = self.capacity, "revalidation pool full, dropping refresh");
        return false;
      }
    };

    let mut tasks = lock::lock(&self.tasks, "revalidate.spawn");
    // Reap finished tasks so the set does not grow unbounded
    while tasks.try_join_next().is_some() {}
    tasks.spawn(async move {
      task.await;
      drop(permit);
    });
    true
  }

  /// Number of refreshes currently running.
  pub fn in_flight(&self) -> usize {
    self.capacity - self.permits.available_permits()
  }

  /// Wait for every running refresh to finish.
  pub async fn drain(&self) {
    let mut tasks = std::mem::take(&mut *lock::lock(&self.tasks, "revalidate.drain"));
    while let Some(result) = tasks.join_next().await {
      if let Err(e) = result {
        if e.is_panic() {
          warn!(error = %e, "revalidation task panicked");
        }
      }
    }
  }

  /// Abort every running refresh.
  pub fn shutdown(&self) {
    lock::lock(&self.tasks, "revalidate.shutdown").abort_all();
  }
}
