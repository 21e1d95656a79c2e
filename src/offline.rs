//! Offline mutation queue.
//!
//! Mutating requests that fail because the origin is unreachable are kept
//! here and replayed, oldest first, when connectivity returns. Each action is
//! retried independently; one that keeps failing is dropped after
//! `max_retries` attempts instead of holding up the rest of the queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::{fetch_with_timeout, lock};
use crate::network::Network;
use crate::request::Request;

/// A mutation waiting to be replayed.
#[derive(Debug, Clone)]
pub struct OfflineAction {
  pub id: u64,
  /// `METHOD path`, for logs and inspection
  pub kind: String,
  /// The original request, replayed as-is
  pub payload: Request,
  pub enqueued_at: DateTime<Utc>,
  pub retry_count: u32,
}

/// Outcome of one replay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
  /// Accepted by the origin and removed
  pub replayed: usize,
  /// Failed again and kept for the next pass
  pub retried: usize,
  /// Removed without success: rejected by the origin or out of retries
  pub dropped: usize,
}

pub struct OfflineQueue {
  actions: Mutex<VecDeque<OfflineAction>>,
  next_id: AtomicU64,
  max_retries: u32,
}

impl OfflineQueue {
  pub fn new(max_retries: u32) -> Self {
    Self {
      actions: Mutex::new(VecDeque::new()),
      next_id: AtomicU64::new(1),
      max_retries: max_retries.max(1),
    }
  }

  /// Record a failed mutation. Returns the action id.
  pub fn enqueue(&self, request: Request) -> u64 {
    let id = self.next_id.fetch_add(1, Ordering::SeqCst);
    let kind = format!("{} {}", request.method, request.url.path());

    info!(action_id = id, kind = %kind, "queued offline action");

    lock::lock(&self.actions, "offline.enqueue").push_back(OfflineAction {
      id,
      kind,
      payload: request,
      enqueued_at: Utc::now(),
      retry_count: 0,
    });
    id
  }

  pub fn len(&self) -> usize {
    lock::lock(&self.actions, "offline.len").len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Pending actions in replay order.
  pub fn pending(&self) -> Vec<OfflineAction> {
    lock::lock(&self.actions, "offline.pending")
      .iter()
      .cloned()
      .collect()
  }

  /// Replay every pending action in FIFO order.
  ///
  /// Actions that fail stay queued, ahead of anything enqueued while the
  /// replay was running.
  pub async fn replay<N: Network + ?Sized>(&self, network: &N, timeout: Duration) -> SyncReport {
    let batch = std::mem::take(&mut *lock::lock(&self.actions, "offline.replay.take"));
    let mut report = SyncReport::default();
    if batch.is_empty() {
      return report;
    }

    info!(pending = batch.len(), "replaying offline actions");
    let mut survivors = VecDeque::new();

    for mut action in batch {
      let failure = match fetch_with_timeout(network, &action.payload, timeout).await {
        Ok(response) if response.is_success() => {
          debug!(action_id = action.id, kind = %action.kind, "offline action replayed");
          report.replayed += 1;
          continue;
        }
        Ok(response) if response.status < 500 => {
          warn!(
            action_id = action.id,
            kind = %action.kind,
            status = response.status,
            "offline action rejected by origin, dropping"
          );
          report.dropped += 1;
          continue;
        }
        Ok(response) => format!("origin answered {}", response.status),
        Err(e) => e.to_string(),
      };

      action.retry_count += 1;
      if action.retry_count >= self.max_retries {
        warn!(
          action_id = action.id,
          kind = %action.kind,
          attempts = action.retry_count,
          error = %failure,
          "offline action exceeded retry limit, dropping"
        );
        report.dropped += 1;
      } else {
        debug!(
          action_id = action.id,
          kind = %action.kind,
          attempts = action.retry_count,
          error = %failure,
          "offline action failed, will retry"
        );
        report.retried += 1;
        survivors.push_back(action);
      }
    }

    let mut actions = lock::lock(&self.actions, "offline.replay.restore");
    survivors.extend(actions.drain(..));
    *actions = survivors;

    info!(
      replayed = report.replayed,
      retried = report.retried,
      dropped = report.dropped,
      "offline replay complete"
    );
    report
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::request::Response;
  use crate::testing::{url, FakeNetwork};
  use reqwest::Method;

  const TIMEOUT: Duration = Duration::from_millis(200);

  fn post(path: &str) -> Request {
    Request::new(Method::POST, url(path)).with_body(r#"{"crop":"maize"}"#)
  }

  #[tokio::test]
  async fn test_replay_is_fifo() {
    let network = FakeNetwork::new();
    for path in ["/api/a1", "/api/a2", "/api/a3"] {
      network.respond(path, Response::new(201, "created"));
    }

    let queue = OfflineQueue::new(3);
    queue.enqueue(post("/api/a1"));
    queue.enqueue(post("/api/a2"));
    queue.enqueue(post("/api/a3"));

    let report = queue.replay(network.as_ref(), TIMEOUT).await;

    assert_eq!(
      network.calls(),
      vec!["POST /api/a1", "POST /api/a2", "POST /api/a3"]
    );
    assert_eq!(report.replayed, 3);
    assert!(queue.is_empty());
  }

  #[tokio::test]
  async fn test_failing_action_does_not_block_later_ones() {
    let network = FakeNetwork::new();
    network.respond_ok("/api/a1", "ok");
    network.respond("/api/a2", Response::new(503, "busy"));
    network.respond_ok("/api/a3", "ok");

    let queue = OfflineQueue::new(3);
    queue.enqueue(post("/api/a1"));
    queue.enqueue(post("/api/a2"));
    queue.enqueue(post("/api/a3"));

    let report = queue.replay(network.as_ref(), TIMEOUT).await;
    assert_eq!(
      report,
      SyncReport {
        replayed: 2,
        retried: 1,
        dropped: 0
      }
    );

    let pending = queue.pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].kind, "POST /api/a2");
    assert_eq!(pending[0].retry_count, 1);
  }

  #[tokio::test]
  async fn test_action_dropped_after_retry_limit() {
    let network = FakeNetwork::new();
    network.unreachable("/api/stuck");
    network.respond_ok("/api/later", "ok");

    let queue = OfflineQueue::new(2);
    queue.enqueue(post("/api/stuck"));

    let first = queue.replay(network.as_ref(), TIMEOUT).await;
    assert_eq!(first.retried, 1);

    queue.enqueue(post("/api/later"));
    let second = queue.replay(network.as_ref(), TIMEOUT).await;
    assert_eq!(second.dropped, 1);
    assert_eq!(second.replayed, 1);
    assert!(queue.is_empty());
    assert_eq!(
      network.calls(),
      vec!["POST /api/stuck", "POST /api/stuck", "POST /api/later"]
    );
  }

  #[tokio::test]
  async fn test_offline_replay_keeps_order_and_counts_retries() {
    let network = FakeNetwork::new();
    network.set_offline(true);

    let queue = OfflineQueue::new(5);
    queue.enqueue(post("/api/a1"));
    queue.enqueue(post("/api/a2"));

    queue.replay(network.as_ref(), TIMEOUT).await;
    queue.replay(network.as_ref(), TIMEOUT).await;

    let pending = queue.pending();
    let kinds: Vec<&str> = pending.iter().map(|a| a.kind.as_str()).collect();
    assert_eq!(kinds, vec!["POST /api/a1", "POST /api/a2"]);
    assert!(pending.iter().all(|a| a.retry_count == 2));
  }

  #[tokio::test]
  async fn test_client_error_is_dropped_immediately() {
    let network = FakeNetwork::new();
    network.respond("/api/invalid", Response::new(422, "invalid listing"));

    let queue = OfflineQueue::new(3);
    queue.enqueue(post("/api/invalid"));

    let report = queue.replay(network.as_ref(), TIMEOUT).await;
    assert_eq!(report.dropped, 1);
    assert!(queue.is_empty());
  }

  #[tokio::test]
  async fn test_timeout_counts_as_failure() {
    let network = FakeNetwork::new();
    network.respond_ok("/api/slow", "ok");
    network.set_delay(Some(Duration::from_millis(100)));

    let queue = OfflineQueue::new(3);
    queue.enqueue(post("/api/slow"));

    let report = queue.replay(network.as_ref(), Duration::from_millis(10)).await;
    assert_eq!(report.retried, 1);
    assert_eq!(queue.len(), 1);
  }
}
