//! Cache layer that executes caching strategies over the partition store and
//! the network.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, instrument, warn};

use super::revalidate::RevalidationPool;
use super::traits::{CacheEntry, CacheResult, PartitionStore};
use crate::classifier::Strategy;
use crate::config::{CacheConfig, PartitionClass};
use crate::error::{CacheError, Result};
use crate::network::Network;
use crate::offline::OfflineQueue;
use crate::request::{Request, Response};

/// Network call bounded by `timeout`; a timeout is reported like any other
/// connectivity failure.
pub(crate) async fn fetch_with_timeout<N: Network + ?Sized>(
  network: &N,
  request: &Request,
  timeout: Duration,
) -> Result<Response> {
  match tokio::time::timeout(timeout, network.fetch(request)).await {
    Ok(result) => result,
    Err(_) => Err(CacheError::Timeout {
      url: request.url.to_string(),
      timeout,
    }),
  }
}

/// Write a successful response into `partition`. Write failures are logged,
/// never surfaced: the response is still served.
pub(crate) fn store_response<S: PartitionStore + ?Sized>(
  storage: &S,
  partition: &str,
  request: &Request,
  response: &Response,
) -> bool {
  let key = request.cache_key();
  let entry = CacheEntry::new(key.clone(), response, Utc::now());
  match storage.put(partition, &key, entry) {
    Ok(()) => true,
    Err(e) => {
      warn!(partition, key = %key, error = %e, "failed to store response");
      false
    }
  }
}

/// Cache layer that manages caching logic and network fetching.
pub struct CacheLayer<S: PartitionStore, N: Network> {
  config: Arc<CacheConfig>,
  storage: Arc<S>,
  network: Arc<N>,
  offline: Arc<OfflineQueue>,
  revalidations: Arc<RevalidationPool>,
}

impl<S: PartitionStore, N: Network> CacheLayer<S, N> {
  pub fn new(
    config: Arc<CacheConfig>,
    storage: Arc<S>,
    network: Arc<N>,
    offline: Arc<OfflineQueue>,
  ) -> Self {
    let revalidations = Arc::new(RevalidationPool::new(config.max_concurrent_revalidations));
    Self {
      config,
      storage,
      network,
      offline,
      revalidations,
    }
  }

  pub fn storage(&self) -> &Arc<S> {
    &self.storage
  }

  pub fn network(&self) -> &Arc<N> {
    &self.network
  }

  pub fn revalidations(&self) -> &RevalidationPool {
    &self.revalidations
  }

  pub fn partition(&self, class: PartitionClass) -> String {
    self.config.partition_name(class)
  }

  pub(crate) async fn fetch_network(&self, request: &Request) -> Result<Response> {
    fetch_with_timeout(self.network.as_ref(), request, self.config.network_timeout()).await
  }

  pub(crate) fn store(&self, partition: &str, request: &Request, response: &Response) -> bool {
    store_response(self.storage.as_ref(), partition, request, response)
  }

  /// Read errors are treated as a miss.
  fn lookup(&self, partition: &str, key: &str) -> Option<Arc<CacheEntry>> {
    match self.storage.match_entry(partition, key) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(partition, key, error = %e, "cache read failed, treating as miss");
        None
      }
    }
  }

  /// Serve `request` with the given strategy.
  #[instrument(skip_all, fields(strategy = %strategy, key = %request.cache_key()))]
  pub async fn execute(
    &self,
    strategy: Strategy,
    request: &Request,
  ) -> Result<CacheResult<Response>> {
    match strategy {
      Strategy::StaticFirst => self.static_first(request).await,
      Strategy::CacheFirst => self.cache_first(request).await,
      Strategy::NetworkFirst => self.network_first(request).await,
      Strategy::StaleWhileRevalidate => self.stale_while_revalidate(request).await,
      Strategy::NetworkOnly => self.network_only(request).await,
      Strategy::CacheOnly => self.cache_only(request),
    }
  }

  /// Cached entry from the static partition, else network.
  pub async fn static_first(&self, request: &Request) -> Result<CacheResult<Response>> {
    self.cache_then_network(PartitionClass::Static, request).await
  }

  /// Cached entry from the image partition, else network.
  pub async fn cache_first(&self, request: &Request) -> Result<CacheResult<Response>> {
    self.cache_then_network(PartitionClass::Images, request).await
  }

  async fn cache_then_network(
    &self,
    class: PartitionClass,
    request: &Request,
  ) -> Result<CacheResult<Response>> {
    let partition = self.partition(class);
    let key = request.cache_key();

    if let Some(cached) = self.lookup(&partition, &key) {
      debug!(partition = %partition, outcome = "hit", "serving cached response");
      return Ok(CacheResult::from_cache(cached.to_response(), cached.stored_at));
    }

    // No cache, must fetch from network
    let response = self.fetch_network(request).await?;
    if response.is_success() {
      self.store(&partition, request, &response);
    }
    debug!(
      partition = %partition,
      outcome = "miss",
      status = response.status,
      "fetched from network"
    );
    Ok(CacheResult::from_network(response))
  }

  /// Network, falling back to the dynamic partition when unreachable.
  ///
  /// An origin that answers with an error status is not a failure; its
  /// response is returned without being cached.
  pub async fn network_first(&self, request: &Request) -> Result<CacheResult<Response>> {
    let partition = self.partition(PartitionClass::Dynamic);

    match self.fetch_network(request).await {
      Ok(response) => {
        if response.is_success() {
          self.store(&partition, request, &response);
        }
        Ok(CacheResult::from_network(response))
      }
      Err(e) => match self.lookup(&partition, &request.cache_key()) {
        Some(cached) => {
          debug!(error = %e, outcome = "fallback", "network failed, serving cached response");
          Ok(CacheResult::offline(cached.to_response(), cached.stored_at))
        }
        None => Err(e),
      },
    }
  }

  /// Cached entry immediately plus a background refresh; network on a miss.
  pub async fn stale_while_revalidate(&self, request: &Request) -> Result<CacheResult<Response>> {
    let partition = self.partition(PartitionClass::Api);
    let key = request.cache_key();

    if let Some(cached) = self.lookup(&partition, &key) {
      let scheduled = self.spawn_revalidation(partition, request.clone());
      debug!(outcome = "hit", revalidating = scheduled, "serving cached response");
      return Ok(CacheResult::revalidating(cached.to_response(), cached.stored_at));
    }

    let response = self.fetch_network(request).await?;
    if response.is_success() {
      self.store(&partition, request, &response);
    }
    Ok(CacheResult::from_network(response))
  }

  fn spawn_revalidation(&self, partition: String, request: Request) -> bool {
    let storage = Arc::clone(&self.storage);
    let network = Arc::clone(&self.network);
    let timeout = self.config.network_timeout();
    let key = request.cache_key();

    self.revalidations.spawn(&key, async move {
      match fetch_with_timeout(network.as_ref(), &request, timeout).await {
        Ok(response) if response.is_success() => {
          store_response(storage.as_ref(), &partition, &request, &response);
          debug!(partition = %partition, key = %request.cache_key(), "revalidated");
        }
        Ok(response) => {
          debug!(status = response.status, "revalidation got error status, keeping cached entry");
        }
        Err(e) => {
          debug!(error = %e, "revalidation failed, keeping cached entry");
        }
      }
    })
  }

  /// Network only. Mutations lost to a connectivity failure are queued for
  /// replay before the error is returned.
  pub async fn network_only(&self, request: &Request) -> Result<CacheResult<Response>> {
    match self.fetch_network(request).await {
      Ok(response) => Ok(CacheResult::from_network(response)),
      Err(e) => {
        if request.is_mutating() && e.is_connectivity() {
          self.offline.enqueue(request.clone());
        }
        Err(e)
      }
    }
  }

  /// Dynamic partition only; a miss is an error and the network is never
  /// consulted.
  pub fn cache_only(&self, request: &Request) -> Result<CacheResult<Response>> {
    let partition = self.partition(PartitionClass::Dynamic);
    let key = request.cache_key();
    match self.lookup(&partition, &key) {
      Some(cached) => Ok(CacheResult::from_cache(cached.to_response(), cached.stored_at)),
      None => Err(CacheError::NotInCache { key }),
    }
  }
}

impl<S: PartitionStore, N: Network> Clone for CacheLayer<S, N> {
  fn clone(&self) -> Self {
    Self {
      config: Arc::clone(&self.config),
      storage: Arc::clone(&self.storage),
      network: Arc::clone(&self.network),
      offline: Arc::clone(&self.offline),
      revalidations: Arc::clone(&self.revalidations),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, MemoryStorage};
  use crate::testing::{self, get, url, FakeNetwork};
  use reqwest::Method;
  use std::time::Instant;

  fn layer_with(
    config: CacheConfig,
    network: &Arc<FakeNetwork>,
  ) -> (CacheLayer<MemoryStorage, FakeNetwork>, Arc<OfflineQueue>) {
    let offline = Arc::new(OfflineQueue::new(config.max_sync_retries));
    let layer = CacheLayer::new(
      Arc::new(config),
      Arc::new(MemoryStorage::new()),
      Arc::clone(network),
      Arc::clone(&offline),
    );
    (layer, offline)
  }

  fn layer(network: &Arc<FakeNetwork>) -> CacheLayer<MemoryStorage, FakeNetwork> {
    layer_with(testing::config(), network).0
  }

  fn seed(
    layer: &CacheLayer<MemoryStorage, FakeNetwork>,
    class: PartitionClass,
    path: &str,
    body: &str,
  ) {
    layer.store(&layer.partition(class), &get(path), &Response::ok(body));
  }

  #[tokio::test]
  async fn test_static_first_stores_then_serves_from_cache() {
    let network = FakeNetwork::new();
    network.respond_ok("/style.css", "body { color: green }");
    let layer = layer(&network);

    let first = layer.static_first(&get("/style.css")).await.unwrap();
    assert_eq!(first.source, CacheSource::Network);

    let stored = layer
      .storage()
      .match_entry("agrimarket-static-v2", &get("/style.css").cache_key())
      .unwrap()
      .expect("stored in static partition");
    assert_eq!(stored.body, b"body { color: green }");

    let second = layer.static_first(&get("/style.css")).await.unwrap();
    assert_eq!(second.source, CacheSource::Cache);
    assert_eq!(second.data.body, first.data.body);
    assert_eq!(network.call_count(), 1);
  }

  #[tokio::test]
  async fn test_static_first_propagates_network_error_without_cache() {
    let network = FakeNetwork::new();
    network.set_offline(true);
    let layer = layer(&network);

    let err = layer.static_first(&get("/app.js")).await.unwrap_err();
    assert!(err.is_connectivity());
  }

  #[tokio::test]
  async fn test_cache_first_uses_image_partition() {
    let network = FakeNetwork::new();
    network.respond_ok("/images/tractor.png", "png-bytes");
    let layer = layer(&network);

    layer.cache_first(&get("/images/tractor.png")).await.unwrap();

    let storage = layer.storage();
    assert_eq!(storage.len("agrimarket-images-v2").unwrap(), 1);
    assert_eq!(storage.len("agrimarket-static-v2").unwrap(), 0);
  }

  #[tokio::test]
  async fn test_error_status_is_returned_but_not_stored() {
    let network = FakeNetwork::new();
    let layer = layer(&network);

    let result = layer.static_first(&get("/missing.css")).await.unwrap();
    assert_eq!(result.data.status, 404);
    assert_eq!(layer.storage().len("agrimarket-static-v2").unwrap(), 0);
  }

  #[tokio::test]
  async fn test_network_first_stores_and_falls_back() {
    let network = FakeNetwork::new();
    network.respond_ok("/listings", "fresh listings");
    let layer = layer(&network);

    let online = layer.network_first(&get("/listings")).await.unwrap();
    assert_eq!(online.source, CacheSource::Network);

    network.set_offline(true);
    let offline = layer.network_first(&get("/listings")).await.unwrap();
    assert_eq!(offline.source, CacheSource::CacheFallback);
    assert_eq!(offline.data.text(), "fresh listings");
  }

  #[tokio::test]
  async fn test_network_first_without_cache_propagates() {
    let network = FakeNetwork::new();
    network.set_offline(true);
    let layer = layer(&network);

    assert!(layer.network_first(&get("/listings")).await.is_err());
  }

  #[tokio::test]
  async fn test_network_first_timeout_falls_back_to_cache() {
    let network = FakeNetwork::new();
    network.respond_ok("/listings", "new");
    let layer = layer(&network);
    seed(&layer, PartitionClass::Dynamic, "/listings", "cached");

    network.set_delay(Some(Duration::from_secs(2)));
    let started = Instant::now();
    let result = layer.network_first(&get("/listings")).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(result.source, CacheSource::CacheFallback);
    assert_eq!(result.data.text(), "cached");
  }

  #[tokio::test]
  async fn test_network_first_timeout_without_cache_is_timeout_error() {
    let network = FakeNetwork::new();
    network.set_delay(Some(Duration::from_secs(2)));
    let layer = layer(&network);

    let err = layer.network_first(&get("/listings")).await.unwrap_err();
    assert!(matches!(err, CacheError::Timeout { .. }));
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_miss_awaits_network() {
    let network = FakeNetwork::new();
    network.respond_ok("/api/equipment", r#"[{"id":1,"name":"Harvester"}]"#);
    let layer = layer(&network);

    let result = layer.stale_while_revalidate(&get("/api/equipment")).await.unwrap();
    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data.text(), r#"[{"id":1,"name":"Harvester"}]"#);
    assert_eq!(layer.storage().len("agrimarket-api-v2").unwrap(), 1);
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_serves_stale_then_refreshes() {
    let network = FakeNetwork::new();
    network.respond_ok("/api/equipment", "refreshed");
    let layer = layer(&network);
    seed(&layer, PartitionClass::Api, "/api/equipment", "stale");

    // Slower than the test would tolerate if the call waited on it
    network.set_delay(Some(Duration::from_millis(150)));
    let started = Instant::now();
    let served = layer.stale_while_revalidate(&get("/api/equipment")).await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(100));
    assert_eq!(served.source, CacheSource::Revalidating);
    assert_eq!(served.data.text(), "stale");

    layer.revalidations().drain().await;
    network.set_delay(None);

    let after = layer.stale_while_revalidate(&get("/api/equipment")).await.unwrap();
    assert_eq!(after.data.text(), "refreshed");
    layer.revalidations().drain().await;
  }

  #[tokio::test]
  async fn test_failed_revalidation_keeps_cached_entry() {
    let network = FakeNetwork::new();
    network.set_offline(true);
    let layer = layer(&network);
    seed(&layer, PartitionClass::Api, "/api/equipment", "stale");

    layer.stale_while_revalidate(&get("/api/equipment")).await.unwrap();
    layer.revalidations().drain().await;

    let again = layer.stale_while_revalidate(&get("/api/equipment")).await.unwrap();
    assert_eq!(again.data.text(), "stale");
  }

  #[tokio::test]
  async fn test_revalidations_beyond_cap_are_dropped() {
    let network = FakeNetwork::new();
    network.set_delay(Some(Duration::from_millis(50)));
    let config = CacheConfig {
      max_concurrent_revalidations: 1,
      ..testing::config()
    };
    let (layer, _) = layer_with(config, &network);
    seed(&layer, PartitionClass::Api, "/api/a", "a");
    seed(&layer, PartitionClass::Api, "/api/b", "b");

    layer.stale_while_revalidate(&get("/api/a")).await.unwrap();
    layer.stale_while_revalidate(&get("/api/b")).await.unwrap();
    layer.revalidations().drain().await;

    assert_eq!(network.calls(), vec!["GET /api/a"]);
  }

  #[tokio::test]
  async fn test_network_only_never_touches_partitions() {
    let network = FakeNetwork::new();
    network.respond_ok("/auth/session", "token");
    let layer = layer(&network);

    layer.network_only(&get("/auth/session")).await.unwrap();
    assert!(layer.storage().partition_names().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_network_only_queues_mutation_on_connectivity_loss() {
    let network = FakeNetwork::new();
    network.set_offline(true);
    let (layer, offline) = layer_with(testing::config(), &network);

    let request = Request::new(Method::POST, url("/api/listings")).with_body("{}");
    assert!(layer.network_only(&request).await.is_err());
    assert_eq!(offline.len(), 1);

    // Reads are not queued
    assert!(layer.network_only(&get("/api/listings")).await.is_err());
    assert_eq!(offline.len(), 1);
  }

  #[tokio::test]
  async fn test_server_rejection_is_not_queued() {
    let network = FakeNetwork::new();
    network.respond("/api/listings", Response::new(500, "boom"));
    let (layer, offline) = layer_with(testing::config(), &network);

    let request = Request::new(Method::POST, url("/api/listings"));
    let result = layer.network_only(&request).await.unwrap();
    assert_eq!(result.data.status, 500);
    assert!(offline.is_empty());
  }

  #[tokio::test]
  async fn test_cache_only() {
    let network = FakeNetwork::new();
    let layer = layer(&network);

    let err = layer.cache_only(&get("/report")).unwrap_err();
    assert!(matches!(err, CacheError::NotInCache { .. }));

    seed(&layer, PartitionClass::Dynamic, "/report", "saved report");
    let hit = layer.cache_only(&get("/report")).unwrap();
    assert_eq!(hit.source, CacheSource::Cache);
    assert_eq!(hit.data.text(), "saved report");
    assert_eq!(network.call_count(), 0);
  }

  #[tokio::test]
  async fn test_execute_dispatches_to_strategy() {
    let network = FakeNetwork::new();
    let layer = layer(&network);
    seed(&layer, PartitionClass::Dynamic, "/report", "saved");

    let result = layer.execute(Strategy::CacheOnly, &get("/report")).await.unwrap();
    assert_eq!(result.data.text(), "saved");
  }
}
