//! Test doubles shared by the unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::network::Network;
use crate::request::{Request, Response};

pub const ORIGIN: &str = "https://market.test/";

pub fn config() -> CacheConfig {
  CacheConfig {
    origin: Url::parse(ORIGIN).unwrap(),
    network_timeout_ms: 200,
    ..CacheConfig::default()
  }
}

pub fn url(path: &str) -> Url {
  Url::parse(ORIGIN).unwrap().join(path).unwrap()
}

pub fn get(path: &str) -> Request {
  Request::get(url(path))
}

pub fn navigate(path: &str) -> Request {
  Request::navigate(url(path))
}

/// Scripted origin keyed by path. Unknown paths answer 404.
#[derive(Default)]
pub struct FakeNetwork {
  routes: Mutex<HashMap<String, Response>>,
  unreachable: Mutex<Vec<String>>,
  calls: Mutex<Vec<String>>,
  offline: AtomicBool,
  delay: Mutex<Option<Duration>>,
}

impl FakeNetwork {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn respond(&self, path: &str, response: Response) {
    self
      .routes
      .lock()
      .unwrap()
      .insert(path.to_string(), response);
  }

  pub fn respond_ok(&self, path: &str, body: &str) {
    self.respond(path, Response::ok(body));
  }

  /// Connection failures for this path only.
  pub fn unreachable(&self, path: &str) {
    self.unreachable.lock().unwrap().push(path.to_string());
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn set_delay(&self, delay: Option<Duration>) {
    *self.delay.lock().unwrap() = delay;
  }

  /// `METHOD path` of every request received, in order.
  pub fn calls(&self) -> Vec<String> {
    self.calls.lock().unwrap().clone()
  }

  pub fn call_count(&self) -> usize {
    self.calls.lock().unwrap().len()
  }
}

#[async_trait]
impl Network for FakeNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let path = request.url.path().to_string();
    self
      .calls
      .lock()
      .unwrap()
      .push(format!("{} {}", request.method, path));

    let delay = *self.delay.lock().unwrap();
    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }

    if self.offline.load(Ordering::SeqCst) || self.unreachable.lock().unwrap().contains(&path) {
      return Err(CacheError::Network {
        url: request.url.to_string(),
        message: "connection refused".to_string(),
      });
    }

    Ok(
      self
        .routes
        .lock()
        .unwrap()
        .get(&path)
        .cloned()
        .unwrap_or_else(|| Response::new(404, "not found")),
    )
  }
}
