//! Request and response values flowing through the cache layer.

use reqwest::Method;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{CacheError, Result};

/// Bundled page served when a navigation can be satisfied by neither the
/// network nor the cache.
pub const OFFLINE_PAGE: &str = include_str!("assets/offline.html");

/// What the host declared the request is for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequestMode {
  /// Top-level page navigation.
  Navigate,
  /// Anything else: scripts, images, API calls.
  #[default]
  Subresource,
}

/// An intercepted outgoing request.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub mode: RequestMode,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      mode: RequestMode::Subresource,
      headers: Vec::new(),
      body: None,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  /// A GET issued as a page navigation.
  pub fn navigate(url: Url) -> Self {
    Self {
      mode: RequestMode::Navigate,
      ..Self::get(url)
    }
  }

  /// Resolve `input` (absolute URL or origin-relative path) against `origin`.
  pub fn resolve(method: Method, origin: &Url, input: &str) -> Result<Self> {
    let url = origin.join(input).map_err(|source| CacheError::InvalidUrl {
      input: input.to_string(),
      source,
    })?;
    Ok(Self::new(method, url))
  }

  pub fn with_mode(mut self, mode: RequestMode) -> Self {
    self.mode = mode;
    self
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = Some(body.into());
    self
  }

  /// Cache key: method and full URL.
  pub fn cache_key(&self) -> String {
    format!("{} {}", self.method, self.url)
  }

  pub fn is_navigation(&self) -> bool {
    self.mode == RequestMode::Navigate
  }

  /// Anything other than GET/HEAD changes server state.
  pub fn is_mutating(&self) -> bool {
    self.method != Method::GET && self.method != Method::HEAD
  }

  pub fn path(&self) -> &str {
    self.url.path()
  }

  /// Lowercased extension of the last path segment, if any.
  pub fn extension(&self) -> Option<String> {
    let segment = self.url.path_segments()?.next_back()?;
    let (stem, ext) = segment.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
      return None;
    }
    Some(ext.to_ascii_lowercase())
  }
}

/// A response as served to the host, and as stored in a partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  pub fn ok(body: impl Into<Vec<u8>>) -> Self {
    Self::new(200, body)
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  /// 2xx; only these are written to a partition.
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Case-insensitive header lookup.
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }

  /// Generic failure returned for non-navigation requests.
  pub fn synthetic_failure() -> Self {
    Self::new(503, "Service Unavailable").with_header("content-type", "text/plain; charset=utf-8")
  }

  pub fn offline_page() -> Self {
    Self::new(503, OFFLINE_PAGE).with_header("content-type", "text/html; charset=utf-8")
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
  }

  #[test]
  fn test_cache_key_includes_method_and_url() {
    let req = Request::get(url("https://market.test/api/equipment?page=2"));
    assert_eq!(req.cache_key(), "GET https://market.test/api/equipment?page=2");
  }

  #[test]
  fn test_extension() {
    assert_eq!(
      Request::get(url("https://market.test/css/Site.CSS")).extension(),
      Some("css".to_string())
    );
    assert_eq!(Request::get(url("https://market.test/marketplace")).extension(), None);
    assert_eq!(Request::get(url("https://market.test/.hidden")).extension(), None);
    assert_eq!(Request::get(url("https://market.test/")).extension(), None);
  }

  #[test]
  fn test_mutating_methods() {
    let base = url("https://market.test/api/listings");
    assert!(!Request::get(base.clone()).is_mutating());
    assert!(!Request::new(Method::HEAD, base.clone()).is_mutating());
    assert!(Request::new(Method::POST, base.clone()).is_mutating());
    assert!(Request::new(Method::DELETE, base).is_mutating());
  }

  #[test]
  fn test_resolve_relative_path() {
    let origin = url("https://market.test/");
    let req = Request::resolve(Method::GET, &origin, "/style.css").unwrap();
    assert_eq!(req.url.as_str(), "https://market.test/style.css");
  }

  #[test]
  fn test_offline_page_has_retry_control() {
    let page = Response::offline_page();
    assert_eq!(page.header("Content-Type"), Some("text/html; charset=utf-8"));
    assert!(page.text().contains("id=\"retry\""));
  }
}
