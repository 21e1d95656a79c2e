//! Error type shared by the cache layer.

use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CacheError>;

#[derive(Debug, Error)]
pub enum CacheError {
  /// Transport-level failure: the origin could not be reached.
  #[error("network request to {url} failed: {message}")]
  Network { url: String, message: String },

  #[error("network request to {url} timed out after {timeout:?}")]
  Timeout { url: String, timeout: Duration },

  /// Raised only by the cache-only strategy.
  #[error("no cached entry for {key}")]
  NotInCache { key: String },

  #[error("{context}: {source}")]
  Storage {
    context: &'static str,
    #[source]
    source: rusqlite::Error,
  },

  #[error("failed to (de)serialize {what}: {source}")]
  Serialization {
    what: &'static str,
    #[source]
    source: serde_json::Error,
  },

  #[error("invalid url '{input}': {source}")]
  InvalidUrl {
    input: String,
    #[source]
    source: url::ParseError,
  },

  /// Strict preload aborted because at least one resource failed.
  #[error("preload aborted, {} resource(s) failed: {}", failed.len(), failed.join(", "))]
  Preload { failed: Vec<String> },

  #[error("configuration error: {0}")]
  Config(String),

  #[error("cannot {action} while {state}")]
  Lifecycle { action: &'static str, state: String },
}

impl CacheError {
  pub(crate) fn storage(context: &'static str, source: rusqlite::Error) -> Self {
    Self::Storage { context, source }
  }

  /// True for failures caused by losing the connection (including timeouts),
  /// as opposed to the origin answering with an error.
  pub fn is_connectivity(&self) -> bool {
    matches!(self, Self::Network { .. } | Self::Timeout { .. })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn connectivity_classification() {
    let network = CacheError::Network {
      url: "https://example.test/".into(),
      message: "connection refused".into(),
    };
    let timeout = CacheError::Timeout {
      url: "https://example.test/".into(),
      timeout: Duration::from_millis(5),
    };
    let miss = CacheError::NotInCache {
      key: "GET https://example.test/".into(),
    };

    assert!(network.is_connectivity());
    assert!(timeout.is_connectivity());
    assert!(!miss.is_connectivity());
  }

  #[test]
  fn preload_error_lists_failures() {
    let err = CacheError::Preload {
      failed: vec!["/a.css".into(), "/b.js".into()],
    };
    assert_eq!(
      err.to_string(),
      "preload aborted, 2 resource(s) failed: /a.css, /b.js"
    );
  }
}
