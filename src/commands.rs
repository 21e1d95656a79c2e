//! Control messages accepted by the worker and the replies it sends back.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};

/// A control message, tagged by `type`:
///
/// ```json
/// {"type": "DELETE_CACHE", "nameSubstring": "images"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
  /// Activate now instead of waiting for existing clients to go away.
  ForceActivate,
  /// Fetch and store these URLs in the dynamic partition.
  CacheUrls { urls: Vec<String> },
  /// Delete every partition whose name contains the substring.
  #[serde(rename_all = "camelCase")]
  DeleteCache { name_substring: String },
  GetCacheInfo,
  /// Delete every partition this layer manages.
  ClearCache,
}

impl Command {
  pub fn from_json(message: &str) -> Result<Self> {
    serde_json::from_str(message).map_err(|source| CacheError::Serialization {
      what: "command",
      source,
    })
  }

  pub fn name(&self) -> &'static str {
    match self {
      Self::ForceActivate => "FORCE_ACTIVATE",
      Self::CacheUrls { .. } => "CACHE_URLS",
      Self::DeleteCache { .. } => "DELETE_CACHE",
      Self::GetCacheInfo => "GET_CACHE_INFO",
      Self::ClearCache => "CLEAR_CACHE",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandReply {
  /// Partitions removed during activation
  Activated { deleted: Vec<String> },
  UrlsCached { cached: Vec<String>, failed: Vec<String> },
  CacheDeleted { deleted: Vec<String> },
  /// Entry count per partition
  CacheInfo { partitions: BTreeMap<String, usize> },
  CacheCleared { success: bool, deleted: Vec<String> },
}

impl CommandReply {
  pub fn to_json(&self) -> Result<String> {
    serde_json::to_string(self).map_err(|source| CacheError::Serialization {
      what: "command reply",
      source,
    })
  }
}
