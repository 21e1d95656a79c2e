use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::classifier::{default_rules, StrategyRule};
use crate::error::{CacheError, Result};

const DEFAULT_MAX_AGE_SECONDS: u64 = 7 * 24 * 60 * 60;
const DEFAULT_NETWORK_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_MAX_CONCURRENT_REVALIDATIONS: usize = 8;
const DEFAULT_MAX_SYNC_RETRIES: u32 = 3;
const DEFAULT_SWEEP_INTERVAL_SECONDS: u64 = 24 * 60 * 60;

/// Content class; one partition exists per class and version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionClass {
  Static,
  Dynamic,
  Images,
  Api,
}

impl PartitionClass {
  pub const ALL: [PartitionClass; 4] = [Self::Static, Self::Dynamic, Self::Images, Self::Api];

  pub fn as_str(self) -> &'static str {
    match self {
      Self::Static => "static",
      Self::Dynamic => "dynamic",
      Self::Images => "images",
      Self::Api => "api",
    }
  }
}

impl fmt::Display for PartitionClass {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// How a preload list treats individual failures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PreloadMode {
  /// Any failure aborts the whole batch and nothing is written.
  Strict,
  /// Each resource is fetched and stored independently.
  #[default]
  BestEffort,
}

/// Cache layer configuration.
///
/// Built once and shared as `Arc<CacheConfig>`; never mutated afterwards.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Origin the marketplace is served from
  pub origin: Url,
  /// Path prefix this layer controls
  pub scope: String,
  pub partition_prefix: String,
  /// Deployment version, suffixed to every partition name
  pub version: String,
  /// Preloaded into the static partition at install
  pub critical_resources: Vec<String>,
  /// Preloaded best-effort into the dynamic partition at install
  pub secondary_pages: Vec<String>,
  pub preload_mode: PreloadMode,
  pub max_age_seconds: u64,
  pub network_timeout_ms: u64,
  pub max_concurrent_revalidations: usize,
  pub max_sync_retries: u32,
  pub sweep_interval_seconds: u64,
  /// Activate right after install instead of waiting
  pub skip_waiting: bool,
  /// Classification rules, in precedence order
  pub rules: Vec<StrategyRule>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      origin: Url::parse("http://localhost:3000/").expect("static origin URL is valid"),
      scope: "/".to_string(),
      partition_prefix: "agrimarket".to_string(),
      version: "v2".to_string(),
      critical_resources: vec![
        "/".to_string(),
        "/manifest.json".to_string(),
        "/icons/icon-192x192.png".to_string(),
      ],
      secondary_pages: vec![
        "/marketplace".to_string(),
        "/equipment".to_string(),
        "/crops".to_string(),
        "/profile".to_string(),
      ],
      preload_mode: PreloadMode::BestEffort,
      max_age_seconds: DEFAULT_MAX_AGE_SECONDS,
      network_timeout_ms: DEFAULT_NETWORK_TIMEOUT_MS,
      max_concurrent_revalidations: DEFAULT_MAX_CONCURRENT_REVALIDATIONS,
      max_sync_retries: DEFAULT_MAX_SYNC_RETRIES,
      sweep_interval_seconds: DEFAULT_SWEEP_INTERVAL_SECONDS,
      skip_waiting: false,
      rules: default_rules(),
    }
  }
}

impl CacheConfig {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./marketcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/marketcache/config.yaml
  ///
  /// Falls back to defaults when no file is found.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = match explicit_path {
      Some(p) if p.exists() => Some(p.to_path_buf()),
      Some(p) => {
        return Err(CacheError::Config(format!(
          "Config file not found: {}",
          p.display()
        )))
      }
      None => Self::find_config_file(),
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("marketcache.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("marketcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
      CacheError::Config(format!(
        "Failed to read config file {}: {}",
        path.display(),
        e
      ))
    })?;

    Self::from_yaml(&contents).map_err(|e| match e {
      CacheError::Config(msg) => CacheError::Config(format!("{}: {}", path.display(), msg)),
      other => other,
    })
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: CacheConfig = serde_yaml::from_str(contents)
      .map_err(|e| CacheError::Config(format!("Failed to parse config: {}", e)))?;
    config.validate()
  }

  fn validate(mut self) -> Result<Self> {
    if self.version.trim().is_empty() {
      return Err(CacheError::Config("version must not be empty".to_string()));
    }
    if self.partition_prefix.trim().is_empty() {
      return Err(CacheError::Config(
        "partition_prefix must not be empty".to_string(),
      ));
    }
    if !self.scope.starts_with('/') {
      self.scope = format!("/{}", self.scope);
    }
    self.max_concurrent_revalidations = self.max_concurrent_revalidations.max(1);
    self.max_sync_retries = self.max_sync_retries.max(1);
    Ok(self)
  }

  /// e.g. `agrimarket-images-v2`
  pub fn partition_name(&self, class: PartitionClass) -> String {
    format!("{}-{}-{}", self.partition_prefix, class, self.version)
  }

  /// Partition names belonging to the current version.
  pub fn current_partitions(&self) -> Vec<String> {
    PartitionClass::ALL
      .iter()
      .map(|class| self.partition_name(*class))
      .collect()
  }

  /// Whether a partition was created by this layer (any version).
  pub fn is_managed(&self, partition: &str) -> bool {
    partition
      .strip_prefix(self.partition_prefix.as_str())
      .is_some_and(|rest| rest.starts_with('-'))
  }

  /// Same origin as the configured one and under the scope path.
  pub fn in_scope(&self, url: &Url) -> bool {
    url.origin() == self.origin.origin() && url.path().starts_with(self.scope.as_str())
  }

  pub fn max_age(&self) -> chrono::Duration {
    i64::try_from(self.max_age_seconds)
      .ok()
      .and_then(chrono::Duration::try_seconds)
      .unwrap_or(chrono::Duration::MAX)
  }

  pub fn network_timeout(&self) -> Duration {
    Duration::from_millis(self.network_timeout_ms)
  }

  pub fn sweep_interval(&self) -> Duration {
    Duration::from_secs(self.sweep_interval_seconds.max(1))
  }
}
