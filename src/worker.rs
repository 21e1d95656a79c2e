//! Lifecycle controller.
//!
//! The [`CacheWorker`] is the entry point the host drives: install and
//! activate signals, control messages, sync and cleanup triggers, and every
//! intercepted request. Each handler returns a value describing what it did
//! so the host decides how to deliver it.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures::future::join_all;
use reqwest::Method;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::cache::{
  fetch_with_timeout, lock, store_response, CacheLayer, CacheResult, CacheSource, PartitionStore,
};
use crate::classifier::Classifier;
use crate::commands::{Command, CommandReply};
use crate::config::{CacheConfig, PartitionClass, PreloadMode};
use crate::error::{CacheError, Result};
use crate::eviction::{self, SweepReport, CLEANUP_TAG};
use crate::network::Network;
use crate::offline::{OfflineQueue, SyncReport};
use crate::request::{Request, Response};

/// Trigger tag for replaying the offline queue.
pub const SYNC_TAG: &str = "background-sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerState {
  Installing,
  /// Installed and waiting to take over from the previous version
  Installed,
  Activating,
  Activated,
}

impl fmt::Display for WorkerState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::Installing => "installing",
      Self::Installed => "installed",
      Self::Activating => "activating",
      Self::Activated => "activated",
    };
    f.write_str(name)
  }
}

/// URLs stored and URLs that could not be fetched, in input order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PreloadReport {
  pub stored: Vec<String>,
  pub failed: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InstallReport {
  pub critical: PreloadReport,
  pub secondary: PreloadReport,
  /// Partitions removed, when activation followed install immediately
  pub activated: Option<Vec<String>>,
}

/// Result of delivering a tagged trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum Signal<T> {
  Handled(T),
  /// The tag is not one this worker listens to
  Ignored { tag: String },
}

/// Clears the install-in-progress flag when an install ends, however it ends.
struct InstallGuard<'a>(&'a AtomicBool);

impl Drop for InstallGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

pub struct CacheWorker<S: PartitionStore, N: Network> {
  config: Arc<CacheConfig>,
  classifier: Classifier,
  layer: CacheLayer<S, N>,
  offline: Arc<OfflineQueue>,
  state: Mutex<WorkerState>,
  installing: AtomicBool,
  controlling: AtomicBool,
}

impl<S: PartitionStore, N: Network> CacheWorker<S, N> {
  pub fn new(config: Arc<CacheConfig>, storage: Arc<S>, network: Arc<N>) -> Self {
    let offline = Arc::new(OfflineQueue::new(config.max_sync_retries));
    let classifier = Classifier::new(config.rules.clone());
    let layer = CacheLayer::new(Arc::clone(&config), storage, network, Arc::clone(&offline));
    Self {
      config,
      classifier,
      layer,
      offline,
      state: Mutex::new(WorkerState::Installing),
      installing: AtomicBool::new(false),
      controlling: AtomicBool::new(false),
    }
  }

  pub fn config(&self) -> &CacheConfig {
    &self.config
  }

  pub fn layer(&self) -> &CacheLayer<S, N> {
    &self.layer
  }

  pub fn offline(&self) -> &OfflineQueue {
    &self.offline
  }

  pub fn state(&self) -> WorkerState {
    *lock::lock(&self.state, "worker.state")
  }

  fn set_state(&self, state: WorkerState) {
    let mut current = lock::lock(&self.state, "worker.set_state");
    if *current != state {
      info!(from = %*current, to = %state, "worker state changed");
      *current = state;
    }
  }

  /// Whether already-open clients are served by this worker.
  pub fn is_controlling(&self) -> bool {
    self.controlling.load(Ordering::Acquire)
  }

  /// Absolute URL of the control scope.
  pub fn scope_url(&self) -> Result<Url> {
    self
      .config
      .origin
      .join(&self.config.scope)
      .map_err(|source| CacheError::InvalidUrl {
        input: self.config.scope.clone(),
        source,
      })
  }

  /// Preload the critical resources into the static partition and the
  /// secondary pages into the dynamic one.
  ///
  /// In strict mode a single failing critical resource aborts the install:
  /// nothing is written, not even an empty partition, and the worker stays
  /// in `Installing`. Only one install runs at a time.
  pub async fn handle_install(&self) -> Result<InstallReport> {
    let _guard = self.begin_install()?;

    let static_partition = self.config.partition_name(PartitionClass::Static);
    let critical = self
      .preload(
        &static_partition,
        &self.config.critical_resources,
        self.config.preload_mode,
      )
      .await?;
    self.layer.storage().open(&static_partition)?;

    let dynamic_partition = self.config.partition_name(PartitionClass::Dynamic);
    let secondary = self
      .preload(
        &dynamic_partition,
        &self.config.secondary_pages,
        PreloadMode::BestEffort,
      )
      .await?;

    self.set_state(WorkerState::Installed);
    info!(
      critical = critical.stored.len(),
      secondary = secondary.stored.len(),
      failed = critical.failed.len() + secondary.failed.len(),
      "install complete"
    );

    let activated = if self.config.skip_waiting {
      Some(self.handle_activate()?)
    } else {
      None
    };

    Ok(InstallReport {
      critical,
      secondary,
      activated,
    })
  }

  fn begin_install(&self) -> Result<InstallGuard<'_>> {
    let state = lock::lock(&self.state, "worker.begin_install");
    if *state != WorkerState::Installing || self.installing.swap(true, Ordering::AcqRel) {
      return Err(CacheError::Lifecycle {
        action: "install",
        state: state.to_string(),
      });
    }
    Ok(InstallGuard(&self.installing))
  }

  /// Take over a store filled by an earlier install of the same version,
  /// skipping the preload. Returns `false` and changes nothing when the
  /// current static partition does not exist yet.
  pub fn resume(&self) -> Result<bool> {
    let static_partition = self.config.partition_name(PartitionClass::Static);
    if !self
      .layer
      .storage()
      .partition_names()?
      .contains(&static_partition)
    {
      return Ok(false);
    }

    {
      let mut state = lock::lock(&self.state, "worker.resume");
      if self.installing.load(Ordering::Acquire) {
        return Err(CacheError::Lifecycle {
          action: "resume",
          state: state.to_string(),
        });
      }
      if *state == WorkerState::Installing {
        info!(partition = %static_partition, "resuming from existing install");
        *state = WorkerState::Installed;
      }
    }

    self.handle_activate()?;
    Ok(true)
  }

  /// Fetch `urls` concurrently and store the successful responses.
  async fn preload(
    &self,
    partition: &str,
    urls: &[String],
    mode: PreloadMode,
  ) -> Result<PreloadReport> {
    let network = self.layer.network();
    let timeout = self.config.network_timeout();

    let fetches = urls.iter().map(|input| async move {
      let request = match Request::resolve(Method::GET, &self.config.origin, input) {
        Ok(request) => request,
        Err(e) => {
          warn!(url = %input, error = %e, "skipping preload of invalid url");
          return (input, None);
        }
      };
      match fetch_with_timeout(network.as_ref(), &request, timeout).await {
        Ok(response) if response.is_success() => (input, Some((request, response))),
        Ok(response) => {
          warn!(url = %input, status = response.status, "preload got error status");
          (input, None)
        }
        Err(e) => {
          warn!(url = %input, error = %e, "preload fetch failed");
          (input, None)
        }
      }
    });
    let results = join_all(fetches).await;

    let failed: Vec<String> = results
      .iter()
      .filter(|(_, fetched)| fetched.is_none())
      .map(|(input, _)| input.to_string())
      .collect();
    if mode == PreloadMode::Strict && !failed.is_empty() {
      return Err(CacheError::Preload { failed });
    }

    let mut report = PreloadReport {
      failed,
      ..PreloadReport::default()
    };
    for (input, fetched) in results {
      if let Some((request, response)) = fetched {
        if store_response(self.layer.storage().as_ref(), partition, &request, &response) {
          report.stored.push(input.to_string());
        } else {
          report.failed.push(input.to_string());
        }
      }
    }

    debug!(
      partition,
      stored = report.stored.len(),
      failed = report.failed.len(),
      "preload finished"
    );
    Ok(report)
  }

  /// Delete every partition outside the current version and take control of
  /// open clients. Returns the deleted partition names.
  ///
  /// A failed cleanup leaves the worker in the state it had before the call.
  pub fn handle_activate(&self) -> Result<Vec<String>> {
    let previous = {
      let mut state = lock::lock(&self.state, "worker.handle_activate");
      if matches!(*state, WorkerState::Installing | WorkerState::Activating) {
        return Err(CacheError::Lifecycle {
          action: "activate",
          state: state.to_string(),
        });
      }
      info!(from = %*state, to = %WorkerState::Activating, "worker state changed");
      std::mem::replace(&mut *state, WorkerState::Activating)
    };

    let deleted = match self
      .layer
      .storage()
      .delete_all_except(&self.config.current_partitions())
    {
      Ok(deleted) => deleted,
      Err(e) => {
        warn!(error = %e, "activation cleanup failed");
        self.set_state(previous);
        return Err(e);
      }
    };
    for name in &deleted {
      info!(partition = %name, "deleted outdated partition");
    }

    self.controlling.store(true, Ordering::Release);
    self.set_state(WorkerState::Activated);
    Ok(deleted)
  }

  #[instrument(skip_all, fields(command = command.name()))]
  pub async fn handle_command(&self, command: Command) -> Result<CommandReply> {
    let storage = self.layer.storage();

    match command {
      Command::ForceActivate => Ok(CommandReply::Activated {
        deleted: self.handle_activate()?,
      }),

      Command::CacheUrls { urls } => {
        let partition = self.config.partition_name(PartitionClass::Dynamic);
        let report = self.preload(&partition, &urls, PreloadMode::BestEffort).await?;
        Ok(CommandReply::UrlsCached {
          cached: report.stored,
          failed: report.failed,
        })
      }

      Command::DeleteCache { name_substring } => {
        let mut deleted = Vec::new();
        if !name_substring.is_empty() {
          for name in storage.partition_names()? {
            if name.contains(&name_substring) && storage.delete_partition(&name)? {
              deleted.push(name);
            }
          }
        }
        info!(pattern = %name_substring, deleted = deleted.len(), "deleted partitions");
        Ok(CommandReply::CacheDeleted { deleted })
      }

      Command::GetCacheInfo => {
        let mut partitions = std::collections::BTreeMap::new();
        for name in storage.partition_names()? {
          let count = storage.len(&name)?;
          partitions.insert(name, count);
        }
        Ok(CommandReply::CacheInfo { partitions })
      }

      Command::ClearCache => {
        let mut deleted = Vec::new();
        let mut success = true;
        for name in storage.partition_names()? {
          if !self.config.is_managed(&name) {
            continue;
          }
          match storage.delete_partition(&name) {
            Ok(_) => deleted.push(name),
            Err(e) => {
              warn!(partition = %name, error = %e, "failed to clear partition");
              success = false;
            }
          }
        }
        info!(deleted = deleted.len(), success, "cleared cache");
        Ok(CommandReply::CacheCleared { success, deleted })
      }
    }
  }

  /// Parse a JSON control message and handle it.
  pub async fn handle_message(&self, message: &str) -> Result<CommandReply> {
    let command = Command::from_json(message)?;
    self.handle_command(command).await
  }

  /// Replay the offline queue when `tag` is the sync tag.
  pub async fn handle_sync(&self, tag: &str) -> Signal<SyncReport> {
    if tag != SYNC_TAG {
      debug!(tag, "ignoring sync trigger");
      return Signal::Ignored { tag: tag.to_string() };
    }
    let report = self
      .offline
      .replay(self.layer.network().as_ref(), self.config.network_timeout())
      .await;
    Signal::Handled(report)
  }

  /// Run an eviction sweep when `tag` is the cleanup tag.
  pub fn handle_periodic_sweep(&self, tag: &str) -> Signal<SweepReport> {
    if tag != CLEANUP_TAG {
      debug!(tag, "ignoring periodic trigger");
      return Signal::Ignored { tag: tag.to_string() };
    }
    let report = eviction::sweep(
      self.layer.storage().as_ref(),
      self.config.max_age(),
      Utc::now(),
    );
    Signal::Handled(report)
  }

  /// Serve an intercepted request.
  ///
  /// Until activation, and for URLs outside the scope, requests go straight
  /// to the network and no partition is touched.
  ///
  /// Failures become the offline page for navigations and a synthetic 503
  /// for everything else. A cache-only miss is returned as an error.
  #[instrument(skip_all, fields(method = %request.method, url = %request.url))]
  pub async fn handle_request(&self, request: Request) -> Result<CacheResult<Response>> {
    if !self.config.in_scope(&request.url) {
      debug!("request outside scope, passing through");
      return self.pass_through(&request).await;
    }
    if !self.is_controlling() {
      debug!(state = %self.state(), "not controlling yet, passing through");
      return self.pass_through(&request).await;
    }

    let strategy = self.classifier.classify(&request);
    match self.layer.execute(strategy, &request).await {
      Ok(result) => {
        debug!(
          strategy = %strategy,
          source = ?result.source,
          status = result.data.status,
          "served"
        );
        Ok(result)
      }
      Err(e @ CacheError::NotInCache { .. }) => Err(e),
      Err(e) if request.is_navigation() => {
        warn!(strategy = %strategy, error = %e, "navigation failed, serving offline page");
        Ok(CacheResult::synthetic(
          Response::offline_page(),
          CacheSource::OfflinePage,
        ))
      }
      Err(e) => {
        warn!(strategy = %strategy, error = %e, "request failed, serving synthetic response");
        Ok(CacheResult::synthetic(
          Response::synthetic_failure(),
          CacheSource::Synthetic,
        ))
      }
    }
  }

  async fn pass_through(&self, request: &Request) -> Result<CacheResult<Response>> {
    let response = self.layer.fetch_network(request).await?;
    Ok(CacheResult::from_network(response))
  }

  /// Wait for background revalidations to finish.
  pub async fn drain(&self) {
    self.layer.revalidations().drain().await;
  }

  /// Abort background revalidations.
  pub fn shutdown(&self) {
    self.layer.revalidations().shutdown();
  }
}
