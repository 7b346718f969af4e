//! The offline worker: install, fetch and activate handlers over one cache
//! store and one network.

use color_eyre::Result;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::cache::{CacheLayer, CacheResult, CacheStorage};
use crate::config::WorkerConfig;
use crate::lifecycle::{Lifecycle, WorkerState};
use crate::manifest;
use crate::net::{Fetcher, Request, RequestKey, Response};

/// What the install handler achieved. Install never fails outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
  /// Every manifest asset was stored
  Populated { entries: usize },
  /// Nothing from the manifest was stored; the reason was logged
  Failed,
}

pub struct OfflineWorker<S: CacheStorage, N: Fetcher> {
  config: WorkerConfig,
  cache: CacheLayer<S>,
  network: N,
}

impl<S: CacheStorage + 'static, N: Fetcher> OfflineWorker<S, N> {
  pub fn new(config: WorkerConfig, storage: Arc<S>, network: N) -> Self {
    let cache = CacheLayer::new(storage, config.cache_name.clone());
    Self {
      config,
      cache,
      network,
    }
  }

  pub fn config(&self) -> &WorkerConfig {
    &self.config
  }

  pub fn cache_name(&self) -> &str {
    self.cache.cache_name()
  }

  pub fn storage(&self) -> &Arc<S> {
    self.cache.storage()
  }

  /// Lifecycle picked up from where an earlier run of this version left it.
  /// A version never seen before starts out parsed.
  pub fn saved_lifecycle(&self) -> Result<Lifecycle> {
    let state = self.storage().worker_state(self.cache_name())?;
    Ok(Lifecycle::resume(state.unwrap_or_default()))
  }

  /// Record a settled lifecycle state for this version.
  pub fn save_state(&self, state: WorkerState) -> Result<()> {
    self.storage().set_worker_state(self.cache_name(), state)
  }

  /// The asset manifest resolved against the scope.
  pub fn manifest(&self) -> Result<Vec<Request>> {
    manifest::resolve(&self.config.scope, &self.config.assets)
  }

  /// Install: open the current cache and precache the manifest as one batch.
  pub async fn on_install(&self) -> InstallOutcome {
    match self.populate().await {
      Ok(entries) => {
        info!(cache = %self.cache_name(), entries, "Precached app shell");
        InstallOutcome::Populated { entries }
      }
      Err(e) => {
        error!(cache = %self.cache_name(), "Initial caching of assets failed: {:#}", e);
        InstallOutcome::Failed
      }
    }
  }

  async fn populate(&self) -> Result<usize> {
    self.storage().open(self.cache_name())?;
    info!(cache = %self.cache_name(), "Cache opened, storing assets");

    let requests = self.manifest()?;
    self
      .cache
      .add_all(requests, |request| self.network.fetch(request))
      .await
  }

  /// Fetch: answer from cache, else from the network.
  ///
  /// `None` means no response could be produced and the caller gets the
  /// host's own network error.
  pub async fn on_fetch(&self, request: Request) -> Option<CacheResult<Response>> {
    let result = self
      .cache
      .fetch(&request, || self.network.fetch(request.clone()))
      .await;

    match result {
      Ok(result) => Some(result),
      Err(e) => {
        error!(request = %request.key(), "Fetch failed: {:#}", e);
        self.offline_fallback()
      }
    }
  }

  fn offline_fallback(&self) -> Option<CacheResult<Response>> {
    let page = self.config.offline_fallback.as_deref()?;

    let url = match self.config.scope.join(page) {
      Ok(url) => url,
      Err(e) => {
        warn!(page, "Invalid offline fallback path: {}", e);
        return None;
      }
    };

    // The fallback page ships with the current release
    match self
      .storage()
      .match_in(self.cache_name(), &RequestKey::new("GET", &url))
    {
      Ok(Some(stored)) => Some(CacheResult::offline(
        stored.to_response(),
        stored.cached_at,
      )),
      Ok(None) => {
        warn!(%url, cache = %self.cache_name(), "Offline fallback page is not cached");
        None
      }
      Err(e) => {
        warn!(%url, "Offline fallback lookup failed: {:#}", e);
        None
      }
    }
  }

  /// Network-only fetch for requests arriving before the worker is active.
  pub async fn passthrough(&self, request: Request) -> Result<Response> {
    self.network.fetch(request).await
  }

  /// Activate: delete every cache except the current one.
  ///
  /// Returns the names that were deleted.
  pub async fn on_activate(&self) -> Result<Vec<String>> {
    let allow_list: HashSet<&str> = HashSet::from([self.cache_name()]);

    let mut deleted = Vec::new();
    for name in self.storage().cache_names()? {
      if allow_list.contains(name.as_str()) {
        continue;
      }
      info!(cache = %name, "Deleting stale cache");
      if self.storage().delete(&name)? {
        deleted.push(name);
      }
    }

    Ok(deleted)
  }
}
