//! Process-local cache storage.

use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::storage::{ensure_cacheable, CacheStorage};
use super::traits::{CachedEntry, StoredResponse};
use crate::lifecycle::WorkerState;
use crate::net::{RequestKey, Response};

struct NamedCache {
  name: String,
  /// Entries in insertion order
  entries: Vec<(RequestKey, StoredResponse)>,
}

impl NamedCache {
  fn new(name: &str) -> Self {
    Self {
      name: name.to_string(),
      entries: Vec::new(),
    }
  }

  fn get(&self, key: &RequestKey) -> Option<&StoredResponse> {
    self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
  }

  fn insert(&mut self, key: RequestKey, stored: StoredResponse) {
    self.entries.retain(|(k, _)| *k != key);
    self.entries.push((key, stored));
  }
}

/// Storage that keeps every cache in memory.
///
/// Used by `--ephemeral` runs and tests; semantics match [`super::SqliteStorage`].
#[derive(Default)]
pub struct MemoryStorage {
  /// Caches in creation order
  caches: RwLock<Vec<NamedCache>>,
  workers: RwLock<HashMap<String, WorkerState>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn read(&self) -> Result<RwLockReadGuard<'_, Vec<NamedCache>>> {
    self.caches.read().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  fn write(&self) -> Result<RwLockWriteGuard<'_, Vec<NamedCache>>> {
    self.caches.write().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

fn open_mut<'a>(caches: &'a mut Vec<NamedCache>, cache_name: &str) -> &'a mut NamedCache {
  let index = match caches.iter().position(|c| c.name == cache_name) {
    Some(index) => index,
    None => {
      caches.push(NamedCache::new(cache_name));
      caches.len() - 1
    }
  };
  &mut caches[index]
}

impl CacheStorage for MemoryStorage {
  fn open(&self, cache_name: &str) -> Result<()> {
    open_mut(&mut *self.write()?, cache_name);
    Ok(())
  }

  fn has(&self, cache_name: &str) -> Result<bool> {
    Ok(self.read()?.iter().any(|c| c.name == cache_name))
  }

  fn cache_names(&self) -> Result<Vec<String>> {
    Ok(self.read()?.iter().map(|c| c.name.clone()).collect())
  }

  fn delete(&self, cache_name: &str) -> Result<bool> {
    let mut caches = self.write()?;
    let before = caches.len();
    caches.retain(|c| c.name != cache_name);
    Ok(caches.len() != before)
  }

  fn match_in(&self, cache_name: &str, key: &RequestKey) -> Result<Option<StoredResponse>> {
    if !key.is_cacheable() {
      return Ok(None);
    }

    Ok(
      self
        .read()?
        .iter()
        .find(|c| c.name == cache_name)
        .and_then(|c| c.get(key))
        .cloned(),
    )
  }

  fn match_any(&self, key: &RequestKey) -> Result<Option<StoredResponse>> {
    if !key.is_cacheable() {
      return Ok(None);
    }

    Ok(self.read()?.iter().find_map(|c| c.get(key)).cloned())
  }

  fn put(&self, cache_name: &str, key: &RequestKey, response: Response) -> Result<()> {
    ensure_cacheable(key)?;

    let stored = StoredResponse::from_response(response);
    let mut caches = self.write()?;
    open_mut(&mut caches, cache_name).insert(key.clone(), stored);
    Ok(())
  }

  fn put_all(&self, cache_name: &str, entries: Vec<(RequestKey, Response)>) -> Result<()> {
    // Validate the whole batch before touching anything
    for (key, _) in &entries {
      ensure_cacheable(key)?;
    }

    let mut caches = self.write()?;
    let cache = open_mut(&mut caches, cache_name);
    for (key, response) in entries {
      cache.insert(key, StoredResponse::from_response(response));
    }
    Ok(())
  }

  fn entries(&self, cache_name: &str) -> Result<Vec<CachedEntry>> {
    let caches = self.read()?;
    let Some(cache) = caches.iter().find(|c| c.name == cache_name) else {
      return Ok(Vec::new());
    };

    Ok(
      cache
        .entries
        .iter()
        .map(|(key, stored)| CachedEntry {
          key: key.clone(),
          status: stored.status,
          response_type: stored.response_type,
          size: stored.body.len(),
          digest: stored.digest(),
          cached_at: stored.cached_at,
        })
        .collect(),
    )
  }

  fn delete_entry(&self, cache_name: &str, key: &RequestKey) -> Result<bool> {
    let mut caches = self.write()?;
    let Some(cache) = caches.iter_mut().find(|c| c.name == cache_name) else {
      return Ok(false);
    };

    let before = cache.entries.len();
    cache.entries.retain(|(k, _)| k != key);
    Ok(cache.entries.len() != before)
  }

  fn worker_state(&self, version: &str) -> Result<Option<WorkerState>> {
    let workers = self
      .workers
      .read()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(workers.get(version).copied())
  }

  fn set_worker_state(&self, version: &str, state: WorkerState) -> Result<()> {
    self
      .workers
      .write()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?
      .insert(version.to_string(), state);
    Ok(())
  }
}
