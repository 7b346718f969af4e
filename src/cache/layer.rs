//! Cache layer that orchestrates caching logic with network fetching.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::storage::CacheStorage;
use super::traits::CacheResult;
use crate::net::{Request, RequestKey, Response};

/// Cache layer bound to the current cache name.
///
/// Reads search every cache in the store; writes only go to the current one.
pub struct CacheLayer<S: CacheStorage> {
  storage: Arc<S>,
  cache_name: String,
}

impl<S: CacheStorage + 'static> CacheLayer<S> {
  pub fn new(storage: Arc<S>, cache_name: impl Into<String>) -> Self {
    Self {
      storage,
      cache_name: cache_name.into(),
    }
  }

  pub fn cache_name(&self) -> &str {
    &self.cache_name
  }

  pub fn storage(&self) -> &Arc<S> {
    &self.storage
  }

  /// Fetch with a cache-first strategy.
  ///
  /// 1. Any cache holding the request answers it; the network is not touched
  /// 2. Otherwise fetch from network
  /// 3. A 200 `basic`/`cors` response is split: one copy goes to a background
  ///    store into the current cache, the other is returned
  /// 4. Anything else is returned as is and not stored
  pub async fn fetch<F, Fut>(&self, request: &Request, fetcher: F) -> Result<CacheResult<Response>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Response>>,
  {
    let key = request.key();

    if let Some(stored) = self.storage.match_any(&key)? {
      debug!(request = %key, "cache hit");
      return Ok(CacheResult::from_cache(
        stored.to_response(),
        stored.cached_at,
      ));
    }

    let response = fetcher().await?;

    if !response.is_cacheable() || !key.is_cacheable() {
      debug!(
        request = %key,
        status = response.status,
        response_type = %response.response_type,
        "not caching response"
      );
      return Ok(CacheResult::from_network(response));
    }

    let (to_store, to_return) = response.tee();
    let write = self.store_in_background(key, to_store);

    Ok(CacheResult::from_network(to_return).with_write(write))
  }

  /// Best-effort store of `response`; failures are logged and dropped.
  fn store_in_background(&self, key: RequestKey, response: Response) -> JoinHandle<()> {
    let storage = Arc::clone(&self.storage);
    let cache_name = self.cache_name.clone();

    tokio::task::spawn_blocking(move || {
      if let Err(e) = storage.put(&cache_name, &key, response) {
        warn!(cache = %cache_name, request = %key, "Failed to cache response: {:#}", e);
      } else {
        debug!(cache = %cache_name, request = %key, "cached response");
      }
    })
  }

  /// Fetch every request and store all responses in the current cache as one
  /// batch.
  ///
  /// Fails without storing anything if the batch names the same request
  /// twice, if any fetch fails, or if any response is not a 2xx.
  pub async fn add_all<F, Fut>(&self, requests: Vec<Request>, fetcher: F) -> Result<usize>
  where
    F: Fn(Request) -> Fut,
    Fut: Future<Output = Result<Response>>,
  {
    let mut seen = HashSet::new();
    for request in &requests {
      let key = request.key();
      if !key.is_cacheable() {
        return Err(eyre!("Cannot precache {}: only GET requests are cacheable", key));
      }
      if !seen.insert(key.clone()) {
        return Err(eyre!("Duplicate request in batch: {}", key));
      }
    }

    let responses = try_join_all(requests.iter().map(|request| {
      let key = request.key();
      let fetch = fetcher(request.clone());
      async move {
        let response = fetch.await?;
        if !response.ok() {
          return Err(eyre!(
            "Bad response for {}: {} {}",
            key,
            response.status,
            response.status_text
          ));
        }
        Ok((key, response))
      }
    }))
    .await?;

    let count = responses.len();
    self.storage.put_all(&self.cache_name, responses)?;

    Ok(count)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, MemoryStorage};
  use crate::net::ResponseType;
  use std::sync::atomic::{AtomicUsize, Ordering};

  fn layer() -> CacheLayer<MemoryStorage> {
    CacheLayer::new(Arc::new(MemoryStorage::new()), "current")
  }

  fn basic(status: u16, body: &str) -> Response {
    Response::new(status)
      .with_type(ResponseType::Basic)
      .with_body(body.as_bytes().to_vec())
  }

  #[tokio::test]
  async fn test_miss_then_hit() {
    let layer = layer();
    let request = Request::parse("https://example.com/app/index.html").unwrap();
    let calls = AtomicUsize::new(0);

    let first = layer
      .fetch(&request, || async {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(basic(200, "shell"))
      })
      .await
      .unwrap();
    assert_eq!(first.source, CacheSource::Network);
    first.cache_write.unwrap().await.unwrap();

    let second = layer
      .fetch(&request, || async {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(basic(200, "changed"))
      })
      .await
      .unwrap();
    assert_eq!(second.source, CacheSource::Cache);
    assert!(second.cached_at.is_some());
    assert_eq!(second.data.into_body(), b"shell");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_non_200_is_not_stored() {
    let layer = layer();
    let request = Request::parse("https://example.com/missing.png").unwrap();

    let result = layer
      .fetch(&request, || async { Ok(basic(404, "nope")) })
      .await
      .unwrap();
    assert_eq!(result.data.status, 404);
    assert!(result.cache_write.is_none());
    assert!(layer.storage().entries("current").unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_fetch_error_propagates() {
    let layer = layer();
    let request = Request::parse("https://example.com/offline.js").unwrap();

    let result = layer
      .fetch(&request, || async { Err(eyre!("connection refused")) })
      .await;
    assert!(result.is_err());
  }

  #[tokio::test]
  async fn test_add_all_rejects_duplicates_before_fetching() {
    let layer = layer();
    let request = Request::parse("https://example.com/a.png").unwrap();
    let calls = AtomicUsize::new(0);

    let result = layer
      .add_all(vec![request.clone(), request], |_| async {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(basic(200, "png"))
      })
      .await;

    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(!layer.storage().has("current").unwrap());
  }

  #[tokio::test]
  async fn test_add_all_fails_on_bad_status() {
    let layer = layer();
    let requests = vec![
      Request::parse("https://example.com/a.js").unwrap(),
      Request::parse("https://example.com/b.js").unwrap(),
    ];

    let result = layer
      .add_all(requests, |request| async move {
        if request.url.path() == "/b.js" {
          Ok(basic(500, "boom"))
        } else {
          Ok(basic(200, "ok"))
        }
      })
      .await;

    assert!(result.is_err());
    assert!(layer.storage().entries("current").unwrap().is_empty());
  }
}
