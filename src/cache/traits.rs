//! Core types shared by the cache storage backends and the cache layer.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;

use crate::net::{RequestKey, Response, ResponseType};

/// A response snapshot as held by a cache.
///
/// Unlike [`Response`], a snapshot can be read any number of times; each
/// lookup hands out a fresh `Response`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredResponse {
  pub response_type: ResponseType,
  pub url: String,
  pub status: u16,
  pub status_text: String,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
  pub cached_at: DateTime<Utc>,
}

impl StoredResponse {
  pub fn from_response(response: Response) -> Self {
    let response_type = response.response_type;
    let url = response.url.clone();
    let status = response.status;
    let status_text = response.status_text.clone();
    let headers = response.headers.clone();
    Self {
      response_type,
      url,
      status,
      status_text,
      headers,
      body: response.into_body(),
      cached_at: Utc::now(),
    }
  }

  pub fn to_response(&self) -> Response {
    Response::new(self.status)
      .with_type(self.response_type)
      .with_url(self.url.clone())
      .with_status_text(self.status_text.clone())
      .with_headers(self.headers.clone())
      .with_body(self.body.clone())
  }

  /// Hex SHA-256 of the body.
  pub fn digest(&self) -> String {
    body_digest(&self.body)
  }
}

pub fn body_digest(body: &[u8]) -> String {
  hex::encode(Sha256::digest(body))
}

/// Listing row for one stored entry.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  pub key: RequestKey,
  pub status: u16,
  pub response_type: ResponseType,
  pub size: usize,
  pub digest: String,
  pub cached_at: DateTime<Utc>,
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
  /// Background store of a copy of `data`, if one was started
  pub cache_write: Option<JoinHandle<()>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
      cache_write: None,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
      cache_write: None,
    }
  }

  /// Create a new cache result for the offline fallback page.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
      cache_write: None,
    }
  }

  pub fn with_write(mut self, write: JoinHandle<()>) -> Self {
    self.cache_write = Some(write);
    self
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Served from a cache without touching the network
  Cache,
  /// Request failed; serving the configured fallback page
  Offline,
}

impl CacheSource {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Network => "network",
      Self::Cache => "cache",
      Self::Offline => "offline",
    }
  }
}
