//! Request and response values exchanged between the worker, the cache store
//! and the network.

use clap::ValueEnum;
use color_eyre::{eyre::eyre, Result};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use std::fmt;
use url::Url;

/// How a request treats cross-origin targets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum RequestMode {
  /// Cross-origin targets are a network error
  SameOrigin,
  /// Cross-origin targets yield an opaque response
  NoCors,
  /// Cross-origin targets must pass a CORS check
  #[default]
  Cors,
  /// Top-level navigation
  Navigate,
}

/// An outgoing resource request.
#[derive(Debug, Clone)]
pub struct Request {
  /// Upper-case HTTP method
  pub method: String,
  pub url: Url,
  pub headers: Vec<(String, String)>,
  pub mode: RequestMode,
}

impl Request {
  /// A plain `GET` in `cors` mode, which is what bulk population issues.
  pub fn get(url: Url) -> Self {
    Self {
      method: "GET".to_string(),
      url,
      headers: Vec::new(),
      mode: RequestMode::default(),
    }
  }

  /// Parse an absolute URL into a `GET` request.
  #[allow(dead_code)]
  pub fn parse(url: &str) -> Result<Self> {
    let url = Url::parse(url).map_err(|e| eyre!("Invalid request URL '{}': {}", url, e))?;
    Ok(Self::get(url))
  }

  #[allow(dead_code)]
  pub fn with_method(mut self, method: &str) -> Self {
    self.method = method.to_ascii_uppercase();
    self
  }

  pub fn with_mode(mut self, mode: RequestMode) -> Self {
    self.mode = mode;
    self
  }

  /// Identity under which this request is stored and matched.
  pub fn key(&self) -> RequestKey {
    RequestKey::new(&self.method, &self.url)
  }
}

/// Request identity: method plus URL without its fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
  pub method: String,
  pub url: String,
}

impl RequestKey {
  pub fn new(method: &str, url: &Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    Self {
      method: method.to_ascii_uppercase(),
      url: url.into(),
    }
  }

  /// Only `GET` requests can be stored or matched.
  pub fn is_cacheable(&self) -> bool {
    self.method == "GET"
  }

  /// Stable, fixed-length hash used as the storage key.
  pub fn hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for RequestKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.method, self.url)
  }
}

/// Classification of a response as seen by the requesting page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseType {
  /// Same-origin response
  Basic,
  /// Cross-origin response that passed the CORS check
  Cors,
  /// Constructed locally
  Default,
  /// Cross-origin `no-cors` response with hidden contents
  Opaque,
}

impl ResponseType {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Basic => "basic",
      Self::Cors => "cors",
      Self::Default => "default",
      Self::Opaque => "opaque",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "basic" => Some(Self::Basic),
      "cors" => Some(Self::Cors),
      "default" => Some(Self::Default),
      "opaque" => Some(Self::Opaque),
      _ => None,
    }
  }

  /// Whether the contents of this kind of response may be stored.
  pub fn is_inspectable(&self) -> bool {
    matches!(self, Self::Basic | Self::Cors)
  }
}

impl fmt::Display for ResponseType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A response whose body can be read exactly once.
///
/// `Response` is deliberately not `Clone`. Code that needs to hand the same
/// payload to two consumers calls [`Response::tee`] before either of them
/// reads it.
#[derive(Debug)]
pub struct Response {
  pub response_type: ResponseType,
  /// Final URL after redirects, empty for constructed responses
  pub url: String,
  pub status: u16,
  pub status_text: String,
  pub headers: Vec<(String, String)>,
  body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16) -> Self {
    Self {
      response_type: ResponseType::Default,
      url: String::new(),
      status,
      status_text: status_text_for(status).to_string(),
      headers: Vec::new(),
      body: Vec::new(),
    }
  }

  /// An opaque response: status 0, no headers, no readable body.
  pub fn opaque() -> Self {
    Self {
      response_type: ResponseType::Opaque,
      status_text: String::new(),
      ..Self::new(0)
    }
  }

  pub fn with_type(mut self, response_type: ResponseType) -> Self {
    self.response_type = response_type;
    self
  }

  pub fn with_url(mut self, url: impl Into<String>) -> Self {
    self.url = url.into();
    self
  }

  pub fn with_status_text(mut self, status_text: impl Into<String>) -> Self {
    self.status_text = status_text.into();
    self
  }

  pub fn with_headers(mut self, headers: Vec<(String, String)>) -> Self {
    self.headers = headers;
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = body.into();
    self
  }

  /// Status in the 200-299 range.
  pub fn ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Case-insensitive header lookup, first value wins.
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  pub fn body(&self) -> &[u8] {
    &self.body
  }

  pub fn into_body(self) -> Vec<u8> {
    self.body
  }

  /// A plain 200 from a same-origin or CORS-approved fetch.
  pub fn is_cacheable(&self) -> bool {
    self.status == 200 && self.response_type.is_inspectable()
  }

  /// Split into two independent copies of the same payload.
  pub fn tee(self) -> (Response, Response) {
    let copy = Response {
      response_type: self.response_type,
      url: self.url.clone(),
      status: self.status,
      status_text: self.status_text.clone(),
      headers: self.headers.clone(),
      body: self.body.clone(),
    };
    (self, copy)
  }
}

fn status_text_for(status: u16) -> &'static str {
  StatusCode::from_u16(status)
    .ok()
    .and_then(|s| s.canonical_reason())
    .unwrap_or("")
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_key_ignores_fragment() {
    let a = Request::parse("https://example.com/app/index.html#top").unwrap();
    let b = Request::parse("https://example.com/app/index.html").unwrap();
    assert_eq!(a.key(), b.key());
    assert_eq!(a.key().hash(), b.key().hash());
  }

  #[test]
  fn test_key_keeps_query() {
    let a = Request::parse("https://fonts.example.com/css2?family=Inter").unwrap();
    let b = Request::parse("https://fonts.example.com/css2").unwrap();
    assert_ne!(a.key(), b.key());
  }

  #[test]
  fn test_method_is_part_of_identity() {
    let get = Request::parse("https://example.com/api").unwrap();
    let post = get.clone().with_method("post");
    assert_eq!(post.method, "POST");
    assert_ne!(get.key().hash(), post.key().hash());
    assert!(get.key().is_cacheable());
    assert!(!post.key().is_cacheable());
  }

  #[test]
  fn test_cacheable_responses() {
    assert!(Response::new(200).with_type(ResponseType::Basic).is_cacheable());
    assert!(Response::new(200).with_type(ResponseType::Cors).is_cacheable());
    assert!(!Response::new(404).with_type(ResponseType::Basic).is_cacheable());
    assert!(!Response::new(204).with_type(ResponseType::Basic).is_cacheable());
    assert!(!Response::opaque().is_cacheable());
  }

  #[test]
  fn test_tee_produces_identical_copies() {
    let response = Response::new(200)
      .with_type(ResponseType::Basic)
      .with_headers(vec![("Content-Type".to_string(), "text/html".to_string())])
      .with_body(b"<html></html>".to_vec());

    let (a, b) = response.tee();
    assert_eq!(a.status, b.status);
    assert_eq!(a.header("content-type"), Some("text/html"));
    assert_eq!(a.into_body(), b.into_body());
  }

  #[test]
  fn test_opaque_response_shape() {
    let response = Response::opaque();
    assert_eq!(response.status, 0);
    assert!(response.headers.is_empty());
    assert!(response.body().is_empty());
    assert!(!response.ok());
  }

  #[test]
  fn test_status_text() {
    assert_eq!(Response::new(200).status_text, "OK");
    assert_eq!(Response::new(404).status_text, "Not Found");
  }
}
