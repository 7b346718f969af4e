//! Scripted network for tests.

use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::client::Fetcher;
use super::types::{Request, Response, ResponseType};

/// Answers requests from a URL table and counts how often it was asked.
/// Unknown URLs fail like an unreachable host.
#[derive(Default)]
pub struct MockNetwork {
  routes: Mutex<HashMap<String, (u16, ResponseType, Vec<u8>)>>,
  calls: AtomicUsize,
}

impl MockNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn route(self, url: &str, status: u16, response_type: ResponseType, body: &str) -> Self {
    self.set(url, status, response_type, body);
    self
  }

  pub fn set(&self, url: &str, status: u16, response_type: ResponseType, body: &str) {
    self.routes.lock().unwrap().insert(
      url.to_string(),
      (status, response_type, body.as_bytes().to_vec()),
    );
  }

  /// Make every request fail from now on.
  pub fn go_offline(&self) {
    self.routes.lock().unwrap().clear();
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }
}

impl Fetcher for MockNetwork {
  async fn fetch(&self, request: Request) -> Result<Response> {
    self.calls.fetch_add(1, Ordering::SeqCst);

    let route = self.routes.lock().unwrap().get(request.url.as_str()).cloned();
    match route {
      Some((_, ResponseType::Opaque, _)) => Ok(Response::opaque()),
      Some((status, response_type, body)) => Ok(
        Response::new(status)
          .with_type(response_type)
          .with_url(request.url.as_str())
          .with_body(body),
      ),
      None => Err(eyre!("Failed to fetch {}: network unreachable", request.url)),
    }
  }
}
