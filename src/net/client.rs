use crate::config::NetworkConfig;
use crate::net::types::{Request, RequestMode, Response, ResponseType};
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{ACCESS_CONTROL_ALLOW_ORIGIN, ORIGIN};
use std::future::Future;
use std::time::Duration;
use tracing::debug;
use url::{Origin, Url};

/// Source of network responses.
///
/// A fetch fails only on network-level errors (unreachable host, refused
/// CORS check, timeout). HTTP error statuses are ordinary responses.
pub trait Fetcher: Send + Sync {
  fn fetch(&self, request: Request) -> impl Future<Output = Result<Response>> + Send;
}

/// HTTP fetcher that classifies responses relative to the worker's origin.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
  origin: Origin,
}

impl HttpFetcher {
  pub fn new(scope: &Url, network: &NetworkConfig) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(network.timeout_secs))
      .user_agent(network.user_agent.clone())
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      origin: scope.origin(),
    })
  }

  fn allows_origin(&self, allow_origin: Option<&str>) -> bool {
    match allow_origin {
      Some("*") => true,
      Some(value) => value.trim() == self.origin.ascii_serialization(),
      None => false,
    }
  }
}

impl Fetcher for HttpFetcher {
  async fn fetch(&self, request: Request) -> Result<Response> {
    let cross_origin = request.url.origin() != self.origin;

    if cross_origin && request.mode == RequestMode::SameOrigin {
      return Err(eyre!(
        "Cross-origin request to {} in same-origin mode",
        request.url
      ));
    }

    let method = reqwest::Method::from_bytes(request.method.as_bytes())
      .map_err(|e| eyre!("Invalid method '{}': {}", request.method, e))?;

    let mut builder = self.client.request(method, request.url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if cross_origin && request.mode == RequestMode::Cors {
      builder = builder.header(ORIGIN, self.origin.ascii_serialization());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", request.url, e))?;

    let status = response.status();
    let final_url = response.url().clone();
    debug!(url = %request.url, final_url = %final_url, status = status.as_u16(), "network response");

    // A redirect can leave the scope origin even when the request did not
    let tainted = cross_origin || final_url.origin() != self.origin;

    let response_type = match (tainted, request.mode) {
      (false, _) | (true, RequestMode::Navigate) => ResponseType::Basic,
      (true, RequestMode::SameOrigin) => {
        return Err(eyre!(
          "Request to {} redirected to cross-origin {} in same-origin mode",
          request.url,
          final_url
        ));
      }
      (true, RequestMode::NoCors) => return Ok(Response::opaque()),
      (true, RequestMode::Cors) => {
        let allow_origin = response
          .headers()
          .get(ACCESS_CONTROL_ALLOW_ORIGIN)
          .and_then(|v| v.to_str().ok());
        if !self.allows_origin(allow_origin) {
          return Err(eyre!("CORS check failed for {}", final_url));
        }
        ResponseType::Cors
      }
    };

    let headers: Vec<(String, String)> = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();

    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body of {}: {}", request.url, e))?;

    let mut result = Response::new(status.as_u16())
      .with_type(response_type)
      .with_url(final_url.as_str())
      .with_headers(headers)
      .with_body(body.to_vec());
    if let Some(reason) = status.canonical_reason() {
      result = result.with_status_text(reason);
    }

    Ok(result)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashMap;
  use std::sync::Arc;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio::net::TcpListener;

  /// Raw HTTP/1.1 response with a fixed body.
  fn http(status: u16, headers: &[(&str, &str)], body: &str) -> String {
    let reason = reqwest::StatusCode::from_u16(status)
      .ok()
      .and_then(|s| s.canonical_reason())
      .unwrap_or("");
    let mut out = format!("HTTP/1.1 {} {}\r\n", status, reason);
    for (name, value) in headers {
      out.push_str(&format!("{}: {}\r\n", name, value));
    }
    out.push_str(&format!(
      "Content-Length: {}\r\nConnection: close\r\n\r\n{}",
      body.len(),
      body
    ));
    out
  }

  /// Serve canned responses by request path on a loopback port. Unknown
  /// paths get a 404.
  async fn serve(routes: Vec<(&str, String)>) -> Url {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let routes: Arc<HashMap<String, String>> = Arc::new(
      routes
        .into_iter()
        .map(|(path, response)| (path.to_string(), response))
        .collect(),
    );

    tokio::spawn(async move {
      while let Ok((mut socket, _)) = listener.accept().await {
        let routes = Arc::clone(&routes);
        tokio::spawn(async move {
          let mut head = Vec::new();
          let mut chunk = [0u8; 1024];
          while !head.windows(4).any(|w| w == b"\r\n\r\n") {
            match socket.read(&mut chunk).await {
              Ok(0) | Err(_) => return,
              Ok(n) => head.extend_from_slice(&chunk[..n]),
            }
          }
          let head = String::from_utf8_lossy(&head);
          let path = head.split_whitespace().nth(1).unwrap_or("/");
          let response = routes
            .get(path)
            .cloned()
            .unwrap_or_else(|| http(404, &[], "missing"));
          let _ = socket.write_all(response.as_bytes()).await;
          let _ = socket.shutdown().await;
        });
      }
    });

    Url::parse(&format!("http://{}/", addr)).unwrap()
  }

  fn fetcher_for(scope: &Url) -> HttpFetcher {
    HttpFetcher::new(scope, &NetworkConfig::default()).unwrap()
  }

  fn request(base: &Url, path: &str, mode: RequestMode) -> Request {
    Request::get(base.join(path).unwrap()).with_mode(mode)
  }

  #[test]
  fn test_allows_origin() {
    let scope = Url::parse("https://reportes.example.com/app/").unwrap();
    let fetcher = fetcher_for(&scope);
    assert!(fetcher.allows_origin(Some("*")));
    assert!(fetcher.allows_origin(Some("https://reportes.example.com")));
    assert!(!fetcher.allows_origin(Some("https://other.example.com")));
    assert!(!fetcher.allows_origin(None));
  }

  #[tokio::test]
  async fn test_same_origin_mode_rejects_cross_origin() {
    let scope = Url::parse("https://reportes.example.com/app/").unwrap();
    let request = Request::parse("https://cdn.example.net/lib.js")
      .unwrap()
      .with_mode(RequestMode::SameOrigin);

    let err = fetcher_for(&scope).fetch(request).await.unwrap_err();
    assert!(err.to_string().contains("same-origin"));
  }

  #[tokio::test]
  async fn test_same_origin_response_is_basic() {
    let app = serve(vec![(
      "/index.html",
      http(200, &[("Content-Type", "text/html")], "<html></html>"),
    )])
    .await;

    let response = fetcher_for(&app)
      .fetch(request(&app, "index.html", RequestMode::Cors))
      .await
      .unwrap();
    assert_eq!(response.response_type, ResponseType::Basic);
    assert_eq!(response.status, 200);
    assert_eq!(response.header("content-type"), Some("text/html"));
    assert_eq!(response.body(), b"<html></html>");
    assert!(response.is_cacheable());
  }

  #[tokio::test]
  async fn test_same_origin_error_status_is_a_response() {
    let app = serve(vec![]).await;

    let response = fetcher_for(&app)
      .fetch(request(&app, "gone.png", RequestMode::Cors))
      .await
      .unwrap();
    assert_eq!(response.response_type, ResponseType::Basic);
    assert_eq!(response.status, 404);
    assert!(!response.is_cacheable());
  }

  #[tokio::test]
  async fn test_cross_origin_no_cors_is_opaque() {
    let app = serve(vec![]).await;
    let cdn = serve(vec![("/lib.js", http(200, &[], "lib"))]).await;

    let response = fetcher_for(&app)
      .fetch(request(&cdn, "lib.js", RequestMode::NoCors))
      .await
      .unwrap();
    assert_eq!(response.response_type, ResponseType::Opaque);
    assert_eq!(response.status, 0);
    assert!(response.body().is_empty());
    assert!(!response.is_cacheable());
  }

  #[tokio::test]
  async fn test_cross_origin_cors_needs_allow_origin() {
    let app = serve(vec![]).await;
    let cdn = serve(vec![
      ("/open.js", http(200, &[("Access-Control-Allow-Origin", "*")], "open")),
      ("/closed.js", http(200, &[], "closed")),
      (
        "/other.js",
        http(200, &[("Access-Control-Allow-Origin", "https://other.example.com")], "other"),
      ),
    ])
    .await;
    let fetcher = fetcher_for(&app);

    let open = fetcher
      .fetch(request(&cdn, "open.js", RequestMode::Cors))
      .await
      .unwrap();
    assert_eq!(open.response_type, ResponseType::Cors);
    assert!(open.is_cacheable());

    assert!(fetcher
      .fetch(request(&cdn, "closed.js", RequestMode::Cors))
      .await
      .is_err());
    assert!(fetcher
      .fetch(request(&cdn, "other.js", RequestMode::Cors))
      .await
      .is_err());
  }

  #[tokio::test]
  async fn test_cross_origin_redirect_is_not_basic() {
    let cdn = serve(vec![
      ("/lib.js", http(200, &[], "lib")),
      ("/shared.js", http(200, &[("Access-Control-Allow-Origin", "*")], "shared")),
    ])
    .await;
    let lib = cdn.join("lib.js").unwrap();
    let shared = cdn.join("shared.js").unwrap();
    let app = serve(vec![
      ("/lib.js", http(302, &[("Location", lib.as_str())], "")),
      ("/shared.js", http(302, &[("Location", shared.as_str())], "")),
    ])
    .await;
    let fetcher = fetcher_for(&app);

    let err = fetcher
      .fetch(request(&app, "lib.js", RequestMode::SameOrigin))
      .await
      .unwrap_err();
    assert!(err.to_string().contains("same-origin"));

    let opaque = fetcher
      .fetch(request(&app, "lib.js", RequestMode::NoCors))
      .await
      .unwrap();
    assert_eq!(opaque.response_type, ResponseType::Opaque);
    assert!(!opaque.is_cacheable());

    assert!(fetcher
      .fetch(request(&app, "lib.js", RequestMode::Cors))
      .await
      .is_err());

    let cors = fetcher
      .fetch(request(&app, "shared.js", RequestMode::Cors))
      .await
      .unwrap();
    assert_eq!(cors.response_type, ResponseType::Cors);
    assert_eq!(cors.url, shared.as_str());
  }
}
