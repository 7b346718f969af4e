//! Built-in releases: the cache name and app-shell asset list each deployed
//! version precaches.

use clap::ValueEnum;
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::fmt;
use url::Url;

use crate::net::Request;

const V1_ASSETS: &[&str] = &[
  "/",
  "index.html",
  "manifest.json",
  "IMAGEN1.png",
  "IMAGEN1.png",
  "https://cdnjs.cloudflare.com/ajax/libs/jspdf/2.5.1/jspdf.umd.min.js",
  "https://cdnjs.cloudflare.com/ajax/libs/font-awesome/6.4.2/css/all.min.css",
  "https://cdnjs.cloudflare.com/ajax/libs/cropperjs/1.5.13/cropper.min.css",
  "https://cdnjs.cloudflare.com/ajax/libs/cropperjs/1.5.13/cropper.min.js",
  "https://fonts.googleapis.com/css2?family=Inter:wght@400;500;600;700&display=swap",
  "https://fonts.gstatic.com/s/inter/v13/UcC73FwrK3iLTeHuS_fvQtMwCp50KnMa1ZL7.woff2",
];

const V2_ASSETS: &[&str] = &[
  "/",
  "./",
  "index.html",
  "manifest.json",
  "icon-192.png",
  "icon-512.png",
  "https://cdnjs.cloudflare.com/ajax/libs/jspdf/2.5.1/jspdf.umd.min.js",
  "https://cdnjs.cloudflare.com/ajax/libs/font-awesome/6.4.2/css/all.min.css",
  "https://cdnjs.cloudflare.com/ajax/libs/cropperjs/1.5.13/cropper.min.css",
  "https://cdnjs.cloudflare.com/ajax/libs/cropperjs/1.5.13/cropper.min.js",
  "https://fonts.googleapis.com/css2?family=Inter:wght@400;500;600;700&display=swap",
  "https://fonts.gstatic.com/s/inter/v13/UcC73FwrK3iLTeHuS_fvQtMwCp50KnMa1ZL7.woff2",
];

/// A deployed version of the app shell.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Release {
  V1,
  #[default]
  V2,
}

impl Release {
  pub fn cache_name(&self) -> &'static str {
    match self {
      Self::V1 => "reportes-pro-cache-v1",
      Self::V2 => "reportes-pro-cache-v2",
    }
  }

  pub fn assets(&self) -> &'static [&'static str] {
    match self {
      Self::V1 => V1_ASSETS,
      Self::V2 => V2_ASSETS,
    }
  }
}

impl fmt::Display for Release {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::V1 => f.write_str("v1"),
      Self::V2 => f.write_str("v2"),
    }
  }
}

/// Resolve manifest entries against the scope, keeping their order.
///
/// Relative entries resolve the way a page-relative link would: `/` is the
/// origin root and `./` is the scope directory itself.
pub fn resolve(scope: &Url, assets: &[String]) -> Result<Vec<Request>> {
  assets
    .iter()
    .map(|asset| {
      scope
        .join(asset)
        .map(Request::get)
        .map_err(|e| eyre!("Invalid asset URL '{}': {}", asset, e))
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  fn scope() -> Url {
    Url::parse("https://reportes.example.com/app/").unwrap()
  }

  fn owned(assets: &[&str]) -> Vec<String> {
    assets.iter().map(|s| s.to_string()).collect()
  }

  #[test]
  fn test_release_names() {
    assert_eq!(Release::V1.cache_name(), "reportes-pro-cache-v1");
    assert_eq!(Release::V2.cache_name(), "reportes-pro-cache-v2");
    assert_eq!(Release::default(), Release::V2);
  }

  #[test]
  fn test_resolve_relative_and_absolute() {
    let requests = resolve(&scope(), &owned(Release::V2.assets())).unwrap();
    let urls: Vec<&str> = requests.iter().map(|r| r.url.as_str()).collect();

    assert_eq!(urls[0], "https://reportes.example.com/");
    assert_eq!(urls[1], "https://reportes.example.com/app/");
    assert_eq!(urls[2], "https://reportes.example.com/app/index.html");
    assert_eq!(
      urls[6],
      "https://cdnjs.cloudflare.com/ajax/libs/jspdf/2.5.1/jspdf.umd.min.js"
    );
    assert_eq!(requests.len(), Release::V2.assets().len());
  }

  #[test]
  fn test_v1_repeats_an_asset() {
    let requests = resolve(&scope(), &owned(Release::V1.assets())).unwrap();
    assert_eq!(requests[3].key(), requests[4].key());
  }

  #[test]
  fn test_resolve_rejects_garbage() {
    let result = resolve(&scope(), &owned(&["http://[bad"]));
    assert!(result.is_err());
  }
}
