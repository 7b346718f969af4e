use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

use crate::manifest::Release;

const DEFAULT_SCOPE: &str = "http://localhost:8080/reportes-pro/";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Built-in release supplying the cache name and asset list
  pub release: Release,
  /// Overrides the release's cache name
  pub cache_name: Option<String>,
  /// Base URL the worker controls; relative assets resolve against it
  pub scope: String,
  /// Overrides the release's asset list
  pub assets: Option<Vec<String>>,
  /// Cached page served when a request cannot be answered (disabled by default)
  pub offline_fallback: Option<String>,
  /// Cache database location (default: $XDG_DATA_HOME/offcache/cache.db)
  pub database: Option<PathBuf>,
  pub network: NetworkConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      release: Release::default(),
      cache_name: None,
      scope: DEFAULT_SCOPE.to_string(),
      assets: None,
      offline_fallback: None,
      database: None,
      network: NetworkConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  pub timeout_secs: u64,
  pub user_agent: String,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self {
      timeout_secs: 30,
      user_agent: concat!("offcache/", env!("CARGO_PKG_VERSION")).to_string(),
    }
  }
}

/// Resolved settings handed to the worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
  pub cache_name: String,
  pub scope: Url,
  pub assets: Vec<String>,
  pub offline_fallback: Option<String>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offcache/config.yaml
  ///
  /// With no file anywhere the built-in defaults are used.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };

    if let Some(scope) = Self::scope_override() {
      config.scope = scope;
    }

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("offcache.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Scope from the OFFCACHE_SCOPE environment variable, if set.
  fn scope_override() -> Option<String> {
    std::env::var("OFFCACHE_SCOPE")
      .ok()
      .filter(|s| !s.trim().is_empty())
  }

  /// Switch to a built-in release, dropping any name or asset overrides.
  pub fn with_release(self, release: Release) -> Self {
    Self {
      release,
      cache_name: None,
      assets: None,
      ..self
    }
  }

  pub fn cache_name(&self) -> String {
    self
      .cache_name
      .clone()
      .unwrap_or_else(|| self.release.cache_name().to_string())
  }

  pub fn assets(&self) -> Vec<String> {
    match &self.assets {
      Some(assets) => assets.clone(),
      None => self.release.assets().iter().map(|s| s.to_string()).collect(),
    }
  }

  /// Parse the scope, which must be an absolute URL.
  pub fn scope_url(&self) -> Result<Url> {
    Url::parse(&self.scope).map_err(|e| eyre!("Invalid scope URL '{}': {}", self.scope, e))
  }

  pub fn worker(&self) -> Result<WorkerConfig> {
    let cache_name = self.cache_name();
    if cache_name.trim().is_empty() {
      return Err(eyre!("Cache name must not be empty"));
    }

    Ok(WorkerConfig {
      cache_name,
      scope: self.scope_url()?,
      assets: self.assets(),
      offline_fallback: self.offline_fallback.clone(),
    })
  }

  /// Cache database path: the configured one, else the data directory default.
  pub fn database_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.database {
      return Ok(path.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("offcache").join("cache.db"))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;
  use tempfile::NamedTempFile;

  #[test]
  fn test_defaults_use_v2() {
    let config = Config::default();
    assert_eq!(config.cache_name(), "reportes-pro-cache-v2");
    assert_eq!(config.assets().len(), Release::V2.assets().len());
    assert!(config.offline_fallback.is_none());
  }

  #[test]
  fn test_load_yaml_overrides() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
      file,
      "release: v1\nscope: https://reportes.example.com/app/\ncache_name: custom-v9\n\
       assets:\n  - index.html\n  - app.js\noffline_fallback: offline.html\n\
       network:\n  timeout_secs: 5"
    )
    .unwrap();

    let config = Config::load_from_path(file.path()).unwrap();
    assert_eq!(config.release, Release::V1);
    assert_eq!(config.cache_name(), "custom-v9");
    assert_eq!(config.assets(), vec!["index.html", "app.js"]);
    assert_eq!(config.network.timeout_secs, 5);
    assert!(config.network.user_agent.starts_with("offcache/"));

    let worker = config.worker().unwrap();
    assert_eq!(worker.scope.as_str(), "https://reportes.example.com/app/");
    assert_eq!(worker.offline_fallback.as_deref(), Some("offline.html"));
  }

  #[test]
  fn test_release_switch_drops_overrides() {
    let config = Config {
      cache_name: Some("custom".to_string()),
      assets: Some(vec!["a.js".to_string()]),
      ..Config::default()
    }
    .with_release(Release::V1);

    assert_eq!(config.cache_name(), "reportes-pro-cache-v1");
    assert_eq!(config.assets().len(), Release::V1.assets().len());
  }

  #[test]
  fn test_missing_explicit_path() {
    let result = Config::load(Some(Path::new("/nonexistent/offcache.yaml")));
    assert!(result.is_err());
  }

  #[test]
  fn test_invalid_scope() {
    let config = Config {
      scope: "not a url".to_string(),
      ..Config::default()
    };
    assert!(config.worker().is_err());
  }

  #[test]
  fn test_explicit_database_path() {
    let config = Config {
      database: Some(PathBuf::from("/tmp/offcache-test.db")),
      ..Config::default()
    };
    assert_eq!(
      config.database_path().unwrap(),
      PathBuf::from("/tmp/offcache-test.db")
    );
  }
}
