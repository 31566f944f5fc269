use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use url::Url;

use crate::cache::CacheNames;

/// Engine configuration, fixed for the lifetime of one engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
  /// Version tag of the generation this engine installs
  pub version: String,
  /// Prefix of every store name
  pub cache_prefix: String,
  /// Origin the engine serves; relative URLs resolve against it
  pub origin: Url,
  /// Cross-origin hosts (CDNs) still handled by the engine
  pub allowed_hosts: Vec<String>,
  /// Fetched and stored at install time, all or nothing
  pub precache: Vec<String>,
  /// Served for navigations when both network and cache miss
  pub offline_document: String,
  /// Data-store key of the generation metadata record
  pub metadata_key: String,
  /// JSON document `{ "version": "..." }` polled by update checks
  pub version_url: String,
  /// Path segments that mark API/data requests
  pub api_segments: Vec<String>,
  #[serde(deserialize_with = "deserialize_lowercase_set")]
  pub image_extensions: BTreeSet<String>,
  #[serde(deserialize_with = "deserialize_lowercase_set")]
  pub static_extensions: BTreeSet<String>,
  /// Data-store entries refreshed by a sync
  pub sync_segments: Vec<String>,
  /// Promote a freshly installed generation without waiting
  pub skip_waiting: bool,
  pub network_timeout_secs: u64,
  /// SQLite database path (defaults to $XDG_DATA_HOME/swcache/cache.db)
  pub database: Option<PathBuf>,
  /// Directory for rolling log files
  pub log_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      version: "1.0.0".to_string(),
      cache_prefix: "app".to_string(),
      origin: Url::parse("http://localhost/").expect("static URL is valid"),
      allowed_hosts: Vec::new(),
      precache: ["/", "/index.html", "/offline.html", "/manifest.json"]
        .into_iter()
        .map(String::from)
        .collect(),
      offline_document: "/offline.html".to_string(),
      metadata_key: "/metadata.json".to_string(),
      version_url: "/version.json".to_string(),
      api_segments: vec!["/api/".to_string(), "/data/".to_string()],
      image_extensions: ["png", "jpg", "jpeg", "gif", "webp", "svg"]
        .into_iter()
        .map(String::from)
        .collect(),
      static_extensions: ["html", "css", "js", "json", "svg", "png", "ico", "webmanifest"]
        .into_iter()
        .map(String::from)
        .collect(),
      sync_segments: vec!["/api/".to_string()],
      skip_waiting: false,
      network_timeout_secs: 10,
      database: None,
      log_dir: None,
    }
  }
}

fn deserialize_lowercase_set<'de, D>(deserializer: D) -> Result<BTreeSet<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Vec<String> = Vec::deserialize(deserializer)?;
  Ok(
    v.into_iter()
      .map(|s| s.trim_start_matches('.').to_lowercase())
      .collect(),
  )
}

impl EngineConfig {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./swcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/swcache/config.yaml
  ///
  /// Falls back to built-in defaults when no file is found.
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

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };
    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("swcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("swcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: EngineConfig = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if self.version.trim().is_empty() {
      return Err(eyre!("version must not be empty"));
    }
    if self.cache_prefix.trim().is_empty() {
      return Err(eyre!("cache_prefix must not be empty"));
    }
    for url in self
      .precache
      .iter()
      .chain([&self.offline_document, &self.metadata_key, &self.version_url])
    {
      self.resolve(url)?;
    }
    Ok(())
  }

  /// Resolve a possibly relative URL against the configured origin.
  pub fn resolve(&self, url: &str) -> Result<Url> {
    self
      .origin
      .join(url)
      .map_err(|e| eyre!("Invalid URL {}: {}", url, e))
  }

  /// Store names of the configured generation.
  pub fn cache_names(&self) -> CacheNames {
    CacheNames::for_version(&self.cache_prefix, &self.version)
  }
}
