use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::{DEFAULT_MEMORY_CAPACITY, DEFAULT_NAMESPACE, DEFAULT_QUOTA_BYTES};

/// Environment variable that overrides `base_url`.
pub const BASE_URL_ENV: &str = "OFFLINE_SYNC_BASE_URL";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Origin every relative request URL is resolved against
  pub base_url: String,
  pub cache: CacheConfig,
  pub offline: OfflineConfig,
  pub network: NetworkConfig,
  pub logging: LoggingConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      base_url: "http://localhost:3000".to_string(),
      cache: CacheConfig::default(),
      offline: OfflineConfig::default(),
      network: NetworkConfig::default(),
      logging: LoggingConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Entry budget of the memory tier
  pub memory_capacity: usize,
  /// Key prefix for persistent-tier rows
  pub persistent_namespace: String,
  /// Persistent-tier quota in bytes of key + value text
  pub persistent_quota_bytes: u64,
  /// Directory for the SQLite files (defaults to the platform data dir)
  pub data_dir: Option<PathBuf>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      memory_capacity: DEFAULT_MEMORY_CAPACITY,
      persistent_namespace: DEFAULT_NAMESPACE.to_string(),
      persistent_quota_bytes: DEFAULT_QUOTA_BYTES,
      data_dir: None,
    }
  }
}

/// Tunables of the offline queue. Only the offline manager reads these.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
  pub max_queue_size: usize,
  pub sync_interval_ms: u64,
  pub max_retries: u32,
  /// URL path prefixes whose queued requests are evicted last
  pub critical_paths: Vec<String>,
}

impl Default for OfflineConfig {
  fn default() -> Self {
    Self {
      max_queue_size: 100,
      sync_interval_ms: 30_000,
      max_retries: 3,
      critical_paths: vec![
        "/api/tools".to_string(),
        "/api/categories".to_string(),
        "/api/search".to_string(),
      ],
    }
  }
}

impl OfflineConfig {
  pub fn sync_interval(&self) -> Duration {
    Duration::from_millis(self.sync_interval_ms)
  }
}

/// Partial update for [`OfflineConfig`]; `None` fields are left alone.
#[derive(Debug, Clone, Default)]
pub struct OfflineConfigUpdate {
  pub max_queue_size: Option<usize>,
  pub sync_interval_ms: Option<u64>,
  pub max_retries: Option<u32>,
  pub critical_paths: Option<Vec<String>>,
}

impl OfflineConfig {
  pub fn validate(&self) -> Result<()> {
    if self.sync_interval_ms == 0 {
      return Err(eyre!("offline.sync_interval_ms must be greater than zero"));
    }
    Ok(())
  }

  /// Apply `update`, leaving the config untouched when the result is invalid.
  pub fn apply(&mut self, update: OfflineConfigUpdate) -> Result<()> {
    let mut next = self.clone();
    next.merge(update);
    next.validate()?;
    *self = next;
    Ok(())
  }

  fn merge(&mut self, update: OfflineConfigUpdate) {
    if let Some(v) = update.max_queue_size {
      self.max_queue_size = v;
    }
    if let Some(v) = update.sync_interval_ms {
      self.sync_interval_ms = v;
    }
    if let Some(v) = update.max_retries {
      self.max_retries = v;
    }
    if let Some(v) = update.critical_paths {
      self.critical_paths = v;
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  /// Small same-origin resource used by the liveness probe
  pub probe_path: String,
  pub probe_interval_ms: u64,
  /// Upper bound for every outgoing request, probes included
  pub request_timeout_ms: u64,
  /// Connectivity assumed before the first event or probe
  pub assume_online: bool,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self {
      probe_path: "/favicon.ico".to_string(),
      probe_interval_ms: 30_000,
      request_timeout_ms: 10_000,
      assume_online: true,
    }
  }
}

impl NetworkConfig {
  pub fn probe_interval(&self) -> Duration {
    Duration::from_millis(self.probe_interval_ms)
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_millis(self.request_timeout_ms)
  }

  pub fn validate(&self) -> Result<()> {
    if self.probe_interval_ms == 0 {
      return Err(eyre!("network.probe_interval_ms must be greater than zero"));
    }
    if self.request_timeout_ms == 0 {
      return Err(eyre!("network.request_timeout_ms must be greater than zero"));
    }
    Ok(())
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// EnvFilter directive used when RUST_LOG is not set
  pub level: String,
  /// Log to stderr instead of a rolling file in the data directory
  pub stderr: bool,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      stderr: false,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offline-sync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offline-sync/config.yaml
  ///
  /// Defaults are used when no file is found. `OFFLINE_SYNC_BASE_URL`
  /// overrides `base_url` either way.
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
      None => Config::default(),
    };

    if let Ok(base_url) = std::env::var(BASE_URL_ENV) {
      config.base_url = base_url;
    }

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("offline-sync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offline-sync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    config.validate()?;
    Ok(config)
  }

  pub fn validate(&self) -> Result<()> {
    self.offline.validate()?;
    self.network.validate()
  }

  /// Directory holding the cache databases and log files.
  pub fn data_dir(&self) -> Result<PathBuf> {
    match &self.cache.data_dir {
      Some(dir) => Ok(dir.clone()),
      None => crate::db::default_data_dir(),
    }
  }
}
