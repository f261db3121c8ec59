use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::FreshnessPolicy;
use crate::sync::SyncTarget;

/// Environment variable holding the remote API token.
pub const TOKEN_ENV: &str = "NIMBUS_API_TOKEN";

/// Id of the pending-write flush added when no task targets dirty records.
pub const FLUSH_TASK_ID: &str = "pending-writes";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub remote: RemoteConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub sync: SyncConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  /// Base URL of the records API
  pub url: String,
  /// Per-request timeout in seconds
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Database file (defaults to the platform data directory)
  pub path: Option<PathBuf>,
  /// Freshness window for keys without an override
  #[serde(default = "default_ttl_secs")]
  pub ttl_secs: u64,
  /// Freshness window per key prefix, e.g. `daily: 86400`
  #[serde(default)]
  pub ttl_overrides: BTreeMap<String, u64>,
  /// Clean entries older than this are purged
  #[serde(default = "default_retention_secs")]
  pub retention_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      path: None,
      ttl_secs: default_ttl_secs(),
      ttl_overrides: BTreeMap::new(),
      retention_secs: default_retention_secs(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  /// Maximum number of tasks running at once
  #[serde(default = "default_workers")]
  pub workers: usize,
  /// Randomize failure delays
  #[serde(default = "default_true")]
  pub jitter: bool,
  /// Interval of the pending-write flush when no `dirty` task is configured
  #[serde(default = "default_flush_interval_secs")]
  pub flush_interval_secs: u64,
  #[serde(default)]
  pub tasks: Vec<TaskConfig>,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      workers: default_workers(),
      jitter: true,
      flush_interval_secs: default_flush_interval_secs(),
      tasks: Vec::new(),
    }
  }
}

impl SyncConfig {
  /// Tasks to schedule: the configured ones, plus a pending-write flush
  /// unless one of them already targets dirty records.
  pub fn effective_tasks(&self) -> Vec<TaskConfig> {
    let mut tasks = self.tasks.clone();
    if !tasks.iter().any(|t| t.dirty) {
      tasks.push(TaskConfig {
        id: FLUSH_TASK_ID.to_string(),
        key: None,
        prefix: None,
        dirty: true,
        interval_secs: self.flush_interval_secs,
        backoff_base_secs: default_backoff_base_secs(),
        max_backoff_secs: default_max_backoff_secs(),
      });
    }
    tasks
  }
}

/// A periodic sync task. Exactly one of `key`, `prefix` or `dirty` selects
/// what it refreshes.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskConfig {
  pub id: String,
  pub key: Option<String>,
  pub prefix: Option<String>,
  #[serde(default)]
  pub dirty: bool,
  pub interval_secs: u64,
  #[serde(default = "default_backoff_base_secs")]
  pub backoff_base_secs: u64,
  #[serde(default = "default_max_backoff_secs")]
  pub max_backoff_secs: u64,
}

impl TaskConfig {
  pub fn target(&self) -> Result<SyncTarget> {
    match (&self.key, &self.prefix, self.dirty) {
      (Some(key), None, false) => Ok(SyncTarget::Key(key.clone())),
      (None, Some(prefix), false) => Ok(SyncTarget::Prefix(prefix.clone())),
      (None, None, true) => Ok(SyncTarget::Dirty),
      _ => Err(eyre!(
        "Task '{}' must set exactly one of key, prefix or dirty",
        self.id
      )),
    }
  }

  pub fn interval(&self) -> Duration {
    Duration::from_secs(self.interval_secs)
  }

  pub fn backoff_base(&self) -> Duration {
    Duration::from_secs(self.backoff_base_secs)
  }

  pub fn max_backoff(&self) -> Duration {
    Duration::from_secs(self.max_backoff_secs)
  }
}

fn default_timeout_secs() -> u64 {
  10
}

fn default_ttl_secs() -> u64 {
  3600
}

fn default_retention_secs() -> u64 {
  7 * 24 * 3600
}

fn default_workers() -> usize {
  4
}

fn default_true() -> bool {
  true
}

fn default_flush_interval_secs() -> u64 {
  60
}

fn default_backoff_base_secs() -> u64 {
  30
}

fn default_max_backoff_secs() -> u64 {
  1800
}

/// Seconds as a chrono duration, saturating at the largest representable one.
fn to_chrono(secs: u64) -> chrono::Duration {
  i64::try_from(secs)
    .ok()
    .and_then(chrono::Duration::try_seconds)
    .unwrap_or(chrono::Duration::MAX)
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./nimbus-sync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/nimbus-sync/config.yaml
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

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/nimbus-sync/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("nimbus-sync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("nimbus-sync").join("config.yaml");
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

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    if config.sync.flush_interval_secs == 0 {
      return Err(eyre!("sync.flush_interval_secs must be non-zero"));
    }

    let mut ids = HashSet::new();
    for task in &config.sync.tasks {
      task.target()?;
      if !ids.insert(task.id.as_str()) {
        return Err(eyre!("Duplicate task id '{}'", task.id));
      }
      if task.id == FLUSH_TASK_ID && !task.dirty {
        return Err(eyre!(
          "Task id '{}' is reserved for the pending-write flush",
          FLUSH_TASK_ID
        ));
      }
      if task.interval_secs == 0 {
        return Err(eyre!("Task '{}' needs a non-zero interval", task.id));
      }
      if task.backoff_base_secs == 0 {
        return Err(eyre!("Task '{}' needs a non-zero backoff base", task.id));
      }
    }
    Ok(config)
  }

  /// Freshness windows from the `cache` section.
  pub fn freshness_policy(&self) -> FreshnessPolicy {
    self.cache.ttl_overrides.iter().fold(
      FreshnessPolicy::new(to_chrono(self.cache.ttl_secs)),
      |policy, (prefix, ttl)| policy.with_override(prefix.clone(), to_chrono(*ttl)),
    )
  }

  pub fn retention(&self) -> chrono::Duration {
    to_chrono(self.cache.retention_secs)
  }

  /// Get the remote API token from the environment, if set.
  pub fn api_token() -> Option<String> {
    std::env::var(TOKEN_ENV).ok().filter(|t| !t.is_empty())
  }
}
