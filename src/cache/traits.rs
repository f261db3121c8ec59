//! Core types for the caching system.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A cached domain record.
///
/// `payload` is opaque to the cache; only `key`, `version` and `dirty` carry
/// meaning for synchronization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
  /// Stable identifier (e.g. "current:48.85,2.35")
  pub key: String,
  /// Serialized domain value
  pub payload: Value,
  /// Remote-assigned version, or the locally assigned one for a pending write
  pub version: u64,
  /// When this copy was fetched or written locally
  pub fetched_at: DateTime<Utc>,
  /// Has a local write that the remote has not acknowledged
  pub dirty: bool,
}

impl Record {
  /// Create a clean record as returned by the remote.
  pub fn new(key: impl Into<String>, payload: Value, version: u64) -> Self {
    Self {
      key: key.into(),
      payload,
      version,
      fetched_at: Utc::now(),
      dirty: false,
    }
  }

  /// Stamp the record as fetched at `now`.
  pub fn fetched(mut self, now: DateTime<Utc>) -> Self {
    self.fetched_at = now;
    self
  }

  /// Mark the record as carrying an unsynced local write.
  pub fn into_dirty(mut self) -> Self {
    self.dirty = true;
    self
  }

  /// Mark the record as acknowledged by the remote.
  pub fn into_clean(mut self) -> Self {
    self.dirty = false;
    self
  }

  /// True when both records hold the same version and payload.
  pub fn same_content(&self, other: &Record) -> bool {
    self.version == other.version && self.payload == other.payload
  }
}

/// A record as stored locally, with its freshness deadline.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
  pub record: Record,
  /// `fetched_at + ttl`, recomputed on every upsert
  pub fresh_until: DateTime<Utc>,
}

impl CacheEntry {
  pub fn key(&self) -> &str {
    &self.record.key
  }

  pub fn is_dirty(&self) -> bool {
    self.record.dirty
  }

  /// Stale entries are still served; staleness only triggers a refresh.
  pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
    now > self.fresh_until
  }
}

/// Time-to-live settings for cached records.
///
/// The longest matching key prefix wins; keys with no matching prefix use
/// `default_ttl`.
#[derive(Debug, Clone)]
pub struct FreshnessPolicy {
  default_ttl: Duration,
  overrides: Vec<(String, Duration)>,
}

impl FreshnessPolicy {
  pub fn new(default_ttl: Duration) -> Self {
    Self {
      default_ttl,
      overrides: Vec::new(),
    }
  }

  /// Use a different TTL for keys starting with `prefix`.
  pub fn with_override(mut self, prefix: impl Into<String>, ttl: Duration) -> Self {
    self.overrides.push((prefix.into(), ttl));
    // Longest prefix first so the first match is the most specific one
    self
      .overrides
      .sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()));
    self
  }

  pub fn ttl_for(&self, key: &str) -> Duration {
    self
      .overrides
      .iter()
      .find(|(prefix, _)| key.starts_with(prefix.as_str()))
      .map(|(_, ttl)| *ttl)
      .unwrap_or(self.default_ttl)
  }

  pub fn deadline(&self, record: &Record) -> DateTime<Utc> {
    record
      .fetched_at
      .checked_add_signed(self.ttl_for(&record.key))
      .unwrap_or(DateTime::<Utc>::MAX_UTC)
  }
}

impl Default for FreshnessPolicy {
  fn default() -> Self {
    Self::new(Duration::hours(1))
  }
}

/// How `read` chooses between the local store and the remote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ReadPolicy {
  /// Serve the local entry, refreshing it in the background when stale
  #[default]
  CacheFirst,
  /// Never touch the remote
  CacheOnly,
  /// Ask the remote first, falling back to the local entry on transient failure
  RemoteFirst,
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
}

impl<T> CacheResult<T> {
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
    }
  }

  pub fn from_cache(data: T, is_stale: bool) -> Self {
    Self {
      data,
      source: if is_stale {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
    }
  }

  /// Remote unreachable, serving the local copy.
  pub fn offline(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
    }
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Data from cache past its deadline; a refresh may be in flight
  CacheStale,
  /// Offline mode - network unavailable, serving cached data
  Offline,
}
