//! Conflict resolution between a pending local write and a remote update.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use tracing::warn;

use super::traits::Record;

/// A pending local write and the remote copy it diverged from.
#[derive(Debug, Clone)]
pub struct ConflictRecord {
  pub local: Record,
  pub remote: Record,
}

/// Equal versions carrying different payloads. Versioning should make this
/// impossible, so it is reported rather than merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictAnomaly {
  pub key: String,
  pub version: u64,
  pub local_digest: String,
  pub remote_digest: String,
}

impl fmt::Display for ConflictAnomaly {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{} v{}: local {} != remote {}",
      self.key,
      self.version,
      short(&self.local_digest),
      short(&self.remote_digest)
    )
  }
}

fn short(digest: &str) -> &str {
  &digest[..digest.len().min(12)]
}

/// Hex SHA-256 of a payload's canonical JSON encoding.
pub fn payload_digest(payload: &Value) -> String {
  let bytes = serde_json::to_vec(payload).unwrap_or_default();
  hex::encode(Sha256::digest(&bytes))
}

/// Last-writer-wins resolver. Stateless; share freely.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver;

impl ConflictResolver {
  pub fn new() -> Self {
    Self
  }

  /// Pick the record that should survive.
  ///
  /// The higher version wins. On a version tie with differing payloads the
  /// remote wins and a [`ConflictAnomaly`] is logged.
  pub fn resolve(&self, local: &Record, remote: &Record) -> Record {
    if local.version > remote.version {
      return local.clone();
    }
    if local.version == remote.version && local.payload != remote.payload {
      let anomaly = self.anomaly(local, remote);
      warn!(anomaly = %anomaly, "Conflict anomaly: equal versions, different payloads");
    }
    remote.clone()
  }

  /// Resolve a detected conflict, consuming it.
  pub fn resolve_conflict(&self, conflict: ConflictRecord) -> Record {
    self.resolve(&conflict.local, &conflict.remote)
  }

  fn anomaly(&self, local: &Record, remote: &Record) -> ConflictAnomaly {
    ConflictAnomaly {
      key: remote.key.clone(),
      version: remote.version,
      local_digest: payload_digest(&local.payload),
      remote_digest: payload_digest(&remote.payload),
    }
  }
}
