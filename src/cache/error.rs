use thiserror::Error;

use crate::remote::RemoteError;

/// Local store failure. Always fatal to the current operation.
#[derive(Error, Debug)]
pub enum StorageError {
  #[error("SQLite error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("Failed to (de)serialize payload: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),

  #[error("Invalid stored value for {key}: {reason}")]
  Corrupt { key: String, reason: String },

  #[error("Lock poisoned")]
  LockPoisoned,
}

/// Errors surfaced by the cache coordinator.
#[derive(Error, Debug)]
pub enum SyncError {
  #[error("No cached record for {0}")]
  NotFound(String),

  #[error(transparent)]
  Storage(#[from] StorageError),

  #[error(transparent)]
  Remote(#[from] RemoteError),
}

impl SyncError {
  /// Worth retrying later (the scheduler backs off on these).
  pub fn is_transient(&self) -> bool {
    matches!(self, SyncError::Remote(e) if e.is_transient())
  }
}

pub type SyncResult<T> = Result<T, SyncError>;
