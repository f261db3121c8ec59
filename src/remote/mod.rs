//! Remote data source.
//!
//! The cache treats the network as an opaque source of versioned records.
//! [`RemoteSource`] is the seam; [`HttpRemote`] is the JSON-over-HTTP
//! implementation used by the binary.

mod client;
mod error;
#[cfg(test)]
pub(crate) mod fake;

use async_trait::async_trait;

use crate::cache::Record;

pub use client::HttpRemote;
pub use error::RemoteError;

/// A remote API holding the authoritative copy of each record.
///
/// Implementations make a single attempt per call; retry policy belongs to
/// the caller.
#[async_trait]
pub trait RemoteSource: Send + Sync + 'static {
  /// Fetch the current remote copy of `key`.
  async fn fetch(&self, key: &str) -> Result<Record, RemoteError>;

  /// Send a local record upstream. Returns the record as stored remotely,
  /// carrying the server-assigned version.
  async fn push(&self, record: &Record) -> Result<Record, RemoteError>;
}
