//! Offline-first record cache.
//!
//! This module provides:
//! - A durable SQLite store of versioned records with freshness deadlines
//! - A coordinator that serves reads by [`ReadPolicy`] and writes through to
//!   the remote, keeping writes the remote could not accept as dirty
//! - Last-writer-wins conflict resolution for diverged pending writes

mod clock;
mod coordinator;
mod error;
mod locks;
mod resolver;
mod storage;
mod traits;

pub use clock::{Clock, SystemClock};
pub use coordinator::CacheCoordinator;
pub use error::SyncError;
pub use storage::{LocalStore, SqliteStorage};
pub use traits::{CacheEntry, CacheSource, FreshnessPolicy, ReadPolicy, Record};
