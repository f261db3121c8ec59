//! Cache coordinator: orchestrates the local store, the remote source and the
//! conflict resolver.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use super::clock::{Clock, SystemClock};
use super::error::{SyncError, SyncResult};
use super::locks::KeyLocks;
use super::resolver::{ConflictRecord, ConflictResolver};
use super::storage::LocalStore;
use super::traits::{CacheEntry, CacheResult, ReadPolicy, Record};
use crate::remote::{RemoteError, RemoteSource};

/// Offline-first coordinator between a [`LocalStore`] and a [`RemoteSource`].
///
/// Reads are served from the store; writes go through the remote first.
/// Every mutation of a key (write, refresh, delete) runs under that key's
/// lock, so mutations of one key never interleave. Reads never wait for the
/// lock: a `RemoteFirst` read only stores what it fetched when the key is free.
pub struct CacheCoordinator<S, R> {
  inner: Arc<Inner<S, R>>,
}

struct Inner<S, R> {
  store: S,
  remote: R,
  resolver: ConflictResolver,
  locks: KeyLocks,
  clock: Arc<dyn Clock>,
  /// Keys with a background refresh in flight
  refreshing: Arc<Mutex<HashSet<String>>>,
}

/// Marks a key as having a background refresh in flight until dropped, so the
/// mark is cleared however the refresh task ends.
struct InFlight {
  keys: Arc<Mutex<HashSet<String>>>,
  key: String,
}

impl InFlight {
  /// `None` if the key is already marked.
  fn claim(keys: &Arc<Mutex<HashSet<String>>>, key: &str) -> Option<Self> {
    let inserted = keys
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .insert(key.to_string());
    inserted.then(|| Self {
      keys: Arc::clone(keys),
      key: key.to_string(),
    })
  }
}

impl Drop for InFlight {
  fn drop(&mut self) {
    self
      .keys
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .remove(&self.key);
  }
}

impl<S, R> Clone for CacheCoordinator<S, R> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<S, R> CacheCoordinator<S, R>
where
  S: LocalStore + 'static,
  R: RemoteSource,
{
  pub fn new(store: S, remote: R) -> Self {
    Self::with_clock(store, remote, Arc::new(SystemClock))
  }

  pub fn with_clock(store: S, remote: R, clock: Arc<dyn Clock>) -> Self {
    Self {
      inner: Arc::new(Inner {
        store,
        remote,
        resolver: ConflictResolver::new(),
        locks: KeyLocks::new(),
        clock,
        refreshing: Arc::new(Mutex::new(HashSet::new())),
      }),
    }
  }

  /// Read a record according to `policy`.
  ///
  /// - `CacheFirst` returns the local entry (stale or not) without waiting on
  ///   the network, and schedules a background refresh if it is stale.
  /// - `CacheOnly` never touches the remote.
  /// - `RemoteFirst` fetches from the remote, falling back to the local entry
  ///   when the remote is unreachable. The fetched copy is reconciled and
  ///   stored unless a mutation of the key is in flight, in which case it is
  ///   returned without being stored.
  pub async fn read(&self, key: &str, policy: ReadPolicy) -> SyncResult<CacheResult<CacheEntry>> {
    match policy {
      ReadPolicy::CacheOnly => {
        let entry = self.local(key)?;
        let stale = entry.is_stale(self.inner.clock.now());
        Ok(CacheResult::from_cache(entry, stale))
      }
      ReadPolicy::CacheFirst => {
        let entry = self.local(key)?;
        let stale = entry.is_stale(self.inner.clock.now());
        if stale {
          self.spawn_refresh(key);
        }
        Ok(CacheResult::from_cache(entry, stale))
      }
      ReadPolicy::RemoteFirst => match self.read_remote(key).await {
        Ok(entry) => Ok(CacheResult::from_network(entry)),
        Err(SyncError::Remote(e)) if e.is_transient() => match self.inner.store.get(key)? {
          Some(entry) => {
            debug!(key, error = %e, "remote unavailable, serving cached copy");
            Ok(CacheResult::offline(entry))
          }
          None => Err(e.into()),
        },
        Err(e) => Err(e),
      },
    }
  }

  /// Write-through: push to the remote, then record the result locally.
  ///
  /// On a transient remote failure the write is kept locally as dirty (it
  /// survives restarts) and the transient error is returned; the scheduler
  /// flushes it later. On a permanent failure nothing is stored.
  pub async fn write(&self, key: &str, payload: Value) -> SyncResult<CacheEntry> {
    let _guard = self.inner.locks.acquire(key).await;

    let version = self
      .inner
      .store
      .get(key)?
      .map(|e| e.record.version.saturating_add(1))
      .unwrap_or(1);
    let candidate = Record {
      key: key.to_string(),
      payload,
      version,
      fetched_at: self.inner.clock.now(),
      dirty: false,
    };

    match self.inner.remote.push(&candidate).await {
      Ok(stored) => {
        debug!(key, version = stored.version, "write acknowledged by remote");
        self.store_clean(stored)
      }
      Err(e) if e.is_transient() => {
        warn!(key, error = %e, "remote unavailable, queueing write locally");
        self.inner.store.put(&candidate.into_dirty())?;
        Err(e.into())
      }
      Err(e) => {
        warn!(key, error = %e, "write rejected by remote");
        Err(e.into())
      }
    }
  }

  /// Bring the local entry for `key` in line with the remote.
  ///
  /// A pending (dirty) local write is pushed unless the remote has moved past
  /// it, in which case the two are reconciled by the conflict resolver.
  pub async fn refresh(&self, key: &str) -> SyncResult<CacheEntry> {
    let _guard = self.inner.locks.acquire(key).await;
    let fetched = self.inner.remote.fetch(key).await;
    self.reconcile(key, fetched).await
  }

  async fn read_remote(&self, key: &str) -> SyncResult<CacheEntry> {
    let fetched = self.inner.remote.fetch(key).await;
    match self.inner.locks.try_acquire(key) {
      Some(_guard) => self.reconcile(key, fetched).await,
      None => {
        debug!(key, "key is being modified, serving remote copy without storing it");
        let record = fetched?.into_clean().fetched(self.inner.clock.now());
        Ok(self.inner.store.entry_for(record))
      }
    }
  }

  /// Apply a fetch result to the local entry. The caller holds the key lock.
  async fn reconcile(
    &self,
    key: &str,
    fetched: Result<Record, RemoteError>,
  ) -> SyncResult<CacheEntry> {
    match self.inner.store.get(key)? {
      Some(entry) if entry.is_dirty() => self.reconcile_pending(entry.record, fetched).await,
      // Fetched before a write that has since landed
      Some(entry) if matches!(&fetched, Ok(r) if r.version < entry.record.version) => {
        debug!(key, version = entry.record.version, "fetched copy is older than local, keeping local");
        Ok(entry)
      }
      _ => self.store_clean(fetched?),
    }
  }

  async fn reconcile_pending(
    &self,
    local: Record,
    fetched: Result<Record, RemoteError>,
  ) -> SyncResult<CacheEntry> {
    let remote = match fetched {
      Ok(record) => Some(record),
      // The pending write never reached the remote
      Err(RemoteError::NotFound(_)) => None,
      Err(e) => return Err(e.into()),
    };

    let winner = match &remote {
      None => local.clone(),
      Some(r) if r.same_content(&local) => {
        debug!(key = %local.key, "pending write already applied remotely");
        return self.store_clean(r.clone());
      }
      Some(r) if r.version < local.version => local.clone(),
      Some(r) => {
        debug!(
          key = %local.key,
          local_version = local.version,
          remote_version = r.version,
          "pending write diverged from remote"
        );
        self.inner.resolver.resolve_conflict(ConflictRecord {
          local: local.clone(),
          remote: r.clone(),
        })
      }
    };

    if !winner.dirty {
      info!(key = %local.key, version = winner.version, "remote update supersedes pending write");
      return self.store_clean(winner);
    }

    match self.inner.remote.push(&winner).await {
      Ok(stored) => {
        info!(key = %stored.key, version = stored.version, "flushed pending write");
        self.store_clean(stored)
      }
      Err(e) if e.is_transient() => Err(e.into()),
      Err(e) => {
        warn!(key = %local.key, error = %e, "pending write rejected, discarding it");
        match remote {
          Some(r) => {
            self.store_clean(r)?;
          }
          None => {
            self.inner.store.delete(&local.key)?;
          }
        }
        Err(e.into())
      }
    }
  }

  /// Drop the local copy of `key`.
  pub async fn delete(&self, key: &str) -> SyncResult<()> {
    let _guard = self.inner.locks.acquire(key).await;
    if self.inner.store.delete(key)? {
      Ok(())
    } else {
      Err(SyncError::NotFound(key.to_string()))
    }
  }

  /// Local entries whose key starts with `prefix`, in key order.
  pub fn entries(&self, prefix: &str) -> SyncResult<Vec<CacheEntry>> {
    let entries = self
      .inner
      .store
      .scan(|e| e.key().starts_with(prefix))
      .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
  }

  /// Keys holding writes the remote has not acknowledged.
  pub fn dirty_keys(&self) -> SyncResult<Vec<String>> {
    let keys = self
      .inner
      .store
      .scan(|e| e.is_dirty())
      .map(|e| e.map(|e| e.record.key))
      .collect::<Result<Vec<_>, _>>()?;
    Ok(keys)
  }

  /// Delete clean entries not refreshed within `retention`.
  pub fn purge_expired(&self, retention: Duration) -> SyncResult<usize> {
    let now = self.inner.clock.now();
    let cutoff = now
      .checked_sub_signed(retention)
      .unwrap_or(DateTime::<Utc>::MIN_UTC);
    let removed = self.inner.store.purge_expired(cutoff)?;
    if removed > 0 {
      info!(removed, %cutoff, "purged expired cache entries");
    }
    Ok(removed)
  }

  fn local(&self, key: &str) -> SyncResult<CacheEntry> {
    self
      .inner
      .store
      .get(key)?
      .ok_or_else(|| SyncError::NotFound(key.to_string()))
  }

  fn store_clean(&self, record: Record) -> SyncResult<CacheEntry> {
    let record = record.into_clean().fetched(self.inner.clock.now());
    Ok(self.inner.store.put(&record)?)
  }

  /// Refresh `key` in the background unless a refresh is already running.
  fn spawn_refresh(&self, key: &str) {
    let Some(mark) = InFlight::claim(&self.inner.refreshing, key) else {
      return;
    };

    let this = self.clone();
    let key = key.to_string();
    tokio::spawn(async move {
      let result = this.refresh(&key).await;
      drop(mark);

      match result {
        Ok(entry) => debug!(key = %key, version = entry.record.version, "background refresh done"),
        Err(e) => warn!(key = %key, error = %e, "background refresh failed"),
      }
    });
  }

  #[cfg(test)]
  fn refresh_in_flight(&self, key: &str) -> bool {
    self.inner.refreshing.lock().unwrap().contains(key)
  }

  #[cfg(test)]
  pub(crate) fn remote(&self) -> &R {
    &self.inner.remote
  }
}
