//! Per-key write exclusion.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Prune idle locks once the arena grows past this many keys.
const PRUNE_THRESHOLD: usize = 256;

/// Arena of async mutexes keyed by record key.
///
/// Holding the guard returned by [`KeyLocks::acquire`] gives exclusive
/// mutation rights for that key. Unrelated keys never contend.
#[derive(Default)]
pub struct KeyLocks {
  locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyLocks {
  pub fn new() -> Self {
    Self::default()
  }

  /// Wait for exclusive access to `key`.
  pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
    self.lock_for(key).lock_owned().await
  }

  /// Exclusive access to `key` if no one else holds it right now.
  pub fn try_acquire(&self, key: &str) -> Option<OwnedMutexGuard<()>> {
    self.lock_for(key).try_lock_owned().ok()
  }

  fn lock_for(&self, key: &str) -> Arc<AsyncMutex<()>> {
    let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
    if locks.len() >= PRUNE_THRESHOLD {
      // Only the arena holds a reference: nobody is waiting or writing
      locks.retain(|_, l| Arc::strong_count(l) > 1);
    }
    Arc::clone(locks.entry(key.to_string()).or_default())
  }

  #[cfg(test)]
  fn len(&self) -> usize {
    self.locks.lock().unwrap().len()
  }
}
