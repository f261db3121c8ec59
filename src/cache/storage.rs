//! Local store trait and SQLite implementation.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::error::StorageError;
use super::traits::{CacheEntry, FreshnessPolicy, Record};

/// Rows fetched per query while scanning.
const SCAN_PAGE_SIZE: usize = 64;

/// Trait for durable record storage.
///
/// Every mutation is atomic for its key; readers never observe a
/// partially-written row.
pub trait LocalStore: Send + Sync {
  /// Look up a single entry.
  fn get(&self, key: &str) -> Result<Option<CacheEntry>, StorageError>;

  /// Insert or replace the record stored under `record.key`.
  fn put(&self, record: &Record) -> Result<CacheEntry, StorageError>;

  /// The entry `put` would produce for `record`, without storing it.
  fn entry_for(&self, record: Record) -> CacheEntry;

  /// Remove an entry. Returns `false` if nothing was stored under `key`.
  fn delete(&self, key: &str) -> Result<bool, StorageError>;

  /// Entries with keys strictly greater than `after`, in key order.
  fn scan_page(&self, after: Option<&str>, limit: usize)
    -> Result<Vec<CacheEntry>, StorageError>;

  /// Delete clean entries fetched before `cutoff`. Dirty entries are kept.
  fn purge_expired(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError>;

  /// Lazily iterate over entries matching `predicate`.
  ///
  /// Pages are read on demand, so calling `scan` again re-reads current state.
  fn scan<P>(&self, predicate: P) -> Scan<'_, Self, P>
  where
    Self: Sized,
    P: FnMut(&CacheEntry) -> bool,
  {
    Scan::new(self, predicate)
  }
}

/// Lazy, finite scan over a [`LocalStore`].
pub struct Scan<'a, S: ?Sized, P> {
  store: &'a S,
  predicate: P,
  buffer: VecDeque<CacheEntry>,
  last_key: Option<String>,
  done: bool,
}

impl<'a, S: LocalStore + ?Sized, P> Scan<'a, S, P> {
  fn new(store: &'a S, predicate: P) -> Self {
    Self {
      store,
      predicate,
      buffer: VecDeque::new(),
      last_key: None,
      done: false,
    }
  }
}

impl<S, P> Iterator for Scan<'_, S, P>
where
  S: LocalStore + ?Sized,
  P: FnMut(&CacheEntry) -> bool,
{
  type Item = Result<CacheEntry, StorageError>;

  fn next(&mut self) -> Option<Self::Item> {
    loop {
      while let Some(entry) = self.buffer.pop_front() {
        if (self.predicate)(&entry) {
          return Some(Ok(entry));
        }
      }

      if self.done {
        return None;
      }

      match self
        .store
        .scan_page(self.last_key.as_deref(), SCAN_PAGE_SIZE)
      {
        Ok(page) => {
          if page.len() < SCAN_PAGE_SIZE {
            self.done = true;
          }
          if let Some(last) = page.last() {
            self.last_key = Some(last.record.key.clone());
          }
          self.buffer.extend(page);
        }
        Err(e) => {
          self.done = true;
          return Some(Err(e));
        }
      }
    }
  }
}

/// SQLite-based local store.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
  policy: FreshnessPolicy,
}

impl SqliteStorage {
  /// Open (or create) the store at `path`.
  pub fn open_at(path: &Path) -> Result<Self, StorageError> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }

    let conn = Connection::open(path)?;
    tracing::debug!(path = %path.display(), "opened cache database");
    Self::from_connection(conn)
  }

  /// Non-persistent store, mostly for tests.
  pub fn open_in_memory() -> Result<Self, StorageError> {
    Self::from_connection(Connection::open_in_memory()?)
  }

  fn from_connection(conn: Connection) -> Result<Self, StorageError> {
    let storage = Self {
      conn: Mutex::new(conn),
      policy: FreshnessPolicy::default(),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Set the TTL policy used to compute freshness deadlines.
  pub fn with_policy(mut self, policy: FreshnessPolicy) -> Self {
    self.policy = policy;
    self
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf, StorageError> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| {
        std::io::Error::new(
          std::io::ErrorKind::NotFound,
          "Could not determine data directory",
        )
      })?;

    Ok(data_dir.join("nimbus-sync").join("cache.db"))
  }

  fn run_migrations(&self) -> Result<(), StorageError> {
    self.lock()?.execute_batch(CACHE_SCHEMA)?;
    Ok(())
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
    self.conn.lock().map_err(|_| StorageError::LockPoisoned)
  }
}

/// Schema for the record table.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    key TEXT PRIMARY KEY,
    payload BLOB NOT NULL,
    version INTEGER NOT NULL,
    fetched_at TEXT NOT NULL,
    fresh_until TEXT NOT NULL,
    dirty INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_records_dirty ON records(dirty);
CREATE INDEX IF NOT EXISTS idx_records_fetched ON records(fetched_at);
"#;

const SELECT_COLUMNS: &str = "key, payload, version, fetched_at, fresh_until, dirty";

/// A row as it comes out of SQLite, before validation.
type RawRow = (String, Vec<u8>, i64, String, String, bool);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
  Ok((
    row.get(0)?,
    row.get(1)?,
    row.get(2)?,
    row.get(3)?,
    row.get(4)?,
    row.get(5)?,
  ))
}

fn decode_row(raw: RawRow) -> Result<CacheEntry, StorageError> {
  let (key, payload, version, fetched_at, fresh_until, dirty) = raw;
  let version = u64::try_from(version).map_err(|_| StorageError::Corrupt {
    key: key.clone(),
    reason: format!("negative version {}", version),
  })?;
  let payload = serde_json::from_slice(&payload)?;
  let fetched_at = parse_datetime(&key, &fetched_at)?;
  let fresh_until = parse_datetime(&key, &fresh_until)?;

  Ok(CacheEntry {
    record: Record {
      key,
      payload,
      version,
      fetched_at,
      dirty,
    },
    fresh_until,
  })
}

impl LocalStore for SqliteStorage {
  fn get(&self, key: &str) -> Result<Option<CacheEntry>, StorageError> {
    let conn = self.lock()?;
    let raw = conn
      .query_row(
        &format!("SELECT {} FROM records WHERE key = ?", SELECT_COLUMNS),
        params![key],
        read_row,
      )
      .optional()?;

    raw.map(decode_row).transpose()
  }

  fn entry_for(&self, record: Record) -> CacheEntry {
    CacheEntry {
      fresh_until: self.policy.deadline(&record),
      record,
    }
  }

  fn put(&self, record: &Record) -> Result<CacheEntry, StorageError> {
    let version = i64::try_from(record.version).map_err(|_| StorageError::Corrupt {
      key: record.key.clone(),
      reason: format!("version {} out of range", record.version),
    })?;
    let payload = serde_json::to_vec(&record.payload)?;
    let fresh_until = self.policy.deadline(record);

    let conn = self.lock()?;
    conn.execute(
      "INSERT INTO records (key, payload, version, fetched_at, fresh_until, dirty)
       VALUES (?1, ?2, ?3, ?4, ?5, ?6)
       ON CONFLICT(key) DO UPDATE SET
         payload = excluded.payload,
         version = excluded.version,
         fetched_at = excluded.fetched_at,
         fresh_until = excluded.fresh_until,
         dirty = excluded.dirty",
      params![
        record.key,
        payload,
        version,
        format_datetime(record.fetched_at),
        format_datetime(fresh_until),
        record.dirty,
      ],
    )?;

    Ok(CacheEntry {
      record: record.clone(),
      fresh_until,
    })
  }

  fn delete(&self, key: &str) -> Result<bool, StorageError> {
    let conn = self.lock()?;
    let removed = conn.execute("DELETE FROM records WHERE key = ?", params![key])?;
    Ok(removed > 0)
  }

  fn scan_page(
    &self,
    after: Option<&str>,
    limit: usize,
  ) -> Result<Vec<CacheEntry>, StorageError> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(&format!(
      "SELECT {} FROM records WHERE ?1 IS NULL OR key > ?1 ORDER BY key LIMIT ?2",
      SELECT_COLUMNS
    ))?;

    let rows = stmt
      .query_map(params![after, limit as i64], read_row)?
      .collect::<rusqlite::Result<Vec<_>>>()?;

    rows.into_iter().map(decode_row).collect()
  }

  fn purge_expired(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError> {
    let conn = self.lock()?;
    let removed = conn.execute(
      "DELETE FROM records WHERE dirty = 0 AND fetched_at < ?",
      params![format_datetime(cutoff)],
    )?;
    Ok(removed)
  }
}

/// Fixed-width UTC timestamps sort lexically in chronological order.
fn format_datetime(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(key: &str, s: &str) -> Result<DateTime<Utc>, StorageError> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| StorageError::Corrupt {
      key: key.to_string(),
      reason: format!("bad timestamp '{}': {}", s, e),
    })
}
