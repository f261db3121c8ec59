//! Scriptable in-memory remote for tests.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::cache::Record;

use super::{RemoteError, RemoteSource};

type PushHook = Box<dyn Fn(Record) -> Record + Send + Sync>;

#[derive(Default)]
pub struct FakeRemote {
  records: Mutex<HashMap<String, Record>>,
  fetch_failures: Mutex<VecDeque<RemoteError>>,
  push_failures: Mutex<VecDeque<RemoteError>>,
  on_push: Mutex<Option<PushHook>>,
  latency: Mutex<Duration>,
  push_latency: Mutex<Duration>,
  fetches: AtomicUsize,
  pushes: AtomicUsize,
}

impl FakeRemote {
  pub fn new() -> Self {
    Self::default()
  }

  /// Put a record on the "server" directly.
  pub fn seed(&self, record: Record) {
    self
      .records
      .lock()
      .unwrap()
      .insert(record.key.clone(), record.into_clean());
  }

  pub fn get(&self, key: &str) -> Option<Record> {
    self.records.lock().unwrap().get(key).cloned()
  }

  /// Fail the next fetch with `error`. Queued failures are used in order.
  pub fn fail_fetch(&self, error: RemoteError) {
    self.fetch_failures.lock().unwrap().push_back(error);
  }

  /// Fail the next push with `error`.
  pub fn fail_push(&self, error: RemoteError) {
    self.push_failures.lock().unwrap().push_back(error);
  }

  /// Rewrite what the server stores on push.
  pub fn on_push(&self, hook: impl Fn(Record) -> Record + Send + Sync + 'static) {
    *self.on_push.lock().unwrap() = Some(Box::new(hook));
  }

  pub fn set_latency(&self, latency: Duration) {
    *self.latency.lock().unwrap() = latency;
  }

  /// Extra delay for pushes only.
  pub fn set_push_latency(&self, latency: Duration) {
    *self.push_latency.lock().unwrap() = latency;
  }

  pub fn fetch_count(&self) -> usize {
    self.fetches.load(Ordering::SeqCst)
  }

  pub fn push_count(&self) -> usize {
    self.pushes.load(Ordering::SeqCst)
  }

  async fn delay(&self, extra: Duration) {
    let latency = *self.latency.lock().unwrap() + extra;
    if !latency.is_zero() {
      tokio::time::sleep(latency).await;
    }
  }
}

#[async_trait]
impl RemoteSource for FakeRemote {
  async fn fetch(&self, key: &str) -> Result<Record, RemoteError> {
    self.fetches.fetch_add(1, Ordering::SeqCst);
    self.delay(Duration::ZERO).await;

    if let Some(error) = self.fetch_failures.lock().unwrap().pop_front() {
      return Err(error);
    }
    self
      .get(key)
      .ok_or_else(|| RemoteError::NotFound(key.to_string()))
  }

  async fn push(&self, record: &Record) -> Result<Record, RemoteError> {
    self.pushes.fetch_add(1, Ordering::SeqCst);
    let extra = *self.push_latency.lock().unwrap();
    self.delay(extra).await;

    if let Some(error) = self.push_failures.lock().unwrap().pop_front() {
      return Err(error);
    }

    let mut records = self.records.lock().unwrap();
    let version = records.get(&record.key).map(|r| r.version + 1).unwrap_or(1);
    let mut stored = record.clone().into_clean();
    stored.version = version;
    if let Some(hook) = self.on_push.lock().unwrap().as_ref() {
      stored = hook(stored);
    }
    records.insert(stored.key.clone(), stored.clone());
    Ok(stored)
  }
}
