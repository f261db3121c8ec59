//! Background refresh scheduler.

use futures::stream::{self, StreamExt};
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::task::{SyncTarget, SyncTask};
use crate::cache::{CacheCoordinator, Clock, LocalStore, SyncError, SystemClock};
use crate::event::{SyncEvent, SyncEvents};
use crate::remote::RemoteSource;

/// Records refreshed concurrently within one prefix or dirty-set run.
const KEYS_IN_FLIGHT: usize = 8;

#[derive(Debug, Clone, Copy)]
pub struct SchedulerOptions {
  /// Maximum number of tasks running at once
  pub workers: usize,
  /// Add random jitter to failure delays
  pub jitter: bool,
}

impl Default for SchedulerOptions {
  fn default() -> Self {
    Self {
      workers: 4,
      jitter: true,
    }
  }
}

struct TaskHandle {
  task: Arc<Mutex<SyncTask>>,
  cancel: watch::Sender<bool>,
  join: JoinHandle<()>,
}

/// Runs registered [`SyncTask`]s in the background.
///
/// Each task has one runner. Runs of a task id are serialized through a run
/// guard that outlives replacement, so a task never overlaps itself even
/// while a replaced runner finishes its last run. The runner sleeps until the
/// task is due, refreshes its target through the coordinator, then
/// reschedules based on the outcome. Cancellation is observed while waiting;
/// a run in progress always completes.
pub struct SyncScheduler<S, R> {
  coordinator: CacheCoordinator<S, R>,
  clock: Arc<dyn Clock>,
  options: SchedulerOptions,
  workers: Arc<Semaphore>,
  tasks: Mutex<HashMap<String, TaskHandle>>,
  /// Held for the duration of each run, per task id
  run_guards: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
  events: mpsc::UnboundedSender<SyncEvent>,
}

impl<S, R> SyncScheduler<S, R>
where
  S: LocalStore + 'static,
  R: RemoteSource,
{
  pub fn new(coordinator: CacheCoordinator<S, R>, options: SchedulerOptions) -> (Self, SyncEvents) {
    Self::with_clock(coordinator, options, Arc::new(SystemClock))
  }

  pub fn with_clock(
    coordinator: CacheCoordinator<S, R>,
    options: SchedulerOptions,
    clock: Arc<dyn Clock>,
  ) -> (Self, SyncEvents) {
    let (events, stream) = SyncEvents::channel();
    let scheduler = Self {
      coordinator,
      clock,
      options,
      workers: Arc::new(Semaphore::new(options.workers.max(1))),
      tasks: Mutex::new(HashMap::new()),
      run_guards: Mutex::new(HashMap::new()),
      events,
    };
    (scheduler, stream)
  }

  /// Register a task, replacing any task with the same id. It runs at once.
  pub fn schedule(
    &self,
    task_id: &str,
    target: SyncTarget,
    interval: Duration,
    backoff_base: Duration,
    max_backoff: Duration,
  ) {
    let task = SyncTask::new(
      task_id,
      target,
      interval,
      backoff_base,
      max_backoff,
      self.clock.now(),
    );
    info!(task = task_id, target = %task.target, ?interval, "scheduling sync task");

    let task = Arc::new(Mutex::new(task));
    let (cancel, cancelled) = watch::channel(false);
    let runner = Runner {
      coordinator: self.coordinator.clone(),
      clock: Arc::clone(&self.clock),
      workers: Arc::clone(&self.workers),
      events: self.events.clone(),
      jitter: self.options.jitter,
      task: Arc::clone(&task),
      run_guard: self.run_guard(task_id),
    };
    let join = tokio::spawn(runner.run(cancelled));

    let previous = self.tasks().insert(
      task_id.to_string(),
      TaskHandle { task, cancel, join },
    );
    if let Some(previous) = previous {
      debug!(task = task_id, "replaced existing task");
      let _ = previous.cancel.send(true);
    }
  }

  /// Cancel and deregister a task. Returns `false` if it was not registered.
  pub fn cancel(&self, task_id: &str) -> bool {
    match self.tasks().remove(task_id) {
      Some(handle) => {
        info!(task = task_id, "cancelling sync task");
        let _ = handle.cancel.send(true);
        true
      }
      None => false,
    }
  }

  /// Snapshot of a registered task.
  pub fn task(&self, task_id: &str) -> Option<SyncTask> {
    self
      .tasks()
      .get(task_id)
      .map(|h| lock(&h.task).clone())
  }

  /// Cancel every task and wait for in-flight runs to finish.
  pub async fn shutdown(&self) {
    let handles: Vec<TaskHandle> = self.tasks().drain().map(|(_, h)| h).collect();
    for handle in &handles {
      let _ = handle.cancel.send(true);
    }
    for handle in handles {
      let _ = handle.join.await;
    }
  }

  fn tasks(&self) -> MutexGuard<'_, HashMap<String, TaskHandle>> {
    self.tasks.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn run_guard(&self, task_id: &str) -> Arc<AsyncMutex<()>> {
    let mut guards = self.run_guards.lock().unwrap_or_else(|e| e.into_inner());
    Arc::clone(guards.entry(task_id.to_string()).or_default())
  }
}

fn lock(task: &Mutex<SyncTask>) -> MutexGuard<'_, SyncTask> {
  task.lock().unwrap_or_else(|e| e.into_inner())
}

/// Random delay in `[0, base / 2)`, small enough to keep backoff monotonic.
fn jitter_for(base: Duration) -> Duration {
  let half = (base / 2).as_millis() as u64;
  if half == 0 {
    return Duration::ZERO;
  }
  Duration::from_millis(rand::thread_rng().gen_range(0..half))
}

struct Runner<S, R> {
  coordinator: CacheCoordinator<S, R>,
  clock: Arc<dyn Clock>,
  workers: Arc<Semaphore>,
  events: mpsc::UnboundedSender<SyncEvent>,
  jitter: bool,
  task: Arc<Mutex<SyncTask>>,
  run_guard: Arc<AsyncMutex<()>>,
}

impl<S, R> Runner<S, R>
where
  S: LocalStore + 'static,
  R: RemoteSource,
{
  async fn run(self, mut cancelled: watch::Receiver<bool>) {
    let task_id = lock(&self.task).id.clone();

    loop {
      let wait = lock(&self.task).due_in(self.clock.now());
      tokio::select! {
        _ = tokio::time::sleep(wait) => {}
        changed = cancelled.changed() => {
          // Scheduler dropped
          if changed.is_err() {
            break;
          }
        }
      }
      if *cancelled.borrow() {
        break;
      }
      lock(&self.task).wake();

      // A replaced runner may still be finishing a run of this task
      let slot = async {
        let running = Arc::clone(&self.run_guard).lock_owned().await;
        let permit = Arc::clone(&self.workers).acquire_owned().await;
        permit.map(|permit| (running, permit))
      };
      let _slot = tokio::select! {
        slot = slot => match slot {
          Ok(slot) => slot,
          Err(_) => break,
        },
        _ = cancelled.changed() => break,
      };
      if *cancelled.borrow() {
        break;
      }

      let target = {
        let mut task = lock(&self.task);
        task.start();
        task.target.clone()
      };
      let _ = self.events.send(SyncEvent::Started {
        task_id: task_id.clone(),
      });

      let result = refresh_target(&self.coordinator, &target).await;
      let now = self.clock.now();
      let event = self.finish_run(&task_id, result, now);
      let _ = self.events.send(event);
    }

    lock(&self.task).cancel();
    debug!(task = %task_id, "sync task stopped");
    let _ = self.events.send(SyncEvent::Cancelled { task_id });
  }

  fn finish_run(
    &self,
    task_id: &str,
    result: Result<usize, SyncError>,
    now: chrono::DateTime<chrono::Utc>,
  ) -> SyncEvent {
    let mut task = lock(&self.task);
    match result {
      Ok(refreshed) => {
        let next_run_in = task.succeed(now);
        debug!(task = %task_id, refreshed, "sync run succeeded");
        SyncEvent::Succeeded {
          task_id: task_id.to_string(),
          refreshed,
          next_run_in,
        }
      }
      Err(e) if e.is_transient() => {
        let jitter = if self.jitter {
          jitter_for(task.backoff_base)
        } else {
          Duration::ZERO
        };
        let retry_in = task.fail(now, jitter, e.to_string());
        warn!(task = %task_id, attempt = task.attempt, ?retry_in, error = %e, "sync run failed");
        SyncEvent::Failed {
          task_id: task_id.to_string(),
          attempt: task.attempt,
          error: e.to_string(),
          retry_in,
        }
      }
      Err(e) => {
        let retry_in = task.fail_permanently(now, e.to_string());
        warn!(task = %task_id, error = %e, "sync run failed permanently, not retrying");
        SyncEvent::Failed {
          task_id: task_id.to_string(),
          attempt: 0,
          error: e.to_string(),
          retry_in,
        }
      }
    }
  }
}

/// Refresh every key the target covers. Returns how many were refreshed, or
/// the first failure after attempting all of them. A transient failure is
/// preferred so that the task backs off while any key is retryable.
async fn refresh_target<S, R>(
  coordinator: &CacheCoordinator<S, R>,
  target: &SyncTarget,
) -> Result<usize, SyncError>
where
  S: LocalStore + 'static,
  R: RemoteSource,
{
  let keys = match target {
    SyncTarget::Key(key) => vec![key.clone()],
    SyncTarget::Prefix(prefix) => coordinator
      .entries(prefix)?
      .into_iter()
      .map(|e| e.record.key)
      .collect(),
    SyncTarget::Dirty => coordinator.dirty_keys()?,
  };

  let results: Vec<_> = stream::iter(keys)
    .map(|key| async move {
      let result = coordinator.refresh(&key).await;
      (key, result)
    })
    .buffer_unordered(KEYS_IN_FLIGHT)
    .collect()
    .await;

  let mut refreshed = 0;
  let mut first_error: Option<SyncError> = None;
  for (key, result) in results {
    match result {
      Ok(_) => refreshed += 1,
      Err(e) => {
        debug!(key = %key, error = %e, "refresh failed");
        let replace = match &first_error {
          None => true,
          Some(first) => !first.is_transient() && e.is_transient(),
        };
        if replace {
          first_error = Some(e);
        }
      }
    }
  }

  match first_error {
    Some(e) => Err(e),
    None => Ok(refreshed),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{ReadPolicy, Record, SqliteStorage};
  use crate::sync::TaskState;
  use crate::remote::fake::FakeRemote;
  use crate::remote::RemoteError;
  use chrono::{DateTime, Utc};
  use serde_json::json;
  use tokio::time::Instant;

  /// Wall clock driven by tokio's (pausable) time.
  struct TokioClock {
    origin: DateTime<Utc>,
    start: Instant,
  }

  impl TokioClock {
    fn new() -> Self {
      Self {
        origin: Utc::now(),
        start: Instant::now(),
      }
    }
  }

  impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
      self.origin + chrono::Duration::from_std(self.start.elapsed()).unwrap()
    }
  }

  type TestScheduler = SyncScheduler<SqliteStorage, FakeRemote>;

  fn setup(workers: usize) -> (TestScheduler, SyncEvents, CacheCoordinator<SqliteStorage, FakeRemote>) {
    let clock: Arc<dyn Clock> = Arc::new(TokioClock::new());
    let store = SqliteStorage::open_in_memory().unwrap();
    let coordinator = CacheCoordinator::with_clock(store, FakeRemote::new(), Arc::clone(&clock));
    let options = SchedulerOptions {
      workers,
      jitter: false,
    };
    let (scheduler, events) = SyncScheduler::with_clock(coordinator.clone(), options, clock);
    (scheduler, events, coordinator)
  }

  fn transient() -> RemoteError {
    RemoteError::Transient("timeout".to_string())
  }

  const SEC: Duration = Duration::from_secs(1);

  #[tokio::test(start_paused = true)]
  async fn test_backoff_then_recover() {
    let (scheduler, mut events, coordinator) = setup(2);
    let remote = remote_of(&coordinator);
    remote.seed(Record::new("current:paris", json!(20), 1));
    remote.fail_fetch(transient());
    remote.fail_fetch(transient());

    scheduler.schedule(
      "current",
      SyncTarget::Key("current:paris".to_string()),
      60 * SEC,
      5 * SEC,
      60 * SEC,
    );

    let mut seen = Vec::new();
    while seen.len() < 6 {
      seen.push(events.next().await.unwrap());
    }

    let started = |id: &str| SyncEvent::Started {
      task_id: id.to_string(),
    };
    assert_eq!(seen[0], started("current"));
    assert!(matches!(
      &seen[1],
      SyncEvent::Failed { attempt: 1, retry_in, .. } if *retry_in == 10 * SEC
    ));
    assert_eq!(seen[2], started("current"));
    assert!(matches!(
      &seen[3],
      SyncEvent::Failed { attempt: 2, retry_in, .. } if *retry_in == 20 * SEC
    ));
    assert_eq!(seen[4], started("current"));
    assert_eq!(
      seen[5],
      SyncEvent::Succeeded {
        task_id: "current".to_string(),
        refreshed: 1,
        next_run_in: 60 * SEC,
      }
    );

    let task = scheduler.task("current").unwrap();
    assert_eq!(task.attempt, 0);
    let entry = coordinator
      .read("current:paris", ReadPolicy::CacheOnly)
      .await
      .unwrap();
    assert_eq!(entry.data.record.payload, json!(20));
  }

  #[tokio::test(start_paused = true)]
  async fn test_dirty_target_flushes_queued_write() {
    let (scheduler, mut events, coordinator) = setup(2);
    let remote = remote_of(&coordinator);
    remote.fail_push(transient());
    remote.on_push(|mut r| {
      r.version = 5;
      r.payload = json!("payload2b");
      r
    });
    coordinator.write("b", json!("payload2")).await.unwrap_err();

    scheduler.schedule("flush", SyncTarget::Dirty, 30 * SEC, SEC, 10 * SEC);
    assert_eq!(events.next().await.unwrap().task_id(), "flush");
    assert!(matches!(
      events.next().await.unwrap(),
      SyncEvent::Succeeded { refreshed: 1, .. }
    ));

    let entry = coordinator.read("b", ReadPolicy::CacheOnly).await.unwrap();
    assert_eq!(entry.data.record.version, 5);
    assert!(!entry.data.is_dirty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_prefix_target_refreshes_matching_keys() {
    let (scheduler, mut events, coordinator) = setup(2);
    let remote = remote_of(&coordinator);
    for key in ["daily:oslo", "daily:paris", "current:oslo"] {
      remote.seed(Record::new(key, json!(1), 1));
      coordinator.refresh(key).await.unwrap();
      remote.seed(Record::new(key, json!(2), 2));
    }

    scheduler.schedule(
      "daily",
      SyncTarget::Prefix("daily:".to_string()),
      3600 * SEC,
      SEC,
      SEC,
    );
    events.next().await.unwrap();
    assert!(matches!(
      events.next().await.unwrap(),
      SyncEvent::Succeeded { refreshed: 2, .. }
    ));

    let version = |key: &'static str| {
      let coordinator = coordinator.clone();
      async move {
        coordinator
          .read(key, ReadPolicy::CacheOnly)
          .await
          .unwrap()
          .data
          .record
          .version
      }
    };
    assert_eq!(version("daily:oslo").await, 2);
    assert_eq!(version("daily:paris").await, 2);
    assert_eq!(version("current:oslo").await, 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_cancel_stops_future_runs() {
    let (scheduler, mut events, coordinator) = setup(2);
    let remote = remote_of(&coordinator);
    remote.seed(Record::new("k", json!(1), 1));

    scheduler.schedule("k", SyncTarget::Key("k".to_string()), 60 * SEC, SEC, SEC);
    events.next().await.unwrap();
    assert!(matches!(
      events.next().await.unwrap(),
      SyncEvent::Succeeded { .. }
    ));

    assert!(scheduler.cancel("k"));
    assert!(!scheduler.cancel("k"));
    assert!(scheduler.task("k").is_none());
    assert_eq!(
      events.next().await.unwrap(),
      SyncEvent::Cancelled {
        task_id: "k".to_string()
      }
    );

    tokio::time::sleep(600 * SEC).await;
    assert_eq!(remote.fetch_count(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_cancel_during_run_lets_it_finish() {
    let (scheduler, mut events, coordinator) = setup(2);
    let remote = remote_of(&coordinator);
    remote.seed(Record::new("k", json!(1), 1));
    remote.set_latency(5 * SEC);

    scheduler.schedule("k", SyncTarget::Key("k".to_string()), 60 * SEC, SEC, SEC);
    events.next().await.unwrap();
    assert!(scheduler.cancel("k"));

    assert!(matches!(
      events.next().await.unwrap(),
      SyncEvent::Succeeded { .. }
    ));
    assert!(matches!(
      events.next().await.unwrap(),
      SyncEvent::Cancelled { .. }
    ));
    assert!(coordinator.read("k", ReadPolicy::CacheOnly).await.is_ok());
  }

  #[tokio::test(start_paused = true)]
  async fn test_reschedule_replaces_task() {
    let (scheduler, mut events, coordinator) = setup(2);
    remote_of(&coordinator).seed(Record::new("k", json!(1), 1));

    scheduler.schedule("k", SyncTarget::Key("k".to_string()), 60 * SEC, SEC, SEC);
    scheduler.schedule("k", SyncTarget::Key("k".to_string()), 120 * SEC, SEC, SEC);

    assert_eq!(scheduler.task("k").unwrap().interval, 120 * SEC);

    let mut cancelled = 0;
    let mut succeeded = 0;
    while cancelled + succeeded < 2 {
      match events.next().await.unwrap() {
        SyncEvent::Cancelled { .. } => cancelled += 1,
        SyncEvent::Succeeded { next_run_in, .. } => {
          assert_eq!(next_run_in, 120 * SEC);
          succeeded += 1;
        }
        _ => {}
      }
    }
    assert_eq!(cancelled, 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_worker_pool_bounds_concurrency() {
    let (scheduler, mut events, coordinator) = setup(1);
    let remote = remote_of(&coordinator);
    remote.seed(Record::new("a", json!(1), 1));
    remote.seed(Record::new("b", json!(1), 1));
    remote.set_latency(5 * SEC);

    scheduler.schedule("a", SyncTarget::Key("a".to_string()), 600 * SEC, SEC, SEC);
    scheduler.schedule("b", SyncTarget::Key("b".to_string()), 600 * SEC, SEC, SEC);

    let first = events.next().await.unwrap();
    assert!(matches!(first, SyncEvent::Started { .. }));
    // With one worker the other task cannot start before this one finishes
    assert!(matches!(
      events.next().await.unwrap(),
      SyncEvent::Succeeded { ref task_id, .. } if task_id == first.task_id()
    ));
    assert!(matches!(
      events.next().await.unwrap(),
      SyncEvent::Started { .. }
    ));
  }

  #[tokio::test(start_paused = true)]
  async fn test_shutdown_cancels_everything() {
    let (scheduler, mut events, coordinator) = setup(2);
    remote_of(&coordinator).seed(Record::new("k", json!(1), 1));
    scheduler.schedule("a", SyncTarget::Key("k".to_string()), 60 * SEC, SEC, SEC);
    scheduler.schedule("b", SyncTarget::Dirty, 60 * SEC, SEC, SEC);

    scheduler.shutdown().await;
    assert!(scheduler.task("a").is_none());

    let mut cancelled = Vec::new();
    while let Some(event) = events.next().await {
      if let SyncEvent::Cancelled { task_id } = event {
        cancelled.push(task_id);
        if cancelled.len() == 2 {
          break;
        }
      }
    }
    cancelled.sort();
    assert_eq!(cancelled, vec!["a".to_string(), "b".to_string()]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_permanent_failure_waits_full_interval() {
    let (scheduler, mut events, coordinator) = setup(2);
    let remote = remote_of(&coordinator);
    remote.seed(Record::new("k", json!(1), 1));
    remote.fail_fetch(RemoteError::Rejected("validation".to_string()));

    scheduler.schedule("k", SyncTarget::Key("k".to_string()), 60 * SEC, 5 * SEC, 60 * SEC);
    events.next().await.unwrap();
    assert!(matches!(
      events.next().await.unwrap(),
      SyncEvent::Failed { attempt: 0, retry_in, .. } if retry_in == 60 * SEC
    ));

    // Well past the first backoff delay, still no retry
    tokio::time::sleep(30 * SEC).await;
    assert_eq!(remote.fetch_count(), 1);
    let task = scheduler.task("k").unwrap();
    assert_eq!(task.state, TaskState::Idle);
    assert_eq!(task.attempt, 0);
    assert!(task.last_error.is_some());

    events.next().await.unwrap();
    assert!(matches!(
      events.next().await.unwrap(),
      SyncEvent::Succeeded { .. }
    ));
  }

  #[tokio::test(start_paused = true)]
  async fn test_prefix_task_backs_off_when_any_key_is_transient() {
    let (scheduler, mut events, coordinator) = setup(2);
    let remote = remote_of(&coordinator);
    remote.seed(Record::new("p:a", json!(1), 1));
    coordinator.refresh("p:a").await.unwrap();
    coordinator.write("p:b", json!(1)).await.unwrap();
    remote.set_latency(SEC);
    remote.fail_fetch(RemoteError::Rejected("gone".to_string()));
    remote.fail_fetch(transient());

    scheduler.schedule("p", SyncTarget::Prefix("p:".to_string()), 600 * SEC, 5 * SEC, 60 * SEC);
    events.next().await.unwrap();
    assert!(matches!(
      events.next().await.unwrap(),
      SyncEvent::Failed { attempt: 1, .. }
    ));
  }

  #[tokio::test(start_paused = true)]
  async fn test_replacing_a_running_task_does_not_overlap_runs() {
    let (scheduler, mut events, coordinator) = setup(2);
    let remote = remote_of(&coordinator);
    remote.seed(Record::new("k", json!(1), 1));
    remote.set_latency(5 * SEC);

    scheduler.schedule("t", SyncTarget::Key("k".to_string()), 60 * SEC, SEC, SEC);
    assert!(matches!(
      events.next().await.unwrap(),
      SyncEvent::Started { .. }
    ));
    scheduler.schedule("t", SyncTarget::Key("k".to_string()), 120 * SEC, SEC, SEC);

    let mut seen = Vec::new();
    loop {
      let event = events.next().await.unwrap();
      let started = matches!(event, SyncEvent::Started { .. });
      seen.push(event);
      if started {
        break;
      }
    }
    // The replaced run finished before the replacement started
    assert!(matches!(seen[0], SyncEvent::Succeeded { .. }));
  }

  #[tokio::test(start_paused = true)]
  async fn test_backing_off_task_is_idle_once_delay_elapses() {
    let (scheduler, mut events, coordinator) = setup(1);
    let remote = remote_of(&coordinator);
    remote.seed(Record::new("a", json!(1), 1));
    remote.seed(Record::new("b", json!(1), 1));
    remote.fail_fetch(transient());

    scheduler.schedule("b", SyncTarget::Key("b".to_string()), 600 * SEC, 5 * SEC, 60 * SEC);
    events.next().await.unwrap();
    assert!(matches!(
      events.next().await.unwrap(),
      SyncEvent::Failed { retry_in, .. } if retry_in == 10 * SEC
    ));
    assert_eq!(scheduler.task("b").unwrap().state, TaskState::BackingOff);

    // Keep the only worker busy past b's retry time
    remote.set_latency(30 * SEC);
    scheduler.schedule("a", SyncTarget::Key("a".to_string()), 600 * SEC, SEC, SEC);
    events.next().await.unwrap();
    tokio::time::sleep(15 * SEC).await;

    assert_eq!(scheduler.task("b").unwrap().state, TaskState::Idle);
  }

  #[tokio::test(start_paused = true)]
  async fn test_cancel_while_waiting_for_worker() {
    let (scheduler, mut events, coordinator) = setup(1);
    let remote = remote_of(&coordinator);
    remote.seed(Record::new("a", json!(1), 1));
    remote.set_latency(30 * SEC);

    scheduler.schedule("a", SyncTarget::Key("a".to_string()), 600 * SEC, SEC, SEC);
    assert_eq!(
      events.next().await.unwrap(),
      SyncEvent::Started {
        task_id: "a".to_string()
      }
    );
    scheduler.schedule("b", SyncTarget::Key("a".to_string()), 600 * SEC, SEC, SEC);
    tokio::time::sleep(SEC).await;
    assert!(scheduler.cancel("b"));

    assert_eq!(
      events.next().await.unwrap(),
      SyncEvent::Cancelled {
        task_id: "b".to_string()
      }
    );
  }

  #[test]
  fn test_jitter_stays_below_half_base() {
    for _ in 0..100 {
      assert!(jitter_for(10 * SEC) < 5 * SEC);
    }
    assert_eq!(jitter_for(Duration::from_millis(1)), Duration::ZERO);
  }

  fn remote_of(coordinator: &CacheCoordinator<SqliteStorage, FakeRemote>) -> &FakeRemote {
    coordinator.remote()
  }
}
