//! Scheduled sync task state machine.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// What a task refreshes on each run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncTarget {
  /// A single record
  Key(String),
  /// Every stored record whose key starts with the prefix
  Prefix(String),
  /// Every record holding an unsynced local write
  Dirty,
}

impl std::fmt::Display for SyncTarget {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      SyncTarget::Key(key) => write!(f, "key {}", key),
      SyncTarget::Prefix(prefix) => write!(f, "prefix {}*", prefix),
      SyncTarget::Dirty => write!(f, "pending writes"),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
  /// Waiting for the next regular run
  Idle,
  Running,
  /// Waiting out a failure delay
  BackingOff,
  /// Terminal; the task is no longer registered
  Cancelled,
}

/// A registered unit of background work and its retry bookkeeping.
#[derive(Debug, Clone)]
pub struct SyncTask {
  pub id: String,
  pub target: SyncTarget,
  pub interval: Duration,
  pub backoff_base: Duration,
  pub max_backoff: Duration,
  pub next_run_at: DateTime<Utc>,
  /// Consecutive failures since the last success
  pub attempt: u32,
  pub state: TaskState,
  pub last_error: Option<String>,
}

impl SyncTask {
  /// New task, due immediately.
  pub fn new(
    id: impl Into<String>,
    target: SyncTarget,
    interval: Duration,
    backoff_base: Duration,
    max_backoff: Duration,
    now: DateTime<Utc>,
  ) -> Self {
    Self {
      id: id.into(),
      target,
      interval,
      backoff_base,
      max_backoff: max_backoff.max(backoff_base),
      next_run_at: now,
      attempt: 0,
      state: TaskState::Idle,
      last_error: None,
    }
  }

  /// Time left until the task is due (zero if overdue).
  pub fn due_in(&self, now: DateTime<Utc>) -> Duration {
    (self.next_run_at - now).to_std().unwrap_or(Duration::ZERO)
  }

  pub fn start(&mut self) {
    self.state = TaskState::Running;
  }

  /// Reset the failure count and wait a full interval. Returns the delay.
  pub fn succeed(&mut self, now: DateTime<Utc>) -> Duration {
    self.attempt = 0;
    self.last_error = None;
    self.state = TaskState::Idle;
    self.reschedule(now, self.interval)
  }

  /// Count a failure and back off. Returns the delay.
  pub fn fail(&mut self, now: DateTime<Utc>, jitter: Duration, error: String) -> Duration {
    self.attempt = self.attempt.saturating_add(1);
    self.last_error = Some(error);
    self.state = TaskState::BackingOff;
    let delay = self.backoff_delay(jitter);
    self.reschedule(now, delay)
  }

  /// Count a failure that retrying cannot fix. The task keeps its regular
  /// interval instead of backing off. Returns the delay.
  pub fn fail_permanently(&mut self, now: DateTime<Utc>, error: String) -> Duration {
    self.attempt = 0;
    self.last_error = Some(error);
    self.state = TaskState::Idle;
    self.reschedule(now, self.interval)
  }

  /// The failure delay has elapsed; the task is eligible to run again.
  pub fn wake(&mut self) {
    if self.state == TaskState::BackingOff {
      self.state = TaskState::Idle;
    }
  }

  pub fn cancel(&mut self) {
    self.state = TaskState::Cancelled;
  }

  /// `backoff_base * 2^attempt + jitter`, capped at `max_backoff`.
  pub fn backoff_delay(&self, jitter: Duration) -> Duration {
    let factor = 2u32.checked_pow(self.attempt).unwrap_or(u32::MAX);
    self
      .backoff_base
      .checked_mul(factor)
      .unwrap_or(self.max_backoff)
      .saturating_add(jitter)
      .min(self.max_backoff)
  }

  fn reschedule(&mut self, now: DateTime<Utc>, delay: Duration) -> Duration {
    let step = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
    self.next_run_at = now.checked_add_signed(step).unwrap_or(DateTime::<Utc>::MAX_UTC);
    delay
  }
}
