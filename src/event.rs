use std::time::Duration;
use tokio::sync::mpsc;

/// Background sync lifecycle events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
  /// A task began a run
  Started { task_id: String },
  /// A run finished; the task sleeps for its regular interval
  Succeeded {
    task_id: String,
    refreshed: usize,
    next_run_in: Duration,
  },
  /// A run failed; the task backs off
  Failed {
    task_id: String,
    attempt: u32,
    error: String,
    retry_in: Duration,
  },
  /// The task was cancelled and will not run again
  Cancelled { task_id: String },
}

impl SyncEvent {
  pub fn task_id(&self) -> &str {
    match self {
      SyncEvent::Started { task_id }
      | SyncEvent::Succeeded { task_id, .. }
      | SyncEvent::Failed { task_id, .. }
      | SyncEvent::Cancelled { task_id } => task_id,
    }
  }
}

/// Receiving half of the scheduler's event channel
pub struct SyncEvents {
  rx: mpsc::UnboundedReceiver<SyncEvent>,
}

impl SyncEvents {
  /// Create a connected sender/stream pair
  pub fn channel() -> (mpsc::UnboundedSender<SyncEvent>, Self) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, Self { rx })
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<SyncEvent> {
    self.rx.recv().await
  }

  /// Take an already queued event without waiting
  pub fn try_next(&mut self) -> Option<SyncEvent> {
    self.rx.try_recv().ok()
  }
}
