//! Background synchronization.
//!
//! A [`SyncScheduler`] owns a set of periodic [`SyncTask`]s. Each task keeps
//! one target (a key, a key prefix, or the set of pending writes) in line with
//! the remote, backing off exponentially while the remote is failing.

mod scheduler;
mod task;

pub use scheduler::{SchedulerOptions, SyncScheduler};
pub use task::{SyncTarget, SyncTask, TaskState};
