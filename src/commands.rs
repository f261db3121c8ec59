//! Command-line subcommands and their execution.

use clap::Subcommand;
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::future::Future;
use std::io::Write;
use tracing::{info, warn};

use crate::cache::{CacheCoordinator, CacheEntry, CacheSource, LocalStore, ReadPolicy};
use crate::config::Config;
use crate::event::{SyncEvent, SyncEvents};
use crate::remote::RemoteSource;
use crate::sync::{SchedulerOptions, SyncScheduler};

#[derive(Subcommand, Debug)]
pub enum Command {
  /// Print a record
  Get {
    key: String,
    /// Where to read from
    #[arg(long, value_enum, default_value = "cache-first")]
    policy: ReadPolicy,
  },
  /// Write a JSON payload through to the remote
  Put { key: String, payload: String },
  /// Reconcile a record with the remote now
  Refresh { key: String },
  /// Drop the local copy of a record
  Delete { key: String },
  /// List cached records
  List {
    /// Only keys starting with this prefix
    #[arg(long, default_value = "")]
    prefix: String,
    /// Only records with unsynced local writes
    #[arg(long)]
    dirty: bool,
  },
  /// Remove clean records older than the retention window
  Purge,
  /// Run the configured sync tasks until interrupted
  Sync,
}

fn source_label(source: CacheSource) -> &'static str {
  match source {
    CacheSource::Network => "network",
    CacheSource::CacheFresh => "cached",
    CacheSource::CacheStale => "stale",
    CacheSource::Offline => "offline",
  }
}

/// One line per entry: key, version, state, freshness deadline.
fn format_entry(entry: &CacheEntry) -> String {
  let state = if entry.is_dirty() { "dirty" } else { "clean" };
  format!(
    "{}\tv{}\t{}\t{}",
    entry.key(),
    entry.record.version,
    state,
    entry.fresh_until.format("%Y-%m-%d %H:%M:%S")
  )
}

fn print_record(out: &mut impl Write, entry: &CacheEntry, label: &str) -> Result<()> {
  writeln!(out, "{} v{} ({})", entry.key(), entry.record.version, label)?;
  writeln!(out, "{}", serde_json::to_string_pretty(&entry.record.payload)?)?;
  Ok(())
}

/// Execute a one-shot subcommand. `Sync` runs until `shutdown` resolves.
pub async fn execute<S, R>(
  command: Command,
  coordinator: &CacheCoordinator<S, R>,
  config: &Config,
  out: &mut impl Write,
  shutdown: impl Future<Output = ()>,
) -> Result<()>
where
  S: LocalStore + 'static,
  R: RemoteSource,
{
  match command {
    Command::Get { key, policy } => {
      let result = coordinator.read(&key, policy).await?;
      print_record(out, &result.data, source_label(result.source))?;
    }
    Command::Put { key, payload } => {
      let payload: Value =
        serde_json::from_str(&payload).map_err(|e| eyre!("Payload is not valid JSON: {}", e))?;
      match coordinator.write(&key, payload).await {
        Ok(entry) => print_record(out, &entry, "written")?,
        Err(e) if e.is_transient() => {
          writeln!(out, "{}: remote unavailable, queued for sync ({})", key, e)?;
        }
        Err(e) => return Err(e.into()),
      }
    }
    Command::Refresh { key } => {
      let entry = coordinator.refresh(&key).await?;
      print_record(out, &entry, "refreshed")?;
    }
    Command::Delete { key } => {
      coordinator.delete(&key).await?;
      writeln!(out, "deleted {}", key)?;
    }
    Command::List { prefix, dirty } => {
      for entry in coordinator.entries(&prefix)? {
        if dirty && !entry.is_dirty() {
          continue;
        }
        writeln!(out, "{}", format_entry(&entry))?;
      }
    }
    Command::Purge => {
      let removed = coordinator.purge_expired(config.retention())?;
      writeln!(out, "purged {} entries", removed)?;
    }
    Command::Sync => run_sync(coordinator, config, shutdown).await?,
  }
  Ok(())
}

/// Schedule every configured task, plus the pending-write flush, and log their
/// progress until `shutdown`.
async fn run_sync<S, R>(
  coordinator: &CacheCoordinator<S, R>,
  config: &Config,
  shutdown: impl Future<Output = ()>,
) -> Result<()>
where
  S: LocalStore + 'static,
  R: RemoteSource,
{
  let options = SchedulerOptions {
    workers: config.sync.workers,
    jitter: config.sync.jitter,
  };
  let (scheduler, mut events) = SyncScheduler::new(coordinator.clone(), options);
  for task in &config.sync.effective_tasks() {
    scheduler.schedule(
      &task.id,
      task.target()?,
      task.interval(),
      task.backoff_base(),
      task.max_backoff(),
    );
  }

  tokio::pin!(shutdown);
  loop {
    tokio::select! {
      _ = &mut shutdown => break,
      Some(event) = events.next() => log_event(&event),
    }
  }

  info!("shutting down sync tasks");
  scheduler.shutdown().await;
  drain(&mut events);

  let pending = coordinator.dirty_keys()?.len();
  if pending > 0 {
    warn!(pending, "exiting with unsynced writes");
  }
  Ok(())
}

fn drain(events: &mut SyncEvents) {
  while let Some(event) = events.try_next() {
    log_event(&event);
  }
}

fn log_event(event: &SyncEvent) {
  match event {
    SyncEvent::Started { task_id } => tracing::debug!(task = %task_id, "sync started"),
    SyncEvent::Succeeded {
      task_id,
      refreshed,
      next_run_in,
    } => info!(task = %task_id, refreshed, ?next_run_in, "sync succeeded"),
    SyncEvent::Failed {
      task_id,
      attempt,
      error,
      retry_in,
    } => warn!(task = %task_id, attempt, error = %error, ?retry_in, "sync failed"),
    SyncEvent::Cancelled { task_id } => info!(task = %task_id, "sync task cancelled"),
  }
}
