mod cache;
mod commands;
mod config;
mod event;
mod remote;
mod sync;

use clap::Parser;
use color_eyre::Result;
use std::io;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cache::{CacheCoordinator, SqliteStorage};
use remote::HttpRemote;

#[derive(Parser, Debug)]
#[command(name = "nimbus-sync")]
#[command(about = "Offline-first record cache with background sync")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/nimbus-sync/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: commands::Command,
}

/// Log to stderr and to a daily file next to the cache database.
///
/// Use RUST_LOG to control the level (e.g., RUST_LOG=nimbus_sync=debug).
/// The returned guard flushes the file writer and must outlive `main`'s work.
fn init_tracing(log_dir: &Path) -> WorkerGuard {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

  let file_appender = tracing_appender::rolling::daily(log_dir, "nimbus-sync.log");
  let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

  tracing_subscriber::registry()
    .with(fmt::layer().with_writer(io::stderr))
    .with(fmt::layer().with_ansi(false).with_writer(file_writer))
    .with(filter)
    .init();

  guard
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = config::Config::load(args.config.as_deref())?;

  let db_path = match &config.cache.path {
    Some(path) => path.clone(),
    None => SqliteStorage::default_path()?,
  };
  let log_dir = db_path
    .parent()
    .map(Path::to_path_buf)
    .unwrap_or_else(|| PathBuf::from("."));
  std::fs::create_dir_all(&log_dir)?;
  let _guard = init_tracing(&log_dir);

  let store = SqliteStorage::open_at(&db_path)?.with_policy(config.freshness_policy());
  let remote = HttpRemote::new(&config.remote, config::Config::api_token())?;
  let coordinator = CacheCoordinator::new(store, remote);

  let shutdown = async {
    if let Err(e) = tokio::signal::ctrl_c().await {
      tracing::error!(error = %e, "failed to listen for Ctrl-C");
    }
  };

  let mut stdout = io::stdout().lock();
  commands::execute(args.command, &coordinator, &config, &mut stdout, shutdown).await
}
