use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;
use reqwest::Method;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use marketcache::eviction::{self, CLEANUP_TAG};
use marketcache::notification::Notification;
use marketcache::request::RequestMode;
use marketcache::worker::SYNC_TAG;
use marketcache::{CacheConfig, CacheWorker, Command, HttpNetwork, Request, SqliteStorage};

type Worker = CacheWorker<SqliteStorage, HttpNetwork>;

#[derive(Parser, Debug)]
#[command(name = "marketcache")]
#[command(about = "Request cache for the marketplace front end")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/marketcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Cache database (default: $XDG_DATA_HOME/marketcache/cache.db)
  #[arg(long)]
  db: Option<PathBuf>,

  /// Write logs to this file instead of stderr
  #[arg(long)]
  log_file: Option<PathBuf>,

  #[command(subcommand)]
  command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
  /// Preload critical resources and secondary pages
  Install {
    /// Activate right after installing
    #[arg(long)]
    activate: bool,
  },
  /// Serve one request through the cache
  Fetch {
    /// Absolute URL or path relative to the origin
    url: String,
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
    /// Treat the request as a page navigation
    #[arg(long)]
    navigate: bool,
  },
  /// Send a raw JSON control message
  Send { message: String },
  /// Entry count per partition
  Info,
  /// Delete every managed partition
  Clear,
  /// Delete partitions whose name contains SUBSTRING
  Delete { substring: String },
  /// Fetch URLs into the dynamic partition
  Preload { urls: Vec<String> },
  /// Evict entries older than the configured maximum age
  Sweep,
  /// Render the notification a push message would display
  Notify { payload: Option<String> },
  /// Install, activate, then serve requests and commands read from stdin
  Run,
}

fn init_tracing(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

  match log_file {
    Some(path) => {
      let dir = path.parent().unwrap_or_else(|| Path::new("."));
      let name = path
        .file_name()
        .ok_or_else(|| eyre!("invalid log file path: {}", path.display()))?;
      std::fs::create_dir_all(dir)
        .wrap_err_with(|| format!("Failed to create log directory: {}", dir.display()))?;

      let appender = tracing_appender::rolling::never(dir, name);
      let (writer, guard) = tracing_appender::non_blocking(appender);
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(writer)
        .init();
      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
      Ok(None)
    }
  }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

/// Requests are only cached once the worker controls its clients: reuse an
/// earlier install of this version, or install now.
async fn ensure_active(worker: &Worker) -> Result<()> {
  if worker.is_controlling() || worker.resume()? {
    return Ok(());
  }
  let report = worker.handle_install().await?;
  if report.activated.is_none() {
    worker.handle_activate()?;
  }
  Ok(())
}

async fn fetch(worker: &Worker, input: &str, method: &str, navigate: bool) -> Result<()> {
  let method: Method = method
    .to_uppercase()
    .parse()
    .wrap_err_with(|| format!("invalid method: {}", method))?;
  let mut request = Request::resolve(method, &worker.config().origin, input)?;
  if navigate {
    request = request.with_mode(RequestMode::Navigate);
  }

  let result = worker.handle_request(request).await?;
  println!(
    "{} ({:?}, {} bytes)",
    result.data.status,
    result.source,
    result.data.body.len()
  );
  println!("{}", result.data.text());
  Ok(())
}

async fn message(worker: &Worker, message: &str) -> Result<()> {
  let reply = worker.handle_message(message).await?;
  println!("{}", reply.to_json()?);
  Ok(())
}

async fn command(worker: &Worker, command: Command) -> Result<()> {
  let reply = worker.handle_command(command).await?;
  println!("{}", reply.to_json()?);
  Ok(())
}

/// One line per input: a JSON control message, `sync`, `sweep`,
/// `navigate <url>` or `<METHOD> <url>`.
async fn run(worker: Arc<Worker>) -> Result<()> {
  ensure_active(&worker).await?;
  info!(state = %worker.state(), "serving requests");

  let sweeper = eviction::spawn_periodic(Arc::clone(&worker), worker.config().sweep_interval());

  let mut lines = BufReader::new(tokio::io::stdin()).lines();
  while let Some(line) = lines.next_line().await? {
    let line = line.trim();
    if line.is_empty() {
      continue;
    }

    let outcome = if line.starts_with('{') {
      message(&worker, line).await
    } else if line == "sync" {
      print_json(&worker.handle_sync(SYNC_TAG).await)
    } else if line == "sweep" {
      print_json(&worker.handle_periodic_sweep(CLEANUP_TAG))
    } else if line == "quit" {
      break;
    } else {
      match line.split_once(' ') {
        Some(("navigate", url)) => fetch(&worker, url.trim(), "GET", true).await,
        Some((method, url)) => fetch(&worker, url.trim(), method, false).await,
        None => fetch(&worker, line, "GET", false).await,
      }
    };

    if let Err(e) = outcome {
      eprintln!("error: {:#}", e);
    }
  }

  sweeper.stop().await;
  worker.drain().await;
  Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_tracing(args.log_file.as_deref())?;

  // Load configuration
  let config = Arc::new(CacheConfig::load(args.config.as_deref())?);

  let storage = match &args.db {
    Some(path) => SqliteStorage::open(path)?,
    None => SqliteStorage::open_default()?,
  };
  let network = HttpNetwork::new()?;
  let worker = Arc::new(CacheWorker::new(
    config,
    Arc::new(storage),
    Arc::new(network),
  ));

  match args.command {
    Cmd::Install { activate } => {
      let report = worker.handle_install().await?;
      print_json(&report)?;
      if activate && report.activated.is_none() {
        let deleted = worker.handle_activate()?;
        print_json(&deleted)?;
      }
    }
    Cmd::Fetch {
      url,
      method,
      navigate,
    } => {
      ensure_active(&worker).await?;
      fetch(&worker, &url, &method, navigate).await?
    }
    Cmd::Send { message: json } => message(&worker, &json).await?,
    Cmd::Info => command(&worker, Command::GetCacheInfo).await?,
    Cmd::Clear => command(&worker, Command::ClearCache).await?,
    Cmd::Delete { substring } => {
      command(
        &worker,
        Command::DeleteCache {
          name_substring: substring,
        },
      )
      .await?
    }
    Cmd::Preload { urls } => command(&worker, Command::CacheUrls { urls }).await?,
    Cmd::Sweep => print_json(&worker.handle_periodic_sweep(CLEANUP_TAG))?,
    Cmd::Notify { payload } => {
      let origin = &worker.config().origin;
      let notification = Notification::from_push(origin, payload.as_deref().map(str::as_bytes))?;
      print_json(&notification)?;
    }
    Cmd::Run => run(Arc::clone(&worker)).await?,
  }

  worker.drain().await;
  Ok(())
}
