mod cache;
mod config;
mod event;
mod lifecycle;
mod logging;
mod manifest;
mod net;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use std::future::Future;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

use crate::cache::{CacheStorage, MemoryStorage, SqliteStorage};
use crate::config::Config;
use crate::event::{EventLoop, EventSender};
use crate::lifecycle::{Lifecycle, WorkerState};
use crate::manifest::Release;
use crate::net::{HttpFetcher, Request, RequestMode};
use crate::worker::{InstallOutcome, OfflineWorker};

type Worker<S> = OfflineWorker<S, HttpFetcher>;

#[derive(Parser, Debug)]
#[command(name = "offcache")]
#[command(about = "Precache an app shell, serve it cache-first, prune stale caches")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./offcache.yaml or $XDG_CONFIG_HOME/offcache/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Built-in release to deploy, replacing the configured cache name and assets
  #[arg(short, long, value_enum, global = true)]
  release: Option<Release>,

  /// Cache database path
  #[arg(long, global = true)]
  db: Option<PathBuf>,

  /// Keep caches in memory for this run only
  #[arg(long, global = true)]
  ephemeral: bool,

  /// Also write logs to this file
  #[arg(long, global = true)]
  log_file: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Precache the asset manifest into the current cache
  Install,
  /// Delete every cache except the current one
  Activate,
  /// Install, then activate
  Update,
  /// Request URLs through the active worker
  Fetch {
    #[arg(required = true)]
    urls: Vec<String>,

    /// Request mode, which decides how cross-origin URLs are treated
    #[arg(long, value_enum, default_value_t = RequestMode::Cors)]
    mode: RequestMode,

    /// Write the response body to stdout (single URL only)
    #[arg(long)]
    body: bool,
  },
  /// Remove one URL from a cache (default: the current one)
  Evict {
    url: String,

    #[arg(long)]
    name: Option<String>,
  },
  /// List caches and their entry counts
  Caches,
  /// List the entries of a cache (default: the current one)
  Entries { name: Option<String> },
  /// Print the asset manifest resolved against the scope
  Manifest,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = logging::init(args.log_file.as_deref())?;

  // Load configuration
  let mut config = Config::load(args.config.as_deref())?;

  // Override from command line
  if let Some(release) = args.release {
    config = config.with_release(release);
  }
  if let Some(db) = args.db {
    config.database = Some(db);
  }

  if args.ephemeral {
    run(args.command, &config, MemoryStorage::new()).await
  } else {
    let storage = SqliteStorage::open_at(&config.database_path()?)?;
    run(args.command, &config, storage).await
  }
}

async fn run<S: CacheStorage + 'static>(command: Command, config: &Config, storage: S) -> Result<()> {
  let worker_config = config.worker()?;
  let network = HttpFetcher::new(&worker_config.scope, &config.network)?;
  let worker = Arc::new(OfflineWorker::new(
    worker_config,
    Arc::new(storage),
    network,
  ));

  match command {
    Command::Install => {
      let (outcome, state) = dispatch(&worker, Lifecycle::new(), |events| async move {
        events.install().await
      })
      .await?;
      println!("worker {}", state);
      ensure_populated(&worker, outcome)?;
    }
    Command::Activate => {
      let (deleted, state) = dispatch(&worker, worker.saved_lifecycle()?, |events| async move {
        events.activate().await
      })
      .await?;
      report_activate(&deleted);
      println!("worker {}", state);
    }
    Command::Update => {
      let ((outcome, deleted), state) = dispatch(&worker, Lifecycle::new(), |events| async move {
        let outcome = events.install().await?;
        let deleted = events.activate().await?;
        Ok::<_, color_eyre::Report>((outcome, deleted))
      })
      .await?;
      report_activate(&deleted);
      println!("worker {}", state);
      ensure_populated(&worker, outcome)?;
    }
    Command::Fetch {
      urls,
      mode,
      body,
    } => fetch(&worker, urls, mode, body).await?,
    Command::Evict { url, name } => {
      let name = name.unwrap_or_else(|| worker.cache_name().to_string());
      let url = worker
        .config()
        .scope
        .join(&url)
        .map_err(|e| eyre!("Invalid URL '{}': {}", url, e))?;
      let key = Request::get(url).key();
      if worker.storage().delete_entry(&name, &key)? {
        println!("evicted {} from {}", key, name);
      } else {
        return Err(eyre!("{} is not stored in {}", key, name));
      }
    }
    Command::Caches => {
      let storage = worker.storage();
      for name in storage.cache_names()? {
        let marker = if name == worker.cache_name() { "*" } else { " " };
        println!("{} {} ({} entries)", marker, name, storage.entries(&name)?.len());
      }
    }
    Command::Entries { name } => {
      let name = name.unwrap_or_else(|| worker.cache_name().to_string());
      if !worker.storage().has(&name)? {
        return Err(eyre!("No cache named {}", name));
      }
      for entry in worker.storage().entries(&name)? {
        println!(
          "{} {:>8} {:<6} {} {} {}",
          entry.status,
          entry.size,
          entry.response_type.as_str(),
          short_digest(&entry.digest),
          entry.cached_at.format("%Y-%m-%d %H:%M:%S"),
          entry.key
        );
      }
    }
    Command::Manifest => {
      for request in worker.manifest()? {
        println!("{}", request.url);
      }
    }
  }

  Ok(())
}

/// Run `f` against a fresh event loop, then wait for the loop to settle.
async fn dispatch<S, T, F, Fut>(
  worker: &Arc<Worker<S>>,
  lifecycle: Lifecycle,
  f: F,
) -> Result<(T, WorkerState)>
where
  S: CacheStorage + 'static,
  F: FnOnce(EventSender) -> Fut,
  Fut: Future<Output = Result<T>>,
{
  let event_loop = EventLoop::new(Arc::clone(worker), lifecycle);
  let sender = event_loop.sender();
  let running = tokio::spawn(event_loop.run());

  // The sender moves into `f`; once it is dropped the loop can finish
  let result = f(sender).await;
  let state = running
    .await
    .map_err(|e| eyre!("Event loop crashed: {}", e))?;

  Ok((result?, state))
}

/// Report the install outcome; a failed precache makes the command fail.
fn ensure_populated<S: CacheStorage + 'static>(
  worker: &Worker<S>,
  outcome: InstallOutcome,
) -> Result<()> {
  match outcome {
    InstallOutcome::Populated { entries } => {
      println!("precached {} assets into {}", entries, worker.cache_name());
      Ok(())
    }
    InstallOutcome::Failed => Err(eyre!(
      "Install did not precache the manifest into {}; see the log for the failing asset",
      worker.cache_name()
    )),
  }
}

/// Leading characters of a body digest, or all of it when shorter.
fn short_digest(digest: &str) -> &str {
  digest.get(..12).unwrap_or(digest)
}

fn report_activate(deleted: &[String]) {
  if deleted.is_empty() {
    println!("no stale caches");
  }
  for name in deleted {
    println!("deleted {}", name);
  }
}

async fn fetch<S: CacheStorage + 'static>(
  worker: &Arc<Worker<S>>,
  urls: Vec<String>,
  mode: RequestMode,
  body: bool,
) -> Result<()> {
  if body && urls.len() != 1 {
    return Err(eyre!("--body needs exactly one URL"));
  }

  let requests = urls
    .iter()
    .map(|url| worker.config().scope.join(url).map(Request::get))
    .collect::<std::result::Result<Vec<_>, _>>()
    .map_err(|e| eyre!("Invalid URL: {}", e))?
    .into_iter()
    .map(|request| request.with_mode(mode))
    .collect::<Vec<_>>();

  let lifecycle = worker.saved_lifecycle()?;
  if !lifecycle.is_active() {
    warn!(
      cache = %worker.cache_name(),
      state = %lifecycle.state(),
      "Worker is not active, requests go straight to the network"
    );
  }

  let (results, _) = dispatch(
    worker,
    lifecycle,
    |events| async move {
      let pending = requests.into_iter().map(|request| {
        let events = events.clone();
        async move {
          let url = request.url.clone();
          (url, events.fetch(request).await)
        }
      });
      Ok(join_all(pending).await)
    },
  )
  .await?;

  let mut unanswered = 0;
  for (url, result) in results {
    match result? {
      Some(fetched) if body => {
        std::io::stdout()
          .write_all(fetched.response.body())
          .map_err(|e| eyre!("Failed to write body: {}", e))?;
      }
      Some(fetched) => {
        let stored = fetched
          .cached_at
          .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
          .unwrap_or_else(|| "-".to_string());
        println!(
          "{} {:<7} {:>8} {:<24} {:<19} {}",
          fetched.response.status,
          fetched.source.as_str(),
          fetched.response.body().len(),
          fetched.response.header("content-type").unwrap_or("-"),
          stored,
          url
        );
      }
      None => {
        unanswered += 1;
        println!("--- no response   {}", url);
      }
    }
  }

  if unanswered > 0 {
    return Err(eyre!("{} request(s) got no response", unanswered));
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_short_digest() {
    let full = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";
    assert_eq!(short_digest(full), "9f86d081884c");
    assert_eq!(short_digest("abc"), "abc");
    assert_eq!(short_digest(""), "");
  }
}
