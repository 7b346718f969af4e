use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{error, warn};

use crate::cache::{CacheResult, CacheSource, CacheStorage};
use crate::lifecycle::{Lifecycle, WorkerState};
use crate::net::{Fetcher, Request, Response};
use crate::worker::{InstallOutcome, OfflineWorker};

/// Events delivered to the worker
#[derive(Debug)]
pub enum Event {
  /// Precache the manifest
  Install {
    done: oneshot::Sender<Result<InstallOutcome>>,
  },
  /// Prune stale caches
  Activate {
    done: oneshot::Sender<Result<Vec<String>>>,
  },
  /// Answer a resource request
  Fetch {
    request: Request,
    respond_to: oneshot::Sender<Option<Fetched>>,
  },
}

/// A response handed back for a fetch event.
#[derive(Debug)]
pub struct Fetched {
  pub response: Response,
  pub source: CacheSource,
  /// When the response was stored, for cache and offline answers
  pub cached_at: Option<DateTime<Utc>>,
}

/// Event loop hosting one worker.
///
/// Lifecycle events run one at a time and each finishes before the next
/// event is taken. Fetch events run as independent tasks in no particular
/// order; the loop waits for their background cache writes before it
/// returns.
pub struct EventLoop<S: CacheStorage, N: Fetcher> {
  worker: Arc<OfflineWorker<S, N>>,
  lifecycle: Lifecycle,
  tx: mpsc::UnboundedSender<Event>,
  rx: mpsc::UnboundedReceiver<Event>,
}

impl<S, N> EventLoop<S, N>
where
  S: CacheStorage + 'static,
  N: Fetcher + 'static,
{
  pub fn new(worker: Arc<OfflineWorker<S, N>>, lifecycle: Lifecycle) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    Self {
      worker,
      lifecycle,
      tx,
      rx,
    }
  }

  /// Get a sender for dispatching events
  pub fn sender(&self) -> EventSender {
    EventSender {
      tx: self.tx.clone(),
    }
  }

  /// Process events until every sender is dropped, then settle outstanding
  /// fetch tasks. Returns the worker's final state.
  pub async fn run(self) -> WorkerState {
    let Self {
      worker,
      mut lifecycle,
      tx,
      mut rx,
    } = self;
    drop(tx);

    let mut tasks = JoinSet::new();

    while let Some(event) = rx.recv().await {
      match event {
        Event::Install { done } => {
          let _ = done.send(install(&worker, &mut lifecycle).await);
        }
        Event::Activate { done } => {
          let _ = done.send(activate(&worker, &mut lifecycle).await);
        }
        Event::Fetch {
          request,
          respond_to,
        } => {
          let worker = Arc::clone(&worker);
          let controlled = lifecycle.is_active();
          tasks.spawn(handle_fetch(worker, controlled, request, respond_to));
        }
      }

      while let Some(finished) = tasks.try_join_next() {
        if let Err(e) = finished {
          warn!("Fetch task failed: {}", e);
        }
      }
    }

    while let Some(finished) = tasks.join_next().await {
      if let Err(e) = finished {
        warn!("Fetch task failed: {}", e);
      }
    }

    lifecycle.state()
  }
}

async fn install<S, N>(
  worker: &OfflineWorker<S, N>,
  lifecycle: &mut Lifecycle,
) -> Result<InstallOutcome>
where
  S: CacheStorage + 'static,
  N: Fetcher,
{
  lifecycle.transition(WorkerState::Installing)?;
  let outcome = worker.on_install().await;
  lifecycle.transition(WorkerState::Installed)?;
  worker.save_state(lifecycle.state())?;
  Ok(outcome)
}

async fn activate<S, N>(
  worker: &OfflineWorker<S, N>,
  lifecycle: &mut Lifecycle,
) -> Result<Vec<String>>
where
  S: CacheStorage + 'static,
  N: Fetcher,
{
  lifecycle.transition(WorkerState::Activating)?;
  let result = worker.on_activate().await;
  if let Err(e) = &result {
    error!("Stale cache cleanup failed: {:#}", e);
  }
  // A failed cleanup does not keep the worker from activating
  lifecycle.transition(WorkerState::Activated)?;
  worker.save_state(lifecycle.state())?;
  result
}

async fn handle_fetch<S, N>(
  worker: Arc<OfflineWorker<S, N>>,
  controlled: bool,
  request: Request,
  respond_to: oneshot::Sender<Option<Fetched>>,
) where
  S: CacheStorage + 'static,
  N: Fetcher,
{
  let result = if controlled {
    worker.on_fetch(request).await
  } else {
    let key = request.key();
    match worker.passthrough(request).await {
      Ok(response) => Some(CacheResult::from_network(response)),
      Err(e) => {
        error!(request = %key, "Fetch failed: {:#}", e);
        None
      }
    }
  };

  let Some(mut result) = result else {
    let _ = respond_to.send(None);
    return;
  };

  let write = result.cache_write.take();
  let _ = respond_to.send(Some(Fetched {
    response: result.data,
    source: result.source,
    cached_at: result.cached_at,
  }));

  if let Some(write) = write {
    if let Err(e) = write.await {
      warn!("Background cache write failed: {}", e);
    }
  }
}

/// Cloneable handle for dispatching events to a running [`EventLoop`].
#[derive(Clone)]
pub struct EventSender {
  tx: mpsc::UnboundedSender<Event>,
}

impl EventSender {
  pub async fn install(&self) -> Result<InstallOutcome> {
    let (done, rx) = oneshot::channel();
    self.send(Event::Install { done })?;
    rx.await
      .map_err(|_| eyre!("Event loop dropped the install event"))?
  }

  pub async fn activate(&self) -> Result<Vec<String>> {
    let (done, rx) = oneshot::channel();
    self.send(Event::Activate { done })?;
    rx.await
      .map_err(|_| eyre!("Event loop dropped the activate event"))?
  }

  /// Dispatch a fetch event and wait for its response, if any.
  pub async fn fetch(&self, request: Request) -> Result<Option<Fetched>> {
    let (respond_to, rx) = oneshot::channel();
    self.send(Event::Fetch {
      request,
      respond_to,
    })?;
    rx.await
      .map_err(|_| eyre!("Event loop dropped the fetch event"))
  }

  fn send(&self, event: Event) -> Result<()> {
    self
      .tx
      .send(event)
      .map_err(|_| eyre!("Event loop is not running"))
  }
}
