use crate::{
  config::DownloaderConfig,
  crash::{Crasher, TracingCrasher},
  engine::{delegate::DownloadSessionDelegate, DownloadBatchDataController, DownloadBatchResponse},
  events::{DownloadEvent, EventHub},
  model::DownloadBatchRequest,
  persistence::{DownloadsPersistence, SqliteDownloadsPersistence},
  transport::{
    http::{build_client, HttpSession},
    NetworkSession,
  },
};
use std::{future::Future, sync::Arc};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

const LOAD_ATTEMPTS: usize = 3;

/// Builds the transfer session around the delegate that will receive its callbacks.
pub type SessionFactory = Box<dyn FnOnce(Arc<DownloadSessionDelegate>) -> Arc<dyn NetworkSession> + Send>;

/// Public entry point: submit batches, observe and cancel them.
#[derive(Clone)]
pub struct DownloadManager {
  controller: Arc<DownloadBatchDataController>,
  delegate: Arc<DownloadSessionDelegate>,
  // The controller only holds a weak reference.
  _session: Arc<dyn NetworkSession>,
  events: EventHub,
}

impl DownloadManager {
  /// Wires the engine, restores persisted batches and reattaches tasks the session still runs.
  pub async fn start(
    config: &DownloaderConfig,
    session_factory: SessionFactory,
    persistence: Arc<dyn DownloadsPersistence>,
    crasher: Arc<dyn Crasher>,
  ) -> Self {
    let events = EventHub::new();
    let controller = DownloadBatchDataController::new(
      config.max_simultaneous_downloads,
      persistence,
      crasher.clone(),
      events.clone(),
    );
    let delegate = Arc::new(DownloadSessionDelegate::new(
      controller.clone(),
      config.paths().downloads_dir,
      crasher.clone(),
    ));
    let session = session_factory(delegate.clone());

    if let Err(e) = attempt(LOAD_ATTEMPTS, || controller.load_batches_from_persistence()).await {
      crasher.record_error(&format!("{e:#}"), "Failed to load batches from persistence");
    }

    controller.update_session(&session).await;
    let running = session.tasks();
    controller.set_running_tasks(running.download).await;

    Self {
      controller,
      delegate,
      _session: session,
      events,
    }
  }

  /// Default wiring: SQLite under the data dir, HTTP transfers, tracing crash sink.
  pub async fn open(config: &DownloaderConfig) -> anyhow::Result<Self> {
    let paths = config.paths();
    paths.create_dirs()?;
    let persistence = Arc::new(SqliteDownloadsPersistence::open(paths.db_path.clone())?);
    let client = build_client(config)?;
    let read_timeout = config.request_timeout();
    let incoming_dir = paths.incoming_dir.clone();
    let factory: SessionFactory = Box::new(move |delegate: Arc<DownloadSessionDelegate>| {
      let session: Arc<dyn NetworkSession> = Arc::new(HttpSession::new(client, delegate, incoming_dir, read_timeout));
      session
    });
    tracing::info!(data_dir = %paths.data_dir.display(), "starting batch downloader");
    Ok(Self::start(config, factory, persistence, Arc::new(TracingCrasher)).await)
  }

  pub async fn download(&self, batch: DownloadBatchRequest) -> anyhow::Result<Arc<DownloadBatchResponse>> {
    self.controller.download(batch).await
  }

  pub async fn get_on_going_downloads(&self) -> Vec<Arc<DownloadBatchResponse>> {
    self.controller.get_on_going_downloads().await
  }

  pub async fn running_tasks(&self) -> usize {
    self.controller.running_tasks().await
  }

  pub fn set_background_session_completion(&self, completion: impl FnOnce() + Send + 'static) {
    self.delegate.set_background_session_completion(completion);
  }

  /// Cancels the given batches and returns once the engine has dropped them.
  pub async fn cancel(&self, downloads: &[Arc<DownloadBatchResponse>]) {
    futures_util::future::join_all(downloads.iter().map(|batch| async move {
      batch.cancel().await;
      let _ = batch.completion().await;
    }))
    .await;
    let ids: Vec<i64> = downloads.iter().map(|b| b.batch_id()).collect();
    self.controller.wait_until_batches_removed(&ids).await;
  }

  pub async fn wait_until_batches_removed(&self, batch_ids: &[i64]) {
    self.controller.wait_until_batches_removed(batch_ids).await;
  }

  pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
    self.events.subscribe()
  }

  pub fn events(&self) -> BroadcastStream<DownloadEvent> {
    self.events.stream()
  }
}

async fn attempt<T, F, Fut>(times: usize, mut op: F) -> anyhow::Result<T>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = anyhow::Result<T>>,
{
  let mut tries = 1;
  loop {
    match op().await {
      Ok(v) => return Ok(v),
      Err(e) if tries >= times => return Err(e),
      Err(e) => {
        tracing::warn!(attempt = tries, error = %e, "retrying");
        tries += 1;
      }
    }
  }
}
