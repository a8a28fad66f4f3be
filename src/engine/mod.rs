pub mod delegate;
pub mod file_writer;
pub mod progress;
pub mod response;

use crate::{
  crash::{self, Crasher},
  error::DownloadError,
  events::EventHub,
  model::{DownloadBatch, DownloadBatchRequest, DownloadRequest},
  persistence::DownloadsPersistence,
  transport::{NetworkSession, TaskHandle},
};
use anyhow::Context;
use std::{
  collections::{BTreeMap, BTreeSet},
  sync::{Arc, Weak},
};
use tokio::sync::{watch, Mutex};

pub use progress::{ProgressReceiver, ProgressSnapshot};
pub use response::{DownloadBatchResponse, RequestDetails, ResponseState, SingleTaskResponse};

/// Owns every active batch and decides which requests get a transfer slot.
pub struct DownloadBatchDataController {
  max_simultaneous_downloads: usize,
  persistence: Arc<dyn DownloadsPersistence>,
  crasher: Arc<dyn Crasher>,
  events: EventHub,
  active_ids: watch::Sender<BTreeSet<i64>>,
  state: Mutex<ControllerState>,
}

#[derive(Default)]
struct ControllerState {
  session: Option<Weak<dyn NetworkSession>>,
  // Ascending batch id is the admission order.
  batches: BTreeMap<i64, Arc<DownloadBatchResponse>>,
  loaded_initial_running_tasks: bool,
}

impl DownloadBatchDataController {
  pub fn new(
    max_simultaneous_downloads: usize,
    persistence: Arc<dyn DownloadsPersistence>,
    crasher: Arc<dyn Crasher>,
    events: EventHub,
  ) -> Arc<Self> {
    let (active_ids, _) = watch::channel(BTreeSet::new());
    Arc::new(Self {
      max_simultaneous_downloads: max_simultaneous_downloads.max(1),
      persistence,
      crasher,
      events,
      active_ids,
      state: Mutex::new(ControllerState::default()),
    })
  }

  pub async fn update_session(&self, session: &Arc<dyn NetworkSession>) {
    self.state.lock().await.session = Some(Arc::downgrade(session));
  }

  pub async fn get_on_going_downloads(&self) -> Vec<Arc<DownloadBatchResponse>> {
    self.state.lock().await.batches.values().cloned().collect()
  }

  pub async fn running_tasks(&self) -> usize {
    let state = self.state.lock().await;
    state.batches.values().map(|b| b.running_tasks()).sum()
  }

  pub async fn download_request_response(&self, task: &TaskHandle) -> Option<SingleTaskResponse> {
    let state = self.state.lock().await;
    state.batches.values().find_map(|batch| {
      batch.download_request(task).map(|request| SingleTaskResponse {
        request,
        batch: batch.clone(),
      })
    })
  }

  pub async fn download(self: &Arc<Self>, batch_request: DownloadBatchRequest) -> anyhow::Result<Arc<DownloadBatchResponse>> {
    tracing::info!(requests = batch_request.requests.len(), "batching downloads");
    let mut state = self.state.lock().await;
    if let Some(owned) = batch_request
      .requests
      .iter()
      .find(|r| Self::owning_batch(&state, r).is_some())
    {
      anyhow::bail!("{} is already part of an active batch", owned.url);
    }

    let batch = self.persistence.insert(&batch_request).context("failed to persist batch")?;
    let response = self.create_response(&mut state, batch);
    self.start_pending_tasks_if_needed(&state);
    Ok(response)
  }

  /// Materializes every persisted batch. Transfers start only after `set_running_tasks`.
  pub async fn load_batches_from_persistence(self: &Arc<Self>) -> anyhow::Result<()> {
    let mut state = self.state.lock().await;
    let batches = self
      .persistence
      .retrieve_all()
      .context("failed to load persisted batches")?;
    tracing::info!(batches = batches.len(), "loading persisted batches");
    for batch in batches {
      if state.batches.contains_key(&batch.id) {
        continue;
      }
      self.create_response(&mut state, batch);
    }
    Ok(())
  }

  /// Reconciles persisted task ids with the tasks the session still runs, then opens admission.
  pub async fn set_running_tasks(&self, tasks: Vec<TaskHandle>) {
    let mut state = self.state.lock().await;
    tracing::info!(tasks = tasks.len(), batches = state.batches.len(), "reconciling running tasks");
    for batch in state.batches.values() {
      batch.associate_tasks(&tasks);
    }
    state.loaded_initial_running_tasks = true;
    self.start_pending_tasks_if_needed(&state);
  }

  pub async fn download_completed(&self, response: &SingleTaskResponse) {
    let state = self.state.lock().await;
    response.batch.complete(&response.request, Ok(()));
    self.update_download_persistence(&response.batch, &response.request);
    self.start_pending_tasks_if_needed(&state);
  }

  pub async fn download_failed(&self, response: &SingleTaskResponse, error: DownloadError) {
    let state = self.state.lock().await;
    response.batch.complete(&response.request, Err(error));
    self.update_download_persistence(&response.batch, &response.request);
    self.start_pending_tasks_if_needed(&state);
  }

  /// Resolves once none of `batch_ids` is active any more.
  pub async fn wait_until_batches_removed(&self, batch_ids: &[i64]) {
    let mut rx = self.active_ids.subscribe();
    let _ = rx
      .wait_for(|active| batch_ids.iter().all(|id| !active.contains(id)))
      .await;
  }

  fn owning_batch<'a>(state: &'a ControllerState, request: &DownloadRequest) -> Option<&'a Arc<DownloadBatchResponse>> {
    state.batches.values().find(|b| b.requests().contains(request))
  }

  fn create_response(self: &Arc<Self>, state: &mut ControllerState, batch: DownloadBatch) -> Arc<DownloadBatchResponse> {
    let response = DownloadBatchResponse::new(batch, self.crasher.clone());
    let batch_id = response.batch_id();
    state.batches.insert(batch_id, response.clone());
    self.publish_active_ids(state);
    self.events.emit_batch_added(batch_id, response.requests().len());

    // Subscribe before spawning so an already-completed batch is still observed.
    let progress = response.progress();
    let controller = Arc::downgrade(self);
    tokio::spawn(async move {
      let outcome = progress.completion().await;
      let Some(controller) = controller.upgrade() else { return };
      controller.clean_up_for_completed_batch(batch_id, outcome).await;
    });

    response
  }

  async fn clean_up_for_completed_batch(&self, batch_id: i64, outcome: Result<(), DownloadError>) {
    let mut state = self.state.lock().await;
    if state.batches.remove(&batch_id).is_none() {
      return;
    }
    tracing::info!(batch_id, success = outcome.is_ok(), "removing completed batch");
    crash::recover(self.crasher.as_ref(), "DownloadPersistence.deleteBatch", || {
      self.persistence.delete(&[batch_id])
    });
    self.publish_active_ids(&state);
    self.events.emit_batch_removed(batch_id, outcome.err());
    self.start_pending_tasks_if_needed(&state);
  }

  fn start_pending_tasks_if_needed(&self, state: &ControllerState) {
    if !state.loaded_initial_running_tasks {
      return;
    }
    let Some(session) = state.session.as_ref().and_then(|s| s.upgrade()) else {
      tracing::debug!("no live session; not starting downloads");
      return;
    };
    if state.batches.is_empty() {
      return;
    }
    let running: usize = state.batches.values().map(|b| b.running_tasks()).sum();
    if running >= self.max_simultaneous_downloads {
      return;
    }

    let mut free_slots = self.max_simultaneous_downloads - running;
    let mut started: Vec<TaskHandle> = Vec::new();
    for batch in state.batches.values() {
      while free_slots > 0 {
        let Some((request, task)) = batch.start_download_if_needed(session.as_ref()) else { break };
        self.update_download_persistence(batch, &request);
        started.push(task);
        free_slots -= 1;
      }
      if free_slots == 0 {
        break;
      }
    }

    if started.is_empty() {
      return;
    }
    tracing::info!(count = started.len(), running, "starting downloads");
    for task in &started {
      task.resume();
    }
    self.events.emit_tasks_started(started.len());
  }

  fn update_download_persistence(&self, batch: &DownloadBatchResponse, request: &DownloadRequest) {
    let download = batch.download(request);
    crash::recover(self.crasher.as_ref(), "DownloadPersistence.updateDownload", || {
      self.persistence.update(&[download])
    });
  }

  fn publish_active_ids(&self, state: &ControllerState) {
    self.active_ids.send_replace(state.batches.keys().copied().collect());
  }
}
