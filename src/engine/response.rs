use super::progress::{ProgressReceiver, ProgressSender};
use crate::{
  crash::Crasher,
  error::DownloadError,
  model::{Download, DownloadBatch, DownloadProgress, DownloadRequest, DownloadStatus, TaskId},
  transport::{NetworkSession, TaskHandle},
};
use parking_lot::Mutex;
use std::{
  collections::HashMap,
  fmt,
  hash::{Hash, Hasher},
  sync::Arc,
};

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseState {
  InProgress,
  Finished,
  Failed(DownloadError),
}

struct ResponseData {
  state: ResponseState,
  task_id: Option<TaskId>,
  task: Option<TaskHandle>,
  progress: ProgressSender,
}

impl ResponseData {
  fn is_in_progress(&self) -> bool {
    self.state == ResponseState::InProgress
  }

  fn finished(&self) -> bool {
    self.state == ResponseState::Finished
  }

  fn failed(&self) -> Option<&DownloadError> {
    match &self.state {
      ResponseState::Failed(e) => Some(e),
      _ => None,
    }
  }
}

/// Point-in-time view of one request of a batch.
#[derive(Debug, Clone)]
pub struct RequestDetails {
  pub state: ResponseState,
  pub task_id: Option<TaskId>,
  pub task: Option<TaskHandle>,
}

/// A request together with the batch that owns it.
#[derive(Clone)]
pub struct SingleTaskResponse {
  pub request: DownloadRequest,
  pub batch: Arc<DownloadBatchResponse>,
}

/// Aggregate state of one persisted batch: per-request state, progress and completion.
///
/// A batch completes exactly once. The first failing request cancels all the others and
/// its error becomes the batch's error.
pub struct DownloadBatchResponse {
  batch_id: i64,
  requests: Vec<DownloadRequest>,
  progress: ProgressSender,
  crasher: Arc<dyn Crasher>,
  responses: Mutex<HashMap<DownloadRequest, ResponseData>>,
}

type Responses = HashMap<DownloadRequest, ResponseData>;

impl DownloadBatchResponse {
  pub fn new(batch: DownloadBatch, crasher: Arc<dyn Crasher>) -> Arc<Self> {
    let mut requests = Vec::with_capacity(batch.downloads.len());
    let mut responses = HashMap::with_capacity(batch.downloads.len());
    for d in &batch.downloads {
      let data = ResponseData {
        state: ResponseState::InProgress,
        task_id: d.task_id,
        task: None,
        progress: ProgressSender::new(DownloadProgress::default()),
      };
      if responses.insert(d.request.clone(), data).is_none() {
        requests.push(d.request.clone());
      }
    }

    let this = Self {
      batch_id: batch.id,
      requests,
      progress: ProgressSender::new(DownloadProgress::default()),
      crasher,
      responses: Mutex::new(responses),
    };

    {
      let mut responses = this.responses.lock();
      for d in batch.downloads.iter().filter(|d| d.status == DownloadStatus::Completed) {
        this.complete_locked(&mut responses, &d.request, Ok(()));
      }
    }
    if this.requests.is_empty() {
      this.progress.finish(Some(DownloadProgress::finished()), Ok(()));
    }

    Arc::new(this)
  }

  pub fn batch_id(&self) -> i64 {
    self.batch_id
  }

  pub fn requests(&self) -> &[DownloadRequest] {
    &self.requests
  }

  pub fn progress(&self) -> ProgressReceiver {
    self.progress.subscribe()
  }

  pub fn current_progress(&self) -> DownloadProgress {
    self.progress.current()
  }

  pub async fn completion(&self) -> Result<(), DownloadError> {
    self.progress.subscribe().completion().await
  }

  pub fn progress_of(&self, request: &DownloadRequest) -> ProgressReceiver {
    let mut responses = self.responses.lock();
    self.response_mut(&mut responses, request).progress.subscribe()
  }

  pub fn details(&self, request: &DownloadRequest) -> RequestDetails {
    let mut responses = self.responses.lock();
    let data = self.response_mut(&mut responses, request);
    RequestDetails {
      state: data.state.clone(),
      task_id: data.task_id,
      task: data.task.clone(),
    }
  }

  pub fn is_completed(&self) -> bool {
    Self::completed(&self.responses.lock())
  }

  /// Requests currently occupying a transfer slot.
  pub fn running_tasks(&self) -> usize {
    self
      .responses
      .lock()
      .values()
      .filter(|d| d.is_in_progress() && d.task_id.is_some())
      .count()
  }

  pub fn download(&self, request: &DownloadRequest) -> Download {
    let mut responses = self.responses.lock();
    let data = self.response_mut(&mut responses, request);
    Download {
      batch_id: self.batch_id,
      request: request.clone(),
      task_id: data.task_id,
      status: if data.is_in_progress() {
        DownloadStatus::Downloading
      } else {
        DownloadStatus::Completed
      },
    }
  }

  pub fn update_progress(&self, request: &DownloadRequest, progress: DownloadProgress) {
    let mut responses = self.responses.lock();
    if Self::completed(&responses) {
      return;
    }
    let data = self.response_mut(&mut responses, request);
    if data.finished() || data.failed().is_some() {
      return;
    }
    data.progress.send(progress);
    self.progress.send(Self::overall(&responses));
  }

  pub fn complete(&self, request: &DownloadRequest, result: Result<(), DownloadError>) {
    let mut responses = self.responses.lock();
    self.complete_locked(&mut responses, request, result);
  }

  fn complete_locked(&self, responses: &mut Responses, request: &DownloadRequest, result: Result<(), DownloadError>) {
    let completed_previously = Self::completed(responses);
    let data = self.response_mut(responses, request);
    if !data.is_in_progress() {
      tracing::debug!(batch_id = self.batch_id, url = %request.url, "ignoring completion of a finished request");
      return;
    }
    data.state = match &result {
      Ok(()) => ResponseState::Finished,
      Err(e) => ResponseState::Failed(e.clone()),
    };
    data.progress.finish(Some(DownloadProgress::finished()), result);

    if completed_previously {
      return;
    }
    if !Self::completed(responses) {
      self.progress.send(Self::overall(responses));
      return;
    }

    let first_error = self
      .requests
      .iter()
      .find_map(|r| responses.get(r).and_then(|d| d.failed().cloned()));
    match first_error {
      Some(error) => {
        if error.is_cancelled() {
          tracing::info!(batch_id = self.batch_id, "batch cancelled");
        } else {
          self.crasher.record_error(&error, &format!("Download failed {}", self.batch_id));
        }
        for other in &self.requests {
          self.cancel_locked(responses, other);
        }
        self.progress.finish(None, Err(error));
      }
      None => {
        tracing::info!(batch_id = self.batch_id, "batch finished");
        self.progress.finish(Some(DownloadProgress::finished()), Ok(()));
      }
    }
  }

  /// Cancels every request; a no-op for a batch that already completed.
  pub async fn cancel(&self) {
    let cancels = self.requests.iter().map(|r| async move { self.cancel_request(r) });
    futures_util::future::join_all(cancels).await;
  }

  pub fn cancel_request(&self, request: &DownloadRequest) {
    let mut responses = self.responses.lock();
    self.cancel_locked(&mut responses, request);
  }

  fn cancel_locked(&self, responses: &mut Responses, request: &DownloadRequest) {
    let data = self.response_mut(responses, request);
    if !data.is_in_progress() {
      return;
    }
    if let Some(task) = &data.task {
      task.cancel();
    }
    self.complete_locked(responses, request, Err(DownloadError::Cancelled));
  }

  /// Creates a task for the first in-progress request that has none yet.
  pub fn start_download_if_needed(&self, session: &dyn NetworkSession) -> Option<(DownloadRequest, TaskHandle)> {
    let mut responses = self.responses.lock();
    for request in &self.requests {
      let Some(data) = responses.get_mut(request) else { continue };
      if data.is_in_progress() && data.task_id.is_none() {
        let task = session.download_task(request);
        data.task_id = Some(task.task_identifier());
        data.task = Some(task.clone());
        return Some((request.clone(), task));
      }
    }
    None
  }

  /// Reattaches live session tasks by identifier and forgets identifiers the session no longer knows.
  pub fn associate_tasks(&self, tasks: &[TaskHandle]) {
    let by_id: HashMap<TaskId, &TaskHandle> = tasks.iter().map(|t| (t.task_identifier(), t)).collect();
    let mut responses = self.responses.lock();
    for request in &self.requests {
      let Some(data) = responses.get_mut(request) else { continue };
      let Some(task_id) = data.task_id else { continue };
      match by_id.get(&task_id) {
        Some(task) => data.task = Some((*task).clone()),
        None => {
          if !data.finished() {
            tracing::warn!(
              batch_id = self.batch_id,
              task_id,
              url = %request.url,
              "no running task for download; it will be restarted"
            );
          }
          data.task_id = None;
          data.task = None;
        }
      }
    }
  }

  /// The request owning `task`, attaching the live handle if only its id was known.
  pub fn download_request(&self, task: &TaskHandle) -> Option<DownloadRequest> {
    let task_id = task.task_identifier();
    let mut responses = self.responses.lock();
    for request in &self.requests {
      let Some(data) = responses.get_mut(request) else { continue };
      if data.task_id == Some(task_id) {
        if data.task.is_none() {
          data.task = Some(task.clone());
        }
        return Some(request.clone());
      }
    }
    None
  }

  fn response_mut<'a>(&self, responses: &'a mut Responses, request: &DownloadRequest) -> &'a mut ResponseData {
    match responses.get_mut(request) {
      Some(data) => data,
      None => panic!("{} is not part of batch {}", request.url, self.batch_id),
    }
  }

  fn completed(responses: &Responses) -> bool {
    responses.values().any(|d| d.failed().is_some()) || responses.values().all(ResponseData::finished)
  }

  fn overall(responses: &Responses) -> DownloadProgress {
    if responses.is_empty() {
      return DownloadProgress::finished();
    }
    let sum: f64 = responses.values().map(|d| d.progress.current().progress()).sum();
    DownloadProgress::new(1.0, sum / responses.len() as f64)
  }
}

impl PartialEq for DownloadBatchResponse {
  fn eq(&self, other: &Self) -> bool {
    self.batch_id == other.batch_id
  }
}

impl Eq for DownloadBatchResponse {}

impl Hash for DownloadBatchResponse {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.batch_id.hash(state);
  }
}

impl fmt::Debug for DownloadBatchResponse {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("DownloadBatchResponse")
      .field("batch_id", &self.batch_id)
      .field("requests", &self.requests.len())
      .finish()
  }
}
