//! Adapts transfer-session callbacks to controller and batch operations.

use super::{file_writer, DownloadBatchDataController, ResponseState, SingleTaskResponse};
use crate::{
  crash::Crasher,
  error::{DownloadError, ENOSPC},
  model::{DownloadProgress, DownloadRequest},
  transport::{describe, SessionError, SessionErrorKind, SessionTask, TaskHandle},
};
use parking_lot::Mutex;
use std::{
  path::{Path, PathBuf},
  sync::Arc,
};

type BackgroundCompletion = Box<dyn FnOnce() + Send>;

pub struct DownloadSessionDelegate {
  controller: Arc<DownloadBatchDataController>,
  downloads_dir: PathBuf,
  crasher: Arc<dyn Crasher>,
  background_session_completion: Mutex<Option<BackgroundCompletion>>,
}

impl DownloadSessionDelegate {
  pub fn new(controller: Arc<DownloadBatchDataController>, downloads_dir: PathBuf, crasher: Arc<dyn Crasher>) -> Self {
    Self {
      controller,
      downloads_dir,
      crasher,
      background_session_completion: Mutex::new(None),
    }
  }

  /// One-shot callback run when the session reports it has no more queued events.
  pub fn set_background_session_completion(&self, completion: impl FnOnce() + Send + 'static) {
    *self.background_session_completion.lock() = Some(Box::new(completion));
  }

  pub async fn did_finish_events_for_background_session(&self) {
    let completion = self.background_session_completion.lock().take();
    if let Some(completion) = completion {
      tracing::debug!("background session events finished");
      completion();
    }
  }

  pub async fn did_write_data(&self, task: &TaskHandle, _bytes_written: i64, total_written: i64, total_expected: i64) {
    let Some(response) = self.controller.download_request_response(task).await else {
      tracing::warn!(task = %describe(task.as_ref()), "progress reported for an unknown task");
      return;
    };
    let progress = DownloadProgress::new(total_expected as f64, total_written as f64);
    response.batch.update_progress(&response.request, progress);
  }

  pub async fn did_finish_downloading_to(&self, task: &TaskHandle, location: &Path) {
    if let Err(e) = validate(task.as_ref()) {
      tracing::warn!(task = %describe(task.as_ref()), error = %e, "discarding body of rejected response");
      return;
    }
    let Some(response) = self.controller.download_request_response(task).await else {
      tracing::warn!(task = %describe(task.as_ref()), "finished file for an unknown task");
      return;
    };
    if response.batch.details(&response.request).state != ResponseState::InProgress {
      tracing::debug!(task = %describe(task.as_ref()), "discarding body of a finished request");
      if let Err(e) = file_writer::remove_if_exists(location).await {
        tracing::warn!(path = %location.display(), error = %e, "failed to remove discarded body");
      }
      return;
    }

    let destination = response.request.destination(&self.downloads_dir);
    let resume_file = response.request.resume_file(&self.downloads_dir);
    if let Err(e) = file_writer::move_into_place(location, &destination, &resume_file).await {
      tracing::error!(
        task = %describe(task.as_ref()),
        destination = %destination.display(),
        error = %e,
        "failed to move downloaded file into place"
      );
      self
        .crasher
        .record_error(&e, "Problem with create directory or copying item to the new location");
      self.controller.download_failed(&response, DownloadError::from(e)).await;
    }
  }

  pub async fn did_complete_with_error(&self, task: &TaskHandle, error: Option<SessionError>) {
    let Some(response) = self.controller.download_request_response(task).await else {
      if !error.as_ref().is_some_and(SessionError::is_cancelled) {
        tracing::warn!(task = %describe(task.as_ref()), "completion reported for an unknown task");
      }
      return;
    };

    match (error, validate(task.as_ref())) {
      (Some(error), _) => {
        let error = self.wrap(error, &response).await;
        self.controller.download_failed(&response, error).await;
      }
      (None, Err(error)) => {
        tracing::warn!(task = %describe(task.as_ref()), error = %error, "download rejected");
        self.crasher.record_error(&error, "Download network error occurred");
        self.controller.download_failed(&response, error).await;
      }
      (None, Ok(())) => {
        tracing::debug!(task = %describe(task.as_ref()), "download completed");
        self.controller.download_completed(&response).await;
      }
    }
  }

  async fn wrap(&self, mut error: SessionError, response: &SingleTaskResponse) -> DownloadError {
    if let Some(data) = error.resume_data.take() {
      self.save_resume_data(&response.request, &data).await;
    }
    if error.is_cancelled() {
      return DownloadError::Cancelled;
    }
    tracing::warn!(url = %response.request.url, error = %error, "download failed");
    self.crasher.record_error(&error, "Download network error occurred");
    match error.kind {
      SessionErrorKind::Posix(ENOSPC) => DownloadError::NoDiskSpace,
      kind => DownloadError::Network(kind.into()),
    }
  }

  async fn save_resume_data(&self, request: &DownloadRequest, data: &[u8]) {
    let path = request.resume_file(&self.downloads_dir);
    if let Err(e) = file_writer::write_atomic(&path, data).await {
      tracing::error!(path = %path.display(), error = %e, "failed to save resume data");
      self.crasher.record_error(&e, "Couldn't save resume data");
    }
  }
}

/// Only 2xx responses count as success.
pub fn validate(task: &dyn SessionTask) -> Result<(), DownloadError> {
  let code = task.status_code().unwrap_or(0);
  if (200..300).contains(&code) {
    Ok(())
  } else {
    Err(DownloadError::unacceptable_status(code))
  }
}
