//! Transfer session seam: what the engine needs from a background download engine.

pub mod http;

use crate::model::{DownloadRequest, TaskId};
use std::{fmt, sync::Arc};
use url::Url;

/// A single transfer owned by a session. Tasks are created suspended.
pub trait SessionTask: Send + Sync + fmt::Debug {
  fn task_identifier(&self) -> TaskId;
  fn original_url(&self) -> Option<Url>;
  /// HTTP status of the response, once headers arrived.
  fn status_code(&self) -> Option<u16>;
  fn resume(&self);
  fn cancel(&self);
}

pub type TaskHandle = Arc<dyn SessionTask>;

#[derive(Debug, Default, Clone)]
pub struct SessionTasks {
  pub data: Vec<TaskHandle>,
  pub upload: Vec<TaskHandle>,
  pub download: Vec<TaskHandle>,
}

/// Background transfer engine. Implementations must never invoke delegate callbacks
/// synchronously from `download_task`, `resume` or `cancel`.
pub trait NetworkSession: Send + Sync {
  fn download_task(&self, request: &DownloadRequest) -> TaskHandle;
  fn tasks(&self) -> SessionTasks;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionErrorKind {
  Cancelled,
  TimedOut,
  CannotFindHost,
  CannotConnectToHost,
  DnsLookupFailed,
  NetworkConnectionLost,
  NotConnectedToInternet,
  BadServerResponse,
  /// Raw OS error code.
  Posix(i32),
  Unknown,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct SessionError {
  pub kind: SessionErrorKind,
  pub message: String,
  /// Opaque blob a session can later use to continue the transfer.
  pub resume_data: Option<Vec<u8>>,
}

impl SessionError {
  pub fn new(kind: SessionErrorKind, message: impl Into<String>) -> Self {
    Self {
      kind,
      message: message.into(),
      resume_data: None,
    }
  }

  pub fn cancelled() -> Self {
    Self::new(SessionErrorKind::Cancelled, "cancelled")
  }

  pub fn with_resume_data(mut self, data: Vec<u8>) -> Self {
    self.resume_data = Some(data);
    self
  }

  pub fn is_cancelled(&self) -> bool {
    self.kind == SessionErrorKind::Cancelled
  }

  pub fn from_io(e: &std::io::Error) -> Self {
    let kind = match e.raw_os_error() {
      Some(code) => SessionErrorKind::Posix(code),
      None => SessionErrorKind::Unknown,
    };
    Self::new(kind, e.to_string())
  }
}

/// Short human-readable label for a task, used in log lines.
pub fn describe(task: &dyn SessionTask) -> String {
  match task.original_url() {
    Some(url) => format!("task {} ({url})", task.task_identifier()),
    None => format!("task {}", task.task_identifier()),
  }
}
