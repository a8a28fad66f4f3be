//! HTTP transfer session on tokio + reqwest.
//!
//! Each resumed task streams its body into a temp file under the incoming dir and reports
//! progress, the finished file and completion to the delegate, in that order.

use super::{NetworkSession, SessionError, SessionErrorKind, SessionTask, SessionTasks, TaskHandle};
use crate::{
  config::DownloaderConfig,
  engine::{delegate::DownloadSessionDelegate, file_writer},
  model::{DownloadRequest, TaskId},
};
use anyhow::Context;
use dashmap::DashMap;
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::{
  fmt,
  path::{Path, PathBuf},
  sync::{
    atomic::{AtomicBool, AtomicI64, Ordering},
    Arc, Weak,
  },
  time::Duration,
};
use tokio::{io::AsyncWriteExt, runtime::Handle, sync::watch};
use url::Url;
use uuid::Uuid;

pub fn build_client(config: &DownloaderConfig) -> anyhow::Result<reqwest::Client> {
  reqwest::Client::builder()
    .user_agent(config.user_agent.clone())
    .redirect(reqwest::redirect::Policy::limited(10))
    .connect_timeout(config.connect_timeout())
    .build()
    .context("failed to build reqwest client")
}

/// What a failed transfer hands back so a later request can revalidate with a range.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ResumeData {
  pub url: Url,
  pub bytes_received: u64,
  pub etag: Option<String>,
  pub last_modified: Option<String>,
}

impl ResumeData {
  pub fn encode(&self) -> Vec<u8> {
    serde_json::to_vec(self).unwrap_or_default()
  }

  pub fn decode(data: &[u8]) -> anyhow::Result<Self> {
    serde_json::from_slice(data).context("invalid resume data")
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskControl {
  Run,
  Cancel,
}

pub struct HttpSession {
  inner: Arc<SessionInner>,
}

struct SessionInner {
  client: reqwest::Client,
  delegate: Arc<DownloadSessionDelegate>,
  incoming_dir: PathBuf,
  read_timeout: Duration,
  runtime: Handle,
  next_task_id: AtomicI64,
  tasks: DashMap<TaskId, Arc<HttpDownloadTask>>,
}

impl HttpSession {
  /// Must be called from within a tokio runtime; transfers are spawned on it.
  pub fn new(
    client: reqwest::Client,
    delegate: Arc<DownloadSessionDelegate>,
    incoming_dir: PathBuf,
    read_timeout: Duration,
  ) -> Self {
    Self {
      inner: Arc::new(SessionInner {
        client,
        delegate,
        incoming_dir,
        read_timeout,
        runtime: Handle::current(),
        next_task_id: AtomicI64::new(1),
        tasks: DashMap::new(),
      }),
    }
  }
}

impl NetworkSession for HttpSession {
  fn download_task(&self, request: &DownloadRequest) -> TaskHandle {
    let id = self.inner.next_task_id.fetch_add(1, Ordering::SeqCst);
    let (control, _) = watch::channel(TaskControl::Run);
    let task = Arc::new(HttpDownloadTask {
      id,
      url: request.url.clone(),
      status_code: Mutex::new(None),
      started: AtomicBool::new(false),
      control,
      session: Arc::downgrade(&self.inner),
    });
    self.inner.tasks.insert(id, task.clone());
    task
  }

  fn tasks(&self) -> SessionTasks {
    SessionTasks {
      download: self
        .inner
        .tasks
        .iter()
        .map(|t| t.value().clone() as TaskHandle)
        .collect(),
      ..SessionTasks::default()
    }
  }
}

pub struct HttpDownloadTask {
  id: TaskId,
  url: Url,
  status_code: Mutex<Option<u16>>,
  started: AtomicBool,
  control: watch::Sender<TaskControl>,
  session: Weak<SessionInner>,
}

impl HttpDownloadTask {
  fn launch(&self) {
    if self.started.swap(true, Ordering::SeqCst) {
      return;
    }
    let Some(session) = self.session.upgrade() else { return };
    let Some(task) = session.tasks.get(&self.id).map(|t| t.value().clone()) else { return };
    let runtime = session.runtime.clone();
    runtime.spawn(session.run(task));
  }
}

impl fmt::Debug for HttpDownloadTask {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("HttpDownloadTask")
      .field("id", &self.id)
      .field("url", &self.url.as_str())
      .finish()
  }
}

impl SessionTask for HttpDownloadTask {
  fn task_identifier(&self) -> TaskId {
    self.id
  }

  fn original_url(&self) -> Option<Url> {
    Some(self.url.clone())
  }

  fn status_code(&self) -> Option<u16> {
    *self.status_code.lock()
  }

  fn resume(&self) {
    self.launch();
  }

  fn cancel(&self) {
    self.control.send_replace(TaskControl::Cancel);
    // A task cancelled before it ran still reports its cancellation.
    self.launch();
  }
}

impl SessionInner {
  async fn run(self: Arc<Self>, task: Arc<HttpDownloadTask>) {
    let handle: TaskHandle = task.clone();
    let temp_path = self.incoming_dir.join(format!("{}.part", Uuid::new_v4()));
    tracing::debug!(task_id = task.id, url = %task.url, "transfer started");

    match self.transfer(&task, &handle, &temp_path).await {
      Ok(()) => {
        self.delegate.did_finish_downloading_to(&handle, &temp_path).await;
        let _ = file_writer::remove_if_exists(&temp_path).await;
        self.delegate.did_complete_with_error(&handle, None).await;
      }
      Err(e) => {
        let _ = file_writer::remove_if_exists(&temp_path).await;
        tracing::debug!(task_id = task.id, url = %task.url, error = %e, "transfer failed");
        self.delegate.did_complete_with_error(&handle, Some(e)).await;
      }
    }

    self.tasks.remove(&task.id);
    if self.tasks.is_empty() {
      self.delegate.did_finish_events_for_background_session().await;
    }
  }

  async fn transfer(&self, task: &HttpDownloadTask, handle: &TaskHandle, temp_path: &Path) -> Result<(), SessionError> {
    let mut control = task.control.subscribe();
    if *control.borrow() == TaskControl::Cancel {
      return Err(SessionError::cancelled());
    }

    let response = tokio::select! {
      _ = cancelled(&mut control) => return Err(SessionError::cancelled()),
      r = tokio::time::timeout(self.read_timeout, self.client.get(task.url.clone()).send()) => match r {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => return Err(classify(&e)),
        Err(_) => return Err(SessionError::new(SessionErrorKind::TimedOut, "timed out waiting for response headers")),
      },
    };

    *task.status_code.lock() = Some(response.status().as_u16());
    let expected = response
      .content_length()
      .and_then(|l| i64::try_from(l).ok())
      .unwrap_or(-1);
    let mut resume = ResumeData {
      url: task.url.clone(),
      bytes_received: 0,
      etag: header(&response, reqwest::header::ETAG),
      last_modified: header(&response, reqwest::header::LAST_MODIFIED),
    };

    tokio::fs::create_dir_all(&self.incoming_dir)
      .await
      .map_err(|e| SessionError::from_io(&e))?;
    let mut file = tokio::fs::File::create(temp_path)
      .await
      .map_err(|e| SessionError::from_io(&e))?;

    let mut body = response.bytes_stream();
    let mut written: i64 = 0;
    loop {
      let next = tokio::select! {
        _ = cancelled(&mut control) => return Err(SessionError::cancelled()),
        n = tokio::time::timeout(self.read_timeout, body.next()) => n,
      };
      let chunk = match next {
        Ok(None) => break,
        Ok(Some(Ok(chunk))) => chunk,
        Ok(Some(Err(e))) => return Err(classify(&e).with_resume_data(resume.encode())),
        Err(_) => {
          return Err(
            SessionError::new(SessionErrorKind::TimedOut, "timed out reading response body")
              .with_resume_data(resume.encode()),
          )
        }
      };
      file.write_all(&chunk).await.map_err(|e| SessionError::from_io(&e))?;
      let len = chunk.len() as i64;
      written += len;
      resume.bytes_received = written as u64;
      self.delegate.did_write_data(handle, len, written, expected).await;
    }
    file.flush().await.map_err(|e| SessionError::from_io(&e))?;
    Ok(())
  }
}

async fn cancelled(control: &mut watch::Receiver<TaskControl>) {
  let _ = control.wait_for(|c| *c == TaskControl::Cancel).await;
}

fn header(response: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
  response
    .headers()
    .get(name)
    .and_then(|v| v.to_str().ok())
    .map(str::to_string)
}

fn classify(err: &reqwest::Error) -> SessionError {
  let kind = if err.is_timeout() {
    SessionErrorKind::TimedOut
  } else if err.is_connect() {
    if looks_like_dns_failure(err) {
      SessionErrorKind::DnsLookupFailed
    } else {
      SessionErrorKind::CannotConnectToHost
    }
  } else if err.is_body() || err.is_decode() {
    SessionErrorKind::NetworkConnectionLost
  } else if err.is_redirect() || err.is_status() {
    SessionErrorKind::BadServerResponse
  } else {
    SessionErrorKind::Unknown
  };
  SessionError::new(kind, err.to_string())
}

fn looks_like_dns_failure(err: &reqwest::Error) -> bool {
  let mut source: Option<&(dyn std::error::Error + 'static)> = std::error::Error::source(err);
  while let Some(e) = source {
    let msg = e.to_string();
    if msg.contains("dns error") || msg.contains("failed to lookup address") {
      return true;
    }
    source = e.source();
  }
  false
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn resume_data_round_trips_through_json() {
    let data = ResumeData {
      url: Url::parse("https://files.test/a.zip").unwrap(),
      bytes_received: 42,
      etag: Some("\"abc\"".into()),
      last_modified: None,
    };
    assert_eq!(ResumeData::decode(&data.encode()).unwrap(), data);
    assert!(ResumeData::decode(b"nope").is_err());
  }
}
