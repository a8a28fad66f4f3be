use crate::{config::DownloaderPaths, transport::SessionErrorKind};
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// POSIX "no space left on device".
pub const ENOSPC: i32 = 28;

/// Terminal failure of a single download or of a whole batch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, serde::Serialize, serde::Deserialize)]
#[serde(tag = "code", content = "detail", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DownloadError {
  #[error("download cancelled")]
  Cancelled,
  #[error("not enough disk space")]
  NoDiskSpace,
  #[error("server error: {0}")]
  ServerError(String),
  #[error("network error: {0}")]
  Network(NetworkError),
  #[error("file system error: {0}")]
  FileSystem(String),
}

impl DownloadError {
  pub fn is_cancelled(&self) -> bool {
    matches!(self, DownloadError::Cancelled)
  }

  pub fn unacceptable_status(code: u16) -> Self {
    DownloadError::ServerError(format!("Unacceptable status code: {code}"))
  }
}

impl From<std::io::Error> for DownloadError {
  fn from(e: std::io::Error) -> Self {
    if e.raw_os_error() == Some(ENOSPC) {
      return DownloadError::NoDiskSpace;
    }
    DownloadError::FileSystem(e.to_string())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NetworkError {
  #[error("unknown network failure")]
  Unknown,
  #[error("not connected to the internet")]
  NotConnectedToInternet,
  #[error("server not reachable")]
  ServerNotReachable,
  #[error("connection lost")]
  ConnectionLost,
  #[error("incorrect data returned")]
  IncorrectDataReturned,
}

impl From<SessionErrorKind> for NetworkError {
  fn from(kind: SessionErrorKind) -> Self {
    match kind {
      SessionErrorKind::TimedOut
      | SessionErrorKind::CannotFindHost
      | SessionErrorKind::CannotConnectToHost
      | SessionErrorKind::DnsLookupFailed => NetworkError::ServerNotReachable,
      SessionErrorKind::NetworkConnectionLost => NetworkError::ConnectionLost,
      SessionErrorKind::NotConnectedToInternet => NetworkError::NotConnectedToInternet,
      SessionErrorKind::BadServerResponse => NetworkError::IncorrectDataReturned,
      SessionErrorKind::Cancelled | SessionErrorKind::Posix(_) | SessionErrorKind::Unknown => {
        NetworkError::Unknown
      }
    }
  }
}

pub fn init_tracing(paths: &DownloaderPaths) -> anyhow::Result<()> {
  let file_appender = tracing_appender::rolling::daily(&paths.logs_dir, "batch-downloader.jsonl");
  let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
  let _ = LOG_GUARD.set(guard);

  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,reqwest=warn,hyper=warn"));

  tracing_subscriber::fmt()
    .with_env_filter(env_filter)
    .with_writer(non_blocking)
    .json()
    .with_current_span(true)
    .with_span_list(true)
    .try_init()
    .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

  Ok(())
}
