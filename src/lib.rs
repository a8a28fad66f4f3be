//! Persisted, concurrency-capped batch file downloads.
//!
//! A [`DownloadManager`] accepts [`DownloadBatchRequest`]s, stores them, and schedules their
//! transfers on a [`transport::NetworkSession`] so that at most
//! `max_simultaneous_downloads` transfers run at once, oldest batch first. Batches survive
//! restarts and are reconciled against the tasks the session still reports.

pub mod config;
pub mod crash;
pub mod engine;
pub mod error;
pub mod events;
pub mod manager;
pub mod model;
pub mod persistence;
pub mod transport;

pub use config::{DownloaderConfig, DownloaderPaths};
pub use crash::{Crasher, TracingCrasher};
pub use engine::{
  DownloadBatchResponse, ProgressReceiver, RequestDetails, ResponseState, SingleTaskResponse,
};
pub use error::{init_tracing, DownloadError, NetworkError};
pub use events::DownloadEvent;
pub use manager::{DownloadManager, SessionFactory};
pub use model::{Download, DownloadBatch, DownloadBatchRequest, DownloadProgress, DownloadRequest, DownloadStatus, TaskId};
pub use persistence::{DownloadsPersistence, SqliteDownloadsPersistence};
