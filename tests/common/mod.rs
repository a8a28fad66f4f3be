#![allow(dead_code)]

use batch_downloader::{
  engine::delegate::DownloadSessionDelegate,
  transport::{NetworkSession, SessionError, SessionTask, SessionTasks, TaskHandle},
  Crasher, DownloadBatchResponse, DownloadManager, DownloaderConfig, DownloadRequest, DownloadsPersistence,
  SessionFactory, SqliteDownloadsPersistence, TaskId,
};
use parking_lot::Mutex;
use std::{
  fmt,
  path::{Path, PathBuf},
  sync::{
    atomic::{AtomicBool, AtomicI64, Ordering},
    Arc,
  },
};
use tempfile::TempDir;
use url::Url;

pub const MAX_SIMULTANEOUS: usize = 3;

#[derive(Default)]
pub struct RecordingCrasher {
  records: Mutex<Vec<(String, String)>>,
}

impl RecordingCrasher {
  pub fn reasons(&self) -> Vec<String> {
    self.records.lock().iter().map(|(_, r)| r.clone()).collect()
  }
}

impl Crasher for RecordingCrasher {
  fn record_error(&self, error: &dyn fmt::Display, reason: &str) {
    self.records.lock().push((error.to_string(), reason.to_string()));
  }
}

pub struct FakeTask {
  pub id: TaskId,
  pub url: Url,
  status: Mutex<Option<u16>>,
  resumed: AtomicBool,
  cancelled: AtomicBool,
  finished: AtomicBool,
}

impl FakeTask {
  fn new(id: TaskId, url: Url) -> Self {
    Self {
      id,
      url,
      status: Mutex::new(None),
      resumed: AtomicBool::new(false),
      cancelled: AtomicBool::new(false),
      finished: AtomicBool::new(false),
    }
  }

  pub fn is_resumed(&self) -> bool {
    self.resumed.load(Ordering::SeqCst)
  }

  pub fn is_cancelled(&self) -> bool {
    self.cancelled.load(Ordering::SeqCst)
  }
}

impl fmt::Debug for FakeTask {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "FakeTask({})", self.id)
  }
}

impl SessionTask for FakeTask {
  fn task_identifier(&self) -> TaskId {
    self.id
  }
  fn original_url(&self) -> Option<Url> {
    Some(self.url.clone())
  }
  fn status_code(&self) -> Option<u16> {
    *self.status.lock()
  }
  fn resume(&self) {
    self.resumed.store(true, Ordering::SeqCst);
  }
  fn cancel(&self) {
    self.cancelled.store(true, Ordering::SeqCst);
  }
}

/// Session whose callbacks are driven by the test.
pub struct NetworkSessionFake {
  delegate: Arc<DownloadSessionDelegate>,
  next_id: AtomicI64,
  tasks: Mutex<Vec<Arc<FakeTask>>>,
}

impl NetworkSessionFake {
  pub fn task(&self, id: TaskId) -> Arc<FakeTask> {
    match self.tasks.lock().iter().find(|t| t.id == id) {
      Some(t) => t.clone(),
      None => panic!("no fake task {id}"),
    }
  }

  pub fn created(&self) -> Vec<Arc<FakeTask>> {
    self.tasks.lock().clone()
  }

  /// Tasks resumed and not yet reported finished.
  pub fn running(&self) -> Vec<Arc<FakeTask>> {
    self
      .tasks
      .lock()
      .iter()
      .filter(|t| t.is_resumed() && !t.finished.load(Ordering::SeqCst))
      .cloned()
      .collect()
  }

  pub async fn report_progress(&self, task: &Arc<FakeTask>, written: i64, total: i64) {
    let handle: TaskHandle = task.clone();
    self.delegate.did_write_data(&handle, written, written, total).await;
  }

  pub async fn complete_download_task(&self, task: &Arc<FakeTask>, location: &Path, total_bytes: i64, progress_loops: i64) {
    self.respond(task, 200, location, total_bytes, progress_loops).await;
  }

  pub async fn respond(&self, task: &Arc<FakeTask>, status: u16, location: &Path, total_bytes: i64, progress_loops: i64) {
    let handle: TaskHandle = task.clone();
    *task.status.lock() = Some(status);
    for i in 1..=progress_loops {
      let written = total_bytes * i / progress_loops;
      self
        .delegate
        .did_write_data(&handle, total_bytes / progress_loops, written, total_bytes)
        .await;
    }
    self.delegate.did_finish_downloading_to(&handle, location).await;
    self.delegate.did_complete_with_error(&handle, None).await;
    task.finished.store(true, Ordering::SeqCst);
  }

  pub async fn fail_download_task(&self, task: &Arc<FakeTask>, error: SessionError) {
    let handle: TaskHandle = task.clone();
    self.delegate.did_complete_with_error(&handle, Some(error)).await;
    task.finished.store(true, Ordering::SeqCst);
  }

  pub async fn finish_background_events(&self) {
    self.delegate.did_finish_events_for_background_session().await;
  }
}

impl NetworkSession for NetworkSessionFake {
  fn download_task(&self, request: &DownloadRequest) -> TaskHandle {
    let id = self.next_id.fetch_add(1, Ordering::SeqCst);
    let task = Arc::new(FakeTask::new(id, request.url.clone()));
    self.tasks.lock().push(task.clone());
    task
  }

  fn tasks(&self) -> SessionTasks {
    let download = self
      .tasks
      .lock()
      .iter()
      .filter(|t| !t.finished.load(Ordering::SeqCst))
      .map(|t| t.clone() as TaskHandle)
      .collect();
    SessionTasks {
      download,
      ..SessionTasks::default()
    }
  }
}

pub struct Harness {
  pub manager: DownloadManager,
  pub session: Arc<NetworkSessionFake>,
  pub persistence: Arc<dyn DownloadsPersistence>,
  pub crasher: Arc<RecordingCrasher>,
  pub config: DownloaderConfig,
  dir: Arc<TempDir>,
}

impl Harness {
  pub async fn new() -> Self {
    let dir = Arc::new(tempfile::tempdir().unwrap());
    let config = DownloaderConfig {
      max_simultaneous_downloads: MAX_SIMULTANEOUS,
      ..DownloaderConfig::with_data_dir(dir.path())
    };
    config.paths().create_dirs().unwrap();
    let persistence: Arc<dyn DownloadsPersistence> =
      Arc::new(SqliteDownloadsPersistence::open(config.paths().db_path).unwrap());
    Self::start(dir, config, persistence, Vec::new(), 1).await
  }

  pub async fn with_persistence(persistence: Arc<dyn DownloadsPersistence>) -> Self {
    let dir = Arc::new(tempfile::tempdir().unwrap());
    let config = DownloaderConfig {
      max_simultaneous_downloads: MAX_SIMULTANEOUS,
      ..DownloaderConfig::with_data_dir(dir.path())
    };
    config.paths().create_dirs().unwrap();
    Self::start(dir, config, persistence, Vec::new(), 1).await
  }

  /// A fresh manager on the same storage, as after a process restart. `surviving` are the
  /// tasks the session still reports.
  pub async fn restart(&self, surviving: Vec<Arc<FakeTask>>) -> Self {
    Self::start(self.dir.clone(), self.config.clone(), self.persistence.clone(), surviving, 100).await
  }

  async fn start(
    dir: Arc<TempDir>,
    config: DownloaderConfig,
    persistence: Arc<dyn DownloadsPersistence>,
    surviving: Vec<Arc<FakeTask>>,
    first_task_id: TaskId,
  ) -> Self {
    let crasher = Arc::new(RecordingCrasher::default());
    let slot: Arc<Mutex<Option<Arc<NetworkSessionFake>>>> = Arc::new(Mutex::new(None));
    let factory_slot = slot.clone();
    let factory: SessionFactory = Box::new(move |delegate: Arc<DownloadSessionDelegate>| {
      let fake = Arc::new(NetworkSessionFake {
        delegate,
        next_id: AtomicI64::new(first_task_id),
        tasks: Mutex::new(surviving),
      });
      *factory_slot.lock() = Some(fake.clone());
      let session: Arc<dyn NetworkSession> = fake;
      session
    });
    let manager = DownloadManager::start(&config, factory, persistence.clone(), crasher.clone()).await;
    let session = match slot.lock().take() {
      Some(s) => s,
      None => panic!("session factory was not called"),
    };
    Self {
      manager,
      session,
      persistence,
      crasher,
      config,
      dir,
    }
  }

  pub fn downloads_dir(&self) -> PathBuf {
    self.config.paths().downloads_dir
  }

  /// A finished transfer file waiting to be moved into place.
  pub fn incoming(&self, name: &str, contents: &[u8]) -> PathBuf {
    let path = self.config.paths().incoming_dir.join(name);
    std::fs::write(&path, contents).unwrap();
    path
  }

  pub fn task_for(&self, batch: &DownloadBatchResponse, request: &DownloadRequest) -> Arc<FakeTask> {
    match batch.details(request).task_id {
      Some(id) => self.session.task(id),
      None => panic!("{} has no task", request.url),
    }
  }

  pub async fn complete(&self, batch: &DownloadBatchResponse, request: &DownloadRequest) {
    let task = self.task_for(batch, request);
    let location = self.incoming(&format!("{}.part", task.id), request.url.as_str().as_bytes());
    self.session.complete_download_task(&task, &location, 100, 4).await;
  }
}

pub fn request(name: &str) -> DownloadRequest {
  DownloadRequest::new(
    Url::parse(&format!("https://files.test/{name}")).unwrap(),
    format!("mushaf/{name}"),
  )
}

pub fn requests(names: &[&str]) -> Vec<DownloadRequest> {
  names.iter().map(|n| request(n)).collect()
}
