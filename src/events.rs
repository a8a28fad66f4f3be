use crate::error::DownloadError;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum DownloadEvent {
  BatchAdded { batch_id: i64, requests: usize },
  TasksStarted { count: usize },
  BatchRemoved { batch_id: i64, error: Option<DownloadError> },
}

#[derive(Clone)]
pub struct EventHub {
  tx: broadcast::Sender<DownloadEvent>,
}

impl EventHub {
  pub fn new() -> Self {
    // Lagging subscribers lose the oldest events.
    let (tx, _) = broadcast::channel(512);
    Self { tx }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
    self.tx.subscribe()
  }

  pub fn stream(&self) -> BroadcastStream<DownloadEvent> {
    BroadcastStream::new(self.tx.subscribe())
  }

  pub fn emit_batch_added(&self, batch_id: i64, requests: usize) {
    let _ = self.tx.send(DownloadEvent::BatchAdded { batch_id, requests });
  }

  pub fn emit_tasks_started(&self, count: usize) {
    let _ = self.tx.send(DownloadEvent::TasksStarted { count });
  }

  pub fn emit_batch_removed(&self, batch_id: i64, error: Option<DownloadError>) {
    let _ = self.tx.send(DownloadEvent::BatchRemoved { batch_id, error });
  }
}

impl Default for EventHub {
  fn default() -> Self {
    Self::new()
  }
}
