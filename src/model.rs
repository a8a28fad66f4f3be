use std::path::{Path, PathBuf};
use url::Url;

/// Identifier a transfer session assigns to one of its tasks.
pub type TaskId = i64;

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DownloadStatus {
  Downloading,
  Completed,
}

/// One file to fetch. `destination_path` is relative to the downloads directory.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq, Hash)]
pub struct DownloadRequest {
  pub url: Url,
  pub destination_path: String,
}

impl DownloadRequest {
  pub fn new(url: Url, destination_path: impl Into<String>) -> Self {
    Self {
      url,
      destination_path: destination_path.into(),
    }
  }

  pub fn resume_path(&self) -> String {
    format!("{}.resume", self.destination_path)
  }

  pub fn destination(&self, root: &Path) -> PathBuf {
    root.join(&self.destination_path)
  }

  pub fn resume_file(&self, root: &Path) -> PathBuf {
    root.join(self.resume_path())
  }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq, Default)]
pub struct DownloadBatchRequest {
  pub requests: Vec<DownloadRequest>,
}

impl DownloadBatchRequest {
  /// Keeps the first occurrence of every request, in order.
  pub fn new(requests: impl IntoIterator<Item = DownloadRequest>) -> Self {
    let mut out: Vec<DownloadRequest> = Vec::new();
    for r in requests {
      if !out.contains(&r) {
        out.push(r);
      }
    }
    Self { requests: out }
  }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct Download {
  pub batch_id: i64,
  pub request: DownloadRequest,
  pub task_id: Option<TaskId>,
  pub status: DownloadStatus,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct DownloadBatch {
  pub id: i64,
  pub downloads: Vec<Download>,
}

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct DownloadProgress {
  pub total: f64,
  pub completed: f64,
}

impl DownloadProgress {
  pub fn new(total: f64, completed: f64) -> Self {
    Self { total, completed }
  }

  pub fn finished() -> Self {
    Self::new(1.0, 1.0)
  }

  /// Fraction in `[0, 1]`; unknown totals report 0.
  pub fn progress(&self) -> f64 {
    if self.total <= 0.0 || !self.total.is_finite() {
      return 0.0;
    }
    (self.completed / self.total).clamp(0.0, 1.0)
  }
}

impl Default for DownloadProgress {
  fn default() -> Self {
    Self::new(1.0, 0.0)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn request(path: &str) -> DownloadRequest {
    DownloadRequest::new(Url::parse(&format!("https://files.test/{path}")).unwrap(), path)
  }

  #[test]
  fn resume_path_sits_next_to_destination() {
    let r = request("audio/001.mp3");
    assert_eq!(r.resume_path(), "audio/001.mp3.resume");
    assert_eq!(
      r.resume_file(Path::new("/data")),
      PathBuf::from("/data/audio/001.mp3.resume")
    );
  }

  #[test]
  fn batch_request_drops_duplicates_in_order() {
    let batch = DownloadBatchRequest::new(vec![request("a"), request("b"), request("a"), request("c")]);
    let paths: Vec<_> = batch.requests.iter().map(|r| r.destination_path.as_str()).collect();
    assert_eq!(paths, vec!["a", "b", "c"]);
  }

  #[test]
  fn progress_fraction_is_clamped() {
    assert_eq!(DownloadProgress::new(0.0, 5.0).progress(), 0.0);
    assert_eq!(DownloadProgress::new(-1.0, 5.0).progress(), 0.0);
    assert_eq!(DownloadProgress::new(10.0, 20.0).progress(), 1.0);
    assert!((DownloadProgress::new(4.0, 1.0).progress() - 0.25).abs() < f64::EPSILON);
    assert_eq!(DownloadProgress::default().progress(), 0.0);
  }
}
