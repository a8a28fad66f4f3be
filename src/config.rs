use anyhow::Context;
use std::{
  path::{Path, PathBuf},
  time::Duration,
};

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct DownloaderConfig {
  /// Root under which logs, the database and downloaded files live.
  pub data_dir: PathBuf,
  pub max_simultaneous_downloads: usize,
  pub user_agent: String,
  pub connect_timeout_secs: u64,
  pub request_timeout_secs: u64,
}

impl Default for DownloaderConfig {
  fn default() -> Self {
    Self {
      data_dir: PathBuf::from("batch-downloader"),
      max_simultaneous_downloads: 3,
      user_agent: format!("batch-downloader/{}", env!("CARGO_PKG_VERSION")),
      connect_timeout_secs: 15,
      request_timeout_secs: 60,
    }
  }
}

impl DownloaderConfig {
  pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
    Self {
      data_dir: data_dir.into(),
      ..Self::default()
    }
  }

  /// Reads a JSON config file. A missing file yields the defaults.
  pub fn load(path: &Path) -> anyhow::Result<Self> {
    let raw = match std::fs::read_to_string(path) {
      Ok(raw) => raw,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
      Err(e) => return Err(e).context("failed to read config file"),
    };
    let mut cfg: Self = serde_json::from_str(&raw).context("invalid config file")?;
    if cfg.max_simultaneous_downloads == 0 {
      tracing::warn!("max_simultaneous_downloads of 0 would stall every batch; using 1");
      cfg.max_simultaneous_downloads = 1;
    }
    Ok(cfg)
  }

  pub fn connect_timeout(&self) -> Duration {
    Duration::from_secs(self.connect_timeout_secs)
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.request_timeout_secs)
  }

  pub fn paths(&self) -> DownloaderPaths {
    DownloaderPaths::new(&self.data_dir)
  }
}

#[derive(Debug, Clone)]
pub struct DownloaderPaths {
  pub data_dir: PathBuf,
  pub logs_dir: PathBuf,
  pub downloads_dir: PathBuf,
  /// In-flight transfer files. Kept under the downloads dir so moves stay on one volume.
  pub incoming_dir: PathBuf,
  pub db_path: PathBuf,
}

impl DownloaderPaths {
  pub fn new(data_dir: &Path) -> Self {
    let downloads_dir = data_dir.join("downloads");
    Self {
      data_dir: data_dir.to_path_buf(),
      logs_dir: data_dir.join("logs"),
      incoming_dir: downloads_dir.join(".incoming"),
      downloads_dir,
      db_path: data_dir.join("downloads.sqlite3"),
    }
  }

  pub fn create_dirs(&self) -> anyhow::Result<()> {
    std::fs::create_dir_all(&self.data_dir).context("failed to create data dir")?;
    std::fs::create_dir_all(&self.logs_dir).context("failed to create logs dir")?;
    std::fs::create_dir_all(&self.downloads_dir).context("failed to create downloads dir")?;
    std::fs::create_dir_all(&self.incoming_dir).context("failed to create incoming dir")?;
    Ok(())
  }
}
