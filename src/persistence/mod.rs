use crate::model::{Download, DownloadBatch, DownloadBatchRequest, DownloadRequest, DownloadStatus};
use anyhow::Context;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::{path::PathBuf, sync::Arc};
use url::Url;

/// Durable store of batches and their downloads. Every method is atomic on its own.
pub trait DownloadsPersistence: Send + Sync {
  fn retrieve_all(&self) -> anyhow::Result<Vec<DownloadBatch>>;
  fn insert(&self, batch: &DownloadBatchRequest) -> anyhow::Result<DownloadBatch>;
  fn update(&self, downloads: &[Download]) -> anyhow::Result<()>;
  fn delete(&self, batch_ids: &[i64]) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct SqliteDownloadsPersistence {
  conn: Arc<Mutex<Connection>>,
}

impl SqliteDownloadsPersistence {
  pub fn open(path: PathBuf) -> anyhow::Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).context("failed to create db parent dir")?;
    }
    let conn = Connection::open(&path).context("failed to open sqlite db")?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Self::from_connection(conn)
  }

  pub fn open_in_memory() -> anyhow::Result<Self> {
    let conn = Connection::open_in_memory().context("failed to open in-memory sqlite db")?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> anyhow::Result<Self> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    let db = Self {
      conn: Arc::new(Mutex::new(conn)),
    };
    db.init_schema()?;
    Ok(db)
  }

  fn init_schema(&self) -> anyhow::Result<()> {
    let sql = r#"
      CREATE TABLE IF NOT EXISTS download_batches (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        created_at TEXT NOT NULL
      );

      CREATE TABLE IF NOT EXISTS downloads (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        batch_id INTEGER NOT NULL,
        url TEXT NOT NULL,
        resume_path TEXT NOT NULL,
        destination_path TEXT NOT NULL,
        status TEXT NOT NULL,
        task_id INTEGER,
        updated_at TEXT NOT NULL,
        FOREIGN KEY(batch_id) REFERENCES download_batches(id) ON DELETE CASCADE
      );

      CREATE INDEX IF NOT EXISTS idx_downloads_by_batch ON downloads(batch_id);
    "#;

    let conn = self.conn.lock();
    conn.execute_batch(sql).context("failed to initialize schema")?;
    Ok(())
  }

  fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
      .format(&time::format_description::well_known::Rfc3339)
      .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
  }
}

impl DownloadsPersistence for SqliteDownloadsPersistence {
  fn retrieve_all(&self) -> anyhow::Result<Vec<DownloadBatch>> {
    let conn = self.conn.lock();
    let mut stmt = conn.prepare(
      r#"
        SELECT b.id, d.url, d.destination_path, d.status, d.task_id
        FROM download_batches b
        LEFT JOIN downloads d ON d.batch_id = b.id
        ORDER BY b.id ASC, d.id ASC
      "#,
    )?;

    let rows = stmt.query_map([], |row| {
      let batch_id: i64 = row.get(0)?;
      let url: Option<String> = row.get(1)?;
      let destination_path: Option<String> = row.get(2)?;
      let status: Option<String> = row.get(3)?;
      let task_id: Option<i64> = row.get(4)?;
      Ok((batch_id, url, destination_path, status, task_id))
    })?;

    let mut out: Vec<DownloadBatch> = Vec::new();
    for r in rows {
      let (batch_id, url, destination_path, status, task_id) = r?;
      if out.last().map(|b| b.id) != Some(batch_id) {
        out.push(DownloadBatch {
          id: batch_id,
          downloads: Vec::new(),
        });
      }
      // Empty batches come back from the LEFT JOIN with a NULL download row.
      let (Some(url), Some(destination_path), Some(status)) = (url, destination_path, status) else {
        continue;
      };
      let url = Url::parse(&url).with_context(|| format!("invalid url stored for batch {batch_id}"))?;
      let download = Download {
        batch_id,
        request: DownloadRequest::new(url, destination_path),
        task_id,
        status: parse_status(&status),
      };
      if let Some(batch) = out.last_mut() {
        batch.downloads.push(download);
      }
    }
    Ok(out)
  }

  fn insert(&self, batch: &DownloadBatchRequest) -> anyhow::Result<DownloadBatch> {
    let now = Self::now_rfc3339();
    let mut conn = self.conn.lock();
    let tx = conn.transaction()?;
    tx.execute(
      r#"INSERT INTO download_batches (created_at) VALUES (?1)"#,
      params![now],
    )
    .context("failed to insert batch")?;
    let batch_id = tx.last_insert_rowid();

    let mut downloads = Vec::with_capacity(batch.requests.len());
    for request in &batch.requests {
      tx.execute(
        r#"
          INSERT INTO downloads (batch_id, url, resume_path, destination_path, status, task_id, updated_at)
          VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6)
        "#,
        params![
          batch_id,
          request.url.as_str(),
          request.resume_path(),
          request.destination_path,
          status_to_str(DownloadStatus::Downloading),
          now
        ],
      )
      .context("failed to insert download")?;
      downloads.push(Download {
        batch_id,
        request: request.clone(),
        task_id: None,
        status: DownloadStatus::Downloading,
      });
    }
    tx.commit().context("failed to commit batch")?;

    Ok(DownloadBatch {
      id: batch_id,
      downloads,
    })
  }

  fn update(&self, downloads: &[Download]) -> anyhow::Result<()> {
    let now = Self::now_rfc3339();
    let mut conn = self.conn.lock();
    let tx = conn.transaction()?;
    for d in downloads {
      tx.execute(
        r#"UPDATE downloads SET status=?1, task_id=?2, updated_at=?3 WHERE batch_id=?4 AND url=?5"#,
        params![status_to_str(d.status), d.task_id, now, d.batch_id, d.request.url.as_str()],
      )
      .context("failed to update download")?;
    }
    tx.commit().context("failed to commit download update")?;
    Ok(())
  }

  fn delete(&self, batch_ids: &[i64]) -> anyhow::Result<()> {
    let mut conn = self.conn.lock();
    let tx = conn.transaction()?;
    for id in batch_ids {
      tx.execute(r#"DELETE FROM download_batches WHERE id=?1"#, params![id])
        .context("failed to delete batch")?;
    }
    tx.commit().context("failed to commit batch delete")?;
    Ok(())
  }
}

fn status_to_str(s: DownloadStatus) -> &'static str {
  match s {
    DownloadStatus::Downloading => "DOWNLOADING",
    DownloadStatus::Completed => "COMPLETED",
  }
}

fn parse_status(s: &str) -> DownloadStatus {
  match s {
    "COMPLETED" => DownloadStatus::Completed,
    _ => DownloadStatus::Downloading,
  }
}
