use std::{
  ffi::OsString,
  io,
  path::{Path, PathBuf},
};

/// Moves a finished transfer to `destination`, clearing any stale resume file and
/// previous destination first.
pub async fn move_into_place(source: &Path, destination: &Path, resume_file: &Path) -> io::Result<()> {
  remove_if_exists(resume_file).await?;
  remove_if_exists(destination).await?;
  if let Some(parent) = destination.parent() {
    tokio::fs::create_dir_all(parent).await?;
  }
  match tokio::fs::rename(source, destination).await {
    Ok(()) => Ok(()),
    Err(rename_err) => {
      // Cross-volume moves fail to rename.
      if tokio::fs::copy(source, destination).await.is_err() {
        return Err(rename_err);
      }
      let _ = tokio::fs::remove_file(source).await;
      Ok(())
    }
  }
}

/// Writes `data` next to `path` and renames it over, so readers never see a partial file.
pub async fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
  if let Some(parent) = path.parent() {
    tokio::fs::create_dir_all(parent).await?;
  }
  let tmp = sibling_tmp(path);
  tokio::fs::write(&tmp, data).await?;
  if let Err(e) = tokio::fs::rename(&tmp, path).await {
    let _ = tokio::fs::remove_file(&tmp).await;
    return Err(e);
  }
  Ok(())
}

pub async fn remove_if_exists(path: &Path) -> io::Result<()> {
  match tokio::fs::remove_file(path).await {
    Ok(()) => Ok(()),
    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
    Err(e) => Err(e),
  }
}

fn sibling_tmp(path: &Path) -> PathBuf {
  let mut name: OsString = path.as_os_str().to_owned();
  name.push(".tmp");
  PathBuf::from(name)
}
