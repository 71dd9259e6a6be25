//! JSON state files
//!
//! Checkpoints, batch artifacts, and the committed set are all whole-file JSON
//! documents. Writes go to a temp file in the same directory and are renamed
//! over the target, so a crash mid-write leaves the previous version intact.

use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{Error, Result};

/// Serialize `value` as pretty JSON and atomically replace `path`.
///
/// The parent directory is created if missing.
pub async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value).map_err(|source| Error::Json {
        path: path.display().to_string(),
        source,
    })?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Config(format!("{} has no parent directory", path.display())))?;
    tokio::fs::create_dir_all(dir).await?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_path = dir.join(format!(".{file_name}.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, &json).await?;
    tokio::fs::rename(&tmp_path, path).await?;

    debug!(path = %path.display(), bytes = json.len(), "persisted json");
    Ok(())
}

/// Read and parse a JSON file. Returns `Ok(None)` when the file does not exist.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| Error::Json {
            path: path.display().to_string(),
            source,
        })
}
