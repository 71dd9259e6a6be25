//! Batch artifacts and the run index
//!
//! One `batch_{n}.json` per batch with at least one success. Batch numbers
//! continue from the highest artifact found in any results directory, and an
//! existing file is never overwritten.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::Result;

const PREFIX: &str = "batch_";
const SUFFIX: &str = ".json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchArtifact {
    pub batch: u64,
    /// Items dispatched in the batch
    pub size: usize,
    pub success: usize,
    pub duration_sec: f64,
    pub quota_used: u64,
    /// Video id to harvested record, successes only
    pub videos: Map<String, Value>,
    /// Video id to work list category
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub categories: BTreeMap<String, String>,
}

/// Per-batch line of the run index.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub batch: u64,
    pub size: usize,
    pub success: usize,
    pub duration_sec: f64,
}

impl From<&BatchArtifact> for BatchSummary {
    fn from(a: &BatchArtifact) -> Self {
        Self {
            batch: a.batch,
            size: a.size,
            success: a.success,
            duration_sec: a.duration_sec,
        }
    }
}

pub fn artifact_file_name(batch: u64) -> String {
    format!("{PREFIX}{batch}{SUFFIX}")
}

/// `batch_12.json` -> 12
pub fn parse_artifact_number(file_name: &str) -> Option<u64> {
    file_name
        .strip_prefix(PREFIX)?
        .strip_suffix(SUFFIX)?
        .parse()
        .ok()
}

/// Artifact files in `dir`, ordered by batch number. A missing directory has none.
pub async fn list_artifacts(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(common::Error::from(e).into()),
    };

    let mut found = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(common::Error::from)? {
        let name = entry.file_name();
        if let Some(n) = name.to_str().and_then(parse_artifact_number) {
            found.push((n, entry.path()));
        }
    }
    found.sort_by_key(|(n, _)| *n);
    Ok(found)
}

/// Highest batch number across `dirs`, 0 when there are no artifacts.
pub async fn highest_batch_number(dirs: &[&Path]) -> Result<u64> {
    let mut highest = 0;
    for dir in dirs {
        if let Some((n, _)) = list_artifacts(dir).await?.last() {
            highest = highest.max(*n);
        }
    }
    Ok(highest)
}

/// Write `artifact` into `dir`. If its file name is taken, the batch number
/// is bumped until a free name is found and `artifact.batch` is updated.
pub async fn write_artifact(dir: &Path, artifact: &mut BatchArtifact) -> Result<PathBuf> {
    let mut path = dir.join(artifact_file_name(artifact.batch));
    while tokio::fs::try_exists(&path)
        .await
        .map_err(common::Error::from)?
    {
        let taken = artifact.batch;
        artifact.batch += 1;
        warn!(taken, next = artifact.batch, "artifact exists, renumbering");
        path = dir.join(artifact_file_name(artifact.batch));
    }
    common::write_json_atomic(&path, artifact).await?;
    debug!(path = %path.display(), batch = artifact.batch, "artifact written");
    Ok(path)
}

pub async fn read_artifact(path: &Path) -> Result<Option<BatchArtifact>> {
    Ok(common::read_json(path).await?)
}

/// Write the run index: `_batches`, `_run`, then every record by video id.
pub async fn write_run_index(
    path: &Path,
    batches: &[BatchSummary],
    run: Value,
    records: &Map<String, Value>,
) -> Result<()> {
    let mut index = Map::with_capacity(records.len() + 2);
    index.insert(
        "_batches".to_string(),
        serde_json::to_value(batches).unwrap_or(Value::Null),
    );
    index.insert("_run".to_string(), run);
    for (id, record) in records {
        index.insert(id.clone(), record.clone());
    }
    common::write_json_atomic(path, &index).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn artifact(batch: u64) -> BatchArtifact {
        let mut videos = Map::new();
        videos.insert("aaaaaaaaaaa".into(), json!({"videoId": "aaaaaaaaaaa"}));
        BatchArtifact {
            batch,
            size: 2,
            success: 1,
            duration_sec: 1.5,
            quota_used: 3,
            videos,
            categories: [("aaaaaaaaaaa".to_string(), "music".to_string())].into(),
        }
    }

    #[test]
    fn file_names_round_trip_through_parser() {
        assert_eq!(artifact_file_name(7), "batch_7.json");
        assert_eq!(parse_artifact_number("batch_7.json"), Some(7));
        assert_eq!(parse_artifact_number("batch_x.json"), None);
        assert_eq!(parse_artifact_number("progress.json"), None);
        assert_eq!(parse_artifact_number("batch_7.json.tmp"), None);
    }

    #[test]
    fn serialized_shape_uses_camel_case() {
        let value = serde_json::to_value(artifact(3)).unwrap();
        assert_eq!(value["batch"], 3);
        assert_eq!(value["durationSec"], 1.5);
        assert_eq!(value["quotaUsed"], 3);
        assert_eq!(value["videos"]["aaaaaaaaaaa"]["videoId"], "aaaaaaaaaaa");
        assert_eq!(value["categories"]["aaaaaaaaaaa"], "music");
    }

    #[test]
    fn artifact_without_categories_parses() {
        let parsed: BatchArtifact = serde_json::from_value(json!({
            "batch": 1, "size": 1, "success": 1, "durationSec": 0.1,
            "quotaUsed": 1, "videos": {}
        }))
        .unwrap();
        assert!(parsed.categories.is_empty());
    }

    #[tokio::test]
    async fn listing_is_numeric_and_tolerates_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(list_artifacts(&dir.path().join("nope")).await.unwrap().is_empty());

        for n in [10, 2, 1] {
            std::fs::write(dir.path().join(artifact_file_name(n)), "{}").unwrap();
        }
        std::fs::write(dir.path().join("progress.json"), "{}").unwrap();

        let numbers: Vec<u64> = list_artifacts(dir.path())
            .await
            .unwrap()
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        assert_eq!(numbers, vec![1, 2, 10]);
    }

    #[tokio::test]
    async fn highest_number_spans_directories() {
        let primary = tempfile::tempdir().unwrap();
        let legacy = tempfile::tempdir().unwrap();
        assert_eq!(
            highest_batch_number(&[primary.path(), legacy.path()]).await.unwrap(),
            0
        );

        std::fs::write(primary.path().join(artifact_file_name(4)), "{}").unwrap();
        std::fs::write(legacy.path().join(artifact_file_name(9)), "{}").unwrap();
        assert_eq!(
            highest_batch_number(&[primary.path(), legacy.path()]).await.unwrap(),
            9
        );
    }

    #[tokio::test]
    async fn write_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(artifact_file_name(5)), "{}").unwrap();
        std::fs::write(dir.path().join(artifact_file_name(6)), "{}").unwrap();

        let mut a = artifact(5);
        let path = write_artifact(dir.path(), &mut a).await.unwrap();
        assert_eq!(a.batch, 7);
        assert_eq!(path, dir.path().join("batch_7.json"));

        let read = read_artifact(&path).await.unwrap().unwrap();
        assert_eq!(read, a);
        assert_eq!(std::fs::read_to_string(dir.path().join("batch_5.json")).unwrap(), "{}");
    }

    #[tokio::test]
    async fn run_index_puts_metadata_first() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("yt_api_aggregate.json");
        let a = artifact(1);

        write_run_index(
            &path,
            &[BatchSummary::from(&a)],
            json!({"halt": "completed"}),
            &a.videos,
        )
        .await
        .unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let value: Map<String, Value> = serde_json::from_str(&raw).unwrap();
        let keys: Vec<&String> = value.keys().collect();
        assert_eq!(keys, vec!["_batches", "_run", "aaaaaaaaaaa"]);
        assert_eq!(value["_batches"][0]["success"], 1);
        assert_eq!(value["_run"]["halt"], "completed");
    }
}
