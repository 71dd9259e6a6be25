//! Local copy of the repository file listing
//!
//! Listing a large dataset repository is slow, so the known paths are kept in
//! `repo_files.json` under the cache directory and refreshed after commits.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub const FILE_NAME: &str = "repo_files.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheFile {
    #[serde(default)]
    files: Vec<String>,
}

#[derive(Debug)]
pub struct ListingCache {
    path: PathBuf,
    paths: BTreeSet<String>,
}

impl ListingCache {
    /// Load the cached listing. `None` when no cache file exists yet.
    pub async fn load(cache_dir: &Path) -> Result<Option<Self>> {
        let path = cache_dir.join(FILE_NAME);
        let file: Option<CacheFile> = common::read_json(&path).await?;
        Ok(file.map(|f| Self {
            path,
            paths: f.files.into_iter().collect(),
        }))
    }

    pub fn new(cache_dir: &Path, paths: impl IntoIterator<Item = String>) -> Self {
        Self {
            path: cache_dir.join(FILE_NAME),
            paths: paths.into_iter().collect(),
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        self.paths.contains(path)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Replace the listing with a fresh remote one.
    pub fn replace(&mut self, paths: impl IntoIterator<Item = String>) {
        self.paths = paths.into_iter().collect();
    }

    pub fn merge(&mut self, paths: impl IntoIterator<Item = String>) {
        self.paths.extend(paths);
    }

    pub async fn save(&self) -> Result<()> {
        let file = CacheFile {
            files: self.paths.iter().cloned().collect(),
        };
        common::write_json_atomic(&self.path, &file).await?;
        Ok(())
    }
}
