//! Durable record of processed locators
//!
//! Stored as `{"processed_urls": [...sorted], "count": n}` and rewritten
//! whole after every new entry.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Result;

pub const FILE_NAME: &str = "progress.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct CheckpointFile {
    #[serde(default)]
    processed_urls: Vec<String>,
    #[serde(default)]
    count: usize,
}

#[derive(Debug)]
pub struct Checkpoint {
    path: PathBuf,
    processed: BTreeSet<String>,
}

impl Checkpoint {
    /// Load `progress.json` from `results_dir`, falling back to the legacy
    /// directory's copy when the primary one is absent. Saves always target
    /// the primary directory. A corrupt file is an error, not an empty set.
    pub async fn load(results_dir: &Path, legacy_dir: Option<&Path>) -> Result<Self> {
        let path = results_dir.join(FILE_NAME);
        let mut file: Option<CheckpointFile> = common::read_json(&path).await?;

        if file.is_none() {
            if let Some(legacy) = legacy_dir {
                let legacy_path = legacy.join(FILE_NAME);
                file = common::read_json(&legacy_path).await?;
                if file.is_some() {
                    info!(path = %legacy_path.display(), "loaded checkpoint from legacy directory");
                }
            }
        }

        let processed: BTreeSet<String> = file
            .map(|f| f.processed_urls.into_iter().collect())
            .unwrap_or_default();
        info!(path = %path.display(), processed = processed.len(), "checkpoint loaded");
        Ok(Self { path, processed })
    }

    pub fn contains(&self, locator: &str) -> bool {
        self.processed.contains(locator)
    }

    pub fn len(&self) -> usize {
        self.processed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processed.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn processed(&self) -> impl Iterator<Item = &str> {
        self.processed.iter().map(String::as_str)
    }

    /// Record `locator` and persist. Returns false (without writing) when it
    /// was already present.
    pub async fn insert(&mut self, locator: &str) -> Result<bool> {
        if !self.processed.insert(locator.to_owned()) {
            return Ok(false);
        }
        self.save().await?;
        Ok(true)
    }

    /// Record `locator` in memory only. Returns false when it was already present.
    pub fn mark(&mut self, locator: &str) -> bool {
        self.processed.insert(locator.to_owned())
    }

    pub async fn save(&self) -> Result<()> {
        self.snapshot().await
    }

    /// Write of the current contents that does not borrow the checkpoint, so
    /// entries marked while it runs are left for the next snapshot.
    pub fn snapshot(&self) -> impl Future<Output = Result<()>> + Send + 'static {
        let path = self.path.clone();
        let file = CheckpointFile {
            processed_urls: self.processed.iter().cloned().collect(),
            count: self.processed.len(),
        };
        async move {
            common::write_json_atomic(&path, &file).await?;
            Ok(())
        }
    }
}
