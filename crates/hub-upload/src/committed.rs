//! Artifacts already pushed to the hub, persisted as `{"committed": [...]}`

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Result;

pub const FILE_NAME: &str = "committed_batches.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct CommittedFile {
    #[serde(default)]
    committed: Vec<String>,
}

#[derive(Debug)]
pub struct CommittedSet {
    path: PathBuf,
    names: BTreeSet<String>,
}

impl CommittedSet {
    pub async fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(FILE_NAME);
        let file: Option<CommittedFile> = common::read_json(&path).await?;
        let names: BTreeSet<String> = file
            .map(|f| f.committed.into_iter().collect())
            .unwrap_or_default();
        info!(path = %path.display(), committed = names.len(), "committed set loaded");
        Ok(Self { path, names })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Add `names` and persist the whole set.
    pub async fn extend<I>(&mut self, names: I) -> Result<()>
    where
        I: IntoIterator<Item = String>,
    {
        self.names.extend(names);
        let file = CommittedFile {
            committed: self.names.iter().cloned().collect(),
        };
        common::write_json_atomic(&self.path, &file).await?;
        Ok(())
    }
}
