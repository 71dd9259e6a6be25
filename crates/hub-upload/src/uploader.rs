//! Commit-batching uploader loop
//!
//! Each iteration:
//! 1. Discover artifacts not yet pending or committed. Fewer than the
//!    detection threshold are held back until more arrive.
//! 2. Prune the one-hour commit history.
//! 3. Commit when enough batches are pending, or when some are pending and
//!    the last commit is older than `max_wait`, and the hourly ceiling allows.
//! 4. Push pending batches in chunks of at most `max_batches_per_commit`,
//!    degrading per `policy::plan` when the hub rejects a push.
//!
//! A chunk moves to the committed set only once all its files were pushed.
//! Aborted chunks stay pending; files that did land are merged into the
//! listing cache so the retry skips them.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use harvest::artifact;
use serde_json::{Map, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::ListingCache;
use crate::committed::CommittedSet;
use crate::error::{Error, Result};
use crate::policy::{CommitAction, plan};
use crate::store::{RemoteError, RemoteFile, RemoteStore};

const HOUR: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
pub struct UploaderConfig {
    pub poll_interval: Duration,
    /// New artifacts needed before any are enqueued
    pub detection_threshold: usize,
    pub min_batches_per_commit: usize,
    pub max_wait: Duration,
    pub max_commits_per_hour: usize,
    pub max_batches_per_commit: usize,
    pub max_files_per_commit: usize,
    /// Chunks at or below this many files fall back to single-file commits
    pub split_floor: usize,
    pub single_delay: Duration,
    pub rate_limit_cooldown: Duration,
    pub snapshot_label: String,
    pub results_dir: PathBuf,
    /// Committed set and listing cache live here
    pub cache_dir: PathBuf,
    /// Optional `category -> [video ids]` index for artifacts without categories
    pub cat2ids_path: Option<PathBuf>,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            detection_threshold: 5,
            min_batches_per_commit: 10,
            max_wait: Duration::from_secs(300),
            max_commits_per_hour: 100,
            max_batches_per_commit: 50,
            max_files_per_commit: 1000,
            split_floor: 8,
            single_delay: Duration::from_millis(500),
            rate_limit_cooldown: Duration::from_secs(60),
            snapshot_label: "yt_api".to_string(),
            results_dir: PathBuf::from("results"),
            cache_dir: PathBuf::from(".cache"),
            cat2ids_path: None,
        }
    }
}

impl UploaderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.detection_threshold == 0 {
            return Err(Error::Config("detection_threshold must be at least 1".into()));
        }
        if self.max_commits_per_hour == 0 {
            return Err(Error::Config("max_commits_per_hour must be at least 1".into()));
        }
        if self.max_batches_per_commit == 0 {
            return Err(Error::Config("max_batches_per_commit must be at least 1".into()));
        }
        if self.max_batches_per_commit >= self.max_files_per_commit {
            return Err(Error::Config(format!(
                "max_batches_per_commit ({}) must be below max_files_per_commit ({})",
                self.max_batches_per_commit, self.max_files_per_commit
            )));
        }
        Ok(())
    }
}

/// Counters shared with the status endpoint.
#[derive(Debug, Default)]
pub struct UploadStatus {
    pending: AtomicUsize,
    committed: AtomicUsize,
    commits_last_hour: AtomicUsize,
    remote_commits: AtomicU64,
    files_uploaded: AtomicU64,
    files_failed: AtomicU64,
}

impl UploadStatus {
    pub fn health(&self) -> Value {
        serde_json::json!({
            "status": "ok",
            "mode": "upload",
            "pending_batches": self.pending.load(Ordering::Relaxed),
            "committed_batches": self.committed.load(Ordering::Relaxed),
            "commits_last_hour": self.commits_last_hour.load(Ordering::Relaxed),
            "remote_commits": self.remote_commits.load(Ordering::Relaxed),
            "files_uploaded": self.files_uploaded.load(Ordering::Relaxed),
            "files_failed": self.files_failed.load(Ordering::Relaxed),
        })
    }
}

/// What one iteration did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    /// Artifacts enqueued this iteration
    pub discovered: usize,
    /// New artifacts left for a later iteration
    pub held_back: usize,
    pub batches_committed: usize,
    pub remote_commits: usize,
    pub files_uploaded: usize,
    /// A chunk was left pending after a rate limit or the hourly ceiling
    pub aborted: bool,
}

enum ChunkOutcome {
    Done,
    Aborted,
}

pub struct Uploader {
    store: Arc<dyn RemoteStore>,
    config: UploaderConfig,
    snapshot_folder: String,
    pending: Vec<String>,
    committed: CommittedSet,
    listing: ListingCache,
    history: VecDeque<Instant>,
    last_commit: Option<Instant>,
    /// Video id to category, from the optional index file
    id_categories: HashMap<String, String>,
    status: Arc<UploadStatus>,
}

impl Uploader {
    /// Load persisted state and fix the snapshot folder name for this process.
    pub async fn new(store: Arc<dyn RemoteStore>, config: UploaderConfig) -> Result<Self> {
        config.validate()?;

        let committed = CommittedSet::load(&config.cache_dir).await?;
        let listing = match ListingCache::load(&config.cache_dir).await? {
            Some(cache) => cache,
            None => initial_listing(store.as_ref(), &config.cache_dir).await?,
        };
        let id_categories = match &config.cat2ids_path {
            Some(path) => load_category_index(path).await?,
            None => HashMap::new(),
        };
        let snapshot_folder = format!(
            "meta_{}_{}",
            chrono::Local::now().format("%Y-%m-%d"),
            config.snapshot_label
        );

        info!(
            folder = %snapshot_folder,
            committed = committed.len(),
            remote_files = listing.len(),
            indexed_ids = id_categories.len(),
            "uploader ready"
        );

        let status = Arc::new(UploadStatus::default());
        status.committed.store(committed.len(), Ordering::Relaxed);

        Ok(Self {
            store,
            config,
            snapshot_folder,
            pending: Vec::new(),
            committed,
            listing,
            history: VecDeque::new(),
            last_commit: None,
            id_categories,
            status,
        })
    }

    pub fn snapshot_folder(&self) -> &str {
        &self.snapshot_folder
    }

    pub fn pending(&self) -> &[String] {
        &self.pending
    }

    pub fn committed(&self) -> &CommittedSet {
        &self.committed
    }

    pub fn status(&self) -> Arc<UploadStatus> {
        self.status.clone()
    }

    /// Poll until `cancel` fires. Iteration errors are logged, never fatal.
    pub async fn run(&mut self, cancel: CancellationToken) {
        info!(
            poll_ms = self.config.poll_interval.as_millis() as u64,
            results_dir = %self.config.results_dir.display(),
            "uploader loop started"
        );
        while !cancel.is_cancelled() {
            match self.tick().await {
                Ok(report) if report.batches_committed > 0 || report.aborted => {
                    info!(
                        committed = report.batches_committed,
                        commits = report.remote_commits,
                        files = report.files_uploaded,
                        pending = self.pending.len(),
                        aborted = report.aborted,
                        "upload iteration finished"
                    );
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "upload iteration failed"),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
        info!(
            pending = self.pending.len(),
            committed = self.committed.len(),
            "uploader loop stopped"
        );
    }

    /// One discover-and-commit iteration.
    pub async fn tick(&mut self) -> Result<TickReport> {
        let mut report = TickReport::default();
        self.discover(&mut report).await?;
        self.prune_history();

        if self.should_commit() {
            self.commit_pending(&mut report).await?;
        }

        self.publish_status();
        Ok(report)
    }

    async fn discover(&mut self, report: &mut TickReport) -> Result<()> {
        let listed = artifact::list_artifacts(&self.config.results_dir).await?;
        let fresh: Vec<String> = listed
            .iter()
            .filter_map(|(_, path)| path.file_name()?.to_str().map(str::to_owned))
            .filter(|name| !self.committed.contains(name) && !self.pending.contains(name))
            .collect();

        if fresh.len() >= self.config.detection_threshold {
            info!(new = fresh.len(), pending = self.pending.len() + fresh.len(), "enqueued new artifacts");
            report.discovered = fresh.len();
            self.pending.extend(fresh);
        } else if !fresh.is_empty() {
            debug!(
                new = fresh.len(),
                threshold = self.config.detection_threshold,
                "holding back small batch of new artifacts"
            );
            report.held_back = fresh.len();
        }
        Ok(())
    }

    fn prune_history(&mut self) {
        let now = Instant::now();
        while let Some(oldest) = self.history.front() {
            if now.duration_since(*oldest) < HOUR {
                break;
            }
            self.history.pop_front();
        }
    }

    fn remaining_commits(&self) -> usize {
        self.config
            .max_commits_per_hour
            .saturating_sub(self.history.len())
    }

    fn has_budget(&mut self) -> bool {
        self.prune_history();
        self.remaining_commits() > 0
    }

    fn should_commit(&self) -> bool {
        if self.pending.is_empty() || self.remaining_commits() == 0 {
            return false;
        }
        let waited_long_enough = self
            .last_commit
            .is_none_or(|t| t.elapsed() >= self.config.max_wait);
        self.pending.len() >= self.config.min_batches_per_commit || waited_long_enough
    }

    async fn commit_pending(&mut self, report: &mut TickReport) -> Result<()> {
        while !self.pending.is_empty() {
            if !self.has_budget() {
                info!(pending = self.pending.len(), "hourly commit ceiling reached");
                report.aborted = true;
                break;
            }

            let take = self.config.max_batches_per_commit.min(self.pending.len());
            let files = self.materialize(&self.pending[..take]).await;

            if files.is_empty() {
                debug!(batches = take, "nothing new to push for chunk");
                self.mark_committed(take).await?;
                report.batches_committed += take;
                continue;
            }

            let mut uploaded = Vec::new();
            match self.push_chunk(files, &mut uploaded, report).await {
                ChunkOutcome::Done => {
                    self.mark_committed(take).await?;
                    report.batches_committed += take;
                    self.refresh_listing(uploaded).await?;
                }
                ChunkOutcome::Aborted => {
                    warn!(
                        batches = take,
                        landed = uploaded.len(),
                        "chunk left pending for a later iteration"
                    );
                    self.listing.merge(uploaded);
                    self.listing.save().await?;
                    report.aborted = true;
                    break;
                }
            }
        }
        Ok(())
    }

    /// Repository files for every record in `names` that is not already remote.
    async fn materialize(&self, names: &[String]) -> Vec<RemoteFile> {
        let mut files = Vec::new();
        let mut seen = HashSet::new();

        for name in names {
            let path = self.config.results_dir.join(name);
            let batch = match artifact::read_artifact(&path).await {
                Ok(Some(batch)) => batch,
                Ok(None) => {
                    warn!(artifact = %name, "artifact disappeared before upload");
                    continue;
                }
                Err(e) => {
                    warn!(artifact = %name, error = %e, "unreadable artifact skipped");
                    continue;
                }
            };

            for (video_id, record) in &batch.videos {
                let category = batch
                    .categories
                    .get(video_id)
                    .or_else(|| self.id_categories.get(video_id));
                let Some(category) = category else {
                    warn!(video_id = %video_id, artifact = %name, "no category for record, skipped");
                    continue;
                };
                let repo_path = format!(
                    "{category}/{video_id}/{}/{video_id}.json",
                    self.snapshot_folder
                );
                if self.listing.contains(&repo_path) || !seen.insert(repo_path.clone()) {
                    continue;
                }
                match serde_json::to_vec_pretty(record) {
                    Ok(content) => files.push(RemoteFile {
                        path: repo_path,
                        content,
                    }),
                    Err(e) => warn!(video_id = %video_id, error = %e, "record did not serialize"),
                }
            }
        }
        files
    }

    /// Push one chunk, splitting and retrying per the commit policy.
    async fn push_chunk(
        &mut self,
        files: Vec<RemoteFile>,
        uploaded: &mut Vec<String>,
        report: &mut TickReport,
    ) -> ChunkOutcome {
        let cap = self.config.max_files_per_commit;
        // The flag marks pieces pushed after the chunk sat out its cooldown.
        let mut stack: Vec<(Vec<RemoteFile>, bool)> = files
            .chunks(cap)
            .map(|piece| (piece.to_vec(), false))
            .collect();
        if stack.len() > 1 {
            debug!(files = files.len(), pieces = stack.len(), "chunk exceeds file cap, split locally");
        }
        stack.reverse();
        let mut cooled = false;

        while let Some((mut part, retry)) = stack.pop() {
            if !self.has_budget() {
                return ChunkOutcome::Aborted;
            }
            let message = if retry {
                format!("Batch upload: {} metadata files (retry)", part.len())
            } else {
                format!("Batch upload: {} metadata files", part.len())
            };
            let error = match self.store.commit(&part, &message).await {
                Ok(()) => {
                    self.record_commit("bulk", &part, uploaded, report);
                    continue;
                }
                Err(e) => e,
            };

            match plan(&error, part.len(), self.config.split_floor) {
                CommitAction::Split => {
                    let right = part.split_off(part.len() / 2);
                    warn!(left = part.len(), right = right.len(), error = %error, "hub rejected file count, splitting");
                    stack.push((right, retry));
                    stack.push((part, retry));
                }
                CommitAction::CooldownRetry if cooled => {
                    error!(files = part.len(), error = %error, "rate limited again after cooldown");
                    return ChunkOutcome::Aborted;
                }
                CommitAction::CooldownRetry => {
                    warn!(
                        cooldown_secs = self.config.rate_limit_cooldown.as_secs(),
                        error = %error,
                        "rate limited, cooling down before one retry"
                    );
                    cooled = true;
                    tokio::time::sleep(self.config.rate_limit_cooldown).await;
                    stack.push((part, true));
                }
                CommitAction::FallbackToSingles => {
                    warn!(files = part.len(), error = %error, "bulk commit failed, pushing files one by one");
                    if !self.push_singles(part, uploaded, report).await {
                        return ChunkOutcome::Aborted;
                    }
                }
            }
        }
        ChunkOutcome::Done
    }

    /// One commit per file. Returns false when the iteration must stop.
    async fn push_singles(
        &mut self,
        files: Vec<RemoteFile>,
        uploaded: &mut Vec<String>,
        report: &mut TickReport,
    ) -> bool {
        for (i, file) in files.into_iter().enumerate() {
            if i > 0 && !self.config.single_delay.is_zero() {
                tokio::time::sleep(self.config.single_delay).await;
            }
            if !self.has_budget() {
                return false;
            }
            let message = format!("Upload {}", file.path);
            let single = std::slice::from_ref(&file);
            match self.store.commit(single, &message).await {
                Ok(()) => self.record_commit("single", single, uploaded, report),
                Err(RemoteError::RateLimited(msg)) => {
                    warn!(path = %file.path, error = %msg, "rate limited during single-file commits");
                    return false;
                }
                Err(e) => {
                    warn!(path = %file.path, error = %e, "single-file commit failed, skipping file");
                    self.status.files_failed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        true
    }

    fn record_commit(
        &mut self,
        kind: &'static str,
        files: &[RemoteFile],
        uploaded: &mut Vec<String>,
        report: &mut TickReport,
    ) {
        let now = Instant::now();
        self.history.push_back(now);
        self.last_commit = Some(now);

        report.remote_commits += 1;
        report.files_uploaded += files.len();
        uploaded.extend(files.iter().map(|f| f.path.clone()));

        metrics::counter!("upload_commits_total", "kind" => kind).increment(1);
        metrics::counter!("upload_files_total").increment(files.len() as u64);
        self.status.remote_commits.fetch_add(1, Ordering::Relaxed);
        self.status
            .files_uploaded
            .fetch_add(files.len() as u64, Ordering::Relaxed);

        debug!(
            kind,
            files = files.len(),
            commits_last_hour = self.history.len(),
            "commit pushed"
        );
    }

    async fn mark_committed(&mut self, take: usize) -> Result<()> {
        let names: Vec<String> = self.pending.drain(..take).collect();
        self.committed.extend(names).await
    }

    /// Prefer the remote listing, and keep what was just pushed in case the
    /// listing lags behind the commit.
    async fn refresh_listing(&mut self, uploaded: Vec<String>) -> Result<()> {
        match self.store.list_files().await {
            Ok(paths) => self.listing.replace(paths),
            Err(e) => warn!(error = %e, "listing refresh failed, merging local paths"),
        }
        self.listing.merge(uploaded);
        self.listing.save().await
    }

    fn publish_status(&self) {
        metrics::gauge!("upload_pending_batches").set(self.pending.len() as f64);
        self.status
            .pending
            .store(self.pending.len(), Ordering::Relaxed);
        self.status
            .committed
            .store(self.committed.len(), Ordering::Relaxed);
        self.status
            .commits_last_hour
            .store(self.history.len(), Ordering::Relaxed);
    }
}

async fn initial_listing(store: &dyn RemoteStore, cache_dir: &Path) -> Result<ListingCache> {
    match store.list_files().await {
        Ok(paths) => {
            let cache = ListingCache::new(cache_dir, paths);
            cache.save().await?;
            Ok(cache)
        }
        Err(e) => {
            warn!(error = %e, "initial repository listing failed, starting with empty cache");
            Ok(ListingCache::new(cache_dir, Vec::new()))
        }
    }
}

/// Invert `{category: [ids]}`. The first category listing an id wins.
async fn load_category_index(path: &Path) -> Result<HashMap<String, String>> {
    let Some(index): Option<Map<String, Value>> = common::read_json(path).await? else {
        warn!(path = %path.display(), "category index not found");
        return Ok(HashMap::new());
    };
    let mut by_id = HashMap::new();
    for (category, ids) in &index {
        for id in ids.as_array().into_iter().flatten() {
            if let Some(id) = id.as_str() {
                by_id
                    .entry(id.to_owned())
                    .or_insert_with(|| category.clone());
            }
        }
    }
    Ok(by_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreFuture;
    use harvest::BatchArtifact;
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeStore {
        /// Paths of every accepted commit, in order
        commits: Mutex<Vec<Vec<String>>>,
        remote: Mutex<BTreeSet<String>>,
        /// Reject commits with more files than this
        max_files: Option<usize>,
        /// Rate-limit this many commits before accepting
        rate_limited: Mutex<u32>,
        /// Fail every multi-file commit with an unclassified error
        reject_bulk: bool,
        attempts: AtomicUsize,
    }

    impl FakeStore {
        fn commit_sizes(&self) -> Vec<usize> {
            self.commits.lock().unwrap().iter().map(Vec::len).collect()
        }
    }

    impl RemoteStore for FakeStore {
        fn commit<'a>(&'a self, files: &'a [RemoteFile], _message: &'a str) -> StoreFuture<'a, ()> {
            Box::pin(async move {
                self.attempts.fetch_add(1, Ordering::SeqCst);
                {
                    let mut left = self.rate_limited.lock().unwrap();
                    if *left > 0 {
                        *left -= 1;
                        return Err(RemoteError::RateLimited("429 Too Many Requests".into()));
                    }
                }
                if self.max_files.is_some_and(|max| files.len() > max) {
                    return Err(RemoteError::FileCountExceeded("too many files".into()));
                }
                if self.reject_bulk && files.len() > 1 {
                    return Err(RemoteError::Other("500 internal".into()));
                }
                let paths: Vec<String> = files.iter().map(|f| f.path.clone()).collect();
                self.remote.lock().unwrap().extend(paths.iter().cloned());
                self.commits.lock().unwrap().push(paths);
                Ok(())
            })
        }

        fn list_files(&self) -> StoreFuture<'_, Vec<String>> {
            Box::pin(async move { Ok(self.remote.lock().unwrap().iter().cloned().collect()) })
        }
    }

    struct Dirs {
        _root: tempfile::TempDir,
        results: PathBuf,
        cache: PathBuf,
    }

    fn dirs() -> Dirs {
        let root = tempfile::tempdir().unwrap();
        let results = root.path().join("results");
        let cache = root.path().join("cache");
        std::fs::create_dir_all(&results).unwrap();
        Dirs {
            _root: root,
            results,
            cache,
        }
    }

    fn config(dirs: &Dirs) -> UploaderConfig {
        UploaderConfig {
            results_dir: dirs.results.clone(),
            cache_dir: dirs.cache.clone(),
            single_delay: Duration::ZERO,
            ..Default::default()
        }
    }

    fn video_id(batch: u64, i: usize) -> String {
        format!("v{batch:04}_{i:04}")
    }

    async fn write_batches(dirs: &Dirs, batches: std::ops::RangeInclusive<u64>, per_batch: usize) {
        for batch in batches {
            let mut videos = Map::new();
            let mut categories = BTreeMap::new();
            for i in 0..per_batch {
                let id = video_id(batch, i);
                videos.insert(id.clone(), serde_json::json!({"videoId": id}));
                categories.insert(id, "music".to_string());
            }
            let artifact = BatchArtifact {
                batch,
                size: per_batch,
                success: per_batch,
                duration_sec: 0.1,
                quota_used: per_batch as u64,
                videos,
                categories,
            };
            common::write_json_atomic(
                &dirs.results.join(artifact::artifact_file_name(batch)),
                &artifact,
            )
            .await
            .unwrap();
        }
    }

    async fn uploader(store: &Arc<FakeStore>, config: UploaderConfig) -> Uploader {
        Uploader::new(store.clone(), config).await.unwrap()
    }

    #[tokio::test]
    async fn twelve_pending_commit_immediately() {
        let dirs = dirs();
        write_batches(&dirs, 1..=12, 1).await;
        let store = Arc::new(FakeStore::default());
        let mut up = uploader(&store, config(&dirs)).await;

        let report = up.tick().await.unwrap();

        assert_eq!(report.discovered, 12);
        assert_eq!(report.batches_committed, 12);
        assert_eq!(report.remote_commits, 1);
        assert_eq!(store.commit_sizes(), vec![12]);
        assert!(up.pending().is_empty());
        assert_eq!(up.committed().len(), 12);

        let first = &store.commits.lock().unwrap()[0][0];
        assert_eq!(
            first,
            &format!("music/v0001_0000/{}/v0001_0000.json", up.snapshot_folder())
        );
        assert!(up.snapshot_folder().starts_with("meta_"));
        assert!(up.snapshot_folder().ends_with("_yt_api"));
    }

    #[tokio::test]
    async fn small_dribble_is_held_back() {
        let dirs = dirs();
        write_batches(&dirs, 1..=3, 1).await;
        let store = Arc::new(FakeStore::default());
        let mut up = uploader(&store, config(&dirs)).await;

        let report = up.tick().await.unwrap();
        assert_eq!(report.held_back, 3);
        assert_eq!(report.discovered, 0);
        assert!(up.pending().is_empty());
        assert!(store.commit_sizes().is_empty());

        // Two more reach the threshold; never having committed counts as overdue.
        write_batches(&dirs, 4..=5, 1).await;
        let report = up.tick().await.unwrap();
        assert_eq!(report.discovered, 5);
        assert_eq!(report.batches_committed, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn below_minimum_waits_for_max_wait() {
        let dirs = dirs();
        write_batches(&dirs, 1..=12, 1).await;
        let store = Arc::new(FakeStore::default());
        let mut up = uploader(&store, config(&dirs)).await;
        up.tick().await.unwrap();

        write_batches(&dirs, 13..=17, 1).await;
        let report = up.tick().await.unwrap();
        assert_eq!(report.discovered, 5);
        assert_eq!(report.batches_committed, 0);
        assert_eq!(up.pending().len(), 5);

        tokio::time::advance(Duration::from_secs(301)).await;
        let report = up.tick().await.unwrap();
        assert_eq!(report.batches_committed, 5);
        assert_eq!(store.commit_sizes(), vec![12, 5]);
    }

    #[tokio::test]
    async fn chunks_respect_batch_cap() {
        let dirs = dirs();
        write_batches(&dirs, 1..=7, 1).await;
        let store = Arc::new(FakeStore::default());
        let mut up = uploader(
            &store,
            UploaderConfig {
                max_batches_per_commit: 3,
                min_batches_per_commit: 5,
                ..config(&dirs)
            },
        )
        .await;

        let report = up.tick().await.unwrap();
        assert_eq!(report.batches_committed, 7);
        assert_eq!(store.commit_sizes(), vec![3, 3, 1]);
    }

    #[tokio::test]
    async fn oversized_chunk_is_split_locally_before_pushing() {
        let dirs = dirs();
        write_batches(&dirs, 1..=5, 3).await;
        let store = Arc::new(FakeStore::default());
        let mut up = uploader(
            &store,
            UploaderConfig {
                max_batches_per_commit: 2,
                max_files_per_commit: 4,
                min_batches_per_commit: 5,
                ..config(&dirs)
            },
        )
        .await;

        up.tick().await.unwrap();
        // chunks of 2, 2, 1 batches = 6, 6, 3 files; 6 > 4 splits before any push
        assert_eq!(store.commit_sizes(), vec![4, 2, 4, 2, 3]);
        assert_eq!(store.attempts.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn file_count_rejection_bisects_until_accepted() {
        let dirs = dirs();
        write_batches(&dirs, 1..=8, 1).await;
        let store = Arc::new(FakeStore {
            max_files: Some(2),
            ..Default::default()
        });
        let mut up = uploader(
            &store,
            UploaderConfig {
                min_batches_per_commit: 8,
                split_floor: 1,
                ..config(&dirs)
            },
        )
        .await;

        let report = up.tick().await.unwrap();
        assert_eq!(store.commit_sizes(), vec![2, 2, 2, 2]);
        assert_eq!(report.batches_committed, 8);
        assert!(store.commit_sizes().iter().all(|n| *n <= 2));
    }

    #[tokio::test]
    async fn rejection_at_floor_falls_back_to_singles() {
        let dirs = dirs();
        write_batches(&dirs, 1..=8, 1).await;
        let store = Arc::new(FakeStore {
            max_files: Some(2),
            ..Default::default()
        });
        let mut up = uploader(
            &store,
            UploaderConfig {
                min_batches_per_commit: 8,
                split_floor: 4,
                ..config(&dirs)
            },
        )
        .await;

        let report = up.tick().await.unwrap();
        assert_eq!(store.commit_sizes(), vec![1; 8]);
        assert_eq!(report.remote_commits, 8);
        assert_eq!(up.committed().len(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_retries_once_after_cooldown() {
        let dirs = dirs();
        write_batches(&dirs, 1..=10, 1).await;
        let store = Arc::new(FakeStore {
            rate_limited: Mutex::new(1),
            ..Default::default()
        });
        let mut up = uploader(&store, config(&dirs)).await;

        let started = Instant::now();
        let report = up.tick().await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(60));
        assert_eq!(report.batches_committed, 10);
        assert_eq!(store.commit_sizes(), vec![10]);
        assert!(!report.aborted);
    }

    #[tokio::test(start_paused = true)]
    async fn file_count_rejection_after_cooldown_still_splits() {
        let dirs = dirs();
        write_batches(&dirs, 1..=10, 1).await;
        let store = Arc::new(FakeStore {
            rate_limited: Mutex::new(1),
            max_files: Some(5),
            ..Default::default()
        });
        let mut up = uploader(
            &store,
            UploaderConfig {
                split_floor: 1,
                ..config(&dirs)
            },
        )
        .await;

        let report = up.tick().await.unwrap();
        assert!(!report.aborted);
        // rate limited, then the retry of 10 is rejected on file count
        assert_eq!(store.attempts.load(Ordering::SeqCst), 4);
        assert_eq!(store.commit_sizes(), vec![5, 5]);
        assert_eq!(report.batches_committed, 10);
        assert!(up.pending().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn second_rate_limit_leaves_chunk_pending() {
        let dirs = dirs();
        write_batches(&dirs, 1..=12, 1).await;
        let store = Arc::new(FakeStore {
            rate_limited: Mutex::new(2),
            ..Default::default()
        });
        let mut up = uploader(&store, config(&dirs)).await;

        let report = up.tick().await.unwrap();
        assert!(report.aborted);
        assert_eq!(report.batches_committed, 0);
        assert_eq!(up.pending().len(), 12);
        assert!(up.committed().is_empty());
        assert_eq!(store.attempts.load(Ordering::SeqCst), 2);

        // The hub recovered; the same chunk goes out on the next iteration.
        let report = up.tick().await.unwrap();
        assert_eq!(report.batches_committed, 12);
        assert_eq!(store.commit_sizes(), vec![12]);
    }

    #[tokio::test]
    async fn unclassified_failure_falls_back_to_singles() {
        let dirs = dirs();
        write_batches(&dirs, 1..=5, 1).await;
        let store = Arc::new(FakeStore {
            reject_bulk: true,
            ..Default::default()
        });
        let mut up = uploader(&store, config(&dirs)).await;

        let report = up.tick().await.unwrap();
        assert_eq!(store.commit_sizes(), vec![1; 5]);
        assert_eq!(report.batches_committed, 5);
    }

    #[tokio::test]
    async fn remote_paths_are_not_pushed_again() {
        let dirs = dirs();
        write_batches(&dirs, 1..=5, 2).await;
        let store = Arc::new(FakeStore::default());
        let up = uploader(&store, config(&dirs)).await;
        let existing = format!(
            "music/{id}/{}/{id}.json",
            up.snapshot_folder(),
            id = video_id(1, 0)
        );
        // Seed before the listing is taken by a fresh uploader.
        store.remote.lock().unwrap().insert(existing.clone());
        std::fs::remove_dir_all(&dirs.cache).ok();
        let mut up = uploader(&store, config(&dirs)).await;

        up.tick().await.unwrap();
        let pushed = store.commits.lock().unwrap()[0].clone();
        assert_eq!(pushed.len(), 9);
        assert!(!pushed.contains(&existing));
        assert!(dirs.cache.join(crate::cache::FILE_NAME).exists());
    }

    #[tokio::test]
    async fn fully_remote_chunk_commits_without_round_trip() {
        let dirs = dirs();
        write_batches(&dirs, 1..=5, 1).await;
        let store = Arc::new(FakeStore::default());
        let mut first = uploader(
            &store,
            UploaderConfig {
                max_wait: Duration::ZERO,
                ..config(&dirs)
            },
        )
        .await;
        first.tick().await.unwrap();
        assert_eq!(store.attempts.load(Ordering::SeqCst), 1);

        // Same artifacts under new names, e.g. after a results dir reshuffle.
        for n in 1..=5u64 {
            std::fs::rename(
                dirs.results.join(artifact::artifact_file_name(n)),
                dirs.results.join(artifact::artifact_file_name(n + 100)),
            )
            .unwrap();
        }
        let report = first.tick().await.unwrap();
        assert_eq!(report.batches_committed, 5);
        assert_eq!(report.remote_commits, 0);
        assert_eq!(store.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn committed_set_survives_restart() {
        let dirs = dirs();
        write_batches(&dirs, 1..=10, 1).await;
        let store = Arc::new(FakeStore::default());
        uploader(&store, config(&dirs)).await.tick().await.unwrap();

        let mut restarted = uploader(&store, config(&dirs)).await;
        assert_eq!(restarted.committed().len(), 10);
        let report = restarted.tick().await.unwrap();
        assert_eq!(report.discovered, 0);
        assert_eq!(store.commit_sizes(), vec![10]);
    }

    #[tokio::test(start_paused = true)]
    async fn hourly_ceiling_keeps_chunk_pending() {
        let dirs = dirs();
        write_batches(&dirs, 1..=10, 1).await;
        let store = Arc::new(FakeStore::default());
        let mut up = uploader(
            &store,
            UploaderConfig {
                max_commits_per_hour: 1,
                max_batches_per_commit: 5,
                min_batches_per_commit: 5,
                ..config(&dirs)
            },
        )
        .await;

        let report = up.tick().await.unwrap();
        assert_eq!(report.batches_committed, 5);
        assert!(report.aborted);
        assert_eq!(up.pending().len(), 5);

        let report = up.tick().await.unwrap();
        assert_eq!(report.batches_committed, 0);

        tokio::time::advance(HOUR).await;
        let report = up.tick().await.unwrap();
        assert_eq!(report.batches_committed, 5);
        assert_eq!(store.commit_sizes(), vec![5, 5]);
    }

    #[tokio::test]
    async fn unreadable_artifact_contributes_no_files() {
        let dirs = dirs();
        write_batches(&dirs, 1..=5, 1).await;
        std::fs::write(dirs.results.join("batch_6.json"), "not json").unwrap();
        let store = Arc::new(FakeStore::default());
        let mut up = uploader(&store, config(&dirs)).await;

        let report = up.tick().await.unwrap();
        assert_eq!(report.discovered, 6);
        assert_eq!(store.commit_sizes(), vec![5]);
        assert!(up.committed().contains("batch_6.json"));
    }

    #[tokio::test]
    async fn category_index_fills_missing_categories() {
        let dirs = dirs();
        for batch in 1..=5u64 {
            let id = video_id(batch, 0);
            let mut videos = Map::new();
            videos.insert(id.clone(), serde_json::json!({"videoId": id}));
            let artifact = serde_json::json!({
                "batch": batch, "size": 1, "success": 1, "durationSec": 0.1,
                "quotaUsed": 1, "videos": videos
            });
            std::fs::write(
                dirs.results.join(artifact::artifact_file_name(batch)),
                artifact.to_string(),
            )
            .unwrap();
        }
        let index_path = dirs.cache.parent().unwrap().join("cat2ids.json");
        let ids: Vec<String> = (1..=4).map(|b| video_id(b, 0)).collect();
        std::fs::write(
            &index_path,
            serde_json::json!({"news": ids, "sports": [video_id(1, 0)]}).to_string(),
        )
        .unwrap();

        let store = Arc::new(FakeStore::default());
        let mut up = uploader(
            &store,
            UploaderConfig {
                cat2ids_path: Some(index_path),
                ..config(&dirs)
            },
        )
        .await;

        up.tick().await.unwrap();
        let pushed = store.commits.lock().unwrap()[0].clone();
        // batch 5 has no category anywhere and is dropped
        assert_eq!(pushed.len(), 4);
        assert!(pushed.iter().all(|p| p.starts_with("news/")));
    }

    #[tokio::test]
    async fn invalid_caps_are_rejected() {
        let dirs = dirs();
        let store: Arc<FakeStore> = Arc::new(FakeStore::default());
        let err = Uploader::new(
            store,
            UploaderConfig {
                max_batches_per_commit: 100,
                max_files_per_commit: 100,
                ..config(&dirs)
            },
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, Error::Config(_)), "got: {err:?}");
    }

    #[tokio::test]
    async fn status_reflects_progress() {
        let dirs = dirs();
        write_batches(&dirs, 1..=10, 2).await;
        let store = Arc::new(FakeStore::default());
        let mut up = uploader(&store, config(&dirs)).await;
        let status = up.status();

        up.tick().await.unwrap();
        let health = status.health();
        assert_eq!(health["mode"], "upload");
        assert_eq!(health["committed_batches"], 10);
        assert_eq!(health["pending_batches"], 0);
        assert_eq!(health["remote_commits"], 1);
        assert_eq!(health["files_uploaded"], 20);
        assert_eq!(health["commits_last_hour"], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_cancel() {
        let dirs = dirs();
        write_batches(&dirs, 1..=10, 1).await;
        let store = Arc::new(FakeStore::default());
        let mut up = uploader(&store, config(&dirs)).await;
        let cancel = CancellationToken::new();

        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            stopper.cancel();
        });
        up.run(cancel).await;

        assert_eq!(store.commit_sizes(), vec![10]);
    }
}
