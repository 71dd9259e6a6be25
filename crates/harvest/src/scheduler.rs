//! Batch scheduler
//!
//! Per run: `Init -> (per batch: Dispatch -> Collect -> Checkpoint -> Evaluate) -> Finalize`.
//! Batches run strictly one after another; items inside a batch run through
//! `buffer_unordered` so at most `concurrency` fetches are in flight.
//!
//! Item failures never stop a run. Persistence failures stop it after the
//! current batch. Either way Finalize runs and the checkpoint plus every
//! written artifact stay usable for the next run: a batch cut short by a
//! failed checkpoint write still gets an artifact holding exactly the records
//! whose locators were checkpointed.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream;
use key_pool::KeyPool;
use serde_json::{Map, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::artifact::{self, BatchArtifact, BatchSummary};
use crate::checkpoint::Checkpoint;
use crate::client::{FetchClient, FetchOutcome};
use crate::error::{Error, Result};
use crate::work::WorkItem;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub batch_size: usize,
    /// Upper bound on in-flight fetches within a batch
    pub concurrency: usize,
    /// Consecutive empty batches before a forced rotation
    pub stall_threshold: u32,
    pub results_dir: PathBuf,
    /// Read-only fallback for the checkpoint and batch numbering
    pub legacy_results_dir: Option<PathBuf>,
    pub run_index_name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_size: 16,
            concurrency: 4,
            stall_threshold: 3,
            results_dir: PathBuf::from("results"),
            legacy_results_dir: None,
            run_index_name: "yt_api_aggregate.json".to_string(),
        }
    }
}

/// Why a run stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HaltReason {
    Completed,
    PoolExhausted,
    RotationFailed,
    Cancelled,
    Storage(String),
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HaltReason::Completed => f.write_str("completed"),
            HaltReason::PoolExhausted => f.write_str("pool_exhausted"),
            HaltReason::RotationFailed => f.write_str("rotation_failed"),
            HaltReason::Cancelled => f.write_str("cancelled"),
            HaltReason::Storage(msg) => write!(f, "storage: {msg}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchReport {
    pub batch: u64,
    pub size: usize,
    pub success: usize,
    /// Empty reason to count
    pub failures: BTreeMap<String, usize>,
    pub quota_used: u64,
    pub duration: Duration,
    /// Written artifact, if the batch had any success
    pub artifact: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub halt: HaltReason,
    pub batches: Vec<BatchReport>,
    pub successes: usize,
    pub forced_rotations: u32,
    pub skipped_by_checkpoint: usize,
}

struct Collected {
    report: BatchReport,
    artifact: BatchArtifact,
    storage_error: Option<Error>,
}

type PendingWrite = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Resolve with the in-progress checkpoint write, or never when there is none.
async fn wait_for(writing: &mut Option<(Vec<String>, PendingWrite)>) -> Result<()> {
    match writing {
        Some((_, write)) => write.await,
        None => std::future::pending().await,
    }
}

/// Fold one outcome into the batch. Returns the video id when its locator is
/// new to the checkpoint and still has to be written.
fn stage(
    item: &WorkItem,
    outcome: FetchOutcome,
    checkpoint: &mut Checkpoint,
    artifact: &mut BatchArtifact,
    failures: &mut BTreeMap<String, usize>,
) -> Option<String> {
    let record = match outcome {
        FetchOutcome::Fetched(record) => record,
        FetchOutcome::Empty(reason) => {
            *failures.entry(reason.as_str().to_string()).or_default() += 1;
            return None;
        }
    };
    let id = record.video_id().to_owned();
    let value = match serde_json::to_value(&*record) {
        Ok(v) => v,
        Err(e) => {
            warn!(video_id = %id, error = %e, "record did not serialize");
            *failures.entry("malformed".to_string()).or_default() += 1;
            return None;
        }
    };
    let fresh = checkpoint.mark(&item.locator);
    artifact.categories.insert(id.clone(), item.category.clone());
    artifact.videos.insert(id.clone(), value);
    artifact.success += 1;
    fresh.then_some(id)
}

pub struct Scheduler {
    client: Arc<FetchClient>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(client: Arc<FetchClient>, config: SchedulerConfig) -> Result<Self> {
        if config.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".into()));
        }
        if config.concurrency == 0 {
            return Err(Error::Config("concurrency must be at least 1".into()));
        }
        if config.stall_threshold == 0 {
            return Err(Error::Config("stall_threshold must be at least 1".into()));
        }
        Ok(Self { client, config })
    }

    fn pool(&self) -> &Arc<KeyPool> {
        self.client.pool()
    }

    fn search_dirs(&self) -> Vec<&Path> {
        let mut dirs = vec![self.config.results_dir.as_path()];
        if let Some(legacy) = &self.config.legacy_results_dir {
            dirs.push(legacy.as_path());
        }
        dirs
    }

    /// Harvest `items`, skipping locators already in the checkpoint.
    ///
    /// Errors only when the run cannot start (unreadable checkpoint or results
    /// directory). Everything after Init is reported through `RunReport::halt`.
    pub async fn run(&self, items: Vec<WorkItem>, cancel: CancellationToken) -> Result<RunReport> {
        let run_id = uuid::Uuid::new_v4().to_string();

        // Init
        let mut checkpoint = Checkpoint::load(
            &self.config.results_dir,
            self.config.legacy_results_dir.as_deref(),
        )
        .await?;
        let total_items = items.len();
        let pending: Vec<WorkItem> = items
            .into_iter()
            .filter(|item| !checkpoint.contains(&item.locator))
            .collect();
        let skipped_by_checkpoint = total_items - pending.len();
        let mut next_batch = artifact::highest_batch_number(&self.search_dirs()).await? + 1;
        let batch_count = pending.len().div_ceil(self.config.batch_size);

        info!(
            %run_id,
            items = total_items,
            pending = pending.len(),
            skipped = skipped_by_checkpoint,
            batches = batch_count,
            first_batch = next_batch,
            "harvest run starting"
        );

        let mut report = RunReport {
            run_id,
            halt: HaltReason::Completed,
            batches: Vec::with_capacity(batch_count),
            successes: 0,
            forced_rotations: 0,
            skipped_by_checkpoint,
        };
        let mut summaries = Vec::with_capacity(batch_count);
        let mut records = Map::new();
        let mut consecutive_empty = 0u32;

        for chunk in pending.chunks(self.config.batch_size) {
            if cancel.is_cancelled() {
                report.halt = HaltReason::Cancelled;
                break;
            }

            let batch = next_batch;
            let mut collected = self.run_batch(batch, chunk, &mut checkpoint).await;

            // Written even after a failed checkpoint write: the artifact then
            // holds exactly the records whose locators reached the checkpoint.
            if collected.report.success > 0 {
                match artifact::write_artifact(&self.config.results_dir, &mut collected.artifact)
                    .await
                {
                    Ok(path) => {
                        collected.report.batch = collected.artifact.batch;
                        collected.report.artifact = Some(path);
                    }
                    Err(e) if collected.storage_error.is_some() => {
                        error!(batch, error = %e, "artifact write failed as well");
                    }
                    Err(e) => collected.storage_error = Some(e),
                }
            }
            next_batch = collected.report.batch + 1;

            self.log_batch(&collected.report).await;
            report.successes += collected.report.success;
            summaries.push(BatchSummary::from(&collected.artifact));
            records.extend(collected.artifact.videos);
            let success = collected.report.success;
            report.batches.push(collected.report);

            if let Some(e) = collected.storage_error {
                error!(batch, error = %e, "persisting batch failed, halting");
                report.halt = HaltReason::Storage(e.to_string());
                break;
            }

            // Evaluate
            if cancel.is_cancelled() {
                report.halt = HaltReason::Cancelled;
                break;
            }
            if success > 0 {
                consecutive_empty = 0;
                continue;
            }
            consecutive_empty += 1;
            if consecutive_empty < self.config.stall_threshold {
                continue;
            }
            if self.pool().is_fully_exhausted().await {
                warn!(consecutive_empty, "every API key exhausted, halting");
                report.halt = HaltReason::PoolExhausted;
                break;
            }
            let (active, total) = self.pool().status().await;
            warn!(consecutive_empty, key = active, keys = total, "batches keep coming back empty, forcing key rotation");
            if !self.pool().mark_exhausted_and_advance().await {
                warn!("forced rotation found no usable key, halting");
                report.halt = HaltReason::RotationFailed;
                break;
            }
            report.forced_rotations += 1;
            consecutive_empty = 0;
        }

        self.finalize(&report, &summaries, &records).await;
        Ok(report)
    }

    /// Dispatch and collect one batch. Successes are checkpointed as they land.
    async fn run_batch(
        &self,
        batch: u64,
        chunk: &[WorkItem],
        checkpoint: &mut Checkpoint,
    ) -> Collected {
        let started = Instant::now();
        let quota_before = self.pool().total_quota_used().await;
        let workers = self.config.concurrency.min(chunk.len()).max(1);

        let mut artifact = BatchArtifact {
            batch,
            size: chunk.len(),
            success: 0,
            duration_sec: 0.0,
            quota_used: 0,
            videos: Map::new(),
            categories: BTreeMap::new(),
        };
        let mut failures: BTreeMap<String, usize> = BTreeMap::new();
        let mut storage_error = None;

        let mut outcomes = stream::iter(chunk.iter())
            .map(|item| {
                let client = self.client.clone();
                async move { (item, client.fetch(item).await) }
            })
            .buffer_unordered(workers);

        // Successes are marked in memory as they land and written by at most
        // one checkpoint write at a time, each covering everything marked
        // before it started. Fetches keep running while a write is out.
        let mut unsaved: Vec<String> = Vec::new();
        let mut writing: Option<(Vec<String>, PendingWrite)> = None;
        let mut unpersisted: Vec<String> = Vec::new();
        let mut drained = false;

        loop {
            if writing.is_none() && storage_error.is_none() && !unsaved.is_empty() {
                let covered = std::mem::take(&mut unsaved);
                let write: PendingWrite = Box::pin(checkpoint.snapshot());
                writing = Some((covered, write));
            }
            if drained && writing.is_none() {
                break;
            }

            tokio::select! {
                next = outcomes.next(), if !drained => match next {
                    Some((item, outcome)) => {
                        let fresh = stage(item, outcome, checkpoint, &mut artifact, &mut failures);
                        unsaved.extend(fresh);
                    }
                    None => drained = true,
                },
                written = wait_for(&mut writing) => {
                    let covered = writing.take().map(|(ids, _)| ids).unwrap_or_default();
                    if let Err(e) = written {
                        // In-flight fetches are dropped; their items were
                        // never checkpointed and come back on the next run.
                        unpersisted.extend(covered);
                        storage_error = Some(e);
                        drained = true;
                    }
                }
            }
        }

        if storage_error.is_some() {
            unpersisted.append(&mut unsaved);
            for id in &unpersisted {
                artifact.videos.remove(id);
                artifact.categories.remove(id);
            }
            artifact.success = artifact.videos.len();
            if !unpersisted.is_empty() {
                warn!(
                    batch,
                    dropped = unpersisted.len(),
                    "checkpoint write failed, its records are left out of the artifact"
                );
                *failures.entry("unpersisted".to_string()).or_default() += unpersisted.len();
            }
        }

        let duration = started.elapsed();
        artifact.duration_sec = crate::record::round_millis(duration.as_secs_f64());
        artifact.quota_used = self
            .pool()
            .total_quota_used()
            .await
            .saturating_sub(quota_before);

        Collected {
            report: BatchReport {
                batch,
                size: artifact.size,
                success: artifact.success,
                failures,
                quota_used: artifact.quota_used,
                duration,
                artifact: None,
            },
            artifact,
            storage_error,
        }
    }

    async fn log_batch(&self, report: &BatchReport) {
        let result = if report.success > 0 { "success" } else { "empty" };
        metrics::counter!("harvest_batches_total", "result" => result).increment(1);
        metrics::histogram!("harvest_batch_duration_seconds").record(report.duration.as_secs_f64());

        let (active, total) = self.pool().status().await;
        info!(
            batch = report.batch,
            size = report.size,
            success = report.success,
            failures = ?report.failures,
            quota = report.quota_used,
            key = active,
            keys = total,
            duration_ms = report.duration.as_millis() as u64,
            written = report.artifact.is_some(),
            "batch complete"
        );
    }

    async fn finalize(
        &self,
        report: &RunReport,
        summaries: &[BatchSummary],
        records: &Map<String, Value>,
    ) {
        let quota_used = self.pool().total_quota_used().await;
        let run = serde_json::json!({
            "runId": report.run_id,
            "halt": report.halt.to_string(),
            "batches": report.batches.len(),
            "successes": report.successes,
            "skippedByCheckpoint": report.skipped_by_checkpoint,
            "forcedRotations": report.forced_rotations,
            "quotaUsed": quota_used,
        });
        let path = self.config.results_dir.join(&self.config.run_index_name);
        if let Err(e) = artifact::write_run_index(&path, summaries, run, records).await {
            error!(path = %path.display(), error = %e, "writing run index failed");
        }

        let (active, total) = self.pool().status().await;
        info!(
            run_id = %report.run_id,
            halt = %report.halt,
            batches = report.batches.len(),
            successes = report.successes,
            forced_rotations = report.forced_rotations,
            quota = quota_used,
            key = active,
            keys = total,
            "harvest run finished"
        );
    }
}
