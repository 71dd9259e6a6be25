//! Classified fetch client
//!
//! Wraps a `MetadataSource` with key rotation and bounded retries. `fetch`
//! never returns an error: every failure resolves to `FetchOutcome::Empty`
//! carrying the reason, which the scheduler folds into its batch histogram.
//!
//! Retry strategy: a quota failure marks the key that was used, rotates, and
//! re-issues the whole fetch (at most once per key in the pool). Transient
//! failures retry up to `transient_retries` times with doubling backoff.
//! Rotations do not consume the transient budget.

use std::sync::Arc;
use std::time::Duration;

use key_pool::{Credential, KeyPool, classify_error};
use metadata_source::{
    ChannelDetails, Comment, Enrichment, ErrorClassification, MetadataSource, SourceError,
    VideoDetails,
};
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::record::{Timings, VideoRecord, round_millis};
use crate::work::WorkItem;

/// Largest page the comment endpoints accept.
const MAX_PAGE_SIZE: usize = 100;

/// Quota units charged per answered request. The upstream prices list calls
/// at one unit each; other methods are not used here.
pub const UNITS_PER_REQUEST: u64 = 1;

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub transient_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub fetch_channel: bool,
    pub fetch_comments: bool,
    /// Cap on threads plus replies collected per video
    pub max_comments: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            transient_retries: 2,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(2),
            fetch_channel: true,
            fetch_comments: true,
            max_comments: 100,
        }
    }
}

/// Why a fetch produced no record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EmptyReason {
    NotFound,
    InvalidId,
    PoolExhausted,
    Transient,
}

impl EmptyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmptyReason::NotFound => "not_found",
            EmptyReason::InvalidId => "invalid_id",
            EmptyReason::PoolExhausted => "pool_exhausted",
            EmptyReason::Transient => "transient",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Fetched(Box<VideoRecord>),
    Empty(EmptyReason),
}

impl FetchOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            FetchOutcome::Fetched(_) => "fetched",
            FetchOutcome::Empty(reason) => reason.as_str(),
        }
    }
}

pub struct FetchClient {
    source: Arc<dyn MetadataSource>,
    pool: Arc<KeyPool>,
    config: FetchConfig,
}

impl FetchClient {
    pub fn new(source: Arc<dyn MetadataSource>, pool: Arc<KeyPool>, config: FetchConfig) -> Self {
        Self {
            source,
            pool,
            config,
        }
    }

    pub fn pool(&self) -> &Arc<KeyPool> {
        &self.pool
    }

    /// Fetch one item. Always resolves; failures become `Empty`.
    #[instrument(skip_all, fields(locator = %item.locator))]
    pub async fn fetch(&self, item: &WorkItem) -> FetchOutcome {
        let outcome = match item.video_id.as_deref() {
            Some(video_id) => self.fetch_video(video_id).await,
            None => {
                debug!("no video id in locator");
                FetchOutcome::Empty(EmptyReason::InvalidId)
            }
        };
        metrics::counter!("harvest_fetch_total", "outcome" => outcome.label()).increment(1);
        outcome
    }

    async fn fetch_video(&self, video_id: &str) -> FetchOutcome {
        let max_rotations = self.pool.len();
        let mut rotations = 0usize;
        let mut transient_attempts = 0u32;
        let mut backoff = self.config.initial_backoff;
        let started = Instant::now();

        loop {
            let credential = match self.pool.current_credential().await {
                Ok(c) => c,
                Err(e) => {
                    debug!(error = %e, "no usable key");
                    return FetchOutcome::Empty(EmptyReason::PoolExhausted);
                }
            };

            let error = match self.source.video(&credential.key, video_id).await {
                Ok(Some(video)) => {
                    self.pool.record_usage_for(credential.index, UNITS_PER_REQUEST).await;
                    let record = self.enrich(video, credential, started).await;
                    return FetchOutcome::Fetched(Box::new(record));
                }
                Ok(None) => {
                    self.pool.record_usage_for(credential.index, UNITS_PER_REQUEST).await;
                    return FetchOutcome::Empty(EmptyReason::NotFound);
                }
                Err(e) => e,
            };

            match classify_error(&error) {
                ErrorClassification::QuotaExceeded => {
                    warn!(video_id, key = credential.index, error = %error, "quota exceeded, rotating key");
                    let advanced = self
                        .pool
                        .mark_index_exhausted_and_advance(credential.index)
                        .await;
                    rotations += 1;
                    if !advanced || rotations > max_rotations {
                        return FetchOutcome::Empty(EmptyReason::PoolExhausted);
                    }
                }
                ErrorClassification::Transient => {
                    if transient_attempts >= self.config.transient_retries {
                        warn!(video_id, attempts = transient_attempts + 1, error = %error, "giving up after transient failures");
                        return FetchOutcome::Empty(EmptyReason::Transient);
                    }
                    transient_attempts += 1;
                    debug!(video_id, attempt = transient_attempts, backoff_ms = backoff.as_millis() as u64, error = %error, "retrying after transient failure");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.config.max_backoff);
                }
            }
        }
    }

    async fn enrich(
        &self,
        video: VideoDetails,
        mut credential: Credential,
        started: Instant,
    ) -> VideoRecord {
        let channel = self.channel_enrichment(&video, &mut credential).await;
        let info_secs = started.elapsed().as_secs_f64();

        let comments_started = Instant::now();
        let comments = self
            .comments_enrichment(&video.video_id, &mut credential)
            .await;
        let comments_secs = comments_started.elapsed().as_secs_f64();

        let timings = Timings {
            extract_info_seconds: Some(round_millis(info_secs)),
            extract_comments_seconds: Some(round_millis(comments_secs)),
        };
        VideoRecord::assemble(video, channel, comments, timings)
    }

    /// Mark `index` exhausted and hand back the next usable key, if any.
    async fn rotate_from(&self, index: usize) -> Option<Credential> {
        if !self.pool.mark_index_exhausted_and_advance(index).await {
            return None;
        }
        self.pool.current_credential().await.ok()
    }

    async fn channel_enrichment(
        &self,
        video: &VideoDetails,
        credential: &mut Credential,
    ) -> Enrichment<ChannelDetails> {
        if !self.config.fetch_channel {
            return Enrichment::skipped("disabled");
        }
        let Some(channel_id) = video.channel_id.as_deref() else {
            return Enrichment::skipped("no channel id");
        };

        let mut rotated = false;
        loop {
            match self.source.channel(&credential.key, channel_id).await {
                Ok(Some(channel)) => {
                    self.pool.record_usage_for(credential.index, UNITS_PER_REQUEST).await;
                    return Enrichment::Fetched(channel);
                }
                Ok(None) => {
                    self.pool.record_usage_for(credential.index, UNITS_PER_REQUEST).await;
                    return Enrichment::skipped("channel not found");
                }
                Err(e) if !rotated && classify_error(&e) == ErrorClassification::QuotaExceeded => {
                    debug!(key = credential.index, "quota exceeded during channel enrichment");
                    match self.rotate_from(credential.index).await {
                        Some(next) => {
                            *credential = next;
                            rotated = true;
                        }
                        None => return Enrichment::skipped(format!("no key left: {e}")),
                    }
                }
                Err(e) => return Enrichment::skipped(e.to_string()),
            }
        }
    }

    async fn comments_enrichment(
        &self,
        video_id: &str,
        credential: &mut Credential,
    ) -> Enrichment<Vec<Comment>> {
        if !self.config.fetch_comments {
            return Enrichment::skipped("disabled");
        }

        let mut rotated = false;
        loop {
            match self.top_comments(credential, video_id).await {
                Ok(comments) => return Enrichment::Fetched(comments),
                Err(e) if !rotated && classify_error(&e) == ErrorClassification::QuotaExceeded => {
                    debug!(key = credential.index, "quota exceeded during comment fetch");
                    match self.rotate_from(credential.index).await {
                        Some(next) => {
                            *credential = next;
                            rotated = true;
                        }
                        None => return Enrichment::skipped(format!("no key left: {e}")),
                    }
                }
                Err(e) => return Enrichment::skipped(e.to_string()),
            }
        }
    }

    /// Relevance-ordered threads, each followed by its replies, up to `max_comments`.
    async fn top_comments(
        &self,
        credential: &Credential,
        video_id: &str,
    ) -> Result<Vec<Comment>, SourceError> {
        let max = self.config.max_comments;
        let mut comments = Vec::new();
        let mut page_token: Option<String> = None;

        while comments.len() < max {
            let page = self
                .source
                .comment_threads(
                    &credential.key,
                    video_id,
                    page_token.as_deref(),
                    page_size(max - comments.len()),
                )
                .await?;
            self.pool.record_usage_for(credential.index, UNITS_PER_REQUEST).await;

            let page_was_empty = page.threads.is_empty();
            for thread in page.threads {
                if comments.len() >= max {
                    break;
                }
                comments.push(thread.comment);
                if thread.total_reply_count == 0 || comments.len() >= max {
                    continue;
                }
                if let Some(parent_id) = thread.top_level_id.as_deref() {
                    self.collect_replies(credential, parent_id, max, &mut comments)
                        .await?;
                }
            }

            page_token = page.next_page_token;
            if page_token.is_none() || page_was_empty {
                break;
            }
        }
        Ok(comments)
    }

    async fn collect_replies(
        &self,
        credential: &Credential,
        parent_id: &str,
        max: usize,
        comments: &mut Vec<Comment>,
    ) -> Result<(), SourceError> {
        let mut page_token: Option<String> = None;
        while comments.len() < max {
            let page = self
                .source
                .comment_replies(
                    &credential.key,
                    parent_id,
                    page_token.as_deref(),
                    page_size(max - comments.len()),
                )
                .await?;
            self.pool.record_usage_for(credential.index, UNITS_PER_REQUEST).await;

            let page_was_empty = page.comments.is_empty();
            for reply in page.comments {
                comments.push(reply);
                if comments.len() >= max {
                    break;
                }
            }
            page_token = page.next_page_token;
            if page_token.is_none() || page_was_empty {
                break;
            }
        }
        Ok(())
    }
}

fn page_size(remaining: usize) -> u32 {
    remaining.min(MAX_PAGE_SIZE) as u32
}
