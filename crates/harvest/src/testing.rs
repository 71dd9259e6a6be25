//! In-memory metadata source for client and scheduler tests.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use common::Secret;
use metadata_source::{
    ChannelDetails, Comment, CommentPage, CommentThread, CommentThreadPage, MetadataSource,
    SourceError, SourceFuture, VideoDetails,
};

pub(crate) fn quota_error() -> SourceError {
    SourceError::Status {
        status: 403,
        body: r#"{"error":{"errors":[{"reason":"quotaExceeded"}]}}"#.into(),
    }
}

pub(crate) fn transient_error() -> SourceError {
    SourceError::Status {
        status: 503,
        body: "backend error".into(),
    }
}

/// Scripted upstream. Behavior keys off the API key and video id.
#[derive(Default)]
pub(crate) struct FakeSource {
    /// Keys whose every request fails with a quota error
    pub quota_keys: HashSet<String>,
    /// Keys whose channel requests fail with a quota error
    pub channel_quota_keys: HashSet<String>,
    /// Video ids the upstream does not know
    pub missing: HashSet<String>,
    /// Video id to number of transient failures still to serve
    pub flaky: Mutex<HashMap<String, u32>>,
    /// Video ids that always fail transiently
    pub broken: HashSet<String>,
    pub comment_pages: usize,
    pub threads_per_page: usize,
    pub replies_per_thread: u64,
    /// How long each `video` request takes
    pub video_delay: Option<Duration>,
    /// `video` requests currently in progress, and the most seen at once
    pub in_flight: AtomicUsize,
    pub peak_in_flight: AtomicUsize,
    /// `(video id, results dir)`: fetching that id waits for the checkpoint
    /// to land in the results dir, then makes its next write fail
    pub jam_checkpoint: Option<(String, PathBuf)>,
    /// `(method, key)` for every request received
    pub calls: Mutex<Vec<(String, String)>>,
}

impl FakeSource {
    pub fn with_quota_keys(keys: &[&str]) -> Self {
        Self {
            quota_keys: keys.iter().map(|k| k.to_string()).collect(),
            ..Default::default()
        }
    }

    fn log(&self, method: &str, key: &Secret<String>) {
        self.calls
            .lock()
            .unwrap()
            .push((method.to_string(), key.expose().clone()));
    }

    pub fn calls_to(&self, method: &str) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, k)| k.clone())
            .collect()
    }

    fn quota_blocked(&self, key: &Secret<String>) -> bool {
        self.quota_keys.contains(key.expose())
    }

    pub fn peak(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    async fn jam_if_armed(&self, video_id: &str) {
        let Some((id, dir)) = &self.jam_checkpoint else {
            return;
        };
        if id != video_id {
            return;
        }
        for _ in 0..400 {
            if dir.join(crate::checkpoint::FILE_NAME).exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        // The atomic writer's temp path; a directory there makes the write fail.
        let tmp = format!(".{}.tmp.{}", crate::checkpoint::FILE_NAME, std::process::id());
        std::fs::create_dir_all(dir.join(tmp)).unwrap();
    }
}

impl MetadataSource for FakeSource {
    fn id(&self) -> &str {
        "fake"
    }

    fn video<'a>(
        &'a self,
        key: &'a Secret<String>,
        video_id: &'a str,
    ) -> SourceFuture<'a, Option<VideoDetails>> {
        Box::pin(async move {
            self.log("video", key);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
            if let Some(delay) = self.video_delay {
                tokio::time::sleep(delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.jam_if_armed(video_id).await;
            if self.quota_blocked(key) {
                return Err(quota_error());
            }
            if self.broken.contains(video_id) {
                return Err(transient_error());
            }
            {
                let mut flaky = self.flaky.lock().unwrap();
                if let Some(left) = flaky.get_mut(video_id) {
                    if *left > 0 {
                        *left -= 1;
                        return Err(transient_error());
                    }
                }
            }
            if self.missing.contains(video_id) {
                return Ok(None);
            }
            Ok(Some(VideoDetails {
                video_id: video_id.to_string(),
                title: Some(format!("video {video_id}")),
                channel_id: Some(format!("UC{video_id}")),
                ..Default::default()
            }))
        })
    }

    fn channel<'a>(
        &'a self,
        key: &'a Secret<String>,
        _channel_id: &'a str,
    ) -> SourceFuture<'a, Option<ChannelDetails>> {
        Box::pin(async move {
            self.log("channel", key);
            if self.quota_blocked(key) || self.channel_quota_keys.contains(key.expose()) {
                return Err(quota_error());
            }
            Ok(Some(ChannelDetails {
                subscriber_count: Some(1000),
                country: Some("US".into()),
                ..Default::default()
            }))
        })
    }

    fn comment_threads<'a>(
        &'a self,
        key: &'a Secret<String>,
        _video_id: &'a str,
        page_token: Option<&'a str>,
        max_results: u32,
    ) -> SourceFuture<'a, CommentThreadPage> {
        Box::pin(async move {
            self.log("comment_threads", key);
            if self.quota_blocked(key) {
                return Err(quota_error());
            }
            let page: usize = page_token.and_then(|t| t.parse().ok()).unwrap_or(0);
            if page >= self.comment_pages {
                return Ok(CommentThreadPage::default());
            }
            let threads = (0..self.threads_per_page.min(max_results as usize))
                .map(|i| CommentThread {
                    comment: Comment {
                        text: Some(format!("thread {page}-{i}")),
                        reply_count: self.replies_per_thread,
                        ..Default::default()
                    },
                    top_level_id: Some(format!("t{page}-{i}")),
                    total_reply_count: self.replies_per_thread,
                })
                .collect();
            let next_page_token = (page + 1 < self.comment_pages).then(|| (page + 1).to_string());
            Ok(CommentThreadPage {
                threads,
                next_page_token,
            })
        })
    }

    fn comment_replies<'a>(
        &'a self,
        key: &'a Secret<String>,
        parent_id: &'a str,
        _page_token: Option<&'a str>,
        max_results: u32,
    ) -> SourceFuture<'a, CommentPage> {
        Box::pin(async move {
            self.log("comment_replies", key);
            if self.quota_blocked(key) {
                return Err(quota_error());
            }
            let n = self.replies_per_thread.min(max_results as u64);
            let comments = (0..n)
                .map(|i| Comment {
                    text: Some(format!("reply {parent_id}-{i}")),
                    ..Default::default()
                })
                .collect();
            Ok(CommentPage {
                comments,
                next_page_token: None,
            })
        })
    }
}
