//! YouTube Data API v3 source
//!
//! Issues plain REST calls (`videos`, `channels`, `commentThreads`, `comments`)
//! with the API key as a query parameter. Response bodies are read as untyped
//! JSON and mapped field by field, so schema drift upstream degrades to missing
//! fields rather than parse failures.

use std::time::Duration;

use common::Secret;
use serde_json::Value;
use tracing::debug;

use crate::types::{
    ChannelDetails, Comment, CommentPage, CommentThread, CommentThreadPage, VideoDetails,
};
use crate::{MetadataSource, Result, SourceError, SourceFuture};

pub const DEFAULT_BASE_URL: &str = "https://www.googleapis.com/youtube/v3";

const VIDEO_PARTS: &str =
    "snippet,contentDetails,status,statistics,topicDetails,recordingDetails,liveStreamingDetails";
const CHANNEL_PARTS: &str = "snippet,statistics,brandingSettings";

/// Metadata source backed by the YouTube Data API.
pub struct YouTubeSource {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl YouTubeSource {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            timeout,
        }
    }

    async fn get(
        &self,
        endpoint: &str,
        key: &Secret<String>,
        params: &[(&str, &str)],
    ) -> Result<Value> {
        let url = format!("{}/{endpoint}", self.base_url.trim_end_matches('/'));
        debug!(endpoint, "upstream request");

        let response = self
            .client
            .get(&url)
            .query(params)
            .query(&[("key", key.expose().as_str())])
            .timeout(self.timeout)
            .send()
            .await
            // The URL carries the key, keep it out of error strings
            .map_err(|e| SourceError::Transport(e.without_url().to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));
            return Err(SourceError::Status {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| SourceError::Malformed(e.without_url().to_string()))
    }
}

impl MetadataSource for YouTubeSource {
    fn id(&self) -> &str {
        "youtube"
    }

    fn video<'a>(
        &'a self,
        key: &'a Secret<String>,
        video_id: &'a str,
    ) -> SourceFuture<'a, Option<VideoDetails>> {
        Box::pin(async move {
            let body = self
                .get("videos", key, &[("part", VIDEO_PARTS), ("id", video_id)])
                .await?;
            Ok(parse_video(video_id, &body))
        })
    }

    fn channel<'a>(
        &'a self,
        key: &'a Secret<String>,
        channel_id: &'a str,
    ) -> SourceFuture<'a, Option<ChannelDetails>> {
        Box::pin(async move {
            let body = self
                .get("channels", key, &[("part", CHANNEL_PARTS), ("id", channel_id)])
                .await?;
            Ok(parse_channel(&body))
        })
    }

    fn comment_threads<'a>(
        &'a self,
        key: &'a Secret<String>,
        video_id: &'a str,
        page_token: Option<&'a str>,
        max_results: u32,
    ) -> SourceFuture<'a, CommentThreadPage> {
        Box::pin(async move {
            let max = max_results.to_string();
            let mut params = vec![
                ("part", "snippet,replies"),
                ("videoId", video_id),
                ("order", "relevance"),
                ("maxResults", max.as_str()),
            ];
            if let Some(token) = page_token {
                params.push(("pageToken", token));
            }
            let body = self.get("commentThreads", key, &params).await?;
            Ok(parse_thread_page(&body))
        })
    }

    fn comment_replies<'a>(
        &'a self,
        key: &'a Secret<String>,
        parent_id: &'a str,
        page_token: Option<&'a str>,
        max_results: u32,
    ) -> SourceFuture<'a, CommentPage> {
        Box::pin(async move {
            let max = max_results.to_string();
            let mut params = vec![
                ("part", "snippet"),
                ("parentId", parent_id),
                ("maxResults", max.as_str()),
            ];
            if let Some(token) = page_token {
                params.push(("pageToken", token));
            }
            let body = self.get("comments", key, &params).await?;
            Ok(parse_comment_page(&body))
        })
    }
}

fn text(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_owned)
}

/// Statistics arrive as decimal strings; accept bare numbers too.
fn count(value: &Value, key: &str) -> Option<u64> {
    match value.get(key)? {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

fn first_item(body: &Value) -> Option<&Value> {
    body.get("items")?.as_array()?.first()
}

static NULL: Value = Value::Null;

fn null() -> &'static Value {
    &NULL
}

pub(crate) fn parse_video(video_id: &str, body: &Value) -> Option<VideoDetails> {
    let item = first_item(body)?;
    let snippet = item.get("snippet").unwrap_or(null());
    let content = item.get("contentDetails").unwrap_or(null());
    let status = item.get("status").unwrap_or(null());
    let stats = item.get("statistics").unwrap_or(null());

    let tags = snippet
        .get("tags")
        .and_then(Value::as_array)
        .map(|tags| {
            tags.iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default();

    let mut thumbnails = serde_json::Map::new();
    if let Some(standard) = snippet.get("thumbnails").and_then(|t| t.get("standard")) {
        thumbnails.insert("standard".into(), standard.clone());
    }

    Some(VideoDetails {
        video_id: video_id.to_owned(),
        title: text(snippet, "title"),
        description: text(snippet, "description"),
        tags,
        channel_id: text(snippet, "channelId"),
        channel_title: text(snippet, "channelTitle"),
        published_at: text(snippet, "publishedAt"),
        language: text(snippet, "defaultLanguage"),
        duration: text(content, "duration"),
        view_count: count(stats, "viewCount"),
        like_count: count(stats, "likeCount"),
        comment_count: count(stats, "commentCount"),
        made_for_kids: status.get("madeForKids").and_then(Value::as_bool),
        thumbnails,
    })
}

pub(crate) fn parse_channel(body: &Value) -> Option<ChannelDetails> {
    let item = first_item(body)?;
    let stats = item.get("statistics").unwrap_or(null());
    let snippet = item.get("snippet").unwrap_or(null());
    Some(ChannelDetails {
        subscriber_count: count(stats, "subscriberCount"),
        video_count: count(stats, "videoCount"),
        view_count: count(stats, "viewCount"),
        country: text(snippet, "country"),
    })
}

fn parse_comment(snippet: &Value, reply_count: u64) -> Comment {
    Comment {
        text: text(snippet, "textDisplay"),
        like_count: count(snippet, "likeCount").unwrap_or(0),
        reply_count,
        published_at: text(snippet, "publishedAt"),
        author: text(snippet, "authorDisplayName"),
        author_channel_id: snippet
            .get("authorChannelId")
            .and_then(|c| c.get("value"))
            .and_then(Value::as_str)
            .map(str::to_owned),
    }
}

fn items(body: &Value) -> &[Value] {
    body.get("items")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

pub(crate) fn parse_thread_page(body: &Value) -> CommentThreadPage {
    let threads = items(body)
        .iter()
        .map(|item| {
            let snippet = item.get("snippet").unwrap_or(null());
            let top = snippet.get("topLevelComment").unwrap_or(null());
            let total_reply_count = count(snippet, "totalReplyCount").unwrap_or(0);
            CommentThread {
                comment: parse_comment(top.get("snippet").unwrap_or(null()), total_reply_count),
                top_level_id: text(top, "id"),
                total_reply_count,
            }
        })
        .collect();
    CommentThreadPage {
        threads,
        next_page_token: text(body, "nextPageToken"),
    }
}

pub(crate) fn parse_comment_page(body: &Value) -> CommentPage {
    let comments = items(body)
        .iter()
        .map(|item| parse_comment(item.get("snippet").unwrap_or(null()), 0))
        .collect();
    CommentPage {
        comments,
        next_page_token: text(body, "nextPageToken"),
    }
}
