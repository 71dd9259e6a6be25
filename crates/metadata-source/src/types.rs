//! Records returned by a metadata source
//!
//! Field names serialize in the upstream's camelCase so stored snapshots match
//! the shape downstream consumers already read. Every upstream field is
//! optional: missing or malformed values become `None`, never an error.

use serde::{Deserialize, Serialize};

/// Core per-video metadata from `videos.list`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoDetails {
    pub video_id: String,
    pub title: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub channel_id: Option<String>,
    pub channel_title: Option<String>,
    pub published_at: Option<String>,
    pub language: Option<String>,
    /// ISO 8601 duration as reported upstream (e.g. `PT4M13S`)
    pub duration: Option<String>,
    pub view_count: Option<u64>,
    pub like_count: Option<u64>,
    pub comment_count: Option<u64>,
    pub made_for_kids: Option<bool>,
    /// Only the `standard` thumbnail is kept; empty when absent
    #[serde(default)]
    pub thumbnails: serde_json::Map<String, serde_json::Value>,
}

/// Channel statistics from `channels.list`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelDetails {
    pub subscriber_count: Option<u64>,
    pub video_count: Option<u64>,
    #[serde(rename = "viewCount_channel")]
    pub view_count: Option<u64>,
    pub country: Option<String>,
}

/// A single comment or reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub text: Option<String>,
    pub like_count: u64,
    pub reply_count: u64,
    pub published_at: Option<String>,
    pub author: Option<String>,
    pub author_channel_id: Option<String>,
}

/// A top-level comment plus what is needed to page its replies.
#[derive(Debug, Clone, PartialEq)]
pub struct CommentThread {
    pub comment: Comment,
    /// Id of the top-level comment, the `parentId` for reply listing
    pub top_level_id: Option<String>,
    pub total_reply_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommentThreadPage {
    pub threads: Vec<CommentThread>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommentPage {
    pub comments: Vec<Comment>,
    pub next_page_token: Option<String>,
}
