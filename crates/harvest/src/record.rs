//! Harvested per-video record
//!
//! The stored shape is the primary video fields flattened at the top level,
//! channel statistics merged in when fetched, `topComments` when fetched, and
//! the fetch timings. Enrichments that were skipped are listed with a reason.

use std::collections::BTreeMap;

use metadata_source::{ChannelDetails, Comment, Enrichment, VideoDetails};
use serde::{Deserialize, Serialize};

/// Wall-clock split of a fetch, rounded to milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Timings {
    pub extract_info_seconds: Option<f64>,
    pub extract_comments_seconds: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoRecord {
    #[serde(flatten)]
    pub video: VideoDetails,
    #[serde(flatten)]
    pub channel: Option<ChannelDetails>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_comments: Option<Vec<Comment>>,
    #[serde(rename = "timings_youtube_api")]
    pub timings: Timings,
    /// Enrichment name to skip reason
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub skipped: BTreeMap<String, String>,
}

impl VideoRecord {
    pub fn assemble(
        video: VideoDetails,
        channel: Enrichment<ChannelDetails>,
        comments: Enrichment<Vec<Comment>>,
        timings: Timings,
    ) -> Self {
        let mut skipped = BTreeMap::new();
        let channel = match channel {
            Enrichment::Fetched(c) => Some(c),
            Enrichment::Skipped { reason } => {
                skipped.insert("channel".to_string(), reason);
                None
            }
        };
        let top_comments = match comments {
            Enrichment::Fetched(c) => Some(c),
            Enrichment::Skipped { reason } => {
                skipped.insert("comments".to_string(), reason);
                None
            }
        };
        Self {
            video,
            channel,
            top_comments,
            timings,
            skipped,
        }
    }

    pub fn video_id(&self) -> &str {
        &self.video.video_id
    }
}

pub(crate) fn round_millis(secs: f64) -> f64 {
    (secs * 1000.0).round() / 1000.0
}
