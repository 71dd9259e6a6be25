//! Work list loading
//!
//! `urls.json` nests `category -> interval -> url -> metadata`. Only entries
//! whose leaf is an object are work; anything else at any level is skipped.
//! Traversal order is the file's order (serde_json `preserve_order`).

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::error::{Error, Result};

/// Length of a YouTube video id.
pub const VIDEO_ID_LEN: usize = 11;

static ID_PATTERNS: LazyLock<[Regex; 3]> = LazyLock::new(|| {
    [
        Regex::new(r"(?:v=|/)([0-9A-Za-z_-]{11})").expect("video id regex should compile"),
        Regex::new(r"youtube\.com/watch\?v=([0-9A-Za-z_-]{11})")
            .expect("watch url regex should compile"),
        Regex::new(r"youtu\.be/([0-9A-Za-z_-]{11})").expect("short url regex should compile"),
    ]
});

/// One (category, locator) pair. Identity is the locator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub category: String,
    pub locator: String,
    /// `None` when no 11-character id can be derived from the locator
    pub video_id: Option<String>,
}

impl WorkItem {
    pub fn new(category: impl Into<String>, locator: impl Into<String>) -> Self {
        let locator = locator.into();
        let video_id = extract_video_id(&locator);
        Self {
            category: category.into(),
            locator,
            video_id,
        }
    }
}

/// Derive the video id from a watch URL, short URL, or a bare `?v=` tail.
pub fn extract_video_id(locator: &str) -> Option<String> {
    for pattern in ID_PATTERNS.iter() {
        if let Some(caps) = pattern.captures(locator) {
            return caps.get(1).map(|m| m.as_str().to_owned());
        }
    }
    let tail = locator.rsplit("?v=").next().unwrap_or(locator);
    (tail.chars().count() == VIDEO_ID_LEN).then(|| tail.to_owned())
}

/// Flatten the nested work list into items in traversal order.
pub fn flatten_work_list(root: &Value) -> Vec<WorkItem> {
    let mut items = Vec::new();
    let Some(categories) = root.as_object() else {
        return items;
    };
    for (category, intervals) in categories {
        let Some(intervals) = intervals.as_object() else {
            continue;
        };
        for videos in intervals.values() {
            let Some(videos) = videos.as_object() else {
                continue;
            };
            for (locator, data) in videos {
                if data.is_object() {
                    items.push(WorkItem::new(category.as_str(), locator.as_str()));
                }
            }
        }
    }
    items
}

/// Read and flatten a work list file.
pub async fn load_work_list(path: &Path) -> Result<Vec<WorkItem>> {
    let root: Value = common::read_json(path)
        .await?
        .ok_or_else(|| Error::WorkList(format!("{} not found", path.display())))?;
    if !root.is_object() {
        return Err(Error::WorkList(format!(
            "{} must contain a JSON object",
            path.display()
        )));
    }
    Ok(flatten_work_list(&root))
}
