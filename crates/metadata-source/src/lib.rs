//! Metadata source abstraction for the harvester
//!
//! Defines the `MetadataSource` trait that decouples the fetch client from the
//! upstream API. `YouTubeSource` talks to the YouTube Data API v3; tests
//! substitute in-memory fakes. Every call takes the credential explicitly so
//! rotation never requires rebuilding the transport.

pub mod types;
pub mod youtube;

pub use types::{
    ChannelDetails, Comment, CommentPage, CommentThread, CommentThreadPage, VideoDetails,
};
pub use youtube::YouTubeSource;

use common::Secret;
use std::future::Future;
use std::pin::Pin;

/// Classification of upstream failures, driving rotation vs retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClassification {
    /// Retry on the same credential with backoff (timeouts, 5xx, unknown)
    Transient,
    /// Credential quota spent, rotate to the next credential
    QuotaExceeded,
}

/// Errors from a single upstream request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    #[error("upstream returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed upstream response: {0}")]
    Malformed(String),
}

/// Result alias for source operations.
pub type Result<T> = std::result::Result<T, SourceError>;

/// Outcome of an optional sub-request. Failures are recorded, never raised.
#[derive(Debug, Clone, PartialEq)]
pub enum Enrichment<T> {
    Fetched(T),
    Skipped { reason: String },
}

impl<T> Enrichment<T> {
    pub fn skipped(reason: impl Into<String>) -> Self {
        Enrichment::Skipped {
            reason: reason.into(),
        }
    }

    pub fn fetched(&self) -> Option<&T> {
        match self {
            Enrichment::Fetched(v) => Some(v),
            Enrichment::Skipped { .. } => None,
        }
    }

    pub fn skip_reason(&self) -> Option<&str> {
        match self {
            Enrichment::Fetched(_) => None,
            Enrichment::Skipped { reason } => Some(reason),
        }
    }
}

/// Boxed future returned by `MetadataSource` methods.
pub type SourceFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Per-item metadata extraction against the upstream API.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn MetadataSource>`).
pub trait MetadataSource: Send + Sync {
    /// Identifier for logging (e.g. "youtube")
    fn id(&self) -> &str;

    /// Primary record. `Ok(None)` when the upstream has no such item.
    fn video<'a>(
        &'a self,
        key: &'a Secret<String>,
        video_id: &'a str,
    ) -> SourceFuture<'a, Option<VideoDetails>>;

    /// Channel enrichment for the video's uploader.
    fn channel<'a>(
        &'a self,
        key: &'a Secret<String>,
        channel_id: &'a str,
    ) -> SourceFuture<'a, Option<ChannelDetails>>;

    /// One page of top-level comment threads ordered by relevance.
    fn comment_threads<'a>(
        &'a self,
        key: &'a Secret<String>,
        video_id: &'a str,
        page_token: Option<&'a str>,
        max_results: u32,
    ) -> SourceFuture<'a, CommentThreadPage>;

    /// One page of replies under a top-level comment.
    fn comment_replies<'a>(
        &'a self,
        key: &'a Secret<String>,
        parent_id: &'a str,
        page_token: Option<&'a str>,
        max_results: u32,
    ) -> SourceFuture<'a, CommentPage>;
}
