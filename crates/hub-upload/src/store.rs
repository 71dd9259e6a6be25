//! Remote content store seam
//!
//! The uploader only needs two things from the hub: push a set of files as one
//! commit, and list what is already there. Tests swap in an in-memory store.

use std::future::Future;
use std::pin::Pin;

/// One file to push, addressed by its path inside the repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub path: String,
    pub content: Vec<u8>,
}

/// Commit failures, classified for the retry policy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// The commit carried more files than the hub accepts
    #[error("too many files in commit: {0}")]
    FileCountExceeded(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("remote store error: {0}")]
    Other(String),
}

/// Boxed future returned by `RemoteStore` methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, RemoteError>> + Send + 'a>>;

pub trait RemoteStore: Send + Sync {
    /// Push `files` as a single commit.
    fn commit<'a>(&'a self, files: &'a [RemoteFile], message: &'a str) -> StoreFuture<'a, ()>;

    /// Every file path currently in the repository.
    fn list_files(&self) -> StoreFuture<'_, Vec<String>>;
}
