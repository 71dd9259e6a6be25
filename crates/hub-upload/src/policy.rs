//! What to do after a failed bulk commit

use crate::store::RemoteError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitAction {
    /// Bisect the chunk and push each half
    Split,
    /// Wait out the rate limit, then retry the same chunk once
    CooldownRetry,
    /// Push the chunk one file per commit
    FallbackToSingles,
}

/// Pick the recovery for `error` on a chunk of `chunk_len` files.
///
/// File-count rejections split until a chunk is at or below `floor`, so
/// repeated rejections always terminate in single-file commits.
pub fn plan(error: &RemoteError, chunk_len: usize, floor: usize) -> CommitAction {
    match error {
        RemoteError::FileCountExceeded(_) if chunk_len > floor.max(1) => CommitAction::Split,
        RemoteError::FileCountExceeded(_) => CommitAction::FallbackToSingles,
        RemoteError::RateLimited(_) => CommitAction::CooldownRetry,
        RemoteError::Other(_) => CommitAction::FallbackToSingles,
    }
}
