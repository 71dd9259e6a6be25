//! Error types for key pool operations

/// Errors from key pool operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("all {total} API keys exhausted")]
    AllExhausted { total: usize },
}

/// Result alias for key pool operations.
pub type Result<T> = std::result::Result<T, Error>;
