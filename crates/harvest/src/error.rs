//! Error types for harvest runs

/// Errors that stop a run from starting or from persisting its state.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Storage(#[from] common::Error),

    #[error("work list error: {0}")]
    WorkList(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Result alias for harvest operations.
pub type Result<T> = std::result::Result<T, Error>;
