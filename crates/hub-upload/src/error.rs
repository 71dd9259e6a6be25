//! Error types for the uploader

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Storage(#[from] common::Error),

    #[error(transparent)]
    Artifacts(#[from] harvest::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Result alias for uploader operations.
pub type Result<T> = std::result::Result<T, Error>;
