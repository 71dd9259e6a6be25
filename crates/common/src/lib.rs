//! Shared types for the snapshot harvester workspace

mod error;
pub mod fs;
mod secret;

pub use error::{Error, Result};
pub use fs::{read_json, write_json_atomic};
pub use secret::Secret;
