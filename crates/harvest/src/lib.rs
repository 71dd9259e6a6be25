//! Quota-aware batch harvesting
//!
//! Turns a nested work list into fixed-size batches, fetches each item through
//! a key-rotating client, and persists progress so an interrupted run resumes
//! where it stopped.
//!
//! Run lifecycle:
//! 1. Load the checkpoint and drop already-processed locators
//! 2. Partition the rest into batches numbered after the highest on disk
//! 3. Fetch each batch through a small worker pool, checkpointing every success
//! 4. Write `batch_{n}.json` for batches with at least one success
//! 5. After repeated empty batches, force a key rotation or halt
//! 6. Write the run index

pub mod artifact;
pub mod checkpoint;
pub mod client;
pub mod error;
pub mod record;
pub mod scheduler;
pub mod work;

#[cfg(test)]
pub(crate) mod testing;

pub use artifact::{BatchArtifact, BatchSummary};
pub use checkpoint::Checkpoint;
pub use client::{EmptyReason, FetchClient, FetchConfig, FetchOutcome};
pub use error::{Error, Result};
pub use record::{Timings, VideoRecord};
pub use scheduler::{BatchReport, HaltReason, RunReport, Scheduler, SchedulerConfig};
pub use work::{WorkItem, extract_video_id, flatten_work_list, load_work_list};
