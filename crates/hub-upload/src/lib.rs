//! Commit-batching uploader for a Hugging Face dataset repository
//!
//! Harvest runs drop many small `batch_{n}.json` artifacts. Pushing each one
//! as its own commit would burn through the hub's hourly commit allowance, so
//! the uploader queues artifacts and pushes their records in bulk commits,
//! degrading to smaller commits when the hub rejects a bulk push.
//!
//! Layout in the repository: `category/video_id/meta_{date}_{label}/video_id.json`.

pub mod cache;
pub mod committed;
pub mod error;
pub mod hub;
pub mod policy;
pub mod store;
pub mod uploader;

pub use committed::CommittedSet;
pub use error::{Error, Result};
pub use hub::{HfHub, HubTarget, classify_failure};
pub use policy::{CommitAction, plan};
pub use store::{RemoteError, RemoteFile, RemoteStore, StoreFuture};
pub use uploader::{TickReport, UploadStatus, Uploader, UploaderConfig};
