//! API key pool with sequential rotation and quota accounting
//!
//! Holds an ordered list of upstream API keys. Exactly one key is active at a
//! time; when the upstream reports the active key's quota as spent, the pool
//! marks it exhausted and moves to the lowest-indexed key that is still usable.
//!
//! Key lifecycle:
//! 1. Keys load from configuration at startup, all usable
//! 2. Fetches use `current_credential()` and report cost via `record_usage()`
//! 3. A quota failure calls `mark_index_exhausted_and_advance()` for the key used
//! 4. An exhausted key stays exhausted until the process restarts
//! 5. When every key is exhausted, `current_credential()` fails fast

pub mod error;
pub mod pool;
pub mod quota;

pub use error::{Error, Result};
pub use pool::{Credential, CredentialStatus, KeyPool, PoolSnapshot};
pub use quota::{classify_error, classify_message, classify_status};
