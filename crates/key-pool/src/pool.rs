//! Rotation state and quota accounting
//!
//! A single `tokio::sync::Mutex` guards the active index, the exhausted set,
//! and the usage counters. Critical sections are short and never span a
//! network call; callers get owned copies back.
//!
//! Advancement always rescans from index 0 for the first key not yet
//! exhausted. This fixed precedence means a second failure report for a key
//! that is already exhausted cannot move the index a second time.

use std::collections::BTreeSet;

use common::Secret;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// An API key together with its stable position in the pool.
#[derive(Debug, Clone)]
pub struct Credential {
    pub index: usize,
    pub key: Secret<String>,
}

/// Per-key status for snapshots and the health endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CredentialStatus {
    pub index: usize,
    pub exhausted: bool,
    pub quota_used: u64,
}

/// Point-in-time copy of the rotation state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolSnapshot {
    pub active_index: usize,
    pub total: usize,
    pub exhausted: Vec<usize>,
    pub total_quota_used: u64,
    pub keys: Vec<CredentialStatus>,
}

struct RotationState {
    active_index: usize,
    exhausted: BTreeSet<usize>,
    quota_used: Vec<u64>,
    total_quota_used: u64,
}

impl RotationState {
    fn fully_exhausted(&self, total: usize) -> bool {
        self.exhausted.len() >= total
    }

    /// Move to the lowest non-exhausted index. Returns false when none remain.
    fn advance(&mut self, total: usize) -> bool {
        match (0..total).find(|i| !self.exhausted.contains(i)) {
            Some(next) => {
                if next != self.active_index {
                    info!(from = self.active_index, to = next, "rotated to next API key");
                    metrics::counter!("harvest_key_rotations_total").increment(1);
                }
                self.active_index = next;
                true
            }
            None => {
                warn!(total, "all API keys exhausted");
                false
            }
        }
    }

    fn charge(&mut self, index: usize, units: u64) {
        if let Some(used) = self.quota_used.get_mut(index) {
            *used += units;
        }
        self.total_quota_used += units;
        metrics::counter!("harvest_quota_units_total").increment(units);
    }
}

/// Ordered pool of API keys with sequential failover.
pub struct KeyPool {
    keys: Vec<Secret<String>>,
    state: Mutex<RotationState>,
}

impl KeyPool {
    /// Create a pool over `keys` in the given order. Index 0 starts active.
    pub fn new(keys: Vec<Secret<String>>) -> Self {
        info!(keys = keys.len(), "key pool initialized");
        let quota_used = vec![0; keys.len()];
        Self {
            keys,
            state: Mutex::new(RotationState {
                active_index: 0,
                exhausted: BTreeSet::new(),
                quota_used,
                total_quota_used: 0,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// The active key, or `AllExhausted` once every key is spent.
    pub async fn current_credential(&self) -> Result<Credential> {
        let state = self.state.lock().await;
        let total = self.keys.len();
        if state.fully_exhausted(total) {
            return Err(Error::AllExhausted { total });
        }
        Ok(Credential {
            index: state.active_index,
            key: self.keys[state.active_index].clone(),
        })
    }

    /// Charge `units` to the active key and to the running total.
    pub async fn record_usage(&self, units: u64) {
        let mut state = self.state.lock().await;
        let active = state.active_index;
        state.charge(active, units);
    }

    /// Charge `units` to the key at `index`, the one that served the request.
    ///
    /// A rotation between issuing the request and recording its cost does not
    /// move the charge to the new active key.
    pub async fn record_usage_for(&self, index: usize, units: u64) {
        let mut state = self.state.lock().await;
        state.charge(index, units);
    }

    /// Mark the active key exhausted and advance.
    ///
    /// Returns false when no usable key remains.
    pub async fn mark_exhausted_and_advance(&self) -> bool {
        let mut state = self.state.lock().await;
        let total = self.keys.len();
        let active = state.active_index;
        if active < total {
            state.exhausted.insert(active);
        }
        state.advance(total)
    }

    /// Mark the key a failing request actually used, then advance.
    ///
    /// Concurrent workers that all saw the same key fail each call this; only
    /// the first report changes the exhausted set, and advancing is a rescan,
    /// so the active index moves at most once per exhausted key.
    pub async fn mark_index_exhausted_and_advance(&self, index: usize) -> bool {
        let mut state = self.state.lock().await;
        let total = self.keys.len();
        if index < total && !state.exhausted.insert(index) {
            debug!(index, "key already marked exhausted");
        }
        state.advance(total)
    }

    /// True when no usable key remains (also for an empty pool).
    pub async fn is_fully_exhausted(&self) -> bool {
        self.state.lock().await.fully_exhausted(self.keys.len())
    }

    /// `(active_index + 1, total)` for human-readable log lines.
    pub async fn status(&self) -> (usize, usize) {
        let state = self.state.lock().await;
        (state.active_index + 1, self.keys.len())
    }

    pub async fn total_quota_used(&self) -> u64 {
        self.state.lock().await.total_quota_used
    }

    pub async fn snapshot(&self) -> PoolSnapshot {
        let state = self.state.lock().await;
        let keys = (0..self.keys.len())
            .map(|index| CredentialStatus {
                index,
                exhausted: state.exhausted.contains(&index),
                quota_used: state.quota_used.get(index).copied().unwrap_or(0),
            })
            .collect();
        PoolSnapshot {
            active_index: state.active_index,
            total: self.keys.len(),
            exhausted: state.exhausted.iter().copied().collect(),
            total_quota_used: state.total_quota_used,
            keys,
        }
    }

    /// Pool health summary for the status endpoint.
    ///
    /// Status mapping: no key exhausted → healthy, some usable → degraded,
    /// none usable → unhealthy.
    pub async fn health(&self) -> serde_json::Value {
        let snapshot = self.snapshot().await;
        let usable = snapshot.total - snapshot.exhausted.len();
        let pool_status = if usable == snapshot.total && snapshot.total > 0 {
            "healthy"
        } else if usable > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        let keys: Vec<serde_json::Value> = snapshot
            .keys
            .iter()
            .map(|k| {
                serde_json::json!({
                    "index": k.index,
                    "hint": self.keys[k.index].hint(),
                    "status": if k.exhausted { "exhausted" } else { "available" },
                    "quota_used": k.quota_used,
                })
            })
            .collect();

        serde_json::json!({
            "status": pool_status,
            "keys_total": snapshot.total,
            "keys_available": usable,
            "keys_exhausted": snapshot.exhausted.len(),
            "active_key": snapshot.active_index + 1,
            "quota_used_total": snapshot.total_quota_used,
            "keys": keys,
        })
    }
}
