//! Persisted per-vBucket state snapshot.
//!
//! Stored as JSON in the reserved local document `_local/vbstate` of each
//! vBucket file.

use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketState {
    Active,
    Replica,
    Pending,
    Dead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverEntry {
    pub id: u64,
    pub seq: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VBucketState {
    pub state: BucketState,
    pub checkpoint_id: u64,
    pub max_deleted_seqno: u64,
    pub high_seqno: u64,
    pub purge_seqno: u64,
    pub snap_start: u64,
    pub snap_end: u64,
    pub max_cas: u64,
    #[serde(default)]
    pub failover_table: Vec<FailoverEntry>,
}

impl VBucketState {
    pub fn new(state: BucketState) -> Self {
        Self {
            state,
            checkpoint_id: 0,
            max_deleted_seqno: 0,
            high_seqno: 0,
            purge_seqno: 0,
            snap_start: 0,
            snap_end: 0,
            max_cas: 0,
            failover_table: Vec::new(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("vbucket state serializes")
    }

    /// Parse a persisted snapshot.
    ///
    /// An all-ones max_cas is a historical corruption; it is repaired to 0
    /// on load.
    pub fn from_json(buf: &[u8]) -> Result<Self, serde_json::Error> {
        let mut state: Self = serde_json::from_slice(buf)?;
        if state.max_cas == u64::MAX {
            warn!("repairing persisted max_cas of -1 to 0");
            state.max_cas = 0;
        }
        Ok(state)
    }
}
