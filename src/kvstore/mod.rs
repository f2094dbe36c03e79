//! KVStore contract: the abstract interface the engine drives, plus the
//! shared request/response types.
//!
//! Mutations are accumulated per transaction and persisted by `commit`;
//! completion callbacks fire only after the commit marker is durable.
//! Reads, scans and maintenance operations are defined per vBucket.

use std::collections::HashMap;

use crate::collections::CollectionsView;
use crate::error::Status;
use crate::item::{DocKey, Item, VBucketId};
use crate::vbucket_state::{FailoverEntry, VBucketState};

pub mod couch;

pub use couch::{CouchKVStore, KVStoreConfig};

/// Result of one queued mutation, delivered through its completion
/// callback after commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationResult {
    pub status: Status,
    /// True when the key did not previously exist.
    pub inserted: bool,
}

pub type SetCallback = Box<dyn FnOnce(MutationResult) + Send>;
pub type DelCallback = Box<dyn FnOnce(Status) + Send>;

/// A read result. `item` is populated on success; on a rollback revert of
/// a key absent at the rewind point it carries a deletion marker.
#[derive(Debug)]
pub struct GetValue {
    pub status: Status,
    pub item: Option<Item>,
}

impl GetValue {
    pub fn found(item: Item) -> Self {
        Self {
            status: Status::Success,
            item: Some(item),
        }
    }

    pub fn miss(status: Status) -> Self {
        Self { status, item: None }
    }
}

/// How `snapshot_vbucket` should treat durability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VBStatePersist {
    /// Update the cached state only.
    NotPersist,
    /// Write the state without a durable commit marker.
    PersistWithoutCommit,
    /// Write the state and sync.
    PersistWithCommit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFilter {
    All,
    NoDeletes,
    DeletesOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueFilter {
    KeysOnly,
    ValuesCompressed,
    /// Decompress compressed values before the callback sees them.
    ValuesDecompressed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStatus {
    Success,
    /// The callback yielded; call `scan` again to resume.
    Again,
    Failed,
}

/// Outcome of the per-document cache probe issued before disk reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLookupStatus {
    /// The engine already has this seqno; skip the disk read.
    Hit,
    Miss,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanCallbackStatus {
    Continue,
    /// Stop after this item; the scan can be resumed.
    Yield,
}

pub struct CacheLookup {
    pub key: DocKey,
    pub by_seqno: u64,
    pub vbucket: VBucketId,
}

pub type ScanValueCallback = Box<dyn FnMut(GetValue) -> ScanCallbackStatus + Send>;
pub type CacheLookupCallback = Box<dyn FnMut(&CacheLookup) -> CacheLookupStatus + Send>;
pub type RollbackCallback = Box<dyn FnMut(GetValue) + Send>;
pub type AllKeysCallback = Box<dyn FnMut(&DocKey) + Send>;
pub type BloomFilterCallback = Box<dyn FnMut(&DocKey) + Send>;
/// Consulted per live document during compaction; returning true converts
/// the document to a tombstone.
pub type ExpiryCallback = Box<dyn FnMut(&DocKey, u32) -> bool + Send>;

/// Purge thresholds for one compaction run.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompactionConfig {
    pub purge_before_seq: u64,
    pub purge_before_ts: u64,
    pub drop_deletes: bool,
}

pub struct CompactionContext {
    pub vbucket: VBucketId,
    pub config: CompactionConfig,
    pub curr_time: u32,
    pub bloom_filter_cb: Option<BloomFilterCallback>,
    pub expiry_cb: Option<ExpiryCallback>,
    /// Highest seqno dropped by this run; filled in on success.
    pub max_purged_seq: u64,
}

impl CompactionContext {
    pub fn new(vbucket: VBucketId, config: CompactionConfig, curr_time: u32) -> Self {
        Self {
            vbucket,
            config,
            curr_time,
            bloom_filter_cb: None,
            expiry_cb: None,
            max_purged_seq: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RollbackResult {
    pub success: bool,
    /// Seqno of the rewind point.
    pub high_seqno: u64,
    pub snap_start_seqno: u64,
    pub snap_end_seqno: u64,
    pub failover_entry: Option<FailoverEntry>,
}

impl RollbackResult {
    pub fn failed() -> Self {
        Self {
            success: false,
            high_seqno: 0,
            snap_start_seqno: 0,
            snap_end_seqno: 0,
            failover_entry: None,
        }
    }
}

/// An in-flight ordered range read over one vBucket.
///
/// The store keeps the matching file handle in a registry keyed by `id`;
/// `destroy_scan_context` must be called on every path, including after a
/// failed scan.
pub struct ScanContext {
    pub id: u64,
    pub vbucket: VBucketId,
    pub start_seqno: u64,
    /// High seqno at the time the context was opened.
    pub end_seqno: u64,
    pub doc_filter: DocumentFilter,
    pub value_filter: ValueFilter,
    pub value_cb: ScanValueCallback,
    pub cache_cb: CacheLookupCallback,
    /// Last seqno consumed; scans resume after it.
    pub last_read_seqno: u64,
}

/// One pending background fetch.
pub struct BgFetchItem {
    pub meta_only: bool,
    pub value: GetValue,
}

impl BgFetchItem {
    pub fn new(meta_only: bool) -> Self {
        Self {
            meta_only,
            value: GetValue::miss(Status::WouldBlock),
        }
    }
}

pub type BgFetchQueue = HashMap<DocKey, BgFetchItem>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DBFileInfo {
    pub file_size: u64,
    pub space_used: u64,
}

/// The abstract per-shard persistence contract.
///
/// Mutating operations are only valid on a read-write instance; calling
/// them on a read-only sibling is a logic error and panics.
pub trait KVStore: Send + Sync {
    /// Open a transaction. Panics on a read-only store or when one is
    /// already open.
    fn begin(&self);

    /// Persist the accumulated batch plus, when present, the collections
    /// manifest update, then release the transaction. On failure the batch
    /// is kept and the transaction stays open.
    fn commit(&self, collections_manifest: Option<&Item>) -> bool;

    /// Discard the current batch and release the transaction.
    fn rollback_batch(&self);

    fn set(&self, item: Item, cb: SetCallback);

    fn del(&self, item: Item, cb: DelCallback);

    fn get(&self, key: &DocKey, vbucket: VBucketId, fetch_deleted: bool) -> GetValue;

    fn get_multi(&self, vbucket: VBucketId, fetches: &mut BgFetchQueue);

    fn get_all_keys(
        &self,
        vbucket: VBucketId,
        start_key: &DocKey,
        count: usize,
        cb: AllKeysCallback,
    ) -> Status;

    fn snapshot_vbucket(
        &self,
        vbucket: VBucketId,
        state: &VBucketState,
        persist: VBStatePersist,
    ) -> bool;

    fn compact_db(&self, ctx: &mut CompactionContext) -> bool;

    /// Rewind `vbucket` to the newest commit point at or below `seqno`,
    /// reporting every reverted key through `cb`.
    fn rollback(&self, vbucket: VBucketId, seqno: u64, cb: RollbackCallback) -> RollbackResult;

    fn init_scan_context(
        &self,
        value_cb: ScanValueCallback,
        cache_cb: CacheLookupCallback,
        vbucket: VBucketId,
        start_seqno: u64,
        doc_filter: DocumentFilter,
        value_filter: ValueFilter,
    ) -> Option<ScanContext>;

    fn scan(&self, ctx: &mut ScanContext) -> ScanStatus;

    fn destroy_scan_context(&self, ctx: ScanContext);

    fn list_persisted_vbuckets(&self) -> Vec<(VBucketId, VBucketState)>;

    fn get_vbucket_state(&self, vbucket: VBucketId) -> Option<VBucketState>;

    fn get_num_persisted_deletes(&self, vbucket: VBucketId) -> Result<u64, Status>;

    fn get_db_file_info(&self, vbucket: VBucketId) -> Result<DBFileInfo, Status>;

    fn get_aggr_db_file_info(&self) -> DBFileInfo;

    fn get_num_items(&self, vbucket: VBucketId, min_seq: u64, max_seq: u64) -> Result<u64, Status>;

    fn get_item_count(&self, vbucket: VBucketId) -> Result<u64, Status>;

    fn get_last_persisted_seqno(&self, vbucket: VBucketId) -> u64;

    /// The persisted manifest JSON, or an empty string when none exists.
    fn get_collections_manifest(&self, vbucket: VBucketId) -> String;

    /// Full open/write/commit of the manifest outside a batch.
    fn persist_collections_manifest_item(&self, vbucket: VBucketId, item: &Item) -> bool;

    /// The in-memory view used to validate collection keys.
    fn collections_view(&self, vbucket: VBucketId) -> CollectionsView;

    fn increment_revision(&self, vbucket: VBucketId);

    /// Drop cached state for a vBucket about to be deleted, returning the
    /// revision that must later be unlinked via `del_vbucket`.
    fn prepare_to_delete(&self, vbucket: VBucketId) -> u64;

    fn del_vbucket(&self, vbucket: VBucketId, revision: u64);

    /// Reset a vBucket to a clean state under a fresh revision.
    fn reset(&self, vbucket: VBucketId);

    /// Unlink files whose revisions were superseded, once nothing holds
    /// them open.
    fn pending_tasks(&self);

    fn add_stats(&self, visitor: &mut dyn FnMut(&str, String));

    fn get_stat(&self, name: &str) -> Option<u64>;

    fn is_read_only(&self) -> bool;
}
