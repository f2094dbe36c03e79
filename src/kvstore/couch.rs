//! Couch-format KVStore.
//!
//! A read-write instance owns the per-vBucket file revision map and
//! executes transactions, compaction and rollback against the current
//! revision; `make_read_only_store` yields a read-only sibling sharing the
//! same revision cells, so both observe a newly published revision the
//! instant a compaction (or rollback) stores it.
//!
//! Revision lifecycle: a revision is born at first persist, bumped by
//! compaction or rollback, and unlinked once superseded. Superseded file
//! paths pass through a lock-free queue drained by `pending_tasks`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use crossbeam::queue::SegQueue;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::collections::{CollectionsView, Manifest};
use crate::couch::{
    CouchError, CouchFile, DocInfo, FileHeader, LOCAL_COLLECTIONS_MANIFEST, LOCAL_VBSTATE,
};
use crate::error::Status;
use crate::io::{CountingFileOps, FileOps, RawFileOps};
use crate::item::{datatype, DocKey, DocNamespace, Item, Operation, SystemEvent, VBucketId};
use crate::kvstore::{
    AllKeysCallback, BgFetchQueue, CacheLookup, CacheLookupCallback, CacheLookupStatus,
    CompactionContext, DBFileInfo, DelCallback, DocumentFilter, GetValue, KVStore,
    MutationResult, RollbackCallback, RollbackResult, ScanCallbackStatus, ScanContext,
    ScanStatus, ScanValueCallback, SetCallback, VBStatePersist, ValueFilter,
};
use crate::metadata::MetaData;
use crate::stats::KVStoreStats;
use crate::systemevent::SystemEventFlush;
use crate::vbucket_state::{BucketState, VBucketState};

/// Attempts made to open a vBucket file before giving up. The second
/// attempt re-reads the directory to pick up a revision published by a
/// concurrent compaction.
const OPEN_ATTEMPTS: u32 = 2;

#[derive(Debug, Clone)]
pub struct KVStoreConfig {
    pub db_dir: PathBuf,
    pub max_vbuckets: u16,
    pub shard_id: u16,
}

impl KVStoreConfig {
    pub fn new(db_dir: impl Into<PathBuf>, max_vbuckets: u16, shard_id: u16) -> Self {
        Self {
            db_dir: db_dir.into(),
            max_vbuckets,
            shard_id,
        }
    }
}

/// Per-vBucket current file revision.
///
/// Publishers store with release after the new file is durable; openers
/// load with acquire.
#[derive(Debug)]
pub(crate) struct RevisionMap {
    cells: Vec<AtomicU64>,
}

impl RevisionMap {
    fn new(len: usize) -> Self {
        Self {
            cells: (0..len).map(|_| AtomicU64::new(1)).collect(),
        }
    }

    pub(crate) fn get(&self, vbucket: VBucketId) -> u64 {
        self.cells[vbucket as usize].load(Ordering::Acquire)
    }

    pub(crate) fn set(&self, vbucket: VBucketId, revision: u64) {
        self.cells[vbucket as usize].store(revision, Ordering::Release);
    }

    pub(crate) fn bump(&self, vbucket: VBucketId) -> u64 {
        self.cells[vbucket as usize].fetch_add(1, Ordering::AcqRel) + 1
    }
}

enum Completion {
    Set(SetCallback),
    Del(DelCallback),
    None,
}

/// One queued write. The item keeps every referenced buffer alive until
/// the commit that persists it returns.
struct PendingRequest {
    item: Item,
    delete: bool,
    raw_meta: Option<Bytes>,
    completion: Completion,
}

pub struct CouchKVStore {
    config: KVStoreConfig,
    read_only: bool,
    rev_map: Arc<RevisionMap>,
    intransaction: AtomicBool,
    pending: Mutex<Vec<PendingRequest>>,
    cached_states: RwLock<Vec<Option<VBucketState>>>,
    manifest_views: RwLock<HashMap<VBucketId, (Bytes, CollectionsView)>>,
    cached_file_size: Vec<AtomicU64>,
    cached_space_used: Vec<AtomicU64>,
    cached_delete_count: Vec<AtomicU64>,
    stats: KVStoreStats,
    ops: Arc<dyn FileOps>,
    compaction_ops: Arc<dyn FileOps>,
    pending_file_deletions: Arc<SegQueue<PathBuf>>,
    scan_counter: AtomicU64,
    scans: Mutex<HashMap<u64, CouchFile>>,
}

impl CouchKVStore {
    /// Create a read-write store over `config.db_dir`, recovering revision
    /// and vBucket state from any files already present.
    pub fn new(config: KVStoreConfig) -> anyhow::Result<Self> {
        Self::with_file_ops(config, Arc::new(RawFileOps))
    }

    /// As `new`, with a caller-supplied base `FileOps` (fault injection).
    pub fn with_file_ops(
        config: KVStoreConfig,
        base_ops: Arc<dyn FileOps>,
    ) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.db_dir)
            .with_context(|| format!("create db dir {:?}", config.db_dir))?;

        let rev_map = Arc::new(RevisionMap::new(config.max_vbuckets as usize));
        let store = Self::build(config, base_ops, false, rev_map);
        store.initialize()?;
        Ok(store)
    }

    /// A read-only sibling sharing this store's revision map. The sibling
    /// observes revision publications immediately but panics on any
    /// mutating operation.
    pub fn make_read_only_store(&self) -> anyhow::Result<CouchKVStore> {
        if self.read_only {
            panic!("CouchKVStore::make_read_only_store: already read-only");
        }
        let store = Self::build(
            self.config.clone(),
            Arc::new(RawFileOps),
            true,
            Arc::clone(&self.rev_map),
        );
        store.initialize()?;
        Ok(store)
    }

    fn build(
        config: KVStoreConfig,
        base_ops: Arc<dyn FileOps>,
        read_only: bool,
        rev_map: Arc<RevisionMap>,
    ) -> Self {
        let stats = KVStoreStats::new();
        let ops: Arc<dyn FileOps> = Arc::new(CountingFileOps::new(
            Arc::clone(&base_ops),
            Arc::clone(&stats.fs_stats),
        ));
        let compaction_ops: Arc<dyn FileOps> = Arc::new(CountingFileOps::new(
            base_ops,
            Arc::clone(&stats.fs_stats_compaction),
        ));

        let n = config.max_vbuckets as usize;
        Self {
            config,
            read_only,
            rev_map,
            intransaction: AtomicBool::new(false),
            pending: Mutex::new(Vec::new()),
            cached_states: RwLock::new(vec![None; n]),
            manifest_views: RwLock::new(HashMap::new()),
            cached_file_size: (0..n).map(|_| AtomicU64::new(0)).collect(),
            cached_space_used: (0..n).map(|_| AtomicU64::new(0)).collect(),
            cached_delete_count: (0..n).map(|_| AtomicU64::new(0)).collect(),
            stats,
            ops,
            compaction_ops,
            pending_file_deletions: Arc::new(SegQueue::new()),
            scan_counter: AtomicU64::new(0),
            scans: Mutex::new(HashMap::new()),
        }
    }

    /// Scan the database directory, publish the newest revision per
    /// vBucket and warm the cached states. Stale compaction leftovers are
    /// removed.
    fn initialize(&self) -> anyhow::Result<()> {
        let mut newest: BTreeMap<VBucketId, u64> = BTreeMap::new();
        for entry in std::fs::read_dir(&self.config.db_dir)
            .with_context(|| format!("read db dir {:?}", self.config.db_dir))?
        {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };

            if name.ends_with(".compact") {
                if !self.read_only {
                    info!(file = name, "removing stale compaction file");
                    let _ = std::fs::remove_file(entry.path());
                }
                continue;
            }

            if let Some((vbucket, revision)) = parse_couch_file(name) {
                if (vbucket as usize) < self.config.max_vbuckets as usize {
                    let slot = newest.entry(vbucket).or_insert(revision);
                    *slot = (*slot).max(revision);
                }
            }
        }

        for (vbucket, revision) in newest {
            if !self.read_only {
                self.rev_map.set(vbucket, revision);
            }
            if let Err(error) = self.warm_vbucket(vbucket) {
                warn!(vbucket, %error, "failed to load persisted vbucket state");
            }
        }
        Ok(())
    }

    fn warm_vbucket(&self, vbucket: VBucketId) -> crate::couch::Result<()> {
        let file = self.open_db(vbucket, self.rev_map.get(vbucket), false, &self.ops)?;

        let state = match file.local_doc(LOCAL_VBSTATE) {
            Some(raw) => match VBucketState::from_json(raw) {
                Ok(state) => Some(state),
                Err(error) => {
                    warn!(vbucket, %error, "unreadable persisted vbucket state");
                    None
                }
            },
            None => None,
        };
        self.cached_states.write()[vbucket as usize] = state;

        self.update_cached_counters(vbucket, &file);
        self.refresh_collections_view(vbucket, &file);
        file.close();
        Ok(())
    }

    fn db_path(&self, vbucket: VBucketId, revision: u64) -> PathBuf {
        self.config
            .db_dir
            .join(format!("{vbucket}.couch.{revision}"))
    }

    fn compact_path(&self, vbucket: VBucketId, revision: u64) -> PathBuf {
        self.config
            .db_dir
            .join(format!("{vbucket}.couch.{revision}.compact"))
    }

    fn stat_prefix(&self) -> String {
        format!(
            "{}_{}",
            if self.read_only { "ro" } else { "rw" },
            self.config.shard_id
        )
    }

    fn assert_writable(&self, operation: &str) {
        if self.read_only {
            panic!("CouchKVStore::{operation}: not valid on a read-only store");
        }
    }

    fn open_db(
        &self,
        vbucket: VBucketId,
        revision: u64,
        create: bool,
        ops: &Arc<dyn FileOps>,
    ) -> crate::couch::Result<CouchFile> {
        let path = self.db_path(vbucket, revision);
        if create {
            CouchFile::create(path, Arc::clone(ops))
        } else {
            CouchFile::open(path, Arc::clone(ops))
        }
    }

    /// Open the current revision with a bounded retry: a failed first
    /// attempt re-reads the directory in case a compaction published a new
    /// revision between the map load and the open.
    fn open_db_retry(
        &self,
        vbucket: VBucketId,
        create: bool,
    ) -> crate::couch::Result<(CouchFile, u64)> {
        let mut revision = self.rev_map.get(vbucket);
        let mut attempt = 1;
        loop {
            match self.open_db(vbucket, revision, create, &self.ops) {
                Ok(file) => return Ok((file, revision)),
                Err(error) if attempt < OPEN_ATTEMPTS => {
                    info!(
                        vbucket,
                        revision,
                        attempt,
                        %error,
                        "vbucket file open failed; re-checking revision and retrying"
                    );
                    if let Some(newest) = self.newest_rev_on_disk(vbucket) {
                        if newest != revision {
                            revision = newest;
                            if !self.read_only {
                                self.rev_map.set(vbucket, revision);
                            }
                        }
                    }
                    attempt += 1;
                }
                Err(error) => {
                    warn!(vbucket, revision, %error, "vbucket file open failed");
                    return Err(error);
                }
            }
        }
    }

    fn newest_rev_on_disk(&self, vbucket: VBucketId) -> Option<u64> {
        let entries = std::fs::read_dir(&self.config.db_dir).ok()?;
        let mut newest = None;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some((vb, rev)) = parse_couch_file(name) {
                if vb == vbucket {
                    newest = Some(newest.map_or(rev, |n: u64| n.max(rev)));
                }
            }
        }
        newest
    }

    fn couch_err_to_status(&self, error: &CouchError) -> Status {
        match error {
            CouchError::Io(e) if e.kind() == std::io::ErrorKind::NotFound => Status::SystemError,
            CouchError::Io(_) => Status::IoError,
            CouchError::Corrupt(_) | CouchError::NoHeader => Status::TempFail,
        }
    }

    fn cached_state(&self, vbucket: VBucketId) -> Option<VBucketState> {
        self.cached_states.read()[vbucket as usize].clone()
    }

    fn update_cached_counters(&self, vbucket: VBucketId, file: &CouchFile) {
        let vb = vbucket as usize;
        self.cached_file_size[vb].store(file.file_size(), Ordering::Relaxed);
        self.cached_space_used[vb].store(file.space_used(), Ordering::Relaxed);
        self.cached_delete_count[vb].store(file.num_deleted(), Ordering::Relaxed);
    }

    /// The collections view for the manifest persisted in `file`. Views
    /// are cached keyed by the raw manifest bytes, so both this store and
    /// a sibling always validate against what is actually on disk.
    fn refresh_collections_view(&self, vbucket: VBucketId, file: &CouchFile) -> CollectionsView {
        let Some(raw) = file.local_doc(LOCAL_COLLECTIONS_MANIFEST).cloned() else {
            return CollectionsView::default();
        };

        if let Some((cached_raw, view)) = self.manifest_views.read().get(&vbucket) {
            if *cached_raw == raw {
                return view.clone();
            }
        }

        match Manifest::from_json(&raw) {
            Ok(manifest) => {
                let mut view = self
                    .manifest_views
                    .read()
                    .get(&vbucket)
                    .map(|(_, v)| v.clone())
                    .unwrap_or_default();
                view.apply(&manifest);
                self.manifest_views
                    .write()
                    .insert(vbucket, (raw, view.clone()));
                view
            }
            Err(error) => {
                warn!(vbucket, %error, "unreadable persisted collections manifest");
                CollectionsView::default()
            }
        }
    }

    fn apply_manifest_bytes(&self, vbucket: VBucketId, raw: &Bytes) {
        match Manifest::from_json(raw) {
            Ok(manifest) => {
                let mut views = self.manifest_views.write();
                let view = match views.remove(&vbucket) {
                    Some((_, mut view)) => {
                        view.apply(&manifest);
                        view
                    }
                    None => CollectionsView::from_manifest(&manifest),
                };
                views.insert(vbucket, (raw.clone(), view));
            }
            Err(error) => {
                warn!(vbucket, %error, "rejecting malformed collections manifest")
            }
        }
    }

    /// Materialize an item from its index entry, reading the body unless
    /// `meta_only`.
    fn fetch_doc(
        &self,
        file: &CouchFile,
        key: &DocKey,
        info: &DocInfo,
        vbucket: VBucketId,
        meta_only: bool,
    ) -> Result<Item, Status> {
        let meta = match MetaData::decode(&info.rev_meta) {
            Ok(meta) => meta,
            Err(error) => {
                warn!(vbucket, %error, "malformed document metadata");
                return Err(Status::TempFail);
            }
        };

        let value = match info.body {
            Some(handle) if !meta_only => match file.read_body(handle) {
                Ok(body) => body,
                Err(error) => {
                    warn!(vbucket, %error, "failed to read document body");
                    return Err(self.couch_err_to_status(&error));
                }
            },
            _ => Bytes::new(),
        };

        let operation = if info.deleted {
            Operation::Deletion
        } else if key.namespace() == DocNamespace::System {
            match SystemEvent::from_flags(meta.flags()) {
                Some(event) => Operation::SystemEvent(event),
                None => Operation::Mutation,
            }
        } else {
            Operation::Mutation
        };

        self.stats.io_num_read.fetch_add(1, Ordering::Relaxed);
        self.stats.io_read_bytes.fetch_add(
            (key.bytes().len() + info.rev_meta.len() + value.len()) as u64,
            Ordering::Relaxed,
        );

        Ok(Item {
            key: key.clone(),
            value,
            vbucket,
            cas: meta.cas(),
            expiry: meta.expiry(),
            flags: meta.flags(),
            datatype: meta.datatype(),
            by_seqno: info.seqno,
            operation,
        })
    }

    /// Read path against an already-open handle.
    pub fn get_with_header(
        &self,
        file: &CouchFile,
        key: &DocKey,
        vbucket: VBucketId,
        fetch_deleted: bool,
    ) -> GetValue {
        self.get_with_header_inner(file, key, vbucket, fetch_deleted, false)
    }

    fn get_with_header_inner(
        &self,
        file: &CouchFile,
        key: &DocKey,
        vbucket: VBucketId,
        fetch_deleted: bool,
        meta_only: bool,
    ) -> GetValue {
        if key.namespace() == DocNamespace::Collections {
            let view = self.refresh_collections_view(vbucket, file);
            if !view.does_key_contain_valid_collection(key) {
                return GetValue::miss(Status::UnknownCollection);
            }
        }

        match file.doc_info(&key.tagged()) {
            None => GetValue::miss(Status::KeyNotFound),
            Some(info) if info.deleted && !fetch_deleted => GetValue::miss(Status::KeyNotFound),
            Some(info) => {
                let info = info.clone();
                match self.fetch_doc(file, key, &info, vbucket, meta_only) {
                    Ok(item) => GetValue::found(item),
                    Err(status) => {
                        self.stats.num_get_failure.fetch_add(1, Ordering::Relaxed);
                        GetValue::miss(status)
                    }
                }
            }
        }
    }

    /// Append the marker document for a manifest-updating event unless the
    /// batch already carries it. Create and SeparatorChanged upsert;
    /// the delete variants tombstone the create-keyed marker.
    fn ensure_marker_queued(reqs: &mut Vec<PendingRequest>, manifest_item: &Item) {
        let Some(event) = manifest_item.system_event() else {
            return;
        };
        if event == SystemEvent::BeginDeleteCollection {
            return;
        }
        let already_queued = reqs.iter().any(|req| {
            req.item.key == manifest_item.key && req.item.by_seqno == manifest_item.by_seqno
        });
        if already_queued {
            return;
        }
        reqs.push(PendingRequest {
            delete: !SystemEventFlush::is_upsert(manifest_item),
            raw_meta: None,
            item: manifest_item.clone(),
            completion: Completion::None,
        });
    }

    /// The write half of commit: everything between opening the file and
    /// the durable header.
    fn save_docs(
        &self,
        vbucket: VBucketId,
        manifest: Option<&Item>,
        reqs: &mut Vec<PendingRequest>,
    ) -> crate::couch::Result<Vec<bool>> {
        let (mut file, _revision) = self.open_db_retry(vbucket, true)?;

        if let Some(manifest_item) = manifest {
            Self::ensure_marker_queued(reqs, manifest_item);
        }

        let mut inserted = Vec::with_capacity(reqs.len());
        let mut max_deleted_seqno = 0u64;
        for req in reqs.iter() {
            let tagged = req.item.key.tagged();
            let meta_bytes = match &req.raw_meta {
                Some(raw) => raw.clone(),
                None => Bytes::copy_from_slice(
                    &MetaData::new(
                        req.item.cas,
                        req.item.expiry,
                        req.item.flags,
                        req.item.datatype,
                    )
                    .encode(),
                ),
            };

            let body = if req.item.value.is_empty() {
                None
            } else {
                Some(file.append_body(&req.item.value)?)
            };

            if req.delete {
                max_deleted_seqno = max_deleted_seqno.max(req.item.by_seqno);
            }

            let physical_size =
                (tagged.len() + meta_bytes.len() + req.item.value.len()) as u32;
            inserted.push(file.doc_info(&tagged).is_none());
            file.upsert(
                tagged,
                DocInfo {
                    seqno: req.item.by_seqno,
                    rev_meta: meta_bytes.clone(),
                    deleted: req.delete,
                    datatype: req.item.datatype,
                    body,
                    physical_size,
                },
            );

            self.stats.io_num_write.fetch_add(1, Ordering::Relaxed);
            self.stats.io_write_bytes.fetch_add(
                (req.item.key.bytes().len() + meta_bytes.len() + req.item.value.len()) as u64,
                Ordering::Relaxed,
            );
        }

        let manifest_bytes = manifest.map(|item| item.value.clone());
        if let Some(raw) = &manifest_bytes {
            file.set_local_doc(LOCAL_COLLECTIONS_MANIFEST, raw.clone());
        }

        let mut state = self
            .cached_state(vbucket)
            .unwrap_or_else(|| VBucketState::new(BucketState::Active));
        state.high_seqno = file.header().update_seq;
        state.max_deleted_seqno = state.max_deleted_seqno.max(max_deleted_seqno);
        file.set_local_doc(LOCAL_VBSTATE, Bytes::from(state.to_json()));

        // The single durability point for the whole batch.
        file.write_header(true)?;

        self.cached_states.write()[vbucket as usize] = Some(state);
        self.update_cached_counters(vbucket, &file);
        if let Some(raw) = &manifest_bytes {
            self.apply_manifest_bytes(vbucket, raw);
        }
        file.close();
        Ok(inserted)
    }

    fn rewrite_as_revision(
        &self,
        vbucket: VBucketId,
        source: &CouchFile,
        header: &FileHeader,
        new_revision: u64,
        ops: &Arc<dyn FileOps>,
    ) -> crate::couch::Result<CouchFile> {
        let tmp_path = self.compact_path(vbucket, new_revision);
        let mut dst = CouchFile::create(&tmp_path, Arc::clone(ops))?;

        for (key, info) in &header.by_id {
            let body = match info.body {
                Some(handle) => Some(dst.append_body(&source.read_body(handle)?)?),
                None => None,
            };
            dst.upsert(
                key.clone(),
                DocInfo {
                    body,
                    ..info.clone()
                },
            );
        }

        {
            let dst_header = dst.header_mut();
            dst_header.update_seq = header.update_seq;
            dst_header.purge_seq = header.purge_seq;
            dst_header.local_docs = header.local_docs.clone();
        }
        dst.write_header(true)?;
        Ok(dst)
    }

    fn publish_revision(
        &self,
        vbucket: VBucketId,
        old_revision: u64,
        new_revision: u64,
        tmp_path: &Path,
    ) -> crate::couch::Result<()> {
        let final_path = self.db_path(vbucket, new_revision);
        std::fs::rename(tmp_path, &final_path)?;
        fsync_parent_dir(&final_path)?;

        self.rev_map.set(vbucket, new_revision);
        self.pending_file_deletions
            .push(self.db_path(vbucket, old_revision));
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn set_with_raw_meta(&self, item: Item, raw_meta: Bytes, cb: SetCallback) {
        self.assert_writable("set");
        assert!(
            self.intransaction.load(Ordering::SeqCst),
            "CouchKVStore::set: no transaction open"
        );
        self.pending.lock().push(PendingRequest {
            item,
            delete: false,
            raw_meta: Some(raw_meta),
            completion: Completion::Set(cb),
        });
    }
}

impl KVStore for CouchKVStore {
    fn begin(&self) {
        self.assert_writable("begin");
        if self.intransaction.swap(true, Ordering::SeqCst) {
            panic!("CouchKVStore::begin: transaction already open");
        }
    }

    fn commit(&self, collections_manifest: Option<&Item>) -> bool {
        self.assert_writable("commit");
        if !self.intransaction.load(Ordering::SeqCst) {
            panic!("CouchKVStore::commit: no transaction open");
        }

        let mut reqs = std::mem::take(&mut *self.pending.lock());
        let vbucket = reqs
            .first()
            .map(|req| req.item.vbucket)
            .or_else(|| collections_manifest.map(|item| item.vbucket));
        let Some(vbucket) = vbucket else {
            // Nothing queued and no manifest: an empty commit is a no-op.
            self.intransaction.store(false, Ordering::SeqCst);
            return true;
        };

        match self.save_docs(vbucket, collections_manifest, &mut reqs) {
            Ok(inserted) => {
                self.stats
                    .docs_committed
                    .store(reqs.len() as u64, Ordering::Relaxed);
                for (req, inserted) in reqs.into_iter().zip(inserted) {
                    match req.completion {
                        Completion::Set(cb) => cb(MutationResult {
                            status: Status::Success,
                            inserted,
                        }),
                        Completion::Del(cb) => cb(Status::Success),
                        Completion::None => {}
                    }
                }
                self.intransaction.store(false, Ordering::SeqCst);
                true
            }
            Err(error) => {
                warn!(vbucket, %error, "commit failed; batch retained");
                // Put the batch back so the flusher can retry the commit.
                let mut pending = self.pending.lock();
                reqs.append(&mut pending);
                *pending = reqs;
                false
            }
        }
    }

    fn rollback_batch(&self) {
        self.assert_writable("rollback");
        if self.intransaction.swap(false, Ordering::SeqCst) {
            self.pending.lock().clear();
        }
    }

    fn set(&self, item: Item, cb: SetCallback) {
        self.assert_writable("set");
        assert!(
            self.intransaction.load(Ordering::SeqCst),
            "CouchKVStore::set: no transaction open"
        );
        self.pending.lock().push(PendingRequest {
            item,
            delete: false,
            raw_meta: None,
            completion: Completion::Set(cb),
        });
    }

    fn del(&self, item: Item, cb: DelCallback) {
        self.assert_writable("del");
        assert!(
            self.intransaction.load(Ordering::SeqCst),
            "CouchKVStore::del: no transaction open"
        );
        self.pending.lock().push(PendingRequest {
            item,
            delete: true,
            raw_meta: None,
            completion: Completion::Del(cb),
        });
    }

    fn get(&self, key: &DocKey, vbucket: VBucketId, fetch_deleted: bool) -> GetValue {
        let file = match self.open_db(vbucket, self.rev_map.get(vbucket), false, &self.ops) {
            Ok(file) => file,
            Err(error) => {
                let status = self.couch_err_to_status(&error);
                if status != Status::SystemError {
                    warn!(vbucket, %error, "get failed to open vbucket file");
                } else {
                    debug!(vbucket, "get on never-persisted vbucket");
                }
                self.stats.num_get_failure.fetch_add(1, Ordering::Relaxed);
                return GetValue::miss(status);
            }
        };
        let value = self.get_with_header(&file, key, vbucket, fetch_deleted);
        file.close();
        value
    }

    fn get_multi(&self, vbucket: VBucketId, fetches: &mut BgFetchQueue) {
        let file = match self.open_db(vbucket, self.rev_map.get(vbucket), false, &self.ops) {
            Ok(file) => file,
            Err(error) => {
                warn!(vbucket, %error, "getMulti failed to open vbucket file");
                let status = self.couch_err_to_status(&error);
                self.stats
                    .num_get_failure
                    .fetch_add(fetches.len() as u64, Ordering::Relaxed);
                for fetch in fetches.values_mut() {
                    fetch.value = GetValue::miss(status);
                }
                return;
            }
        };

        for (key, fetch) in fetches.iter_mut() {
            fetch.value =
                self.get_with_header_inner(&file, key, vbucket, true, fetch.meta_only);
        }
        file.close();
    }

    fn get_all_keys(
        &self,
        vbucket: VBucketId,
        start_key: &DocKey,
        count: usize,
        mut cb: AllKeysCallback,
    ) -> Status {
        let file = match self.open_db(vbucket, self.rev_map.get(vbucket), false, &self.ops) {
            Ok(file) => file,
            Err(error) => {
                warn!(vbucket, %error, "getAllKeys failed to open vbucket file");
                return self.couch_err_to_status(&error);
            }
        };

        let start = start_key.tagged();
        let mut emitted = 0usize;
        for (tagged, info) in file.header().by_id.range(start..) {
            if emitted == count {
                break;
            }
            if info.deleted {
                continue;
            }
            if let Some(key) = DocKey::from_tagged(tagged) {
                cb(&key);
                emitted += 1;
            }
        }
        file.close();
        Status::Success
    }

    fn snapshot_vbucket(
        &self,
        vbucket: VBucketId,
        state: &VBucketState,
        persist: VBStatePersist,
    ) -> bool {
        self.assert_writable("snapshotVBucket");
        self.cached_states.write()[vbucket as usize] = Some(state.clone());
        if persist == VBStatePersist::NotPersist {
            return true;
        }

        let (mut file, _revision) = match self.open_db_retry(vbucket, true) {
            Ok(opened) => opened,
            Err(error) => {
                warn!(vbucket, %error, "snapshotVBucket failed to open vbucket file");
                return false;
            }
        };
        file.set_local_doc(LOCAL_VBSTATE, Bytes::from(state.to_json()));
        match file.write_header(persist == VBStatePersist::PersistWithCommit) {
            Ok(()) => {
                self.update_cached_counters(vbucket, &file);
                file.close();
                true
            }
            Err(error) => {
                warn!(vbucket, %error, "snapshotVBucket failed to persist state");
                false
            }
        }
    }

    fn compact_db(&self, ctx: &mut CompactionContext) -> bool {
        self.assert_writable("compactDB");
        let vbucket = ctx.vbucket;
        let revision = self.rev_map.get(vbucket);
        let new_revision = revision + 1;

        let source = match self.open_db(vbucket, revision, false, &self.compaction_ops) {
            Ok(file) => file,
            Err(error) => {
                warn!(vbucket, revision, %error, "compaction failed to open source file");
                self.stats
                    .num_compaction_failure
                    .fetch_add(1, Ordering::Relaxed);
                return false;
            }
        };

        match self.compact_into(ctx, &source, new_revision) {
            Ok(dst) => {
                let tmp_path = dst.path().to_path_buf();
                self.update_from_compacted(ctx, &dst);
                dst.close();
                source.close();
                if let Err(error) =
                    self.publish_revision(vbucket, revision, new_revision, &tmp_path)
                {
                    warn!(vbucket, %error, "failed to publish compacted revision");
                    let _ = std::fs::remove_file(&tmp_path);
                    self.stats
                        .num_compaction_failure
                        .fetch_add(1, Ordering::Relaxed);
                    return false;
                }
                debug!(vbucket, revision = new_revision, "compaction complete");
                true
            }
            Err(error) => {
                warn!(vbucket, %error, "compaction failed; original revision preserved");
                let _ = std::fs::remove_file(self.compact_path(vbucket, new_revision));
                self.stats
                    .num_compaction_failure
                    .fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    fn rollback(
        &self,
        vbucket: VBucketId,
        seqno: u64,
        mut cb: RollbackCallback,
    ) -> RollbackResult {
        self.assert_writable("rollback");
        let revision = self.rev_map.get(vbucket);
        let file = match self.open_db(vbucket, revision, false, &self.ops) {
            Ok(file) => file,
            Err(error) => {
                warn!(vbucket, %error, "rollback failed to open vbucket file");
                return RollbackResult::failed();
            }
        };

        let state = self.cached_state(vbucket).unwrap_or_else(|| {
            VBucketState::new(BucketState::Active)
        });
        if file.header().update_seq <= seqno {
            return RollbackResult {
                success: true,
                high_seqno: file.header().update_seq,
                snap_start_seqno: state.snap_start,
                snap_end_seqno: state.snap_end,
                failover_entry: state.failover_table.first().copied(),
            };
        }

        // Walk backward through commit points, collecting every key
        // mutated after the target along the way.
        let mut reverted: BTreeSet<Bytes> = file
            .header()
            .by_seq
            .range((Bound::Excluded(seqno), Bound::Unbounded))
            .map(|(_, key)| key.clone())
            .collect();
        let mut offset = file
            .header_offset()
            .expect("open file with docs has a header");
        let target = loop {
            match file.previous_header(offset) {
                Ok(Some((older_offset, header))) => {
                    if header.update_seq <= seqno {
                        break Some(header);
                    }
                    reverted.extend(
                        header
                            .by_seq
                            .range((Bound::Excluded(seqno), Bound::Unbounded))
                            .map(|(_, key)| key.clone()),
                    );
                    offset = older_offset;
                }
                Ok(None) => break None,
                Err(error) => {
                    warn!(vbucket, %error, "vbucket file no longer valid during rollback");
                    return RollbackResult::failed();
                }
            }
        };
        let Some(target) = target else {
            // Nothing retained at or below the requested seqno; the
            // caller has to resync from scratch.
            warn!(
                vbucket,
                seqno, "rollback target predates the oldest retained commit"
            );
            return RollbackResult::failed();
        };

        let new_revision = revision + 1;
        let dst = match self.rewrite_as_revision(vbucket, &file, &target, new_revision, &self.ops)
        {
            Ok(dst) => dst,
            Err(error) => {
                warn!(vbucket, %error, "rollback failed to materialize rewind point");
                let _ = std::fs::remove_file(self.compact_path(vbucket, new_revision));
                return RollbackResult::failed();
            }
        };
        let tmp_path = dst.path().to_path_buf();
        if let Err(error) = self.publish_revision(vbucket, revision, new_revision, &tmp_path) {
            warn!(vbucket, %error, "rollback failed to publish rewind revision");
            let _ = std::fs::remove_file(&tmp_path);
            return RollbackResult::failed();
        }

        let state = match target.local_docs.get(LOCAL_VBSTATE) {
            Some(raw) => VBucketState::from_json(raw).unwrap_or(state),
            None => state,
        };
        self.cached_states.write()[vbucket as usize] = Some(state.clone());
        self.update_cached_counters(vbucket, &dst);

        for tagged in reverted {
            let Some(key) = DocKey::from_tagged(&tagged) else {
                continue;
            };
            match dst.doc_info(&tagged) {
                Some(info) => {
                    let info = info.clone();
                    match self.fetch_doc(&dst, &key, &info, vbucket, false) {
                        Ok(item) => cb(GetValue::found(item)),
                        Err(status) => cb(GetValue::miss(status)),
                    }
                }
                None => cb(GetValue {
                    status: Status::KeyNotFound,
                    item: Some(Item::deletion(key, 0).with_vbucket(vbucket)),
                }),
            }
        }

        file.close();
        dst.close();
        RollbackResult {
            success: true,
            high_seqno: target.update_seq,
            snap_start_seqno: state.snap_start,
            snap_end_seqno: state.snap_end,
            failover_entry: state.failover_table.first().copied(),
        }
    }

    fn init_scan_context(
        &self,
        value_cb: ScanValueCallback,
        cache_cb: CacheLookupCallback,
        vbucket: VBucketId,
        start_seqno: u64,
        doc_filter: DocumentFilter,
        value_filter: ValueFilter,
    ) -> Option<ScanContext> {
        let (file, _revision) = match self.open_db_retry(vbucket, false) {
            Ok(opened) => opened,
            Err(error) => {
                warn!(vbucket, %error, "initScanContext failed to open vbucket file");
                return None;
            }
        };

        let end_seqno = file.header().update_seq;
        let id = self.scan_counter.fetch_add(1, Ordering::Relaxed) + 1;
        self.scans.lock().insert(id, file);

        Some(ScanContext {
            id,
            vbucket,
            start_seqno,
            end_seqno,
            doc_filter,
            value_filter,
            value_cb,
            cache_cb,
            last_read_seqno: start_seqno,
        })
    }

    fn scan(&self, ctx: &mut ScanContext) -> ScanStatus {
        let Some(file) = self.scans.lock().remove(&ctx.id) else {
            warn!(scan = ctx.id, "scan called with unknown context");
            return ScanStatus::Failed;
        };
        let status = self.scan_file(&file, ctx);
        self.scans.lock().insert(ctx.id, file);
        status
    }

    fn destroy_scan_context(&self, ctx: ScanContext) {
        self.scans.lock().remove(&ctx.id);
    }

    fn list_persisted_vbuckets(&self) -> Vec<(VBucketId, VBucketState)> {
        self.cached_states
            .read()
            .iter()
            .enumerate()
            .filter_map(|(vb, state)| {
                state
                    .as_ref()
                    .map(|state| (vb as VBucketId, state.clone()))
            })
            .collect()
    }

    fn get_vbucket_state(&self, vbucket: VBucketId) -> Option<VBucketState> {
        self.cached_state(vbucket)
    }

    fn get_num_persisted_deletes(&self, vbucket: VBucketId) -> Result<u64, Status> {
        let file = self
            .open_db(vbucket, self.rev_map.get(vbucket), false, &self.ops)
            .map_err(|e| self.couch_err_to_status(&e))?;
        let deletes = file.num_deleted();
        file.close();
        Ok(deletes)
    }

    fn get_db_file_info(&self, vbucket: VBucketId) -> Result<DBFileInfo, Status> {
        let file = self
            .open_db(vbucket, self.rev_map.get(vbucket), false, &self.ops)
            .map_err(|e| self.couch_err_to_status(&e))?;
        let info = DBFileInfo {
            file_size: file.file_size(),
            space_used: file.space_used(),
        };
        file.close();
        Ok(info)
    }

    fn get_aggr_db_file_info(&self) -> DBFileInfo {
        let mut info = DBFileInfo::default();
        for vb in 0..self.config.max_vbuckets as usize {
            info.file_size += self.cached_file_size[vb].load(Ordering::Relaxed);
            info.space_used += self.cached_space_used[vb].load(Ordering::Relaxed);
        }
        info
    }

    fn get_num_items(
        &self,
        vbucket: VBucketId,
        min_seq: u64,
        max_seq: u64,
    ) -> Result<u64, Status> {
        let file = self
            .open_db(vbucket, self.rev_map.get(vbucket), false, &self.ops)
            .map_err(|e| self.couch_err_to_status(&e))?;
        let header = file.header();
        let count = header
            .by_seq
            .range(min_seq..=max_seq)
            .filter(|(_, key)| {
                header
                    .by_id
                    .get(key.as_ref() as &[u8])
                    .is_some_and(|info| !info.deleted)
            })
            .count() as u64;
        file.close();
        Ok(count)
    }

    fn get_item_count(&self, vbucket: VBucketId) -> Result<u64, Status> {
        let file = self
            .open_db(vbucket, self.rev_map.get(vbucket), false, &self.ops)
            .map_err(|e| self.couch_err_to_status(&e))?;
        let count = file.num_docs();
        file.close();
        Ok(count)
    }

    fn get_last_persisted_seqno(&self, vbucket: VBucketId) -> u64 {
        self.cached_state(vbucket)
            .map(|state| state.high_seqno)
            .unwrap_or(0)
    }

    fn get_collections_manifest(&self, vbucket: VBucketId) -> String {
        let Ok(file) = self.open_db(vbucket, self.rev_map.get(vbucket), false, &self.ops) else {
            return String::new();
        };
        let manifest = file
            .local_doc(LOCAL_COLLECTIONS_MANIFEST)
            .map(|raw| String::from_utf8_lossy(raw).into_owned())
            .unwrap_or_default();
        file.close();
        manifest
    }

    fn persist_collections_manifest_item(&self, vbucket: VBucketId, item: &Item) -> bool {
        self.assert_writable("persistCollectionsManifestItem");
        let (mut file, _revision) = match self.open_db_retry(vbucket, true) {
            Ok(opened) => opened,
            Err(error) => {
                warn!(vbucket, %error, "manifest persist failed to open vbucket file");
                return false;
            }
        };
        file.set_local_doc(LOCAL_COLLECTIONS_MANIFEST, item.value.clone());
        match file.write_header(true) {
            Ok(()) => {
                self.apply_manifest_bytes(vbucket, &item.value);
                self.update_cached_counters(vbucket, &file);
                file.close();
                true
            }
            Err(error) => {
                warn!(vbucket, %error, "manifest persist failed");
                false
            }
        }
    }

    fn collections_view(&self, vbucket: VBucketId) -> CollectionsView {
        match self.open_db(vbucket, self.rev_map.get(vbucket), false, &self.ops) {
            Ok(file) => {
                let view = self.refresh_collections_view(vbucket, &file);
                file.close();
                view
            }
            Err(_) => CollectionsView::default(),
        }
    }

    fn increment_revision(&self, vbucket: VBucketId) {
        self.assert_writable("incrementRevision");
        self.rev_map.bump(vbucket);
    }

    fn prepare_to_delete(&self, vbucket: VBucketId) -> u64 {
        self.assert_writable("prepareToDelete");
        let vb = vbucket as usize;
        self.cached_states.write()[vb] = None;
        self.manifest_views.write().remove(&vbucket);
        self.cached_file_size[vb].store(0, Ordering::Relaxed);
        self.cached_space_used[vb].store(0, Ordering::Relaxed);
        self.cached_delete_count[vb].store(0, Ordering::Relaxed);
        self.rev_map.get(vbucket)
    }

    fn del_vbucket(&self, vbucket: VBucketId, revision: u64) {
        self.assert_writable("delVBucket");
        let path = self.db_path(vbucket, revision);
        if let Err(error) = std::fs::remove_file(&path) {
            if error.kind() != std::io::ErrorKind::NotFound {
                warn!(vbucket, revision, %error, "failed to unlink vbucket file");
            }
        }
    }

    fn reset(&self, vbucket: VBucketId) {
        self.assert_writable("reset");
        let old_revision = self.rev_map.get(vbucket);
        let new_revision = self.rev_map.bump(vbucket);

        let mut state = self
            .cached_state(vbucket)
            .unwrap_or_else(|| VBucketState::new(BucketState::Active));
        state.high_seqno = 0;
        state.purge_seqno = 0;
        state.max_deleted_seqno = 0;
        state.snap_start = 0;
        state.snap_end = 0;

        match self.open_db(vbucket, new_revision, true, &self.ops) {
            Ok(mut file) => {
                file.set_local_doc(LOCAL_VBSTATE, Bytes::from(state.to_json()));
                if let Err(error) = file.write_header(true) {
                    warn!(vbucket, %error, "reset failed to persist clean state");
                    return;
                }
                self.cached_states.write()[vbucket as usize] = Some(state);
                self.manifest_views.write().remove(&vbucket);
                self.update_cached_counters(vbucket, &file);
                file.close();
                self.pending_file_deletions
                    .push(self.db_path(vbucket, old_revision));
            }
            Err(error) => {
                warn!(vbucket, %error, "reset failed to create fresh revision");
            }
        }
    }

    fn pending_tasks(&self) {
        while let Some(path) = self.pending_file_deletions.pop() {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "unlinked superseded vbucket file"),
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
                Err(error) => {
                    warn!(path = %path.display(), %error, "failed to unlink superseded file")
                }
            }
        }
    }

    fn add_stats(&self, visitor: &mut dyn FnMut(&str, String)) {
        self.stats.add_stats(&self.stat_prefix(), visitor);
    }

    fn get_stat(&self, name: &str) -> Option<u64> {
        self.stats.get(name)
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}

impl CouchKVStore {
    fn compact_into(
        &self,
        ctx: &mut CompactionContext,
        source: &CouchFile,
        new_revision: u64,
    ) -> crate::couch::Result<CouchFile> {
        let vbucket = ctx.vbucket;
        let tmp_path = self.compact_path(vbucket, new_revision);
        let mut dst = CouchFile::create(&tmp_path, Arc::clone(&self.compaction_ops))?;

        let header = source.header();
        let mut max_purged = 0u64;
        for (tagged, info) in &header.by_id {
            let mut info = info.clone();
            let key = DocKey::from_tagged(tagged);

            if !info.deleted {
                if let (Some(expiry_cb), Some(key)) = (ctx.expiry_cb.as_mut(), key.as_ref()) {
                    if let Ok(meta) = MetaData::decode(&info.rev_meta) {
                        let expiry = meta.expiry();
                        if expiry > 0 && expiry <= ctx.curr_time && expiry_cb(key, expiry) {
                            info.deleted = true;
                            info.body = None;
                        }
                    }
                }
            }

            if info.deleted
                && ctx.config.drop_deletes
                && info.seqno < ctx.config.purge_before_seq
            {
                max_purged = max_purged.max(info.seqno);
                continue;
            }

            if !info.deleted {
                if let (Some(bloom_cb), Some(key)) = (ctx.bloom_filter_cb.as_mut(), key.as_ref())
                {
                    bloom_cb(key);
                }
            }

            let body = match info.body {
                Some(handle) => Some(dst.append_body(&source.read_body(handle)?)?),
                None => None,
            };
            info.body = body;
            dst.upsert(tagged.clone(), info);
        }

        let purge_seq = header.purge_seq.max(max_purged);
        let mut state = match header.local_docs.get(LOCAL_VBSTATE) {
            Some(raw) => VBucketState::from_json(raw)
                .unwrap_or_else(|_| VBucketState::new(BucketState::Active)),
            None => VBucketState::new(BucketState::Active),
        };
        state.purge_seqno = purge_seq;

        {
            let dst_header = dst.header_mut();
            dst_header.update_seq = header.update_seq;
            dst_header.purge_seq = purge_seq;
            dst_header.local_docs = header.local_docs.clone();
        }
        dst.set_local_doc(LOCAL_VBSTATE, Bytes::from(state.to_json()));
        dst.write_header(true)?;

        ctx.max_purged_seq = max_purged;
        Ok(dst)
    }

    fn update_from_compacted(&self, ctx: &CompactionContext, dst: &CouchFile) {
        let vbucket = ctx.vbucket;
        self.update_cached_counters(vbucket, dst);
        let mut states = self.cached_states.write();
        if let Some(state) = states[vbucket as usize].as_mut() {
            state.purge_seqno = dst.header().purge_seq;
        }
    }

    fn scan_file(&self, file: &CouchFile, ctx: &mut ScanContext) -> ScanStatus {
        let range = (
            Bound::Excluded(ctx.last_read_seqno.max(ctx.start_seqno)),
            Bound::Included(ctx.end_seqno),
        );
        let header = file.header();

        for (&seqno, tagged) in header.by_seq.range(range) {
            let Some(info) = header.by_id.get(tagged) else {
                warn!(vbucket = ctx.vbucket, seqno, "seqno index entry without document");
                return ScanStatus::Failed;
            };
            if info.seqno != seqno {
                // Superseded entry; the newer version appears later.
                ctx.last_read_seqno = seqno;
                continue;
            }
            let Some(key) = DocKey::from_tagged(tagged) else {
                warn!(vbucket = ctx.vbucket, seqno, "undecodable key in seqno index");
                return ScanStatus::Failed;
            };

            let lookup = CacheLookup {
                key: key.clone(),
                by_seqno: seqno,
                vbucket: ctx.vbucket,
            };
            if (ctx.cache_cb)(&lookup) == CacheLookupStatus::Hit {
                ctx.last_read_seqno = seqno;
                continue;
            }

            match ctx.doc_filter {
                DocumentFilter::NoDeletes if info.deleted => {
                    ctx.last_read_seqno = seqno;
                    continue;
                }
                DocumentFilter::DeletesOnly if !info.deleted => {
                    ctx.last_read_seqno = seqno;
                    continue;
                }
                _ => {}
            }

            let meta_only = ctx.value_filter == ValueFilter::KeysOnly;
            let info = info.clone();
            let mut item = match self.fetch_doc(file, &key, &info, ctx.vbucket, meta_only) {
                Ok(item) => item,
                Err(status) => {
                    warn!(vbucket = ctx.vbucket, seqno, %status, "scan failed to read document");
                    self.stats.num_get_failure.fetch_add(1, Ordering::Relaxed);
                    return ScanStatus::Failed;
                }
            };

            if ctx.value_filter == ValueFilter::ValuesDecompressed && item.is_compressed() {
                match zstd::stream::decode_all(&item.value[..]) {
                    Ok(raw) => {
                        item.value = raw.into();
                        item.datatype &= !datatype::COMPRESSED;
                    }
                    Err(error) => {
                        warn!(vbucket = ctx.vbucket, seqno, %error, "scan failed to decompress value");
                        return ScanStatus::Failed;
                    }
                }
            }

            match (ctx.value_cb)(GetValue::found(item)) {
                ScanCallbackStatus::Continue => ctx.last_read_seqno = seqno,
                ScanCallbackStatus::Yield => {
                    ctx.last_read_seqno = seqno;
                    return ScanStatus::Again;
                }
            }
        }
        ScanStatus::Success
    }
}

fn parse_couch_file(name: &str) -> Option<(VBucketId, u64)> {
    let (vbucket, revision) = name.split_once(".couch.")?;
    Some((vbucket.parse().ok()?, revision.parse().ok()?))
}

fn fsync_parent_dir(path: &Path) -> std::io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "no parent dir"))?;
    std::fs::File::open(parent)?.sync_all()?;
    Ok(())
}
