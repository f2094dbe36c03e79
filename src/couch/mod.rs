//! Append-only vBucket database format.
//!
//! One file per vBucket revision, named `<vbid>.couch.<rev>`.
//!
//! File layout:
//! ```text
//! [doc blob | padding | header block]*
//! ```
//!
//! Doc blob (written at any unaligned offset):
//! ```text
//! [body_len u32 LE][crc32c u32 LE][body bytes]
//! ```
//!
//! Header block (only ever starts on a 4096-byte boundary):
//! ```text
//! [0x01][payload_len u32 LE][crc32c u32 LE][bincode payload]
//! ```
//!
//! The header payload carries the full document indexes (by id and by
//! seqno), the local-document table, and the high/purge seqnos. A commit
//! appends its doc blobs, pads to the next block boundary, appends the new
//! header and issues a single `sync` — the durability point. Bytes after
//! the last durable header (a torn commit) are unreachable and get
//! overwritten by the next writer.
//!
//! Open scans backward from EOF over block boundaries; the first candidate
//! that passes marker, checksum and decode is the current header. Older
//! headers remain at lower boundaries, which is what rollback walks.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::io::{read_exact_at, write_all_at, FileOps};

pub const BLOCK_SIZE: u64 = 4096;
const HEADER_MARKER: u8 = 0x01;
const BLOB_FRAME_SIZE: usize = 8;
const HEADER_FRAME_SIZE: usize = 9;

/// Reserved local document holding the persisted vBucket state.
pub const LOCAL_VBSTATE: &str = "_local/vbstate";
/// Reserved local document holding the collections manifest.
pub const LOCAL_COLLECTIONS_MANIFEST: &str = "_local/collections_manifest";

#[derive(Debug, thiserror::Error)]
pub enum CouchError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("file corrupt: {0}")]
    Corrupt(&'static str),

    #[error("no commit header found")]
    NoHeader,
}

impl CouchError {
    /// True when the underlying cause is a missing file.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CouchError::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }
}

pub type Result<T> = std::result::Result<T, CouchError>;

/// Location of a document body within the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyHandle {
    pub offset: u64,
    pub len: u32,
}

/// Index entry for one document. The deleted bit and the metadata record
/// live here; the body (if any) is a blob elsewhere in the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocInfo {
    pub seqno: u64,
    pub rev_meta: Bytes,
    pub deleted: bool,
    pub datatype: u8,
    pub body: Option<BodyHandle>,
    /// Key + metadata + body bytes, used for space accounting.
    pub physical_size: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileHeader {
    /// Highest seqno ever committed to this file.
    pub update_seq: u64,
    /// Highest seqno dropped by compaction.
    pub purge_seq: u64,
    pub by_id: BTreeMap<Bytes, DocInfo>,
    pub by_seq: BTreeMap<u64, Bytes>,
    pub local_docs: BTreeMap<String, Bytes>,
}

/// An open vBucket database file.
///
/// Holds the file handle and the in-memory copy of the current header.
/// Closing is guaranteed on drop; a close failure is logged, never
/// propagated — the operation that owned the handle is already done.
pub struct CouchFile {
    path: PathBuf,
    file: Option<File>,
    ops: Arc<dyn FileOps>,
    header: FileHeader,
    header_offset: Option<u64>,
    end: u64,
}

impl std::fmt::Debug for CouchFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CouchFile")
            .field("path", &self.path)
            .field("header", &self.header)
            .field("header_offset", &self.header_offset)
            .field("end", &self.end)
            .finish()
    }
}

impl CouchFile {
    /// Open an existing file; fails if it does not exist.
    pub fn open(path: impl AsRef<Path>, ops: Arc<dyn FileOps>) -> Result<Self> {
        Self::open_inner(path.as_ref(), ops, false)
    }

    /// Open a file, creating an empty one if missing. An empty file is a
    /// valid database with no committed header yet.
    pub fn create(path: impl AsRef<Path>, ops: Arc<dyn FileOps>) -> Result<Self> {
        Self::open_inner(path.as_ref(), ops, true)
    }

    fn open_inner(path: &Path, ops: Arc<dyn FileOps>, create: bool) -> Result<Self> {
        let file = ops.open(path, create)?;
        let len = ops.len(&file)?;

        let (header, header_offset, end) = if len == 0 {
            (FileHeader::default(), None, 0)
        } else {
            let top = align_down(len.saturating_sub(1));
            match scan_for_header(ops.as_ref(), &file, len, top)? {
                Some((offset, header, block_len)) => {
                    (header, Some(offset), offset + block_len)
                }
                None => return Err(CouchError::NoHeader),
            }
        };

        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
            ops,
            header,
            header_offset,
            end,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    /// Mutable access to the pending header. Changes only become visible
    /// to readers once `write_header` commits them.
    pub fn header_mut(&mut self) -> &mut FileHeader {
        &mut self.header
    }

    pub fn header_offset(&self) -> Option<u64> {
        self.header_offset
    }

    /// Bytes in the logical file, up to and including the current header.
    pub fn file_size(&self) -> u64 {
        self.end
    }

    /// Bytes attributable to live data: document records plus local docs.
    pub fn space_used(&self) -> u64 {
        let docs: u64 = self
            .header
            .by_id
            .values()
            .map(|info| info.physical_size as u64)
            .sum();
        let locals: u64 = self
            .header
            .local_docs
            .values()
            .map(|value| value.len() as u64)
            .sum();
        docs + locals
    }

    pub fn num_docs(&self) -> u64 {
        self.header.by_id.values().filter(|d| !d.deleted).count() as u64
    }

    pub fn num_deleted(&self) -> u64 {
        self.header.by_id.values().filter(|d| d.deleted).count() as u64
    }

    pub fn doc_info(&self, tagged_key: &[u8]) -> Option<&DocInfo> {
        self.header.by_id.get(tagged_key)
    }

    pub fn local_doc(&self, name: &str) -> Option<&Bytes> {
        self.header.local_docs.get(name)
    }

    pub fn set_local_doc(&mut self, name: &str, value: Bytes) {
        self.header.local_docs.insert(name.to_string(), value);
    }

    /// Insert or replace a document in the pending header. The previous
    /// seqno entry for the key (if any) is unlinked so exactly one live
    /// version is reachable.
    pub fn upsert(&mut self, tagged_key: Bytes, info: DocInfo) {
        let seqno = info.seqno;
        self.header.update_seq = self.header.update_seq.max(seqno);
        if let Some(old) = self.header.by_id.insert(tagged_key.clone(), info) {
            if old.seqno != seqno {
                self.header.by_seq.remove(&old.seqno);
            }
        }
        self.header.by_seq.insert(seqno, tagged_key);
    }

    /// Append a document body blob, returning its location.
    pub fn append_body(&mut self, body: &[u8]) -> Result<BodyHandle> {
        // Data records never begin on a block boundary; that byte is
        // reserved for the header marker.
        if self.end % BLOCK_SIZE == 0 {
            write_all_at(self.ops.as_ref(), self.file(), &[0u8], self.end)?;
            self.end += 1;
        }

        let len: u32 = body
            .len()
            .try_into()
            .map_err(|_| CouchError::Corrupt("document body too large"))?;
        let mut frame = Vec::with_capacity(BLOB_FRAME_SIZE + body.len());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&crc32c::crc32c(body).to_le_bytes());
        frame.extend_from_slice(body);

        let offset = self.end;
        write_all_at(self.ops.as_ref(), self.file(), &frame, offset)?;
        self.end += frame.len() as u64;
        Ok(BodyHandle { offset, len })
    }

    /// Read and verify a document body.
    pub fn read_body(&self, handle: BodyHandle) -> Result<Bytes> {
        let mut frame = vec![0u8; BLOB_FRAME_SIZE + handle.len as usize];
        read_exact_at(self.ops.as_ref(), self.file(), &mut frame, handle.offset)?;

        let stored_len = u32::from_le_bytes(frame[0..4].try_into().unwrap());
        if stored_len != handle.len {
            return Err(CouchError::Corrupt("body length mismatch"));
        }
        let crc_expected = u32::from_le_bytes(frame[4..8].try_into().unwrap());
        let body = &frame[BLOB_FRAME_SIZE..];
        if crc32c::crc32c(body) != crc_expected {
            return Err(CouchError::Corrupt("body crc mismatch"));
        }
        Ok(Bytes::copy_from_slice(body))
    }

    /// Append the pending header and optionally make it durable. This is
    /// the commit point: until the sync completes, the previous header
    /// stays authoritative.
    pub fn write_header(&mut self, sync: bool) -> Result<()> {
        let payload =
            bincode::serialize(&self.header).map_err(|_| CouchError::Corrupt("header encode"))?;
        let len: u32 = payload
            .len()
            .try_into()
            .map_err(|_| CouchError::Corrupt("header too large"))?;

        let aligned = align_up(self.end);
        if aligned > self.end {
            let pad = vec![0u8; (aligned - self.end) as usize];
            write_all_at(self.ops.as_ref(), self.file(), &pad, self.end)?;
        }

        let mut block = Vec::with_capacity(HEADER_FRAME_SIZE + payload.len());
        block.push(HEADER_MARKER);
        block.extend_from_slice(&len.to_le_bytes());
        block.extend_from_slice(&crc32c::crc32c(&payload).to_le_bytes());
        block.extend_from_slice(&payload);
        write_all_at(self.ops.as_ref(), self.file(), &block, aligned)?;

        if sync {
            self.ops.sync(self.file())?;
        }

        self.header_offset = Some(aligned);
        self.end = aligned + block.len() as u64;
        Ok(())
    }

    /// The newest committed header strictly below `below`, if any. Used by
    /// rollback to walk backward through commit points.
    pub fn previous_header(&self, below: u64) -> Result<Option<(u64, FileHeader)>> {
        if below == 0 {
            return Ok(None);
        }
        let top = align_down(below - 1);
        Ok(
            scan_for_header(self.ops.as_ref(), self.file(), below, top)?
                .map(|(offset, header, _)| (offset, header)),
        )
    }

    pub fn sync(&self) -> Result<()> {
        self.ops.sync(self.file())?;
        Ok(())
    }

    /// Explicit close; equivalent to drop but makes the release point
    /// visible at call sites.
    pub fn close(self) {}

    fn file(&self) -> &File {
        self.file.as_ref().expect("file is open")
    }
}

impl Drop for CouchFile {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(error) = self.ops.close(file) {
                warn!(path = %self.path.display(), %error, "error closing vbucket file");
            }
        }
    }
}

fn align_down(offset: u64) -> u64 {
    offset - (offset % BLOCK_SIZE)
}

fn align_up(offset: u64) -> u64 {
    match offset % BLOCK_SIZE {
        0 => offset,
        rem => offset + (BLOCK_SIZE - rem),
    }
}

/// Scan block boundaries downward from `top` for a valid header block.
/// Returns the header's offset, payload, and total block length.
fn scan_for_header(
    ops: &dyn FileOps,
    file: &File,
    file_len: u64,
    top: u64,
) -> Result<Option<(u64, FileHeader, u64)>> {
    let mut offset = top;
    loop {
        if let Some((header, block_len)) = try_header_at(ops, file, file_len, offset)? {
            return Ok(Some((offset, header, block_len)));
        }
        if offset == 0 {
            return Ok(None);
        }
        offset -= BLOCK_SIZE;
    }
}

fn try_header_at(
    ops: &dyn FileOps,
    file: &File,
    file_len: u64,
    offset: u64,
) -> Result<Option<(FileHeader, u64)>> {
    if offset + HEADER_FRAME_SIZE as u64 > file_len {
        return Ok(None);
    }
    let mut frame = [0u8; HEADER_FRAME_SIZE];
    read_exact_at(ops, file, &mut frame, offset)?;
    if frame[0] != HEADER_MARKER {
        return Ok(None);
    }

    let len = u32::from_le_bytes(frame[1..5].try_into().unwrap()) as u64;
    if offset + HEADER_FRAME_SIZE as u64 + len > file_len {
        return Ok(None);
    }
    let crc_expected = u32::from_le_bytes(frame[5..9].try_into().unwrap());

    let mut payload = vec![0u8; len as usize];
    read_exact_at(ops, file, &mut payload, offset + HEADER_FRAME_SIZE as u64)?;
    if crc32c::crc32c(&payload) != crc_expected {
        return Ok(None);
    }

    match bincode::deserialize::<FileHeader>(&payload) {
        Ok(header) => Ok(Some((header, HEADER_FRAME_SIZE as u64 + len))),
        Err(_) => Ok(None),
    }
}
