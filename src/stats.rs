//! Per-store statistics.
//!
//! Counters are relaxed atomics so stats can be read from any thread
//! without locking. Filesystem-level byte accounting lives in `FsStats`
//! blocks fed by the counting file ops; one block tracks normal I/O, a
//! second tracks compaction.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Byte and call counts at the file-ops layer.
#[derive(Debug, Default)]
pub struct FsStats {
    pub num_opens: AtomicU64,
    pub num_closes: AtomicU64,
    pub num_reads: AtomicU64,
    pub num_writes: AtomicU64,
    pub num_syncs: AtomicU64,
    pub total_bytes_read: AtomicU64,
    pub total_bytes_written: AtomicU64,
}

#[derive(Debug)]
pub struct KVStoreStats {
    /// Documents written through commit.
    pub io_num_write: AtomicU64,
    /// Documents read back.
    pub io_num_read: AtomicU64,
    /// User-visible bytes written: key + metadata + value per document.
    pub io_write_bytes: AtomicU64,
    pub io_read_bytes: AtomicU64,
    pub num_get_failure: AtomicU64,
    pub num_compaction_failure: AtomicU64,
    /// Documents in the most recent commit.
    pub docs_committed: AtomicU64,
    /// All bytes moved for normal operations, headers included.
    pub fs_stats: Arc<FsStats>,
    /// All bytes moved on behalf of compaction.
    pub fs_stats_compaction: Arc<FsStats>,
}

impl Default for KVStoreStats {
    fn default() -> Self {
        Self {
            io_num_write: AtomicU64::new(0),
            io_num_read: AtomicU64::new(0),
            io_write_bytes: AtomicU64::new(0),
            io_read_bytes: AtomicU64::new(0),
            num_get_failure: AtomicU64::new(0),
            num_compaction_failure: AtomicU64::new(0),
            docs_committed: AtomicU64::new(0),
            fs_stats: Arc::new(FsStats::default()),
            fs_stats_compaction: Arc::new(FsStats::default()),
        }
    }
}

impl KVStoreStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn io_total_write_bytes(&self) -> u64 {
        self.fs_stats.total_bytes_written.load(Ordering::Relaxed)
            + self
                .fs_stats_compaction
                .total_bytes_written
                .load(Ordering::Relaxed)
    }

    pub fn io_total_read_bytes(&self) -> u64 {
        self.fs_stats.total_bytes_read.load(Ordering::Relaxed)
            + self
                .fs_stats_compaction
                .total_bytes_read
                .load(Ordering::Relaxed)
    }

    pub fn io_compaction_write_bytes(&self) -> u64 {
        self.fs_stats_compaction
            .total_bytes_written
            .load(Ordering::Relaxed)
    }

    pub fn io_compaction_read_bytes(&self) -> u64 {
        self.fs_stats_compaction
            .total_bytes_read
            .load(Ordering::Relaxed)
    }

    /// Point lookup used by the stats surface.
    pub fn get(&self, name: &str) -> Option<u64> {
        let value = match name {
            "io_num_write" => self.io_num_write.load(Ordering::Relaxed),
            "io_num_read" => self.io_num_read.load(Ordering::Relaxed),
            "io_write_bytes" => self.io_write_bytes.load(Ordering::Relaxed),
            "io_read_bytes" => self.io_read_bytes.load(Ordering::Relaxed),
            "io_total_write_bytes" => self.io_total_write_bytes(),
            "io_total_read_bytes" => self.io_total_read_bytes(),
            "io_compaction_write_bytes" => self.io_compaction_write_bytes(),
            "io_compaction_read_bytes" => self.io_compaction_read_bytes(),
            "numGetFailure" => self.num_get_failure.load(Ordering::Relaxed),
            "numCompactionFailure" => self.num_compaction_failure.load(Ordering::Relaxed),
            "lastCommitDocs" => self.docs_committed.load(Ordering::Relaxed),
            _ => return None,
        };
        Some(value)
    }

    /// Emit the counter set with a store prefix, e.g. `rw_0:io_num_write`.
    pub fn add_stats(&self, prefix: &str, visitor: &mut dyn FnMut(&str, String)) {
        const NAMES: &[&str] = &[
            "io_num_write",
            "io_num_read",
            "io_write_bytes",
            "io_read_bytes",
            "io_total_write_bytes",
            "io_total_read_bytes",
            "io_compaction_write_bytes",
            "io_compaction_read_bytes",
            "numGetFailure",
            "numCompactionFailure",
            "lastCommitDocs",
        ];
        for name in NAMES {
            if let Some(value) = self.get(name) {
                visitor(&format!("{prefix}:{name}"), value.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_combine_normal_and_compaction_bytes() {
        let stats = KVStoreStats::new();
        stats
            .fs_stats
            .total_bytes_written
            .store(100, Ordering::Relaxed);
        stats
            .fs_stats_compaction
            .total_bytes_written
            .store(40, Ordering::Relaxed);

        assert_eq!(140, stats.io_total_write_bytes());
        assert_eq!(40, stats.io_compaction_write_bytes());
    }

    #[test]
    fn add_stats_prefixes_every_counter() {
        let stats = KVStoreStats::new();
        stats.io_num_write.store(1, Ordering::Relaxed);

        let mut seen = std::collections::HashMap::new();
        stats.add_stats("rw_0", &mut |key, value| {
            seen.insert(key.to_string(), value);
        });
        assert_eq!(Some(&"1".to_string()), seen.get("rw_0:io_num_write"));
        assert!(seen.contains_key("rw_0:numCompactionFailure"));
    }
}
