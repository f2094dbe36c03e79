//! Blocking file I/O with byte accounting.
//!
//! Every filesystem call the store makes goes through a `FileOps`
//! implementation so that bytes can be attributed (normal vs compaction
//! I/O) and faults can be injected in tests. The raw implementation is
//! plain positional I/O on `std::fs::File`.

use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::stats::FsStats;

pub trait FileOps: Send + Sync {
    fn open(&self, path: &Path, create: bool) -> io::Result<File>;
    fn pread(&self, file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize>;
    fn pwrite(&self, file: &File, buf: &[u8], offset: u64) -> io::Result<usize>;
    fn sync(&self, file: &File) -> io::Result<()>;
    fn len(&self, file: &File) -> io::Result<u64>;
    fn close(&self, file: File) -> io::Result<()>;
}

/// Fill `buf` completely from `offset`, or fail.
pub fn read_exact_at(
    ops: &dyn FileOps,
    file: &File,
    buf: &mut [u8],
    mut offset: u64,
) -> io::Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match ops.pread(file, &mut buf[filled..], offset)? {
            0 => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "short read",
                ))
            }
            n => {
                filled += n;
                offset += n as u64;
            }
        }
    }
    Ok(())
}

/// Write all of `buf` at `offset`, or fail.
pub fn write_all_at(
    ops: &dyn FileOps,
    file: &File,
    buf: &[u8],
    mut offset: u64,
) -> io::Result<()> {
    let mut written = 0;
    while written < buf.len() {
        match ops.pwrite(file, &buf[written..], offset)? {
            0 => return Err(io::Error::new(io::ErrorKind::WriteZero, "short write")),
            n => {
                written += n;
                offset += n as u64;
            }
        }
    }
    Ok(())
}

#[derive(Debug, Default, Clone)]
pub struct RawFileOps;

impl FileOps for RawFileOps {
    fn open(&self, path: &Path, create: bool) -> io::Result<File> {
        let mut options = std::fs::OpenOptions::new();
        options.read(true).write(true);
        if create {
            options.create(true);
        }
        options.open(path)
    }

    #[cfg(unix)]
    fn pread(&self, file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        use std::os::unix::fs::FileExt;
        file.read_at(buf, offset)
    }

    #[cfg(unix)]
    fn pwrite(&self, file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
        use std::os::unix::fs::FileExt;
        file.write_at(buf, offset)
    }

    fn sync(&self, file: &File) -> io::Result<()> {
        file.sync_data()
    }

    fn len(&self, file: &File) -> io::Result<u64> {
        Ok(file.metadata()?.len())
    }

    fn close(&self, file: File) -> io::Result<()> {
        drop(file);
        Ok(())
    }
}

/// Wraps any `FileOps` and feeds an `FsStats` block.
///
/// Bytes are counted on success only, so failed calls never inflate the
/// totals.
pub struct CountingFileOps {
    inner: Arc<dyn FileOps>,
    stats: Arc<FsStats>,
}

impl CountingFileOps {
    pub fn new(inner: Arc<dyn FileOps>, stats: Arc<FsStats>) -> Self {
        Self { inner, stats }
    }
}

impl FileOps for CountingFileOps {
    fn open(&self, path: &Path, create: bool) -> io::Result<File> {
        let file = self.inner.open(path, create)?;
        self.stats.num_opens.fetch_add(1, Ordering::Relaxed);
        Ok(file)
    }

    fn pread(&self, file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let n = self.inner.pread(file, buf, offset)?;
        self.stats.num_reads.fetch_add(1, Ordering::Relaxed);
        self.stats
            .total_bytes_read
            .fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    fn pwrite(&self, file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
        let n = self.inner.pwrite(file, buf, offset)?;
        self.stats.num_writes.fetch_add(1, Ordering::Relaxed);
        self.stats
            .total_bytes_written
            .fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    fn sync(&self, file: &File) -> io::Result<()> {
        self.inner.sync(file)?;
        self.stats.num_syncs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn len(&self, file: &File) -> io::Result<u64> {
        self.inner.len(file)
    }

    fn close(&self, file: File) -> io::Result<()> {
        self.inner.close(file)?;
        self.stats.num_closes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Fault-injection wrapper: fails the next N calls of each configured
/// kind, then passes through.
#[derive(Default)]
pub struct FaultFileOps<O> {
    inner: O,
    fail_opens: AtomicU32,
    fail_reads: AtomicU32,
    fail_writes: AtomicU32,
    fail_syncs: AtomicU32,
    fail_closes: AtomicU32,
}

impl<O: FileOps> FaultFileOps<O> {
    pub fn new(inner: O) -> Self {
        Self {
            inner,
            fail_opens: AtomicU32::new(0),
            fail_reads: AtomicU32::new(0),
            fail_writes: AtomicU32::new(0),
            fail_syncs: AtomicU32::new(0),
            fail_closes: AtomicU32::new(0),
        }
    }

    pub fn fail_next_opens(&self, n: u32) {
        self.fail_opens.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_reads(&self, n: u32) {
        self.fail_reads.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_writes(&self, n: u32) {
        self.fail_writes.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_syncs(&self, n: u32) {
        self.fail_syncs.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_closes(&self, n: u32) {
        self.fail_closes.store(n, Ordering::SeqCst);
    }

    fn take(counter: &AtomicU32, what: &str) -> io::Result<()> {
        let mut current = counter.load(Ordering::SeqCst);
        while current > 0 {
            match counter.compare_exchange(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::Other,
                        format!("injected {what} failure"),
                    ))
                }
                Err(actual) => current = actual,
            }
        }
        Ok(())
    }
}

impl<O: FileOps> FileOps for FaultFileOps<O> {
    fn open(&self, path: &Path, create: bool) -> io::Result<File> {
        Self::take(&self.fail_opens, "open")?;
        self.inner.open(path, create)
    }

    fn pread(&self, file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        Self::take(&self.fail_reads, "read")?;
        self.inner.pread(file, buf, offset)
    }

    fn pwrite(&self, file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
        Self::take(&self.fail_writes, "write")?;
        self.inner.pwrite(file, buf, offset)
    }

    fn sync(&self, file: &File) -> io::Result<()> {
        Self::take(&self.fail_syncs, "sync")?;
        self.inner.sync(file)
    }

    fn len(&self, file: &File) -> io::Result<u64> {
        self.inner.len(file)
    }

    fn close(&self, file: File) -> io::Result<()> {
        Self::take(&self.fail_closes, "close")?;
        self.inner.close(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn counting_ops_track_bytes() {
        let dir = TempDir::new().expect("tempdir");
        let stats = Arc::new(FsStats::default());
        let ops = CountingFileOps::new(Arc::new(RawFileOps), stats.clone());

        let path = dir.path().join("counted");
        let file = ops.open(&path, true).expect("open");
        write_all_at(&ops, &file, b"hello", 0).expect("write");
        let mut buf = [0u8; 5];
        read_exact_at(&ops, &file, &mut buf, 0).expect("read");
        ops.sync(&file).expect("sync");
        ops.close(file).expect("close");

        assert_eq!(5, stats.total_bytes_written.load(Ordering::Relaxed));
        assert_eq!(5, stats.total_bytes_read.load(Ordering::Relaxed));
        assert_eq!(1, stats.num_opens.load(Ordering::Relaxed));
        assert_eq!(1, stats.num_syncs.load(Ordering::Relaxed));
        assert_eq!(1, stats.num_closes.load(Ordering::Relaxed));
    }

    #[test]
    fn fault_ops_fail_exactly_n_times() {
        let dir = TempDir::new().expect("tempdir");
        let ops = FaultFileOps::new(RawFileOps);
        let path = dir.path().join("faulty");

        ops.fail_next_opens(1);
        assert!(ops.open(&path, true).is_err());
        assert!(ops.open(&path, true).is_ok());
    }
}
