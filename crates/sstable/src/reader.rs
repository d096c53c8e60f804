use crc32fast::Hasher as Crc32;
use memtable::{check_range, IndexEntry, IndexError, Result};
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

use crate::format::{
    entry_count, entry_offset, read_entry, read_header, CHECKSUM_BYTES, ENTRY_BYTES, HEADER_BYTES,
};

/// Deepest midpoint cache we will build (2^28 samples).
pub const MAX_CACHE_DEPTH: u32 = 28;

/// One sample of the midpoint cache: the entry stored at `index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Midpoint {
    pub entry: IndexEntry,
    pub index: u64,
}

/// The open table file and where the next read starts.
///
/// Reads at the current offset go straight to the buffer; anything else is
/// a relative seek, which keeps the buffer when the target is inside it.
struct TableFile {
    rdr: BufReader<File>,
    /// `None` after a failed read left the offset unknown.
    offset: Option<u64>,
    seeks: u64,
}

impl TableFile {
    fn new(rdr: BufReader<File>, offset: u64) -> Self {
        Self {
            rdr,
            offset: Some(offset),
            seeks: 0,
        }
    }

    fn read_at(&mut self, index: u64) -> Result<IndexEntry> {
        let target = entry_offset(index);
        match self.offset.take() {
            Some(current) if current == target => {}
            Some(current) => {
                self.rdr.seek_relative(target as i64 - current as i64)?;
                self.seeks += 1;
            }
            None => {
                self.rdr.seek(SeekFrom::Start(target))?;
                self.seeks += 1;
            }
        }
        let entry = read_entry(&mut self.rdr)?;
        self.offset = Some(target + ENTRY_BYTES);
        Ok(entry)
    }
}

#[derive(Debug, Default)]
struct Lifecycle {
    refs: usize,
    marked: bool,
    deleted: bool,
}

/// An open, immutable, on-disk table.
///
/// Entries are stored in table order (`(key, position)` descending), so every
/// query is a lower-bound search followed by a short forward scan. The
/// midpoint cache narrows the lower-bound search to the file region between
/// two samples before any disk read happens.
///
/// A persistent file handle is kept open for the lifetime of the table,
/// wrapped in a `Mutex` so queries work through `&self`. The handle is
/// closed and the file removed once the table has been
/// [marked for destruction](SSTable::mark_for_destruction) and the last
/// [`TableRef`] is released.
pub struct SSTable {
    path: PathBuf,
    count: u64,
    midpoints: Vec<Midpoint>,
    file: Mutex<Option<TableFile>>,
    lifecycle: Mutex<Lifecycle>,
    disposed: Condvar,
}

/// Counted handle to an [`SSTable`]. While any handle is alive the backing
/// file will not be deleted.
pub struct TableRef {
    table: Arc<SSTable>,
}

impl TableRef {
    pub fn table(&self) -> &Arc<SSTable> {
        &self.table
    }
}

impl std::ops::Deref for TableRef {
    type Target = SSTable;

    fn deref(&self) -> &SSTable {
        &self.table
    }
}

impl Drop for TableRef {
    fn drop(&mut self) {
        self.table.release();
    }
}

impl fmt::Debug for SSTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SSTable")
            .field("path", &self.path)
            .field("count", &self.count)
            .field("midpoints", &self.midpoints.len())
            .finish()
    }
}

impl SSTable {
    /// Opens a table file and builds a midpoint cache of up to
    /// `2^cache_depth` samples. A depth of 0 disables the cache; queries then
    /// binary-search the whole file.
    ///
    /// The checksum is not verified here; call
    /// [`verify_integrity`](SSTable::verify_integrity) for that.
    ///
    /// # Errors
    ///
    /// [`IndexError::InvalidFormat`] for an unknown header marker,
    /// [`IndexError::CorruptIndex`] for a truncated or misaligned body,
    /// [`IndexError::InvalidArgument`] for a cache depth above
    /// [`MAX_CACHE_DEPTH`].
    pub fn open<P: AsRef<Path>>(path: P, cache_depth: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if cache_depth > MAX_CACHE_DEPTH {
            return Err(IndexError::InvalidArgument(format!(
                "cache depth {} exceeds maximum {}",
                cache_depth, MAX_CACHE_DEPTH
            )));
        }

        let f = File::open(&path)?;
        let filesize = f.metadata()?.len();
        let count = entry_count(filesize, &path)?;
        let mut rdr = BufReader::new(f);
        read_header(&mut rdr, &path)?;
        let mut f = TableFile::new(rdr, HEADER_BYTES);

        let midpoints = Self::build_midpoints(&mut f, count, cache_depth)?;
        debug!(
            path = %path.display(),
            entries = count,
            midpoints = midpoints.len(),
            "opened table"
        );

        Ok(Self {
            path,
            count,
            midpoints,
            file: Mutex::new(Some(f)),
            lifecycle: Mutex::new(Lifecycle::default()),
            disposed: Condvar::new(),
        })
    }

    /// Samples evenly index-spaced entries, always including the first and
    /// the last one.
    fn build_midpoints(f: &mut TableFile, count: u64, depth: u32) -> Result<Vec<Midpoint>> {
        if depth == 0 || count == 0 {
            return Ok(Vec::new());
        }
        let samples = (1u64 << depth).clamp(2, count.max(2)).min(count);
        let mut midpoints = Vec::with_capacity(samples as usize);
        for i in 0..samples {
            let index = if samples == 1 {
                0
            } else {
                i * (count - 1) / (samples - 1)
            };
            let entry = f.read_at(index)?;
            midpoints.push(Midpoint { entry, index });
        }
        Ok(midpoints)
    }

    /// Runs `op` against the open file handle.
    fn with_file<T>(&self, op: impl FnOnce(&mut TableFile) -> Result<T>) -> Result<T> {
        let mut guard = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_mut() {
            Some(f) => op(f),
            None => Err(IndexError::TableDisposed(self.path.clone())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name without the directory, as recorded in the manifest.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn len(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn midpoints(&self) -> &[Midpoint] {
        &self.midpoints
    }

    /// Index range `[lo, hi]` that must contain the first entry `<= target`
    /// in ascending terms (`hi == count` means "none").
    fn narrow(&self, target: &IndexEntry) -> (u64, u64) {
        if self.midpoints.is_empty() {
            return (0, self.count);
        }
        let j = self.midpoints.partition_point(|m| m.entry > *target);
        let lo = if j == 0 { 0 } else { self.midpoints[j - 1].index + 1 };
        let hi = if j == self.midpoints.len() {
            self.count
        } else {
            self.midpoints[j].index
        };
        (lo, hi)
    }

    /// First index whose entry is `<= target`; `count` when there is none.
    fn lower_bound(&self, f: &mut TableFile, target: &IndexEntry) -> Result<u64> {
        let (mut lo, mut hi) = self.narrow(target);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if f.read_at(mid)? <= *target {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        Ok(lo)
    }

    fn entry_at(&self, f: &mut TableFile, index: u64) -> Result<Option<IndexEntry>> {
        if index >= self.count {
            return Ok(None);
        }
        f.read_at(index).map(Some)
    }

    /// Position of `version` in `stream`, the largest one if the version was
    /// indexed more than once.
    pub fn lookup_exact(&self, stream: u32, version: i64) -> Result<Option<i64>> {
        let target = IndexEntry::new(stream, version, i64::MAX);
        self.with_file(|f| {
            let idx = self.lower_bound(f, &target)?;
            Ok(self
                .entry_at(f, idx)?
                .filter(|e| e.stream == stream && e.version == version)
                .map(|e| e.position))
        })
    }

    /// Entry with the greatest `(version, position)` for `stream`.
    pub fn latest_entry(&self, stream: u32) -> Result<Option<IndexEntry>> {
        let target = IndexEntry::new(stream, i64::MAX, i64::MAX);
        self.with_file(|f| {
            let idx = self.lower_bound(f, &target)?;
            Ok(self.entry_at(f, idx)?.filter(|e| e.stream == stream))
        })
    }

    /// Entry with the least `(version, position)` for `stream`.
    pub fn oldest_entry(&self, stream: u32) -> Result<Option<IndexEntry>> {
        // Versions are never negative, so everything at or past this bound
        // belongs to a smaller stream hash.
        let past_stream = IndexEntry::new(stream, -1, i64::MAX);
        self.with_file(|f| {
            let end = self.lower_bound(f, &past_stream)?;
            if end == 0 {
                return Ok(None);
            }
            Ok(self.entry_at(f, end - 1)?.filter(|e| e.stream == stream))
        })
    }

    /// Lazily yields entries of `stream` with `start_version <= version <=
    /// end_version`, newest first. The iterator holds a [`TableRef`], so the
    /// file stays on disk until it is dropped.
    pub fn range(
        self: &Arc<Self>,
        stream: u32,
        start_version: i64,
        end_version: i64,
    ) -> Result<RangeIter> {
        check_range(start_version, end_version)?;
        let table = self.acquire()?;
        let next = if start_version > end_version {
            self.count
        } else {
            let target = IndexEntry::new(stream, end_version, i64::MAX);
            self.with_file(|f| self.lower_bound(f, &target))?
        };
        Ok(RangeIter {
            table,
            stream,
            start_version,
            next,
            done: false,
        })
    }

    /// Every entry in table order.
    pub fn iter(self: &Arc<Self>) -> Result<Iter> {
        Ok(Iter {
            table: self.acquire()?,
            next: 0,
            done: false,
        })
    }

    /// Recomputes the whole-file checksum and compares it with the trailer.
    pub fn verify_integrity(&self) -> Result<()> {
        self.with_file(|f| self.verify_file(f))
    }

    fn verify_file(&self, file: &mut TableFile) -> Result<()> {
        file.offset = None;
        let f = &mut file.rdr;
        let filesize = f.seek(SeekFrom::End(0))?;
        f.seek(SeekFrom::Start(0))?;

        let mut hasher = Crc32::new();
        let mut remaining = filesize - CHECKSUM_BYTES;
        let mut buf = vec![0u8; 64 * 1024];
        while remaining > 0 {
            let n = remaining.min(buf.len() as u64) as usize;
            f.read_exact(&mut buf[..n])?;
            hasher.update(&buf[..n]);
            remaining -= n as u64;
        }
        let mut stored = [0u8; 4];
        f.read_exact(&mut stored)?;
        let stored = u32::from_le_bytes(stored);
        let actual = hasher.finalize();
        if stored != actual {
            return Err(IndexError::CorruptIndex {
                path: self.path.clone(),
                reason: format!(
                    "checksum mismatch: expected {:#010x}, got {:#010x}",
                    stored, actual
                ),
            });
        }
        Ok(())
    }

    /// Times the file handle was repositioned instead of read in place.
    #[cfg(test)]
    pub(crate) fn seek_count(&self) -> u64 {
        self.file
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(0, |f| f.seeks)
    }

    // -------------------- lifecycle --------------------

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes a counted reference. Fails once the file has been deleted.
    pub fn acquire(self: &Arc<Self>) -> Result<TableRef> {
        let mut lc = self.lifecycle();
        if lc.deleted {
            return Err(IndexError::TableDisposed(self.path.clone()));
        }
        lc.refs += 1;
        Ok(TableRef {
            table: Arc::clone(self),
        })
    }

    fn release(&self) {
        let mut lc = self.lifecycle();
        lc.refs = lc.refs.saturating_sub(1);
        if lc.refs == 0 && lc.marked {
            self.dispose(&mut lc);
        }
    }

    /// Schedules the backing file for deletion as soon as no [`TableRef`]
    /// is outstanding (immediately if none is).
    pub fn mark_for_destruction(&self) {
        let mut lc = self.lifecycle();
        lc.marked = true;
        if lc.refs == 0 {
            self.dispose(&mut lc);
        }
    }

    fn dispose(&self, lc: &mut Lifecycle) {
        if lc.deleted {
            return;
        }
        self.file.lock().unwrap_or_else(PoisonError::into_inner).take();
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "deleted table"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to delete table file"),
        }
        lc.deleted = true;
        self.disposed.notify_all();
    }

    /// Blocks until the file has been deleted or `timeout` elapses. Returns
    /// `true` if the file is gone.
    pub fn wait_for_disposal(&self, timeout: Duration) -> bool {
        let lc = self.lifecycle();
        let (lc, _) = self
            .disposed
            .wait_timeout_while(lc, timeout, |lc| !lc.deleted)
            .unwrap_or_else(PoisonError::into_inner);
        lc.deleted
    }

    pub fn is_disposed(&self) -> bool {
        self.lifecycle().deleted
    }

    /// Number of outstanding [`TableRef`]s.
    pub fn ref_count(&self) -> usize {
        self.lifecycle().refs
    }
}

/// Lazy forward scan over one stream's run of a table.
pub struct RangeIter {
    table: TableRef,
    stream: u32,
    start_version: i64,
    next: u64,
    done: bool,
}

impl Iterator for RangeIter {
    type Item = Result<IndexEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let index = self.next;
        let read = self.table.with_file(|f| self.table.entry_at(f, index));
        match read {
            Ok(Some(e)) if e.stream == self.stream && e.version >= self.start_version => {
                self.next += 1;
                Some(Ok(e))
            }
            Ok(_) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Full forward scan of a table in table order.
pub struct Iter {
    table: TableRef,
    next: u64,
    done: bool,
}

impl Iterator for Iter {
    type Item = Result<IndexEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let index = self.next;
        let read = self.table.with_file(|f| self.table.entry_at(f, index));
        match read {
            Ok(Some(e)) => {
                self.next += 1;
                Some(Ok(e))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.table.count.saturating_sub(self.next) as usize;
        (0, Some(left))
    }
}
