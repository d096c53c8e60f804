use byteorder::{LittleEndian, WriteBytesExt};
use crc32fast::Hasher as Crc32;
use memtable::{sort_for_table, table_order, IndexEntry, IndexError, Result};
use std::cmp::Ordering;
use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::info;

use crate::format::{write_entry, write_header, ENTRY_BYTES, HEADER_BYTES};
use crate::SSTable;

/// Builds immutable table files.
///
/// The writer is stateless. Every write is crash-safe: data goes to
/// `<path>.tmp`, is fsynced, and is then atomically renamed into place.
pub struct SSTableWriter {}

impl SSTableWriter {
    /// Sorts `source` into table order, writes it to `path` and opens the
    /// result with a midpoint cache of depth `cache_depth`.
    ///
    /// Exact `(stream, version, position)` repeats are written once.
    ///
    /// # Errors
    ///
    /// [`IndexError::InvalidArgument`] if `source` is empty or holds an entry
    /// with a negative version/position; [`IndexError::Io`] on any write
    /// failure (no partial file is left at `path`).
    pub fn build<I>(source: I, path: &Path, cache_depth: u32) -> Result<SSTable>
    where
        I: IntoIterator<Item = IndexEntry>,
    {
        let mut entries: Vec<IndexEntry> = source.into_iter().collect();
        if entries.is_empty() {
            return Err(IndexError::InvalidArgument(
                "refusing to build a table from an empty source".to_string(),
            ));
        }
        for e in &entries {
            IndexEntry::checked(e.stream, e.version, e.position)?;
        }
        sort_for_table(&mut entries);

        let started = Instant::now();
        let count = Self::write_from_iterator(path, entries.into_iter().map(Ok))?;
        info!(
            path = %path.display(),
            entries = count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "built table"
        );
        SSTable::open(path, cache_depth)
    }

    /// Writes entries that are already in table order.
    ///
    /// This is the streaming entry point used by merges: nothing is
    /// materialized beyond a single entry. An iterator that is out of order
    /// (or yields an exact repeat) is rejected, and so is the first error it
    /// yields. Returns the number of entries written; zero is allowed.
    pub fn write_from_iterator<I>(path: &Path, iter: I) -> Result<u64>
    where
        I: Iterator<Item = Result<IndexEntry>>,
    {
        let tmp_path = tmp_path_for(path);
        match Self::write_internal(path, &tmp_path, iter) {
            Ok(count) => Ok(count),
            Err(e) => {
                let _ = fs::remove_file(&tmp_path);
                Err(e)
            }
        }
    }

    fn write_internal<I>(path: &Path, tmp_path: &Path, iter: I) -> Result<u64>
    where
        I: Iterator<Item = Result<IndexEntry>>,
    {
        let raw_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(tmp_path)?;
        let mut file = BufWriter::new(raw_file);
        let mut hasher = Crc32::new();

        let mut header = Vec::with_capacity(HEADER_BYTES as usize);
        write_header(&mut header)?;
        hasher.update(&header);
        file.write_all(&header)?;

        let mut record = Vec::with_capacity(ENTRY_BYTES as usize);
        let mut prev: Option<IndexEntry> = None;
        let mut count = 0u64;

        for entry in iter {
            let entry = entry?;
            if let Some(p) = prev {
                if table_order(&p, &entry) != Ordering::Less {
                    return Err(IndexError::InvalidArgument(format!(
                        "entries out of table order: {:?} followed by {:?}",
                        p, entry
                    )));
                }
            }
            record.clear();
            write_entry(&mut record, &entry)?;
            hasher.update(&record);
            file.write_all(&record)?;
            prev = Some(entry);
            count += 1;
        }

        file.write_u32::<LittleEndian>(hasher.finalize())?;

        // Flush BufWriter, then sync the underlying file
        file.flush()?;
        file.into_inner().map_err(|e| e.into_error())?.sync_all()?;

        fs::rename(tmp_path, path)?;

        // A crash after rename but before the directory sync can lose the
        // entry on ext4/XFS.
        if let Some(parent) = path.parent() {
            if let Ok(dir) = fs::File::open(parent) {
                let _ = dir.sync_all();
            }
        }

        Ok(count)
    }
}

/// `<path>.tmp`, next to the final file so the rename stays on one volume.
pub(crate) fn tmp_path_for(path: &Path) -> PathBuf {
    let mut s: OsString = path.as_os_str().to_owned();
    s.push(".tmp");
    PathBuf::from(s)
}
