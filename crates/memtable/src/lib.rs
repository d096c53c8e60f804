//! # Memtable - in-memory write buffer of the stream index
//!
//! Every index write lands here first. The memtable is a multimap from
//! stream hash to the `(version, position)` pairs added for it, in insertion
//! order. It is bounded by an entry count; reaching the bound is the signal
//! for the engine to retire this instance and flush it to an on-disk table.
//!
//! A retired memtable is never cleared or reused. Readers that grabbed it
//! before the swap keep querying it until the table file replaces it.

mod entry;
mod error;

pub use entry::{check_range, sort_for_table, table_order, IndexEntry};
pub use error::{IndexError, Result};

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard};

#[derive(Debug, Default)]
struct Buckets {
    map: HashMap<u32, Vec<(i64, i64)>>,
    len: usize,
}

/// Bounded, thread-safe write buffer.
///
/// Writes are expected to come from a single writer; the internal lock only
/// protects bucket growth against concurrent readers.
#[derive(Debug)]
pub struct MemTable {
    buckets: RwLock<Buckets>,
    max_entries: usize,
}

impl MemTable {
    /// Creates an empty memtable that reports full at `max_entries`.
    pub fn new(max_entries: usize) -> Self {
        Self {
            buckets: RwLock::new(Buckets::default()),
            max_entries: max_entries.max(1),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Buckets> {
        self.buckets.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends `(version, position)` to the bucket for `stream`.
    ///
    /// Exceeding the bound is not an error; callers check [`is_full`].
    ///
    /// [`is_full`]: MemTable::is_full
    pub fn add(&self, stream: u32, version: i64, position: i64) -> Result<()> {
        let entry = IndexEntry::checked(stream, version, position)?;
        let mut buckets = self.buckets.write().unwrap_or_else(PoisonError::into_inner);
        buckets
            .map
            .entry(entry.stream)
            .or_default()
            .push((entry.version, entry.position));
        buckets.len += 1;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.read().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// `true` once the entry count has reached the configured bound.
    pub fn is_full(&self) -> bool {
        self.len() >= self.max_entries
    }

    /// Position of `version` in `stream`; the largest position wins when the
    /// version was added more than once.
    pub fn lookup_exact(&self, stream: u32, version: i64) -> Option<i64> {
        let buckets = self.read();
        buckets
            .map
            .get(&stream)?
            .iter()
            .filter(|(v, _)| *v == version)
            .map(|(_, p)| *p)
            .max()
    }

    /// Entry with the greatest `(version, position)` for `stream`.
    pub fn latest_entry(&self, stream: u32) -> Option<IndexEntry> {
        let buckets = self.read();
        buckets
            .map
            .get(&stream)?
            .iter()
            .max()
            .map(|&(version, position)| IndexEntry::new(stream, version, position))
    }

    /// Entry with the least `(version, position)` for `stream`.
    pub fn oldest_entry(&self, stream: u32) -> Option<IndexEntry> {
        let buckets = self.read();
        buckets
            .map
            .get(&stream)?
            .iter()
            .min()
            .map(|&(version, position)| IndexEntry::new(stream, version, position))
    }

    /// Entries of `stream` with `start_version <= version <= end_version`,
    /// newest first, exact repeats removed.
    pub fn range(&self, stream: u32, start_version: i64, end_version: i64) -> Result<Vec<IndexEntry>> {
        check_range(start_version, end_version)?;
        let buckets = self.read();
        let mut out: Vec<IndexEntry> = match buckets.map.get(&stream) {
            Some(bucket) => bucket
                .iter()
                .filter(|(v, _)| *v >= start_version && *v <= end_version)
                .map(|&(v, p)| IndexEntry::new(stream, v, p))
                .collect(),
            None => Vec::new(),
        };
        sort_for_table(&mut out);
        Ok(out)
    }

    /// Every entry, in table order with exact repeats removed. This is the
    /// input for flushing to disk.
    pub fn sorted_entries(&self) -> Vec<IndexEntry> {
        let buckets = self.read();
        let mut out = Vec::with_capacity(buckets.len);
        for (&stream, bucket) in &buckets.map {
            out.extend(
                bucket
                    .iter()
                    .map(|&(version, position)| IndexEntry::new(stream, version, position)),
            );
        }
        drop(buckets);
        sort_for_table(&mut out);
        out
    }
}
