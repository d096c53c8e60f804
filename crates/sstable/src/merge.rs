//! K-way merge over multiple [`SSTable`]s.
//!
//! Produces entries in table order (`(key, position)` descending). Exact
//! repeats across inputs are emitted once and entries rejected by the
//! liveness predicate are dropped, which is how compaction doubles as
//! garbage collection for scavenged streams.

use memtable::{IndexEntry, Result};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use crate::reader::Iter;
use crate::{SSTable, SSTableWriter};

/// Decides whether an entry still points at a valid log record.
pub type EntryPredicate<'a> = &'a (dyn Fn(&IndexEntry) -> bool + Send + Sync);

/// The current head of one input, ordered for the heap.
struct HeapEntry {
    entry: IndexEntry,
    /// Index into the `sources` array.
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.entry == other.entry && self.source == other.source
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap and table order is descending, so the
        // natural entry order is what we want. Ties go to the lower source.
        self.entry
            .cmp(&other.entry)
            .then_with(|| other.source.cmp(&self.source))
    }
}

/// Lazily merges several tables into one stream in table order.
pub struct MergeIterator<'a> {
    sources: Vec<Iter>,
    heap: BinaryHeap<HeapEntry>,
    is_live: EntryPredicate<'a>,
    last: Option<IndexEntry>,
    failed: bool,
}

impl<'a> MergeIterator<'a> {
    /// Acquires every input table and primes the heap with each head.
    pub fn new(tables: &[Arc<SSTable>], is_live: EntryPredicate<'a>) -> Result<Self> {
        let mut sources = Vec::with_capacity(tables.len());
        let mut heap = BinaryHeap::with_capacity(tables.len());
        for (i, table) in tables.iter().enumerate() {
            let mut iter = table.iter()?;
            if let Some(first) = iter.next() {
                heap.push(HeapEntry {
                    entry: first?,
                    source: i,
                });
            }
            sources.push(iter);
        }
        Ok(Self {
            sources,
            heap,
            is_live,
            last: None,
            failed: false,
        })
    }

    /// Returns the next surviving entry, or `None` when all inputs are
    /// exhausted.
    pub fn next_entry(&mut self) -> Result<Option<IndexEntry>> {
        while let Some(top) = self.heap.pop() {
            if let Some(next) = self.sources[top.source].next() {
                self.heap.push(HeapEntry {
                    entry: next?,
                    source: top.source,
                });
            }
            if self.last == Some(top.entry) {
                continue;
            }
            self.last = Some(top.entry);
            if (self.is_live)(&top.entry) {
                return Ok(Some(top.entry));
            }
        }
        Ok(None)
    }
}

impl Iterator for MergeIterator<'_> {
    type Item = Result<IndexEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.next_entry() {
            Ok(Some(e)) => Some(Ok(e)),
            Ok(None) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Merges `tables` into a new table at `output`, keeping only entries for
/// which `is_live` returns `true`.
///
/// The output may be empty if every entry was dropped; it is still a valid,
/// checksummed table. On failure nothing is left at `output` and the inputs
/// are untouched.
pub fn merge_tables(
    tables: &[Arc<SSTable>],
    output: &Path,
    cache_depth: u32,
    is_live: EntryPredicate<'_>,
) -> Result<SSTable> {
    let started = Instant::now();
    let merge = MergeIterator::new(tables, is_live)?;
    let count = SSTableWriter::write_from_iterator(output, merge)?;
    let input: u64 = tables.iter().map(|t| t.len()).sum();
    info!(
        output = %output.display(),
        inputs = tables.len(),
        input_entries = input,
        output_entries = count,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "merged tables"
    );
    SSTable::open(output, cache_depth)
}
