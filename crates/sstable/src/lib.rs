//! # SSTable - sorted immutable index tables
//!
//! Write-once, read-many files holding index entries for the stream index.
//! A table is produced either by flushing a full [`memtable::MemTable`] or by
//! merging existing tables during compaction; it is never modified
//! afterwards, only superseded and eventually deleted.
//!
//! ## File layout
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │ HEADER (8 bytes)                                              │
//! │ magic (u32 LE) "SIT1" | format_version (u32 LE)               │
//! ├───────────────────────────────────────────────────────────────┤
//! │ ENTRIES (20 bytes each, table order)                          │
//! │                                                               │
//! │ stream (u32 LE) | version (i64 LE) | position (i64 LE)        │
//! │                                                               │
//! │ ... repeated, (stream, version, position) descending ...      │
//! ├───────────────────────────────────────────────────────────────┤
//! │ CHECKSUM (4 bytes)                                            │
//! │ crc32 (u32 LE) over header + entries                          │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! Entries are fixed-size, so entry `i` lives at `8 + 20 * i` and the whole
//! file is binary-searchable without an index section. On open a sparse
//! *midpoint cache* samples up to `2^cache_depth` entries so a lookup can be
//! narrowed to a small region before touching the disk.
//!
//! ## Lifetime
//!
//! Tables are reference-counted through [`TableRef`] handles.
//! [`SSTable::mark_for_destruction`] defers deletion of the file until the
//! last handle is released; [`SSTable::wait_for_disposal`] blocks for it.

mod format;
mod merge;
mod reader;
mod writer;

pub use format::{
    CHECKSUM_BYTES, ENTRY_BYTES, HEADER_BYTES, TABLE_FORMAT_VERSION, TABLE_MAGIC,
};
pub use merge::{merge_tables, EntryPredicate, MergeIterator};
pub use reader::{Iter, Midpoint, RangeIter, SSTable, TableRef, MAX_CACHE_DEPTH};
pub use writer::SSTableWriter;

#[cfg(test)]
mod tests;
