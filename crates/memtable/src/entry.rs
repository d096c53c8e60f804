use std::cmp::Ordering;

use crate::{IndexError, Result};

/// A single index record: "version `version` of the stream hashing to
/// `stream` lives at byte offset `position` in the log".
///
/// The natural [`Ord`] is ascending over `(stream, version, position)`.
/// Tables store entries in the *reverse* of that order (see
/// [`table_order`]), so a forward scan walks a stream from its newest
/// version backwards and duplicate versions surface with the largest
/// position first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IndexEntry {
    pub stream: u32,
    pub version: i64,
    pub position: i64,
}

impl IndexEntry {
    pub fn new(stream: u32, version: i64, position: i64) -> Self {
        Self {
            stream,
            version,
            position,
        }
    }

    /// Builds an entry after checking that `version` and `position` are
    /// non-negative.
    pub fn checked(stream: u32, version: i64, position: i64) -> Result<Self> {
        if version < 0 {
            return Err(IndexError::InvalidArgument(format!(
                "version must be >= 0, got {}",
                version
            )));
        }
        if position < 0 {
            return Err(IndexError::InvalidArgument(format!(
                "position must be >= 0, got {}",
                position
            )));
        }
        Ok(Self::new(stream, version, position))
    }

    /// The 64-bit composite key `(stream << 32) | version`.
    ///
    /// Only collision-free while `version` fits in 32 bits. Ordering never
    /// relies on it; comparisons use the full `(stream, version, position)`
    /// tuple.
    #[must_use]
    pub fn key(&self) -> u64 {
        ((self.stream as u64) << 32) | (self.version as u64 & 0xFFFF_FFFF)
    }
}

/// Comparator for table order: `(key desc, position desc)`.
#[inline]
pub fn table_order(a: &IndexEntry, b: &IndexEntry) -> Ordering {
    b.cmp(a)
}

/// Sorts `entries` into table order and removes exact repeats.
pub fn sort_for_table(entries: &mut Vec<IndexEntry>) {
    entries.sort_unstable_by(table_order);
    entries.dedup();
}

/// Rejects negative range bounds. `start > end` is allowed and simply
/// matches nothing.
pub fn check_range(start_version: i64, end_version: i64) -> Result<()> {
    if start_version < 0 {
        return Err(IndexError::InvalidArgument(format!(
            "range start must be >= 0, got {}",
            start_version
        )));
    }
    if end_version < 0 {
        return Err(IndexError::InvalidArgument(format!(
            "range end must be >= 0, got {}",
            end_version
        )));
    }
    Ok(())
}
