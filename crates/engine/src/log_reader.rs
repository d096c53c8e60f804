//! The log the index is built from.
//!
//! The index never owns the event log. It only needs to re-read the tail
//! that was not yet persisted in tables, which is what [`LogReader`]
//! abstracts. [`MemoryLog`] is a small in-process implementation for
//! embedding and tests.

use std::sync::{PoisonError, RwLock};

use memtable::Result;

/// One indexable record read back from the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRecord {
    /// Position of the commit that made the record durable.
    pub commit_position: i64,
    pub stream: u32,
    pub version: i64,
    /// Where the record itself starts in the log.
    pub position: i64,
}

pub trait LogReader: Send + Sync {
    /// Calls `visit`, in log order, for every record whose commit position
    /// lies in `from..to`, and returns the position the scan reached.
    ///
    /// Selection is by commit, not by the record's own position: `from` is
    /// the index's commit checkpoint, and a record written before it but
    /// committed at or after it has not been persisted yet. Implementations
    /// whose records commit themselves can select on either.
    ///
    /// A reached position below `to` means the log ends early.
    fn replay(
        &self,
        from: i64,
        to: i64,
        visit: &mut dyn FnMut(LogRecord) -> Result<()>,
    ) -> Result<i64>;
}

/// An append-only log kept in memory. Each record occupies one position.
#[derive(Debug, Default)]
pub struct MemoryLog {
    records: RwLock<Vec<LogRecord>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a record committed by itself and returns it.
    pub fn append(&self, stream: u32, version: i64) -> LogRecord {
        self.append_with_commit(stream, version, 0)
    }

    /// Appends a record whose commit lands at `commit_position`. A commit
    /// position below the record's own position is raised to it.
    pub fn append_with_commit(&self, stream: u32, version: i64, commit_position: i64) -> LogRecord {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let position = records.len() as i64;
        let record = LogRecord {
            commit_position: commit_position.max(position),
            stream,
            version,
            position,
        };
        records.push(record);
        record
    }

    /// Position the next record will get.
    pub fn end_position(&self) -> i64 {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len() as i64
    }
}

impl LogReader for MemoryLog {
    fn replay(
        &self,
        from: i64,
        to: i64,
        visit: &mut dyn FnMut(LogRecord) -> Result<()>,
    ) -> Result<i64> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        // commits never precede their record, so nothing at or past `to` qualifies
        let stop = (to.max(0) as usize).min(records.len());
        for record in records.iter().take(stop) {
            if (from..to).contains(&record.commit_position) {
                visit(*record)?;
            }
        }
        Ok(to.min(records.len() as i64).max(from))
    }
}
