/// Read path: `lookup_exact()`, `latest_entry()`, `oldest_entry()` and
/// `range()`.
///
/// Every query works on one view snapshot: all memtables plus every table of
/// the manifest, each table pinned by a counted reference for the duration
/// of the query. If a table was deleted between loading the snapshot and
/// pinning it, a newer snapshot is taken.
use std::sync::Arc;

use memtable::{check_range, sort_for_table, IndexEntry, IndexError, Result};
use sstable::TableRef;

use crate::{IndexState, IndexView, TableIndex};

/// Snapshot reloads before a query gives up. Each retry sees a newer
/// manifest, so running out means the index is being torn down.
const MAX_SNAPSHOT_ATTEMPTS: usize = 64;

impl TableIndex {
    /// Runs `query` against a pinned snapshot.
    fn with_snapshot<T>(&self, query: impl Fn(&IndexView, &[TableRef]) -> Result<T>) -> Result<T> {
        match self.state() {
            IndexState::Uninitialized => return Err(IndexError::InvalidState("index is not initialized")),
            IndexState::Closed => return Err(IndexError::InvalidState("index is closed")),
            IndexState::Initializing | IndexState::Ready => {}
        }
        let mut last = None;
        for _ in 0..MAX_SNAPSHOT_ATTEMPTS {
            let view: Arc<IndexView> = self.shared.view.load_full();
            match view.manifest.acquire_all() {
                Ok(tables) => match query(&view, &tables) {
                    Err(IndexError::TableDisposed(path)) => last = Some(path),
                    other => return other,
                },
                Err(IndexError::TableDisposed(path)) => last = Some(path),
                Err(e) => return Err(e),
            }
        }
        Err(IndexError::TableDisposed(last.unwrap_or_default()))
    }

    /// Position of `stream` at `version`; the highest one if several
    /// entries share the version.
    pub fn lookup_exact(&self, stream: u32, version: i64) -> Result<Option<i64>> {
        if version < 0 {
            return Err(IndexError::InvalidArgument(format!(
                "version must be >= 0, got {}",
                version
            )));
        }
        self.with_snapshot(|view, tables| {
            let mut best = view
                .memtables
                .iter()
                .filter_map(|m| m.lookup_exact(stream, version))
                .max();
            for table in tables {
                if let Some(p) = table.lookup_exact(stream, version)? {
                    best = best.max(Some(p));
                }
            }
            Ok(best)
        })
    }

    /// Entry with the highest version of `stream` (highest position on a
    /// tie).
    pub fn latest_entry(&self, stream: u32) -> Result<Option<IndexEntry>> {
        self.with_snapshot(|view, tables| {
            let mut best = view.memtables.iter().filter_map(|m| m.latest_entry(stream)).max();
            for table in tables {
                best = best.max(table.latest_entry(stream)?);
            }
            Ok(best)
        })
    }

    /// Entry with the lowest version of `stream` (lowest position on a tie).
    pub fn oldest_entry(&self, stream: u32) -> Result<Option<IndexEntry>> {
        self.with_snapshot(|view, tables| {
            let mut best = view.memtables.iter().filter_map(|m| m.oldest_entry(stream)).min();
            for table in tables {
                if let Some(e) = table.oldest_entry(stream)? {
                    best = Some(best.map_or(e, |b: IndexEntry| b.min(e)));
                }
            }
            Ok(best)
        })
    }

    /// Every entry of `stream` with `start_version <= version <=
    /// end_version`, newest first, exact duplicates removed.
    ///
    /// An inverted range yields nothing.
    pub fn range(&self, stream: u32, start_version: i64, end_version: i64) -> Result<Vec<IndexEntry>> {
        check_range(start_version, end_version)?;
        if start_version > end_version {
            return Ok(Vec::new());
        }
        self.with_snapshot(|view, tables| {
            let mut out = Vec::new();
            for m in &view.memtables {
                out.extend(m.range(stream, start_version, end_version)?);
            }
            for table in tables {
                for entry in table.table().range(stream, start_version, end_version)? {
                    out.push(entry?);
                }
            }
            sort_for_table(&mut out);
            Ok(out)
        })
    }
}
