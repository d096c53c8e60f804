//! # Engine - stream index orchestrator
//!
//! Ties the [`memtable`] and [`sstable`] crates into [`TableIndex`], an LSM
//! index from `(stream hash, version)` to log position.
//!
//! ## Architecture
//!
//! ```text
//! add() ──> live MemTable ──(full)──> retired MemTables ──> flush worker
//!                                                             │
//!                      build table, add_table, save MANIFEST  │
//!                                                             v
//!                         level 0: [t0 t1 t2]  ──(full)──> merge
//!                         level 1: [t3]                      │
//!                         level 2: ...      <────────────────┘
//!
//! reads: one IndexView snapshot = live + retired memtables + manifest
//! ```
//!
//! ## Module Responsibilities
//!
//! | Module         | Purpose                                               |
//! |----------------|-------------------------------------------------------|
//! | `lib.rs`       | `TableIndex`, state, snapshot view, `stats`, `Debug`  |
//! | [`recovery`]   | `initialize`: cleanup, manifest load, log replay      |
//! | [`write`]      | `add`, memtable rotation, the flush worker, `close`   |
//! | [`read`]       | `lookup_exact`, `latest_entry`, `oldest_entry`, `range` |
//! | [`compaction`] | `TableManifest::add_table` with cascading merges      |
//! | [`manifest`]   | Persistent level layout (checksummed, atomic writes)  |
//!
//! ## Concurrency
//!
//! Writers are serialized by an internal lock. Readers never block writers:
//! they load the current [`IndexView`] from an `ArcSwap` and take a counted
//! reference on every table in it. A table merged away is deleted only once
//! the last such reference is dropped.

mod compaction;
mod log_reader;
mod manifest;
mod naming;
mod read;
mod recovery;
mod write;

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use arc_swap::ArcSwap;

pub use compaction::AddTableResult;
pub use config::IndexConfig;
pub use log_reader::{LogReader, LogRecord, MemoryLog};
pub use manifest::{TableManifest, MANIFEST_FILENAME, MANIFEST_FORMAT_VERSION};
pub use memtable::{IndexEntry, IndexError, Result};
pub use naming::{FileNameProvider, SequentialFileNames, UuidFileNames, TABLE_EXTENSION};

use memtable::MemTable;
use write::Worker;

/// Decides whether an entry survives a merge.
pub type LivenessCheck = Arc<dyn Fn(&IndexEntry) -> bool + Send + Sync>;

/// Lifecycle of a [`TableIndex`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexState {
    Uninitialized,
    Initializing,
    Ready,
    Closed,
}

/// What readers see: the live memtable first, then retired memtables from
/// newest to oldest, then the persisted tables.
#[derive(Debug)]
pub(crate) struct IndexView {
    pub(crate) memtables: Vec<Arc<MemTable>>,
    pub(crate) manifest: Arc<TableManifest>,
}

impl IndexView {
    fn fresh(config: &IndexConfig, manifest: TableManifest) -> Self {
        Self {
            memtables: vec![Arc::new(MemTable::new(config.max_memtable_entries))],
            manifest: Arc::new(manifest),
        }
    }

    pub(crate) fn live(&self) -> &Arc<MemTable> {
        &self.memtables[0]
    }
}

/// State the flush worker shares with the index handle.
pub(crate) struct Shared {
    pub(crate) config: IndexConfig,
    pub(crate) manifest_path: PathBuf,
    pub(crate) view: ArcSwap<IndexView>,
    pub(crate) names: Arc<dyn FileNameProvider>,
    pub(crate) is_live: LivenessCheck,
    /// Memtables handed to the worker and not yet finished.
    pub(crate) pending: Mutex<usize>,
    pub(crate) idle: Condvar,
    pub(crate) last_error: Mutex<Option<String>>,
    pub(crate) faulted: AtomicBool,
}

/// Checkpoints of everything added so far.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WriterState {
    pub(crate) prepare_checkpoint: i64,
    pub(crate) commit_checkpoint: i64,
}

/// Point-in-time numbers for monitoring and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexStats {
    pub state: IndexState,
    pub live_memtable_entries: usize,
    /// Retired memtables still waiting to be persisted.
    pub pending_flushes: usize,
    pub tables_per_level: Vec<usize>,
    /// Checkpoints of the persisted manifest.
    pub prepare_checkpoint: i64,
    pub commit_checkpoint: i64,
}

/// The stream index.
///
/// # Lifecycle
///
/// 1. [`TableIndex::new`] - nothing touches the disk yet.
/// 2. [`TableIndex::initialize`] - load the manifest, replay the log tail.
/// 3. [`TableIndex::add`] and the queries, from any number of threads.
/// 4. [`TableIndex::close`] - drain the flush queue, optionally delete files.
pub struct TableIndex {
    pub(crate) shared: Arc<Shared>,
    pub(crate) log: Arc<dyn LogReader>,
    pub(crate) state: Mutex<IndexState>,
    pub(crate) writer: Mutex<WriterState>,
    pub(crate) worker: Mutex<Option<Worker>>,
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TableIndex {
    /// Random table names, every entry kept on merge.
    pub fn new(config: IndexConfig, log: Arc<dyn LogReader>) -> Self {
        let names = Arc::new(UuidFileNames::new(&config.dir));
        Self::with_options(config, log, names, Arc::new(|_: &IndexEntry| true))
    }

    pub fn with_options(
        config: IndexConfig,
        log: Arc<dyn LogReader>,
        names: Arc<dyn FileNameProvider>,
        is_live: LivenessCheck,
    ) -> Self {
        let manifest = TableManifest::empty(config.max_tables_per_level, config.cache_depth);
        let view = IndexView::fresh(&config, manifest);
        Self {
            shared: Arc::new(Shared {
                manifest_path: config.dir.join(MANIFEST_FILENAME),
                view: ArcSwap::from_pointee(view),
                names,
                is_live,
                pending: Mutex::new(0),
                idle: Condvar::new(),
                last_error: Mutex::new(None),
                faulted: AtomicBool::new(false),
                config,
            }),
            log,
            state: Mutex::new(IndexState::Uninitialized),
            writer: Mutex::new(WriterState {
                prepare_checkpoint: -1,
                commit_checkpoint: -1,
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn state(&self) -> IndexState {
        *lock(&self.state)
    }

    pub fn config(&self) -> &IndexConfig {
        &self.shared.config
    }

    pub fn dir(&self) -> &Path {
        &self.shared.config.dir
    }

    /// The current manifest snapshot.
    pub fn manifest(&self) -> Arc<TableManifest> {
        Arc::clone(&self.shared.view.load().manifest)
    }

    /// Message of the most recent background flush failure, if any.
    pub fn last_background_error(&self) -> Option<String> {
        lock(&self.shared.last_error).clone()
    }

    pub fn stats(&self) -> IndexStats {
        let view = self.shared.view.load();
        IndexStats {
            state: self.state(),
            live_memtable_entries: view.live().len(),
            pending_flushes: view.memtables.len() - 1,
            tables_per_level: view.manifest.tables_per_level(),
            prepare_checkpoint: view.manifest.prepare_checkpoint(),
            commit_checkpoint: view.manifest.commit_checkpoint(),
        }
    }
}

impl std::fmt::Debug for TableIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("TableIndex")
            .field("dir", &self.shared.config.dir)
            .field("state", &stats.state)
            .field("live_memtable_entries", &stats.live_memtable_entries)
            .field("pending_flushes", &stats.pending_flushes)
            .field("tables_per_level", &stats.tables_per_level)
            .field("prepare_checkpoint", &stats.prepare_checkpoint)
            .field("commit_checkpoint", &stats.commit_checkpoint)
            .finish()
    }
}

/// Best-effort close on drop.
///
/// Queued memtables are still flushed. Errors are ignored because Drop cannot
/// propagate them; anything lost is recovered from the log on restart.
impl Drop for TableIndex {
    fn drop(&mut self) {
        let _ = self.close(false);
    }
}

#[cfg(test)]
mod tests;
