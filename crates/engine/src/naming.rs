//! Table file naming.
//!
//! Flushes and merges never pick file names themselves; they ask a
//! [`FileNameProvider`]. Production uses random UUIDs, tests can use a
//! deterministic counter.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use uuid::Uuid;

/// Extension of every table file in the index directory.
pub const TABLE_EXTENSION: &str = "sst";

/// Hands out paths for new table files.
///
/// Returned paths must live directly in the index directory: the manifest
/// records bare file names and reopens them relative to its own location.
pub trait FileNameProvider: Send + Sync {
    fn next_path(&self) -> PathBuf;
}

/// `<uuid-v4>.sst` inside `dir`.
#[derive(Debug, Clone)]
pub struct UuidFileNames {
    dir: PathBuf,
}

impl UuidFileNames {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }
}

impl FileNameProvider for UuidFileNames {
    fn next_path(&self) -> PathBuf {
        self.dir
            .join(format!("{}.{}", Uuid::new_v4().simple(), TABLE_EXTENSION))
    }
}

/// `<prefix>-000000.sst`, `<prefix>-000001.sst`, ... inside `dir`.
///
/// Names that already exist on disk are skipped, so a restarted index never
/// overwrites a live table.
#[derive(Debug)]
pub struct SequentialFileNames {
    dir: PathBuf,
    prefix: String,
    next: AtomicU64,
}

impl SequentialFileNames {
    pub fn new<P: AsRef<Path>>(dir: P, prefix: &str) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            prefix: prefix.to_string(),
            next: AtomicU64::new(0),
        }
    }
}

impl FileNameProvider for SequentialFileNames {
    fn next_path(&self) -> PathBuf {
        loop {
            let n = self.next.fetch_add(1, Ordering::Relaxed);
            let path = self
                .dir
                .join(format!("{}-{:06}.{}", self.prefix, n, TABLE_EXTENSION));
            if !path.exists() {
                return path;
            }
        }
    }
}

/// `true` for names that look like table files.
pub(crate) fn is_table_file(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(TABLE_EXTENSION)
}

/// `true` for leftovers of interrupted table or manifest writes.
pub(crate) fn is_tmp_file(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("tmp")
}
