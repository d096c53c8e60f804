//! # Manifest - persistent level layout
//!
//! A [`TableManifest`] is an immutable snapshot of which tables make up the
//! index, grouped into levels, plus the two log checkpoints the tables cover.
//! Every change produces a new manifest; the old one stays valid for readers
//! that still hold it.
//!
//! ## File Format
//!
//! ```text
//! 3A1F09C2          <- CRC32 (hex) of every following byte
//! 1                 <- format version
//! 1200/1180         <- prepare checkpoint / commit checkpoint
//! 0,0,6f1c...e2.sst <- level,index,filename
//! 0,1,a93d...07.sst
//! 1,0,c41b...5a.sst
//!                   <- file ends with a newline
//! ```
//!
//! Lines are ordered by level, then by index within the level. The file is
//! rewritten atomically: write `MANIFEST.tmp`, fsync, rename, fsync the
//! directory.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use memtable::{IndexError, Result};
use sstable::{SSTable, TableRef};
use tracing::debug;

/// Name of the manifest file within the index directory.
pub const MANIFEST_FILENAME: &str = "MANIFEST";

const MANIFEST_TMP_FILENAME: &str = "MANIFEST.tmp";

/// Current manifest format version.
pub const MANIFEST_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone)]
pub struct TableManifest {
    pub(crate) levels: Vec<Vec<Arc<SSTable>>>,
    pub(crate) prepare_checkpoint: i64,
    pub(crate) commit_checkpoint: i64,
    pub(crate) max_tables_per_level: usize,
    pub(crate) cache_depth: u32,
}

fn corrupt(reason: impl Into<String>) -> IndexError {
    IndexError::CorruptManifest(reason.into())
}

impl TableManifest {
    /// No tables, both checkpoints at -1.
    pub fn empty(max_tables_per_level: usize, cache_depth: u32) -> Self {
        Self {
            levels: vec![Vec::new()],
            prepare_checkpoint: -1,
            commit_checkpoint: -1,
            max_tables_per_level,
            cache_depth,
        }
    }

    /// Loads the manifest at `path`, or returns [`TableManifest::empty`] if
    /// no file exists yet.
    ///
    /// Tables are reopened from the manifest's own directory. With `verify`
    /// every table checksum is recomputed.
    ///
    /// # Errors
    ///
    /// [`IndexError::CorruptManifest`] on a checksum mismatch, malformed
    /// structure or a listed table that is missing. Damaged tables surface
    /// their own corruption errors.
    pub fn load_from_file(
        path: &Path,
        max_tables_per_level: usize,
        cache_depth: u32,
        verify: bool,
    ) -> Result<Self> {
        let text = match fs::read(path) {
            Ok(bytes) => String::from_utf8(bytes).map_err(|_| corrupt("manifest is not valid UTF-8"))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(Self::empty(max_tables_per_level, cache_depth))
            }
            Err(e) => return Err(e.into()),
        };

        let (hash_line, body) = text
            .split_once('\n')
            .ok_or_else(|| corrupt("missing checksum line"))?;
        let expected = u32::from_str_radix(hash_line.trim(), 16)
            .map_err(|_| corrupt(format!("bad checksum line '{}'", hash_line)))?;
        let actual = crc32fast::hash(body.as_bytes());
        if expected != actual {
            return Err(corrupt(format!(
                "checksum mismatch: expected {:08X}, got {:08X}",
                expected, actual
            )));
        }
        if !body.ends_with('\n') {
            return Err(corrupt("manifest does not end with a newline"));
        }

        let mut lines = body.lines();
        let version = lines.next().ok_or_else(|| corrupt("missing format version"))?;
        if version.trim() != MANIFEST_FORMAT_VERSION.to_string() {
            return Err(corrupt(format!("unsupported manifest version '{}'", version)));
        }

        let checkpoints = lines.next().ok_or_else(|| corrupt("missing checkpoints"))?;
        let (prepare, commit) = checkpoints
            .split_once('/')
            .and_then(|(p, c)| Some((p.trim().parse::<i64>().ok()?, c.trim().parse::<i64>().ok()?)))
            .ok_or_else(|| corrupt(format!("bad checkpoint line '{}'", checkpoints)))?;

        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut levels: Vec<Vec<Arc<SSTable>>> = vec![Vec::new()];
        for (n, line) in lines.enumerate() {
            let mut parts = line.splitn(3, ',');
            let (level, index, name) = match (parts.next(), parts.next(), parts.next()) {
                (Some(l), Some(i), Some(f)) => (l, i, f),
                _ => return Err(corrupt(format!("table line {}: expected level,index,filename", n + 1))),
            };
            let level: usize = level
                .parse()
                .map_err(|_| corrupt(format!("table line {}: bad level '{}'", n + 1, level)))?;
            let index: usize = index
                .parse()
                .map_err(|_| corrupt(format!("table line {}: bad index '{}'", n + 1, index)))?;
            if name.is_empty() || name.contains('/') || name.contains('\\') {
                return Err(corrupt(format!("table line {}: bad file name '{}'", n + 1, name)));
            }
            while levels.len() <= level {
                levels.push(Vec::new());
            }
            if levels.len() != level + 1 || levels[level].len() != index {
                return Err(corrupt(format!(
                    "table line {}: level {} index {} out of order",
                    n + 1,
                    level,
                    index
                )));
            }

            let table_path = dir.join(name);
            if !table_path.exists() {
                return Err(corrupt(format!("listed table {} is missing", name)));
            }
            let table = SSTable::open(&table_path, cache_depth)?;
            if verify {
                table.verify_integrity()?;
            }
            levels[level].push(Arc::new(table));
        }

        let manifest = Self {
            levels,
            prepare_checkpoint: prepare,
            commit_checkpoint: commit,
            max_tables_per_level,
            cache_depth,
        };
        debug!(
            path = %path.display(),
            tables = manifest.table_count(),
            prepare,
            commit,
            "loaded manifest"
        );
        Ok(manifest)
    }

    /// Renders the manifest text, checksum line included.
    pub(crate) fn render(&self) -> String {
        let mut body = format!(
            "{}\n{}/{}\n",
            MANIFEST_FORMAT_VERSION, self.prepare_checkpoint, self.commit_checkpoint
        );
        for (level, index, table) in self.entries() {
            body.push_str(&format!("{},{},{}\n", level, index, table.file_name()));
        }
        format!("{:08X}\n{}", crc32fast::hash(body.as_bytes()), body)
    }

    /// Atomically replaces the file at `path` with this manifest.
    ///
    /// On error the previous file is still in place.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let tmp_path = path.with_file_name(MANIFEST_TMP_FILENAME);
        let write = || -> io::Result<()> {
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            f.write_all(self.render().as_bytes())?;
            f.flush()?;
            f.sync_all()?;
            fs::rename(&tmp_path, path)?;
            if let Some(dir) = path.parent() {
                // directory fsync is not supported everywhere
                if let Ok(d) = File::open(dir) {
                    let _ = d.sync_all();
                }
            }
            Ok(())
        };
        if let Err(e) = write() {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }
        debug!(path = %path.display(), tables = self.table_count(), "saved manifest");
        Ok(())
    }

    pub fn prepare_checkpoint(&self) -> i64 {
        self.prepare_checkpoint
    }

    pub fn commit_checkpoint(&self) -> i64 {
        self.commit_checkpoint
    }

    pub fn max_tables_per_level(&self) -> usize {
        self.max_tables_per_level
    }

    pub fn levels(&self) -> &[Vec<Arc<SSTable>>] {
        &self.levels
    }

    /// `(level, index, table)` for every table, lowest level first.
    pub fn entries(&self) -> impl Iterator<Item = (usize, usize, &Arc<SSTable>)> + '_ {
        self.levels
            .iter()
            .enumerate()
            .flat_map(|(level, tables)| tables.iter().enumerate().map(move |(i, t)| (level, i, t)))
    }

    pub fn tables(&self) -> impl Iterator<Item = &Arc<SSTable>> + '_ {
        self.levels.iter().flatten()
    }

    pub fn table_count(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }

    /// Table count per level, lowest level first.
    pub fn tables_per_level(&self) -> Vec<usize> {
        self.levels.iter().map(Vec::len).collect()
    }

    /// `true` if `table` is part of this manifest.
    pub fn contains(&self, table: &Arc<SSTable>) -> bool {
        self.tables().any(|t| Arc::ptr_eq(t, table))
    }

    /// Takes a reference on every table. Fails with
    /// [`IndexError::TableDisposed`] if any of them is already gone.
    pub fn acquire_all(&self) -> Result<Vec<TableRef>> {
        self.tables().map(|t| t.acquire()).collect()
    }
}
