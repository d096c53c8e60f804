//! # Config - stream index settings
//!
//! All tunables of the index live in [`IndexConfig`]. Values can be set in
//! code with the `with_*` builders or read from the environment:
//!
//! ```text
//! STREAMINDEX_DIR              index directory               (default: "data/index")
//! STREAMINDEX_MEMTABLE_SIZE    entries per memtable          (default: 1000000)
//! STREAMINDEX_TABLES_PER_LEVEL fan-out before a level merges (default: 4)
//! STREAMINDEX_CACHE_DEPTH      midpoint cache depth          (default: 16)
//! STREAMINDEX_VERIFY           verify table checksums on open (default: "true")
//! STREAMINDEX_FLUSH_RETRIES    background flush attempts     (default: 3)
//! STREAMINDEX_DISPOSAL_MS      wait for table deletion, ms   (default: 5000)
//! ```
//!
//! Unparseable values fall back to the default, matching how the CLI has
//! always treated its environment.

use anyhow::{ensure, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_DIR: &str = "data/index";
pub const DEFAULT_MAX_MEMTABLE_ENTRIES: usize = 1_000_000;
pub const DEFAULT_MAX_TABLES_PER_LEVEL: usize = 4;
pub const DEFAULT_CACHE_DEPTH: u32 = 16;
pub const DEFAULT_FLUSH_RETRIES: u32 = 3;
pub const DEFAULT_DISPOSAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on the midpoint cache depth (2^28 samples per table).
pub const MAX_CACHE_DEPTH: u32 = 28;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexConfig {
    /// Directory holding table files and the manifest.
    pub dir: PathBuf,
    /// A memtable is flushed once it holds this many entries.
    pub max_memtable_entries: usize,
    /// A level is merged upward once it holds this many tables.
    pub max_tables_per_level: usize,
    /// Each table samples up to `2^cache_depth` midpoints.
    pub cache_depth: u32,
    /// Recompute every table checksum when loading the manifest.
    pub verify_tables_on_open: bool,
    /// Attempts per background flush before giving up.
    pub flush_retries: u32,
    /// How long `close` waits for superseded files to be deleted.
    pub disposal_timeout: Duration,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(DEFAULT_DIR),
            max_memtable_entries: DEFAULT_MAX_MEMTABLE_ENTRIES,
            max_tables_per_level: DEFAULT_MAX_TABLES_PER_LEVEL,
            cache_depth: DEFAULT_CACHE_DEPTH,
            verify_tables_on_open: true,
            flush_retries: DEFAULT_FLUSH_RETRIES,
            disposal_timeout: DEFAULT_DISPOSAL_TIMEOUT,
        }
    }
}

/// Parses `key` through `lookup`, falling back to `default`.
fn parsed_or<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

impl IndexConfig {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Reads `STREAMINDEX_*` variables from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup. Missing or unparseable
    /// keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        Self {
            dir: lookup("STREAMINDEX_DIR").map(PathBuf::from).unwrap_or(d.dir),
            max_memtable_entries: parsed_or(&lookup, "STREAMINDEX_MEMTABLE_SIZE", d.max_memtable_entries),
            max_tables_per_level: parsed_or(&lookup, "STREAMINDEX_TABLES_PER_LEVEL", d.max_tables_per_level),
            cache_depth: parsed_or(&lookup, "STREAMINDEX_CACHE_DEPTH", d.cache_depth),
            verify_tables_on_open: parsed_or(&lookup, "STREAMINDEX_VERIFY", d.verify_tables_on_open),
            flush_retries: parsed_or(&lookup, "STREAMINDEX_FLUSH_RETRIES", d.flush_retries),
            disposal_timeout: Duration::from_millis(parsed_or(
                &lookup,
                "STREAMINDEX_DISPOSAL_MS",
                d.disposal_timeout.as_millis() as u64,
            )),
        }
    }

    pub fn with_max_memtable_entries(mut self, n: usize) -> Self {
        self.max_memtable_entries = n;
        self
    }

    pub fn with_max_tables_per_level(mut self, n: usize) -> Self {
        self.max_tables_per_level = n;
        self
    }

    pub fn with_cache_depth(mut self, depth: u32) -> Self {
        self.cache_depth = depth;
        self
    }

    pub fn with_verify_tables_on_open(mut self, verify: bool) -> Self {
        self.verify_tables_on_open = verify;
        self
    }

    pub fn with_flush_retries(mut self, retries: u32) -> Self {
        self.flush_retries = retries;
        self
    }

    pub fn with_disposal_timeout(mut self, timeout: Duration) -> Self {
        self.disposal_timeout = timeout;
        self
    }

    /// Checks the settings the index cannot run with.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.max_memtable_entries >= 1, "max_memtable_entries must be >= 1");
        ensure!(
            self.max_tables_per_level >= 2,
            "max_tables_per_level must be >= 2, got {}",
            self.max_tables_per_level
        );
        ensure!(
            self.cache_depth <= MAX_CACHE_DEPTH,
            "cache_depth {} exceeds maximum {}",
            self.cache_depth,
            MAX_CACHE_DEPTH
        );
        ensure!(self.flush_retries >= 1, "flush_retries must be >= 1");
        Ok(())
    }
}
