use crate::*;
use anyhow::Result;
use sstable::{SSTable, SSTableWriter};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub fn count_sst_files(dir: &Path) -> usize {
    fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.path()
                .extension()
                .and_then(|s| s.to_str())
                .map(|ext| ext == "sst")
                .unwrap_or(false)
        })
        .count()
}

pub fn build_table(dir: &Path, name: &str, entries: Vec<IndexEntry>) -> Result<Arc<SSTable>> {
    Ok(Arc::new(SSTableWriter::build(entries, &dir.join(name), 4)?))
}

pub fn keep_all(_: &IndexEntry) -> bool {
    true
}

pub fn small_config(dir: &Path, memtable: usize) -> IndexConfig {
    IndexConfig::new(dir)
        .with_max_memtable_entries(memtable)
        .with_max_tables_per_level(4)
        .with_cache_depth(4)
        .with_disposal_timeout(Duration::from_secs(2))
}

/// An index over `log` with deterministic table names, initialized to the
/// end of the log.
pub fn open_index(config: IndexConfig, log: &Arc<MemoryLog>) -> Result<TableIndex> {
    let names = Arc::new(SequentialFileNames::new(&config.dir, "t"));
    let index = TableIndex::with_options(config, log.clone(), names, Arc::new(keep_all));
    index.initialize(log.end_position())?;
    Ok(index)
}

/// Appends to the log, then indexes the record.
pub fn append(index: &TableIndex, log: &MemoryLog, stream: u32, version: i64) -> Result<LogRecord> {
    let r = log.append(stream, version);
    index.add(r.commit_position, r.stream, r.version, r.position)?;
    Ok(r)
}
