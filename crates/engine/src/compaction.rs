/// Leveled compaction: adding a freshly flushed table to the manifest.
///
/// A new table always enters level 0. Whenever a level reaches
/// `max_tables_per_level` tables, all of them are merged into one table
/// appended to the next level, which may in turn fill up and merge. The
/// current manifest is never modified; callers get a new one back along
/// with the tables it no longer references.
use std::sync::Arc;

use memtable::{IndexError, Result};
use sstable::{merge_tables, EntryPredicate, SSTable};
use tracing::{info, warn};

use crate::manifest::TableManifest;
use crate::naming::FileNameProvider;

/// Result of [`TableManifest::add_table`].
#[derive(Debug)]
pub struct AddTableResult {
    pub manifest: TableManifest,
    /// Tables merged away. Delete them once the new manifest is durable.
    pub to_delete: Vec<Arc<SSTable>>,
}

impl TableManifest {
    /// Returns a manifest with `table` added at level 0, cascading merges
    /// upward as levels fill, and with the checkpoints set to the given
    /// values.
    ///
    /// Merges keep only entries accepted by `is_live`. Output paths come from
    /// `names`.
    ///
    /// # Errors
    ///
    /// Any merge failure. `self` is unaffected and merge outputs created
    /// before the failure are deleted.
    pub fn add_table(
        &self,
        table: Arc<SSTable>,
        prepare_checkpoint: i64,
        commit_checkpoint: i64,
        is_live: EntryPredicate<'_>,
        names: &dyn FileNameProvider,
    ) -> Result<AddTableResult> {
        if prepare_checkpoint < 0 || commit_checkpoint < 0 {
            return Err(IndexError::InvalidArgument(format!(
                "checkpoints must be >= 0, got {}/{}",
                prepare_checkpoint, commit_checkpoint
            )));
        }

        let mut levels = self.levels.clone();
        if levels.is_empty() {
            levels.push(Vec::new());
        }
        levels[0].push(table);

        let mut to_delete = Vec::new();
        let mut created: Vec<Arc<SSTable>> = Vec::new();
        let mut level = 0;
        while level < levels.len() {
            if levels[level].len() >= self.max_tables_per_level {
                let output = names.next_path();
                let merged = match merge_tables(&levels[level], &output, self.cache_depth, is_live) {
                    Ok(t) => Arc::new(t),
                    Err(e) => {
                        warn!(level, error = %e, "merge failed, discarding partial cascade");
                        for t in &created {
                            t.mark_for_destruction();
                        }
                        return Err(e);
                    }
                };
                info!(
                    level,
                    inputs = levels[level].len(),
                    output = %merged.file_name(),
                    entries = merged.len(),
                    "compacted level"
                );
                to_delete.append(&mut levels[level]);
                if level + 1 == levels.len() {
                    levels.push(Vec::new());
                }
                created.push(Arc::clone(&merged));
                levels[level + 1].push(merged);
            }
            level += 1;
        }

        Ok(AddTableResult {
            manifest: TableManifest {
                levels,
                prepare_checkpoint,
                commit_checkpoint,
                max_tables_per_level: self.max_tables_per_level,
                cache_depth: self.cache_depth,
            },
            to_delete,
        })
    }

    /// Tables referenced here but not by `older`, i.e. created on the way
    /// from `older` to `self`.
    pub(crate) fn tables_not_in(&self, older: &TableManifest) -> Vec<Arc<SSTable>> {
        self.tables()
            .filter(|t| !older.contains(t))
            .cloned()
            .collect()
    }
}
