/// Startup: directory cleanup, manifest load and log replay.
///
/// The manifest records the commit checkpoint of the newest persisted
/// table. Everything after it exists only in the log and is replayed into
/// fresh memtables before the index accepts writes. Replayed entries that
/// are already persisted are harmless duplicates.
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use memtable::{IndexError, Result};
use tracing::{debug, error, info, warn};

use crate::manifest::TableManifest;
use crate::naming::{is_table_file, is_tmp_file};
use crate::write::Worker;
use crate::{lock, IndexState, IndexView, TableIndex};

impl TableIndex {
    /// Brings the index up to date with the log up to
    /// `target_log_position` (exclusive) and moves it to
    /// [`IndexState::Ready`].
    ///
    /// # Steps
    ///
    /// 1. Validate the config and create the index directory.
    /// 2. Delete leftover `.tmp` files from interrupted writes.
    /// 3. Load the manifest (empty if none exists).
    /// 4. Delete table files the manifest does not reference.
    /// 5. Start the flush worker.
    /// 6. Replay the log from the commit checkpoint to the target.
    ///
    /// # Errors
    ///
    /// - [`IndexError::InvalidState`] unless the index is uninitialized.
    /// - Corruption errors from the manifest or its tables.
    /// - [`IndexError::RecoveryFailed`] if replay fails or the log ends
    ///   before the target.
    ///
    /// On any error the index ends up [`IndexState::Closed`].
    pub fn initialize(&self, target_log_position: i64) -> Result<()> {
        {
            let mut state = lock(&self.state);
            if *state != IndexState::Uninitialized {
                return Err(IndexError::InvalidState("index is already initialized"));
            }
            *state = IndexState::Initializing;
        }

        let started = Instant::now();
        match self.recover(target_log_position) {
            Ok(replayed) => {
                *lock(&self.state) = IndexState::Ready;
                let stats = self.stats();
                info!(
                    dir = %self.dir().display(),
                    tables_per_level = ?stats.tables_per_level,
                    commit_checkpoint = stats.commit_checkpoint,
                    replayed,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "index ready"
                );
                Ok(())
            }
            Err(e) => {
                error!(dir = %self.dir().display(), error = %e, "index initialization failed");
                self.stop_worker();
                *lock(&self.state) = IndexState::Closed;
                Err(e)
            }
        }
    }

    /// Returns the number of replayed log records.
    fn recover(&self, target: i64) -> Result<u64> {
        let config = &self.shared.config;
        config
            .validate()
            .map_err(|e| IndexError::InvalidArgument(e.to_string()))?;
        fs::create_dir_all(&config.dir)?;
        remove_tmp_files(&config.dir);

        let manifest = TableManifest::load_from_file(
            &self.shared.manifest_path,
            config.max_tables_per_level,
            config.cache_depth,
            config.verify_tables_on_open,
        )?;
        remove_orphan_tables(&config.dir, &manifest);

        let from = manifest.commit_checkpoint().max(0);
        {
            let mut writer = lock(&self.writer);
            writer.prepare_checkpoint = manifest.prepare_checkpoint();
            writer.commit_checkpoint = manifest.commit_checkpoint();
        }
        self.shared
            .view
            .store(Arc::new(IndexView::fresh(config, manifest)));
        *lock(&self.worker) = Some(Worker::spawn(Arc::clone(&self.shared))?);

        if from >= target {
            return Ok(0);
        }

        let mut replayed = 0u64;
        let reached = self
            .log
            .replay(from, target, &mut |record| {
                self.add_entry(
                    record.commit_position,
                    record.stream,
                    record.version,
                    record.position,
                )?;
                replayed += 1;
                Ok(())
            })
            .map_err(|e| {
                IndexError::RecoveryFailed(format!("replay from {} to {} failed: {}", from, target, e))
            })?;
        if reached < target {
            return Err(IndexError::RecoveryFailed(format!(
                "log ended at {} before target {}",
                reached, target
            )));
        }
        debug!(from, target, replayed, "log replayed");
        Ok(replayed)
    }
}

/// Deletes leftovers of interrupted table or manifest writes.
fn remove_tmp_files(dir: &Path) {
    let Ok(entries) = fs::read_dir(dir) else { return };
    for path in entries.flatten().map(|e| e.path()) {
        if is_tmp_file(&path) {
            match fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "removed tmp file"),
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove tmp file"),
            }
        }
    }
}

/// Deletes table files that no manifest references, e.g. outputs of a
/// flush that crashed before the manifest was saved.
fn remove_orphan_tables(dir: &Path, manifest: &TableManifest) {
    let Ok(entries) = fs::read_dir(dir) else { return };
    for path in entries.flatten().map(|e| e.path()) {
        if !is_table_file(&path) || manifest.tables().any(|t| t.path() == path) {
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => info!(path = %path.display(), "removed orphaned table"),
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove orphaned table"),
        }
    }
}
