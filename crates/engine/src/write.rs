/// Write path: `add()`, memtable rotation, the background flush worker and
/// `close()`.
///
/// Entries go into the live memtable. When it fills up it is retired: a new
/// live memtable takes its place in the view and the full one is queued for
/// the flush worker, which persists it as a table, folds the table into the
/// manifest and only then drops the memtable from the view. Until that swap
/// the memtable keeps answering queries.
use std::sync::atomic::Ordering;
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use memtable::{IndexError, MemTable, Result};
use sstable::SSTableWriter;
use tracing::{debug, error, info, warn};

use crate::compaction::AddTableResult;
use crate::{lock, IndexState, IndexView, Shared, TableIndex, WriterState};

/// A retired memtable and the checkpoints it was retired at.
pub(crate) struct FlushJob {
    memtable: Arc<MemTable>,
    prepare_checkpoint: i64,
    commit_checkpoint: i64,
}

pub(crate) struct Worker {
    sender: Sender<FlushJob>,
    handle: JoinHandle<()>,
}

impl Worker {
    pub(crate) fn spawn(shared: Arc<Shared>) -> Result<Self> {
        let (sender, receiver) = mpsc::channel::<FlushJob>();
        let handle = thread::Builder::new()
            .name("index-flush".to_string())
            .spawn(move || {
                for job in receiver {
                    shared.run_flush(job);
                }
                debug!("flush worker stopped");
            })?;
        Ok(Self { sender, handle })
    }

    /// Closes the queue and waits for every queued job to finish.
    fn stop(self) {
        drop(self.sender);
        if self.handle.join().is_err() {
            error!("flush worker panicked");
        }
    }
}

impl TableIndex {
    /// Records that `stream` at `version` lives at `position`, committed at
    /// `commit_position`.
    ///
    /// Only valid once the index is [`IndexState::Ready`]. Calls are
    /// serialized internally; callers should still add in log order so the
    /// checkpoints advance monotonically.
    ///
    /// # Errors
    ///
    /// - [`IndexError::InvalidState`] before `initialize` or after `close`.
    /// - [`IndexError::InvalidArgument`] on a negative argument.
    /// - [`IndexError::Faulted`] after a background flush failed for good.
    pub fn add(&self, commit_position: i64, stream: u32, version: i64, position: i64) -> Result<()> {
        if self.state() != IndexState::Ready {
            return Err(IndexError::InvalidState("index is not ready"));
        }
        self.add_entry(commit_position, stream, version, position)
    }

    /// [`TableIndex::add`] without the state check; used by log replay.
    pub(crate) fn add_entry(
        &self,
        commit_position: i64,
        stream: u32,
        version: i64,
        position: i64,
    ) -> Result<()> {
        if commit_position < 0 {
            return Err(IndexError::InvalidArgument(format!(
                "commit position must be >= 0, got {}",
                commit_position
            )));
        }
        if self.shared.faulted.load(Ordering::Acquire) {
            let reason = self
                .last_background_error()
                .unwrap_or_else(|| "background flush failed".to_string());
            return Err(IndexError::Faulted(reason));
        }

        let mut writer = lock(&self.writer);
        let view = self.shared.view.load();
        let live = view.live();
        live.add(stream, version, position)?;
        writer.prepare_checkpoint = writer.prepare_checkpoint.max(position);
        writer.commit_checkpoint = writer.commit_checkpoint.max(commit_position);

        if live.is_full() {
            self.rotate_memtable(Arc::clone(live), &writer)?;
        }
        Ok(())
    }

    /// Swaps in an empty live memtable and queues `full` for flushing.
    /// Caller holds the writer lock.
    fn rotate_memtable(&self, full: Arc<MemTable>, writer: &WriterState) -> Result<()> {
        let fresh = Arc::new(MemTable::new(self.shared.config.max_memtable_entries));
        self.shared.view.rcu(|v| {
            let mut memtables = Vec::with_capacity(v.memtables.len() + 1);
            memtables.push(Arc::clone(&fresh));
            memtables.extend(v.memtables.iter().cloned());
            IndexView {
                memtables,
                manifest: Arc::clone(&v.manifest),
            }
        });

        *lock(&self.shared.pending) += 1;
        let job = FlushJob {
            memtable: full,
            prepare_checkpoint: writer.prepare_checkpoint,
            commit_checkpoint: writer.commit_checkpoint,
        };
        let sent = match lock(&self.worker).as_ref() {
            Some(worker) => worker.sender.send(job).is_ok(),
            None => false,
        };
        if !sent {
            // the memtable stays readable in the view; the log still has it
            self.shared.finish_job();
            return Err(IndexError::InvalidState("flush worker is not running"));
        }
        debug!(
            prepare = writer.prepare_checkpoint,
            commit = writer.commit_checkpoint,
            "memtable retired"
        );
        Ok(())
    }

    /// Blocks until every retired memtable has been flushed (or given up on).
    pub fn wait_until_idle(&self) {
        let pending = lock(&self.shared.pending);
        let _idle = self
            .shared
            .idle
            .wait_while(pending, |n| *n > 0)
            .unwrap_or_else(std::sync::PoisonError::into_inner);
    }

    /// Stops the flush worker after it has drained its queue.
    ///
    /// The live memtable is not flushed; its entries are recovered from the
    /// log on the next start. With `remove_files` every table and the
    /// manifest are deleted, waiting up to the configured disposal timeout
    /// for readers to let go.
    pub fn close(&self, remove_files: bool) -> Result<()> {
        {
            let mut state = lock(&self.state);
            if *state == IndexState::Closed {
                return Ok(());
            }
            *state = IndexState::Closed;
        }
        self.stop_worker();

        if remove_files {
            let manifest = self.manifest();
            for table in manifest.tables() {
                table.mark_for_destruction();
            }
            let timeout = self.shared.config.disposal_timeout;
            for table in manifest.tables() {
                if !table.wait_for_disposal(timeout) {
                    warn!(
                        table = %table.file_name(),
                        timeout_ms = timeout.as_millis() as u64,
                        "table still referenced, not deleted"
                    );
                }
            }
            match std::fs::remove_file(&self.shared.manifest_path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        info!(dir = %self.shared.config.dir.display(), remove_files, "index closed");
        Ok(())
    }

    pub(crate) fn stop_worker(&self) {
        let worker = lock(&self.worker).take();
        if let Some(worker) = worker {
            worker.stop();
        }
    }
}

impl Shared {
    fn finish_job(&self) {
        let mut pending = lock(&self.pending);
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.idle.notify_all();
        }
    }

    /// Flushes one retired memtable, retrying with fresh file names.
    ///
    /// After the last failed attempt the index is faulted: later jobs are
    /// skipped so the persisted checkpoints never move past data that is
    /// only in memory.
    fn run_flush(&self, job: FlushJob) {
        if self.faulted.load(Ordering::Acquire) {
            warn!(entries = job.memtable.len(), "index faulted, memtable kept in memory");
            self.finish_job();
            return;
        }

        let attempts = self.config.flush_retries.max(1);
        for attempt in 1..=attempts {
            match self.flush_memtable(&job) {
                Ok(()) => break,
                Err(e) if attempt < attempts => {
                    warn!(attempt, error = %e, "flush failed, retrying");
                    thread::sleep(Duration::from_millis(50 * u64::from(attempt)));
                }
                Err(e) => {
                    error!(attempts, error = %e, "flush failed, index faulted");
                    *lock(&self.last_error) = Some(e.to_string());
                    self.faulted.store(true, Ordering::Release);
                }
            }
        }
        self.finish_job();
    }

    fn flush_memtable(&self, job: &FlushJob) -> Result<()> {
        let started = Instant::now();
        let path = self.names.next_path();
        let table = Arc::new(SSTableWriter::build(
            job.memtable.sorted_entries(),
            &path,
            self.config.cache_depth,
        )?);

        // only this thread replaces the manifest
        let current = Arc::clone(&self.view.load().manifest);
        let AddTableResult { manifest, to_delete } = current
            .add_table(
                Arc::clone(&table),
                job.prepare_checkpoint,
                job.commit_checkpoint,
                &*self.is_live,
                &*self.names,
            )
            .map_err(|e| {
                table.mark_for_destruction();
                e
            })?;

        if let Err(e) = manifest.save_to_file(&self.manifest_path) {
            for t in manifest.tables_not_in(&current) {
                t.mark_for_destruction();
            }
            for t in to_delete.iter().filter(|t| !current.contains(t)) {
                t.mark_for_destruction();
            }
            return Err(e);
        }

        let manifest = Arc::new(manifest);
        self.view.rcu(|v| IndexView {
            memtables: v
                .memtables
                .iter()
                .filter(|m| !Arc::ptr_eq(m, &job.memtable))
                .cloned()
                .collect(),
            manifest: Arc::clone(&manifest),
        });
        for t in &to_delete {
            t.mark_for_destruction();
        }

        info!(
            table = %table.file_name(),
            entries = table.len(),
            merged_away = to_delete.len(),
            tables_per_level = ?manifest.tables_per_level(),
            commit = job.commit_checkpoint,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "memtable flushed"
        );
        Ok(())
    }
}
