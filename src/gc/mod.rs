//! Garbage collection of log files.
//!
//! The collector reclaims whole files. A file is worth cleaning when the
//! share of its bytes superseded by later commits exceeds
//! `100 - min_utilization` percent. Cleaning a file means re-appending its
//! live pages through an ordinary transaction; once that transaction has
//! committed the file is only referenced by transactions that began before
//! it, so the file waits for those to finish before it can be deleted.
//!
//! ```text
//!   clean_file          safe task           delay             sweep
//!  ----------> pending ----------> released -------> queued -------> removed
//!                                                  (flush + fsync first)
//! ```
//!
//! Cleaning cycles run on the [`BackgroundCleaner`]'s job processor, see
//! [`cleaner`].

pub mod cleaner;
pub mod utilization;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use crossbeam_skiplist::SkipSet;

use crate::config::GcConfig;
use crate::env::{EnvironmentInner, Transaction};
use crate::error::Result;
use crate::log::address;
use crate::log::loggable::{META_TREE_ID, NO_STRUCTURE_ID};
use crate::log::{Address, Log, RemoveBlockType};
use crate::scheduler::JobProcessor;
use crate::Error;

pub use cleaner::BackgroundCleaner;
pub use utilization::{FileUtilization, UtilizationProfile, UTILIZATION_STORE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcState {
    Idle,
    Cleaning,
    Suspended,
    /// Terminal, the cleaner never runs again.
    Finished,
}

pub struct GarbageCollector {
    env: Weak<EnvironmentInner>,
    config: GcConfig,
    up: UtilizationProfile,
    cleaner: BackgroundCleaner,
    /// Files created since the last cycle.
    new_files: AtomicUsize,
    /// Cleaned files, until they are removed.
    pending: SkipSet<Address>,
    /// Pending files no transaction can reach anymore.
    released: SkipSet<Address>,
    /// Released files whose deletion delay has passed.
    deletion_queue: SkipSet<Address>,
}

impl GarbageCollector {
    pub(crate) fn new(
        env: Weak<EnvironmentInner>,
        config: GcConfig,
        log: Arc<Log>,
        processor: Arc<JobProcessor>,
    ) -> Self {
        Self {
            up: UtilizationProfile::new(log, &config),
            cleaner: BackgroundCleaner::new(env.clone(), processor),
            new_files: AtomicUsize::new(config.files_interval + 1),
            env,
            config,
            pending: SkipSet::new(),
            released: SkipSet::new(),
            deletion_queue: SkipSet::new(),
        }
    }

    fn env(&self) -> Result<Arc<EnvironmentInner>> {
        self.env
            .upgrade()
            .ok_or_else(|| Error::InvalidState("Environment is gone".to_string()))
    }

    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    pub fn utilization_profile(&self) -> &UtilizationProfile {
        &self.up
    }

    pub fn cleaner(&self) -> &BackgroundCleaner {
        &self.cleaner
    }

    pub fn state(&self) -> GcState {
        if self.cleaner.is_finished() {
            GcState::Finished
        } else if self.cleaner.is_suspended() {
            GcState::Suspended
        } else if self.cleaner.is_cleaning() {
            GcState::Cleaning
        } else {
            GcState::Idle
        }
    }

    /// Queues the first cycle at `start_in` after the environment was created.
    pub(crate) fn start(&self, env: &EnvironmentInner) {
        if self.config.enabled {
            self.wake_at(env.created() + self.config.start_in);
        }
    }

    pub(crate) fn fetch_expired(&self, expired: &[(Address, u64)]) -> Result<()> {
        self.up.fetch_expired(expired)
    }

    pub(crate) fn on_new_file(&self, file: Address) {
        let new_files = self.new_files.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::trace!(file, new_files, "New log file");
        if self.config.enabled
            && !self.cleaner.is_cleaning()
            && new_files > self.config.files_interval
            && self.is_too_much_free_space()
        {
            self.wake();
        }
    }

    pub fn new_files(&self) -> usize {
        self.new_files.load(Ordering::SeqCst)
    }

    fn reset_new_files(&self) {
        self.new_files.store(0, Ordering::SeqCst);
    }

    /// Queues a cycle once the transactions running now have finished.
    pub fn wake(&self) {
        if !self.config.enabled {
            return;
        }
        let Ok(env) = self.env() else {
            return;
        };
        let weak = self.env.clone();
        env.execute_transaction_safe_task(move || {
            if let Some(env) = weak.upgrade() {
                env.gc.cleaner.queue_cleaning_job();
            }
        });
    }

    pub fn wake_at(&self, at: Instant) {
        if self.config.enabled {
            self.cleaner.queue_cleaning_job_at(at);
        }
    }

    pub fn is_too_much_free_space(&self) -> bool {
        self.up.total_free_space_percent() > self.config.max_free_space_percent() as u64
    }

    pub fn is_file_to_be_deleted(&self, file: Address) -> bool {
        self.pending.contains(&file)
    }

    /// Cleaned files not removed yet, oldest first.
    pub fn pending_files(&self) -> Vec<Address> {
        self.pending.iter().map(|entry| *entry.value()).collect()
    }

    pub fn suspend(&self) -> Result<()> {
        self.cleaner.suspend()
    }

    pub fn resume(&self) {
        self.cleaner.resume()
    }

    /// Stops the cleaner for good.
    pub fn finish(&self) {
        self.cleaner.finish()
    }

    /// Recomputes the profile from the trees reachable from the latest
    /// commit, dropping what was accounted or loaded before.
    pub fn rebuild_utilization_profile(&self) -> Result<()> {
        let env = self.env()?;
        self.up.rebuild(&env)
    }

    pub(crate) fn can_continue(&self, env: &Arc<EnvironmentInner>) -> Result<bool> {
        self.delete_pending_files_with(env)?;
        Ok(self.is_cleaning_allowed())
    }

    fn is_cleaning_allowed(&self) -> bool {
        !self.cleaner.is_suspended()
            && !self.cleaner.is_finished()
            && self.config.enabled
            && self.is_too_much_free_space()
    }

    /// One cleaning cycle on the calling task: cleans the files ranked by
    /// [`UtilizationProfile::files_sorted_by_utilization`] while cleaning
    /// stays worthwhile. Returns the number of files cleaned, 0 without
    /// doing anything if another cycle is running.
    pub async fn clean_log(&self) -> Result<usize> {
        let env = self.env()?;
        if !self.cleaner.begin_cleaning() {
            tracing::debug!("Cleaning cycle already running");
            return Ok(0);
        }
        let result = self.run_cycle(&env, false).await;
        self.cleaner.end_cleaning();
        result
    }

    /// With `handoff` the cycle stops after the current file once the
    /// cleaner moved to another processor.
    pub(crate) async fn run_cycle(&self, env: &Arc<EnvironmentInner>, handoff: bool) -> Result<usize> {
        let started = Instant::now();
        let new_files = self.new_files();
        let files = self
            .up
            .files_sorted_by_utilization(|file| self.is_file_to_be_deleted(file));
        tracing::info!(
            candidates = files.len(),
            free_percent = self.up.total_free_space_percent(),
            "Started cleaning cycle"
        );

        let mut cleaned = 0;
        let mut deleted = 0;
        for (i, file) in files.into_iter().enumerate() {
            deleted += self.delete_pending_files_with(env)?;
            if !self.is_cleaning_allowed() {
                break;
            }
            if handoff && !self.cleaner.is_current_thread() {
                tracing::debug!("Cleaner moved to another processor");
                break;
            }
            self.reset_new_files();

            if i > new_files {
                if !self.clean_file_with(env, file)? {
                    break;
                }
                cleaned += 1;
            } else {
                for attempt in 0..self.config.fresh_file_retries.max(1) {
                    if attempt > 0 && !self.is_cleaning_allowed() {
                        break;
                    }
                    if self.clean_file_with(env, file)? {
                        cleaned += 1;
                        break;
                    }
                    tokio::task::yield_now().await;
                }
            }
            tokio::task::yield_now().await;
        }
        self.reset_new_files();

        tracing::info!(
            cleaned,
            deleted,
            pending = self.pending.len(),
            free_percent = self.up.total_free_space_percent(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Finished cleaning cycle"
        );
        Ok(cleaned)
    }

    /// Cleans every file but the tail, regardless of utilization. Returns
    /// the number of files cleaned, 0 if a cleaning cycle is running.
    pub fn clean_whole_log(&self) -> Result<usize> {
        let env = self.env()?;
        if !self.cleaner.begin_cleaning() {
            tracing::debug!("Cleaning cycle already running");
            return Ok(0);
        }
        let result = self.clean_all_files(&env);
        self.cleaner.end_cleaning();
        result
    }

    fn clean_all_files(&self, env: &Arc<EnvironmentInner>) -> Result<usize> {
        let log = env.log();
        let tail = log.high_file_address();
        let mut cleaned = 0;
        for file in log.file_addresses() {
            if file == tail || self.is_file_to_be_deleted(file) {
                continue;
            }
            for _ in 0..self.config.fresh_file_retries.max(1) {
                if self.clean_file_with(env, file)? {
                    cleaned += 1;
                    break;
                }
                std::thread::yield_now();
            }
        }
        tracing::info!(cleaned, "Cleaned whole log");
        Ok(cleaned)
    }

    /// Re-appends the live loggables of `file` and marks it for deletion.
    /// Returns false if the file was left alone: it is already pending, it
    /// is one of the newest `file_min_age` files, or the reclaim transaction
    /// lost a race with another commit. Fails for an address that starts no
    /// log file.
    pub fn clean_file(&self, file: Address) -> Result<bool> {
        let env = self.env()?;
        if !self.is_old_enough(env.log(), file, self.config.file_min_age.max(1))? {
            tracing::debug!(file = %display_name(file), "Log file too young to clean");
            return Ok(false);
        }
        self.clean_file_with(&env, file)
    }

    /// Whether `file` is older than the `newest` most recent files. The tail
    /// is always among them.
    fn is_old_enough(&self, log: &Log, file: Address, newest: usize) -> Result<bool> {
        let files = log.file_addresses();
        let position = files
            .iter()
            .position(|f| *f == file)
            .ok_or_else(|| Error::InvalidAddress(format!("No log file at address {}", file)))?;
        Ok(position + newest < files.len())
    }

    fn clean_file_with(&self, env: &Arc<EnvironmentInner>, file: Address) -> Result<bool> {
        if self.is_file_to_be_deleted(file) {
            return Ok(false);
        }
        let _file_guard = self.cleaner.lock_file()?;
        // records committed later may still land in the tail
        if !self.is_old_enough(env.log(), file, 1)? {
            return Ok(false);
        }
        let txn = self.reclaim_file(env, file)?;
        self.commit_reclaimed(env, txn, file)
    }

    /// Hands the loggables of `file` to the stores owning them, in a
    /// transaction started on a clone of the current meta tree.
    fn reclaim_file(&self, env: &Arc<EnvironmentInner>, file: Address) -> Result<Transaction> {
        let log = env.log();
        let bound = file + log.file_length_bound();
        let use_checker = self.config.use_expiration_checker;
        let up = &self.up;
        let is_expired =
            |address: Address, length: u64| use_checker && up.is_expired(address, length);

        let mut txn = Transaction::begin_with_cloned_meta_tree(env.clone())?;
        let mut loggables = log.iter_from(file).peekable();
        while let Some(loggable) = loggables.next() {
            let loggable = loggable?;
            if loggable.address >= bound {
                break;
            }
            match loggable.structure_id {
                NO_STRUCTURE_ID | META_TREE_ID => {}
                _ => txn.reclaim(loggable, &mut loggables, bound, &is_expired)?,
            }
        }
        Ok(txn)
    }

    /// Commits a reclaim transaction and marks `file` pending. False if
    /// another commit came first.
    fn commit_reclaimed(
        &self,
        env: &Arc<EnvironmentInner>,
        mut txn: Transaction,
        file: Address,
    ) -> Result<bool> {
        if !txn.flush()? {
            tracing::debug!(file = %display_name(file), "Reclaim lost a race, retrying later");
            return Ok(false);
        }
        txn.abort();

        self.pending.insert(file);
        let weak = self.env.clone();
        env.execute_transaction_safe_task(move || {
            if let Some(env) = weak.upgrade() {
                env.gc.release_file(file);
            }
        });
        tracing::info!(
            file = %display_name(file),
            high_address = env.log().high_address(),
            "Cleaned log file"
        );
        Ok(true)
    }

    /// Called once no transaction can reach `file` anymore.
    fn release_file(&self, file: Address) {
        if !self.pending.contains(&file) {
            return;
        }
        self.released.insert(file);
        if self.config.files_deletion_delay.is_zero() {
            self.queue_for_deletion(file);
        } else {
            self.cleaner
                .queue_deletion_job(file, self.config.files_deletion_delay);
        }
    }

    pub(crate) fn queue_for_deletion(&self, file: Address) {
        if self.released.contains(&file) {
            self.deletion_queue.insert(file);
        }
    }

    /// Removes the files whose deletion is due. Returns how many were removed.
    pub fn delete_pending_files(&self) -> Result<usize> {
        let env = self.env()?;
        self.delete_pending_files_with(&env)
    }

    /// Removes every released file, ignoring the deletion delay. Files still
    /// reachable by a running transaction stay pending.
    pub fn delete_pending_files_now(&self) -> Result<usize> {
        for entry in self.released.iter() {
            self.deletion_queue.insert(*entry.value());
        }
        self.delete_pending_files()
    }

    pub(crate) fn delete_pending_files_with(&self, env: &Arc<EnvironmentInner>) -> Result<usize> {
        let mut files = Vec::new();
        while let Some(entry) = self.deletion_queue.pop_front() {
            files.push(*entry.value());
        }
        if files.is_empty() {
            return Ok(0);
        }

        env.flush_and_sync()?;
        let how = if self.config.rename_files {
            RemoveBlockType::Rename
        } else {
            RemoveBlockType::Delete
        };

        let mut deleted = 0;
        for file in files {
            if !self.pending.contains(&file) {
                continue;
            }
            match env.log().remove_file(file, how) {
                Ok(()) => {
                    self.up.remove_file(file)?;
                    self.pending.remove(&file);
                    self.released.remove(&file);
                    deleted += 1;
                    tracing::info!(file = %display_name(file), "Deleted log file");
                }
                Err(e @ Error::ResourceBusy(_)) => {
                    tracing::warn!(file = %display_name(file), error = %e, "Log file left pending");
                    self.deletion_queue.insert(file);
                }
                Err(e) => {
                    tracing::warn!(file = %display_name(file), error = %e, "Dropped unremovable log file");
                    self.up.remove_file(file)?;
                    self.pending.remove(&file);
                    self.released.remove(&file);
                }
            }
        }

        if deleted > 0 {
            self.up.estimate_total_bytes()?;
            if self.config.enabled {
                self.up.save(env)?;
            }
        }
        Ok(deleted)
    }
}

fn display_name(file: Address) -> String {
    address::file_name(file).unwrap_or_else(|_| file.to_string())
}

impl std::fmt::Debug for GarbageCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GarbageCollector")
            .field("state", &self.state())
            .field("pending", &self.pending_files())
            .finish()
    }
}
