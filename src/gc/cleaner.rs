//! Scheduling shell around the collector.
//!
//! The cleaner owns the processor cleaning cycles run on and the flags that
//! control them. A cycle checks the flags between files only, so `suspend`
//! takes effect once the file being cleaned is done and `finish` never
//! interrupts a file half way. If the processor is replaced while a cycle
//! runs, the cycle stops after its current file and queues itself on the
//! new processor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::{Duration, Instant};

use crate::env::EnvironmentInner;
use crate::error::Result;
use crate::log::Address;
use crate::scheduler::{Job, JobContext, JobProcessor};

pub struct BackgroundCleaner {
    env: Weak<EnvironmentInner>,
    processor: RwLock<Arc<JobProcessor>>,
    suspended: AtomicBool,
    finished: AtomicBool,
    cleaning: AtomicBool,
    /// Held while a file is cleaned.
    file_lock: Mutex<()>,
}

impl BackgroundCleaner {
    pub(crate) fn new(env: Weak<EnvironmentInner>, processor: Arc<JobProcessor>) -> Self {
        Self {
            env,
            processor: RwLock::new(processor),
            suspended: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            cleaning: AtomicBool::new(false),
            file_lock: Mutex::new(()),
        }
    }

    pub fn job_processor(&self) -> Result<Arc<JobProcessor>> {
        Ok(self.processor.read()?.clone())
    }

    /// Moves cleaning to `processor` and returns the previous one. A cycle
    /// running on the previous processor hands over after its current file.
    pub fn set_job_processor(&self, processor: Arc<JobProcessor>) -> Result<Arc<JobProcessor>> {
        let previous = std::mem::replace(&mut *self.processor.write()?, processor);
        tracing::debug!(
            from = previous.name(),
            to = self.job_processor()?.name(),
            "Cleaner changed processor"
        );
        Ok(previous)
    }

    /// Whether the caller runs on the cleaner's current processor.
    pub fn is_current_thread(&self) -> bool {
        self.processor
            .read()
            .map(|processor| processor.is_current_thread())
            .unwrap_or(false)
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn is_cleaning(&self) -> bool {
        self.cleaning.load(Ordering::SeqCst)
    }

    /// Pauses cleaning. Returns once the file being cleaned, if any, is done.
    pub fn suspend(&self) -> Result<()> {
        if !self.suspended.swap(true, Ordering::SeqCst) {
            drop(self.file_lock.lock()?);
            tracing::info!("Suspended cleaner");
        }
        Ok(())
    }

    pub fn resume(&self) {
        if self.suspended.swap(false, Ordering::SeqCst) {
            tracing::info!("Resumed cleaner");
        }
    }

    /// Stops cleaning for good and shuts the processor down.
    pub fn finish(&self) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        match self.processor.read() {
            Ok(processor) => processor.finish(),
            Err(e) => tracing::error!(error = %e, "Cleaner processor lock poisoned"),
        }
        tracing::info!("Finished cleaner");
    }

    pub fn queue_cleaning_job(&self) {
        self.submit(None);
    }

    pub fn queue_cleaning_job_at(&self, at: Instant) {
        self.submit(Some(at));
    }

    fn submit(&self, at: Option<Instant>) {
        if self.is_finished() {
            return;
        }
        let Ok(processor) = self.job_processor() else {
            return;
        };
        let job = Arc::new(CleaningJob {
            env: self.env.clone(),
        });
        let queued = match at {
            Some(at) => processor.queue_at(job, at),
            None => processor.queue(job),
        };
        if !queued {
            tracing::debug!(processor = processor.name(), "Cleaning job not queued");
        }
    }

    pub(crate) fn queue_deletion_job(&self, file: Address, delay: Duration) {
        let Ok(processor) = self.job_processor() else {
            return;
        };
        let job = Arc::new(DeletionDelayJob {
            env: self.env.clone(),
            file,
        });
        processor.queue_in(job, delay);
    }

    pub(crate) fn lock_file(&self) -> Result<MutexGuard<'_, ()>> {
        Ok(self.file_lock.lock()?)
    }

    /// Claims the single cleaning slot. False if a cycle is already running.
    pub(crate) fn begin_cleaning(&self) -> bool {
        self.cleaning
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn end_cleaning(&self) {
        self.cleaning.store(false, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for BackgroundCleaner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundCleaner")
            .field("suspended", &self.is_suspended())
            .field("finished", &self.is_finished())
            .field("cleaning", &self.is_cleaning())
            .finish()
    }
}

/// One cleaning cycle. Holds the environment weakly: a job outliving its
/// environment does nothing.
struct CleaningJob {
    env: Weak<EnvironmentInner>,
}

#[async_trait::async_trait]
impl Job for CleaningJob {
    fn name(&self) -> &'static str {
        "gc-cleaning"
    }

    async fn execute(&self, ctx: JobContext) -> Result<()> {
        let Some(env) = self.env.upgrade() else {
            return Ok(());
        };
        let gc = &env.gc;
        let cleaner = gc.cleaner();
        if cleaner.is_finished() {
            return Ok(());
        }
        if !cleaner.is_current_thread() {
            // queued before the processor changed
            cleaner.queue_cleaning_job();
            return Ok(());
        }
        let start_at = env.created() + gc.config().start_in;
        if Instant::now() < start_at {
            cleaner.queue_cleaning_job_at(start_at);
            return Ok(());
        }
        if !gc.can_continue(&env)? {
            return Ok(());
        }
        if env.log().number_of_files() <= gc.config().file_min_age {
            return Ok(());
        }
        if !cleaner.begin_cleaning() {
            return Ok(());
        }

        tracing::debug!(run_id = ctx.run_id, "Running cleaning job");
        let result = gc.run_cycle(&env, true).await;
        cleaner.end_cleaning();
        if let Err(e) = result {
            tracing::error!(run_id = ctx.run_id, error = %e, "Cleaning cycle failed");
            return Err(e);
        }

        if cleaner.is_finished() {
            return Ok(());
        }
        if !cleaner.is_current_thread() {
            cleaner.queue_cleaning_job();
        } else if gc.is_too_much_free_space() {
            cleaner.queue_cleaning_job_at(Instant::now() + gc.config().run_period);
        }
        Ok(())
    }
}

/// Moves a released file into the deletion queue once its grace period
/// has passed, then sweeps the queue.
struct DeletionDelayJob {
    env: Weak<EnvironmentInner>,
    file: Address,
}

#[async_trait::async_trait]
impl Job for DeletionDelayJob {
    fn name(&self) -> &'static str {
        "gc-deletion-delay"
    }

    async fn execute(&self, _ctx: JobContext) -> Result<()> {
        let Some(env) = self.env.upgrade() else {
            return Ok(());
        };
        env.gc.queue_for_deletion(self.file);
        env.gc.delete_pending_files_with(&env)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GcConfig, LogConfig};
    use crate::env::tests::test_config;
    use crate::env::{Environment, Store};
    use crate::gc::GcState;
    use tempfile::TempDir;

    fn background_config(dir: &TempDir) -> crate::config::EnvironmentConfig {
        test_config(dir)
            .log(LogConfig::default().file_length(4096))
            .gc(GcConfig::default()
                .start_in(Duration::ZERO)
                .run_period(Duration::from_millis(20))
                .files_interval(1)
                .file_min_age(1)
                .min_utilization(70)
                .files_deletion_delay(Duration::ZERO))
    }

    fn wait_for(condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    fn churn(env: &Environment, store: &Store, rounds: u32) {
        for round in 0..rounds {
            env.execute_in_transaction(|txn| {
                for i in 0..50u32 {
                    let key = format!("key{:03}", i);
                    txn.put(store, key.as_bytes(), format!("round{}", round).as_bytes())?;
                }
                Ok(())
            })
            .unwrap();
        }
    }

    #[test]
    fn test_background_cleaning_deletes_files() {
        let dir = TempDir::new().unwrap();
        let env = Environment::open(background_config(&dir)).unwrap();
        let store = env
            .execute_in_transaction(|txn| txn.open_store("records", false))
            .unwrap();

        churn(&env, &store, 40);
        let first_file = dir.path().join(crate::log::address::file_name(0).unwrap());
        assert!(
            wait_for(|| {
                // new files keep waking the cleaner
                churn(&env, &store, 1);
                !first_file.exists()
            }),
            "the first log file was never reclaimed"
        );

        let records = env
            .compute_in_read_only_transaction(|txn| txn.scan(&store))
            .unwrap();
        assert_eq!(records.len(), 50);
        assert!(env.gc().state() != GcState::Finished);
        env.close().unwrap();
    }

    #[test]
    fn test_suspend_resume_finish() {
        let dir = TempDir::new().unwrap();
        let env = Environment::open(background_config(&dir)).unwrap();
        let gc = env.gc();
        assert_eq!(gc.state(), GcState::Idle);

        gc.suspend().unwrap();
        assert_eq!(gc.state(), GcState::Suspended);
        assert!(gc.cleaner().is_suspended());
        gc.resume();
        assert_eq!(gc.state(), GcState::Idle);

        gc.finish();
        assert_eq!(gc.state(), GcState::Finished);
        assert!(gc.cleaner().job_processor().unwrap().is_finished());
        // finished is terminal
        gc.resume();
        gc.wake();
        assert_eq!(gc.state(), GcState::Finished);
    }

    #[test]
    fn test_suspended_cleaner_leaves_files_alone() {
        let dir = TempDir::new().unwrap();
        let env = Environment::open(background_config(&dir)).unwrap();
        env.gc().suspend().unwrap();
        let store = env
            .execute_in_transaction(|txn| txn.open_store("records", false))
            .unwrap();
        churn(&env, &store, 40);
        std::thread::sleep(Duration::from_millis(100));

        assert!(env.gc().pending_files().is_empty());
        assert!(dir
            .path()
            .join(crate::log::address::file_name(0).unwrap())
            .exists());
    }

    #[test]
    fn test_cleaning_moves_to_new_processor() {
        let dir = TempDir::new().unwrap();
        let env = Environment::open(background_config(&dir)).unwrap();
        let cleaner = env.gc().cleaner();

        let replacement = JobProcessor::start("replacement-cleaner").unwrap();
        let previous = cleaner.set_job_processor(replacement).unwrap();
        assert_eq!(cleaner.job_processor().unwrap().name(), "replacement-cleaner");
        assert!(!cleaner.is_current_thread());
        previous.finish();

        let store = env
            .execute_in_transaction(|txn| txn.open_store("records", false))
            .unwrap();
        churn(&env, &store, 40);
        let first_file = dir.path().join(crate::log::address::file_name(0).unwrap());
        assert!(wait_for(|| {
            churn(&env, &store, 1);
            !first_file.exists()
        }));
    }
}
