//! Dedicated execution contexts for background work.
//!
//! A [`JobProcessor`] owns one OS thread driving a current-thread tokio
//! runtime. Jobs are submitted over a channel and run one after another in
//! submission order; delayed jobs sleep on the same runtime until they are
//! due. Everything a processor runs therefore executes on its thread, which
//! lets jobs detect that they are no longer running on the processor their
//! owner expects.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc};

use crate::error::Result;

/// Context provided to jobs during execution
pub struct JobContext {
    pub job_name: &'static str,
    pub run_id: u64,
}

/// A unit of background work
#[async_trait::async_trait]
pub trait Job: Send + Sync {
    /// Job name for logging
    fn name(&self) -> &'static str;

    /// Execute the job
    async fn execute(&self, ctx: JobContext) -> Result<()>;
}

struct Submission {
    job: Arc<dyn Job>,
    at: Option<Instant>,
}

pub struct JobProcessor {
    name: String,
    sender: mpsc::UnboundedSender<Submission>,
    shutdown_tx: broadcast::Sender<()>,
    thread_id: ThreadId,
    handle: Mutex<Option<JoinHandle<()>>>,
    finished: AtomicBool,
}

impl JobProcessor {
    /// Spawns the processor thread.
    pub fn start(name: impl Into<String>) -> Result<Arc<Self>> {
        let name = name.into();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        let (sender, receiver) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let thread_name = name.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || runtime.block_on(run(thread_name, receiver, shutdown_rx)))?;

        Ok(Arc::new(Self {
            name,
            sender,
            shutdown_tx,
            thread_id: handle.thread().id(),
            handle: Mutex::new(Some(handle)),
            finished: AtomicBool::new(false),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queues a job to run as soon as the jobs before it are done. Returns
    /// false if the processor is finished.
    pub fn queue(&self, job: Arc<dyn Job>) -> bool {
        self.submit(Submission { job, at: None })
    }

    /// Queues a job to run not before `at`.
    pub fn queue_at(&self, job: Arc<dyn Job>, at: Instant) -> bool {
        self.submit(Submission { job, at: Some(at) })
    }

    pub fn queue_in(&self, job: Arc<dyn Job>, delay: Duration) -> bool {
        self.queue_at(job, Instant::now() + delay)
    }

    fn submit(&self, submission: Submission) -> bool {
        if self.is_finished() {
            return false;
        }
        self.sender.send(submission).is_ok()
    }

    /// Whether the caller runs on this processor's thread.
    pub fn is_current_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Stops the processor. Queued and delayed jobs are dropped, a running
    /// job is waited for unless called from the processor itself.
    pub fn finish(&self) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown_tx.send(()).ok();

        if self.is_current_thread() {
            return;
        }
        let handle = match self.handle.lock() {
            Ok(mut handle) => handle.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!(processor = %self.name, "Job processor thread panicked");
            }
        }
    }
}

impl Drop for JobProcessor {
    fn drop(&mut self) {
        self.finish();
    }
}

impl std::fmt::Debug for JobProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobProcessor")
            .field("name", &self.name)
            .field("finished", &self.is_finished())
            .finish()
    }
}

async fn run(
    name: String,
    mut receiver: mpsc::UnboundedReceiver<Submission>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut run_id = 0u64;
    tracing::debug!(processor = %name, "Job processor started");

    loop {
        tokio::select! {
            submission = receiver.recv() => {
                let Some(Submission { job, at }) = submission else {
                    break;
                };
                run_id += 1;
                match at {
                    Some(at) if at > Instant::now() => {
                        tokio::spawn(async move {
                            tokio::time::sleep_until(at.into()).await;
                            execute(job, run_id).await;
                        });
                    }
                    _ => execute(job, run_id).await,
                }
            }

            _ = shutdown_rx.recv() => {
                tracing::debug!(processor = %name, "Job processor shutting down");
                break;
            }
        }
    }
}

async fn execute(job: Arc<dyn Job>, run_id: u64) {
    let ctx = JobContext {
        job_name: job.name(),
        run_id,
    };
    if let Err(e) = job.execute(ctx).await {
        tracing::error!(job = job.name(), error = %e, "Job execution failed");
    }
}
