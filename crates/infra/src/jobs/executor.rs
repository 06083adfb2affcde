//! Worker pool that drains the job queue.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use locate_core::JobId;

use super::processor::{JobProcessor, ProcessOutcome};
use super::store::JobStore;

/// Job executor configuration.
#[derive(Debug, Clone)]
pub struct JobExecutorConfig {
    /// Number of worker threads; each runs one inference at a time
    pub workers: usize,
    /// How long an idle worker waits before re-checking for shutdown
    pub poll_interval: Duration,
    /// Name for logging and thread names
    pub name: String,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            poll_interval: Duration::from_millis(250),
            name: "locate-worker".to_string(),
        }
    }
}

impl JobExecutorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// FIFO queue of job ids waiting for a worker.
#[derive(Debug, Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<JobId>,
}

impl JobQueue {
    /// A queue and its receiving end, for callers that drain it themselves.
    pub fn channel() -> (JobQueue, mpsc::Receiver<JobId>) {
        let (tx, rx) = mpsc::channel();
        (JobQueue { tx }, rx)
    }

    /// Schedule a job. Returns `false` once the executor has stopped.
    pub fn push(&self, job_id: JobId) -> bool {
        self.tx.send(job_id).is_ok()
    }
}

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ExecutorStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_skipped: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

/// Handle to control a running executor.
#[derive(Debug)]
pub struct JobExecutorHandle {
    queue: JobQueue,
    shutdown: Arc<AtomicBool>,
    joins: Vec<thread::JoinHandle<()>>,
    stats: Arc<Mutex<ExecutorStats>>,
    started: Instant,
}

impl JobExecutorHandle {
    pub fn queue(&self) -> JobQueue {
        self.queue.clone()
    }

    /// Get current executor statistics.
    pub fn stats(&self) -> ExecutorStats {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }

    /// Stop workers after their current job and wait for them.
    ///
    /// Jobs still queued stay `pending` in the store and are picked up by the
    /// startup re-queue on the next run.
    pub fn shutdown(self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for join in self.joins {
            let _ = join.join();
        }
    }
}

/// Background job executor.
pub struct JobExecutor<S: JobStore> {
    processor: Arc<JobProcessor<S>>,
}

impl<S: JobStore + 'static> JobExecutor<S> {
    pub fn new(processor: JobProcessor<S>) -> Self {
        Self {
            processor: Arc::new(processor),
        }
    }

    /// Spawn worker threads.
    pub fn spawn(self, config: JobExecutorConfig) -> std::io::Result<JobExecutorHandle> {
        let (queue, rx) = JobQueue::channel();
        let rx = Arc::new(Mutex::new(rx));
        let shutdown = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(Mutex::new(ExecutorStats::default()));

        let mut joins = Vec::with_capacity(config.workers.max(1));
        for n in 0..config.workers.max(1) {
            let worker = Worker {
                name: format!("{}-{n}", config.name),
                processor: self.processor.clone(),
                rx: rx.clone(),
                shutdown: shutdown.clone(),
                stats: stats.clone(),
                poll_interval: config.poll_interval,
            };
            let join = thread::Builder::new()
                .name(worker.name.clone())
                .spawn(move || worker.run());
            match join {
                Ok(join) => joins.push(join),
                Err(e) => {
                    shutdown.store(true, Ordering::SeqCst);
                    return Err(e);
                }
            }
        }
        info!(executor = %config.name, workers = joins.len(), "job executor started");

        Ok(JobExecutorHandle {
            queue,
            shutdown,
            joins,
            stats,
            started: Instant::now(),
        })
    }
}

struct Worker<S: JobStore> {
    name: String,
    processor: Arc<JobProcessor<S>>,
    rx: Arc<Mutex<mpsc::Receiver<JobId>>>,
    shutdown: Arc<AtomicBool>,
    stats: Arc<Mutex<ExecutorStats>>,
    poll_interval: Duration,
}

impl<S: JobStore> Worker<S> {
    fn run(self) {
        debug!(worker = %self.name, "worker started");
        while !self.shutdown.load(Ordering::SeqCst) {
            let next = {
                let rx = self.rx.lock().unwrap_or_else(PoisonError::into_inner);
                rx.recv_timeout(self.poll_interval)
            };
            match next {
                Ok(job_id) => self.execute(job_id),
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!(worker = %self.name, "worker stopped");
    }

    fn execute(&self, job_id: JobId) {
        self.update_stats(|s| s.current_running += 1);

        let result = panic::catch_unwind(AssertUnwindSafe(|| self.processor.process(job_id)));

        self.update_stats(|s| {
            s.current_running = s.current_running.saturating_sub(1);
            match &result {
                Ok(Ok(ProcessOutcome::Completed)) => {
                    s.jobs_processed += 1;
                    s.jobs_succeeded += 1;
                }
                Ok(Ok(ProcessOutcome::Failed)) | Ok(Err(_)) | Err(_) => {
                    s.jobs_processed += 1;
                    s.jobs_failed += 1;
                }
                Ok(Ok(ProcessOutcome::Missing | ProcessOutcome::NotPending(_))) => s.jobs_skipped += 1,
            }
        });

        match result {
            Ok(Ok(outcome)) => debug!(worker = %self.name, job_id = %job_id, ?outcome, "job finished"),
            Ok(Err(e)) => error!(worker = %self.name, job_id = %job_id, error = %e, "failed to persist job state"),
            Err(_) => error!(worker = %self.name, job_id = %job_id, "job processing panicked"),
        }
    }

    fn update_stats(&self, f: impl FnOnce(&mut ExecutorStats)) {
        f(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }
}
