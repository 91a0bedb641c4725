//! Rasterization worker pool.
//!
//! Workers pull jobs from a shared [`JobScheduler`] and hand each one to a
//! [`JobExecutor`] together with its cancellation token. The default pool
//! has a single worker because document decoders are not assumed to be
//! safe for concurrent page access.

use crate::{CancellationToken, Job, JobScheduler};
use std::io;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Callback invoked for each job a worker takes.
///
/// The executor is called even when the token is already cancelled so that
/// the owner of the job can clear its bookkeeping. It should check
/// `token.is_cancelled()` before doing expensive work and again before
/// publishing a result.
pub type JobExecutor = Arc<dyn Fn(&Job, &CancellationToken) + Send + Sync>;

/// Configuration for the worker pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPoolConfig {
    /// Number of worker threads. Default: 1.
    pub num_workers: usize,

    /// How long an idle worker sleeps before polling the queue again.
    /// Default: 5ms.
    pub poll_interval: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self::new(1)
    }
}

impl WorkerPoolConfig {
    pub fn new(num_workers: usize) -> Self {
        Self { num_workers, poll_interval: Duration::from_millis(5) }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Pool of worker threads draining a [`JobScheduler`].
///
/// Dropping the pool signals shutdown and joins the workers.
///
/// # Example
///
/// ```
/// use leaflet_scheduler::{CancellationToken, Job, JobPriority, JobScheduler, WorkerPool, WorkerPoolConfig};
/// use std::sync::Arc;
///
/// let scheduler = Arc::new(JobScheduler::new());
/// let executor = Arc::new(|job: &Job, token: &CancellationToken| {
///     if token.is_cancelled() {
///         return;
///     }
///     println!("rasterizing page {}", job.page_index);
/// });
///
/// let pool = WorkerPool::new(scheduler.clone(), executor, WorkerPoolConfig::default())
///     .expect("worker threads should spawn");
/// scheduler.submit(0, JobPriority::visible(0));
/// pool.shutdown();
/// ```
pub struct WorkerPool {
    workers: Vec<Worker>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Spawn `config.num_workers` threads.
    pub fn new(
        scheduler: Arc<JobScheduler>,
        executor: JobExecutor,
        config: WorkerPoolConfig,
    ) -> io::Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut pool = Self { workers: Vec::with_capacity(config.num_workers), shutdown };

        for id in 0..config.num_workers {
            let worker = Worker::spawn(
                id,
                scheduler.clone(),
                executor.clone(),
                pool.shutdown.clone(),
                config.poll_interval,
            )?;
            pool.workers.push(worker);
        }

        tracing::debug!(workers = pool.workers.len(), "started rasterization workers");
        Ok(pool)
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Signal shutdown and wait for workers to finish their current job.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        for worker in self.workers.drain(..) {
            worker.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    fn spawn(
        id: usize,
        scheduler: Arc<JobScheduler>,
        executor: JobExecutor,
        shutdown: Arc<AtomicBool>,
        poll_interval: Duration,
    ) -> io::Result<Self> {
        let thread = thread::Builder::new()
            .name(format!("leaflet-raster-{id}"))
            .spawn(move || Self::run(&scheduler, &executor, &shutdown, poll_interval))?;

        Ok(Self { thread: Some(thread) })
    }

    fn run(
        scheduler: &JobScheduler,
        executor: &JobExecutor,
        shutdown: &AtomicBool,
        poll_interval: Duration,
    ) {
        while !shutdown.load(Ordering::Acquire) {
            match scheduler.next_job() {
                Some(job) => {
                    let token = scheduler.get_cancellation_token(job.id).unwrap_or_else(|| {
                        // Removed from the registry between pop and lookup.
                        let token = CancellationToken::new();
                        token.cancel();
                        token
                    });

                    executor(&job, &token);
                    scheduler.complete_job(job.id);
                }
                None => thread::sleep(poll_interval),
            }
        }
    }

    fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("rasterization worker panicked");
            }
        }
    }
}
