//! Job scheduler
//!
//! Ties the priority queue to the cancellation registry and keeps counters
//! for submitted, completed and cancelled jobs.

use crate::cancel::{CancellationRegistry, CancellationToken};
use crate::priority::{Job, JobId, JobPriority, PriorityQueue};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Job scheduler statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub jobs_submitted: u64,
    pub jobs_completed: u64,
    pub jobs_cancelled: u64,
    /// Jobs still waiting in the queue
    pub queue_size: usize,
}

impl SchedulerStats {
    /// Jobs submitted but neither completed nor cancelled (queued or running).
    pub fn pending_jobs(&self) -> u64 {
        self.jobs_submitted - self.jobs_completed - self.jobs_cancelled
    }
}

/// Priority scheduler for page rasterization jobs.
///
/// # Example
///
/// ```
/// use leaflet_scheduler::{JobPriority, JobScheduler};
///
/// let scheduler = JobScheduler::new();
/// let (job_id, token) = scheduler.submit(4, JobPriority::visible(0));
///
/// if let Some(job) = scheduler.next_job() {
///     assert_eq!(job.id, job_id);
///     assert!(!token.is_cancelled());
///     scheduler.complete_job(job.id);
/// }
/// ```
#[derive(Default)]
pub struct JobScheduler {
    queue: PriorityQueue,
    stats: Mutex<SchedulerStats>,
    cancellation: CancellationRegistry,
}

impl JobScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn stats_lock(&self) -> MutexGuard<'_, SchedulerStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a rasterization of `page_index`.
    ///
    /// The returned token stays registered until the job completes or is
    /// removed from the queue.
    pub fn submit(&self, page_index: u32, priority: JobPriority) -> (JobId, CancellationToken) {
        let job_id = self.queue.push(page_index, priority);
        let token = self.cancellation.register(job_id);
        self.stats_lock().jobs_submitted += 1;

        tracing::trace!(job_id, page_index, ?priority, "submitted rasterization job");
        (job_id, token)
    }

    /// Take the highest priority job. Its token stays registered until
    /// [`complete_job`](Self::complete_job).
    pub fn next_job(&self) -> Option<Job> {
        self.queue.pop()
    }

    pub fn complete_job(&self, job_id: JobId) {
        self.stats_lock().jobs_completed += 1;
        self.cancellation.unregister(job_id);
    }

    /// Cancel a job by id.
    ///
    /// A queued job is removed and never starts. A running job only has its
    /// token cancelled. Returns `true` if the job was found in either state.
    pub fn cancel_job(&self, job_id: JobId) -> bool {
        let token_cancelled = self.cancellation.cancel(job_id);
        let removed = self.queue.remove_if(|job| job.id == job_id);

        if removed.is_empty() {
            return token_cancelled;
        }

        self.stats_lock().jobs_cancelled += removed.len() as u64;
        self.cancellation.unregister(job_id);
        true
    }

    /// Recompute priorities of queued jobs, e.g. after the visible range moved.
    pub fn reprioritize<F>(&self, priority_of: F) -> usize
    where
        F: Fn(&Job) -> Option<JobPriority>,
    {
        self.queue.reprioritize(priority_of)
    }

    /// Drop every queued job and cancel every running one.
    pub fn clear(&self) {
        let cancelled = self.queue.len();

        self.cancellation.cancel_all();
        self.queue.clear();
        self.cancellation.clear();

        if cancelled > 0 {
            self.stats_lock().jobs_cancelled += cancelled as u64;
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        let mut stats = self.stats_lock().clone();
        stats.queue_size = self.queue.len();
        stats
    }

    /// `None` once the job has completed or been removed.
    pub fn get_cancellation_token(&self, job_id: JobId) -> Option<CancellationToken> {
        self.cancellation.get(job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduler_basic() {
        let scheduler = JobScheduler::new();
        assert_eq!(scheduler.stats().queue_size, 0);

        let (job_id, token) = scheduler.submit(0, JobPriority::visible(0));
        assert_eq!(scheduler.stats().queue_size, 1);
        assert!(!token.is_cancelled());

        let job = scheduler.next_job().unwrap();
        assert_eq!(job.id, job_id);
        scheduler.complete_job(job_id);

        let stats = scheduler.stats();
        assert_eq!(stats.jobs_submitted, 1);
        assert_eq!(stats.jobs_completed, 1);
        assert_eq!(stats.jobs_cancelled, 0);
        assert!(scheduler.get_cancellation_token(job_id).is_none());
    }

    #[test]
    fn test_scheduler_priority_ordering() {
        let scheduler = JobScheduler::new();

        scheduler.submit(9, JobPriority::lookahead(6));
        scheduler.submit(7, JobPriority::visible(2));
        scheduler.submit(8, JobPriority::visible(0));

        let order: Vec<u32> =
            std::iter::from_fn(|| scheduler.next_job()).map(|job| job.page_index).collect();
        assert_eq!(order, vec![8, 7, 9]);
    }

    #[test]
    fn test_cancel_queued_job() {
        let scheduler = JobScheduler::new();
        let (job_id, token) = scheduler.submit(0, JobPriority::visible(0));

        assert!(scheduler.cancel_job(job_id));
        assert!(token.is_cancelled());
        assert_eq!(scheduler.stats().queue_size, 0);
        assert_eq!(scheduler.stats().jobs_cancelled, 1);
        assert!(!scheduler.cancel_job(999));
    }

    #[test]
    fn test_cancel_running_job_only_flags_token() {
        let scheduler = JobScheduler::new();
        let (job_id, token) = scheduler.submit(0, JobPriority::visible(0));

        let job = scheduler.next_job().unwrap();
        assert!(scheduler.cancel_job(job.id));
        assert!(token.is_cancelled());

        scheduler.complete_job(job_id);
        let stats = scheduler.stats();
        assert_eq!(stats.jobs_completed, 1);
        assert_eq!(stats.jobs_cancelled, 0);
    }

    #[test]
    fn test_reprioritize_follows_scroll() {
        let scheduler = JobScheduler::new();
        for page in 0..4 {
            scheduler.submit(page, JobPriority::for_page(page, 0, 1));
        }

        scheduler.reprioritize(|job| Some(JobPriority::for_page(job.page_index, 2, 3)));

        let first = scheduler.next_job().unwrap();
        assert_eq!(first.page_index, 2);
    }

    #[test]
    fn test_clear_cancels_everything() {
        let scheduler = JobScheduler::new();
        let (_, running) = scheduler.submit(0, JobPriority::visible(0));
        let (_, queued) = scheduler.submit(1, JobPriority::visible(0));
        let _ = scheduler.next_job();

        scheduler.clear();

        assert!(queued.is_cancelled());
        assert!(running.is_cancelled());
        assert_eq!(scheduler.stats().queue_size, 0);
        assert_eq!(scheduler.stats().jobs_cancelled, 1);
    }

    #[test]
    fn test_stats_pending_counts_running_jobs() {
        let scheduler = JobScheduler::new();
        scheduler.submit(0, JobPriority::visible(0));
        scheduler.submit(1, JobPriority::visible(2));
        let _ = scheduler.next_job();

        let stats = scheduler.stats();
        assert_eq!(stats.queue_size, 1);
        assert_eq!(stats.pending_jobs(), 2);
    }
}
