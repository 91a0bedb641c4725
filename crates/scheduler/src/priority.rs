//! Rasterization job ordering
//!
//! Jobs for pages inside the visible range outrank lookahead jobs. Within a
//! tier, pages closer to the centre of the visible range run first, and ties
//! go to the lower page index. Submission order only breaks exact ties
//! (the same page queued twice).

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Unique job identifier
pub type JobId = u64;

/// Coarse priority band of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PriorityTier {
    /// Page inside the lookahead margin but not on screen
    Lookahead = 0,

    /// Page currently on screen
    Visible = 1,
}

/// Priority of a rasterization job.
///
/// `distance` is measured in half pages from the centre of the visible
/// range, so that ranges with an even number of pages still have an exact
/// integer centre. Greater values of this type run first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobPriority {
    pub tier: PriorityTier,
    pub distance: u32,
}

impl JobPriority {
    pub fn visible(distance: u32) -> Self {
        Self { tier: PriorityTier::Visible, distance }
    }

    pub fn lookahead(distance: u32) -> Self {
        Self { tier: PriorityTier::Lookahead, distance }
    }

    /// Priority of `page_index` relative to the inclusive visible range
    /// `first..=last`.
    pub fn for_page(page_index: u32, first: u32, last: u32) -> Self {
        let doubled = u64::from(page_index) * 2;
        let centre = u64::from(first) + u64::from(last);
        let distance = doubled.abs_diff(centre).min(u64::from(u32::MAX)) as u32;

        if (first..=last).contains(&page_index) {
            Self::visible(distance)
        } else {
            Self::lookahead(distance)
        }
    }
}

impl Default for JobPriority {
    fn default() -> Self {
        Self::visible(0)
    }
}

impl PartialOrd for JobPriority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for JobPriority {
    fn cmp(&self, other: &Self) -> Ordering {
        self.tier.cmp(&other.tier).then_with(|| other.distance.cmp(&self.distance))
    }
}

/// A queued rasterization of one page.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub page_index: u32,
    pub priority: JobPriority,
    insertion_order: u64,
}

impl Job {
    pub fn new(id: JobId, page_index: u32, priority: JobPriority, insertion_order: u64) -> Self {
        Self { id, page_index, priority, insertion_order }
    }
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Job {}

impl PartialOrd for Job {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Job {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max heap: lower page index and earlier insertion
        // compare as greater.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.page_index.cmp(&self.page_index))
            .then_with(|| other.insertion_order.cmp(&self.insertion_order))
    }
}

/// Thread-safe priority queue of jobs.
pub struct PriorityQueue {
    state: Mutex<QueueState>,
}

struct QueueState {
    heap: BinaryHeap<Job>,
    next_job_id: JobId,
    insertion_counter: u64,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                next_job_id: 1,
                insertion_counter: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a job for `page_index` and return its id.
    pub fn push(&self, page_index: u32, priority: JobPriority) -> JobId {
        let mut state = self.lock();
        let job_id = state.next_job_id;
        state.next_job_id += 1;

        let insertion_order = state.insertion_counter;
        state.insertion_counter += 1;

        state.heap.push(Job::new(job_id, page_index, priority, insertion_order));
        job_id
    }

    pub fn pop(&self) -> Option<Job> {
        self.lock().heap.pop()
    }

    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().heap.is_empty()
    }

    pub fn clear(&self) {
        self.lock().heap.clear();
    }

    /// Remove all jobs matching a predicate and return them.
    pub fn remove_if<F>(&self, predicate: F) -> Vec<Job>
    where
        F: Fn(&Job) -> bool,
    {
        let mut state = self.lock();
        let (removed, remaining): (Vec<Job>, Vec<Job>) =
            std::mem::take(&mut state.heap).into_iter().partition(|job| predicate(job));
        state.heap = remaining.into_iter().collect();
        removed
    }

    /// Recompute job priorities in place. Returns how many changed.
    pub fn reprioritize<F>(&self, priority_of: F) -> usize
    where
        F: Fn(&Job) -> Option<JobPriority>,
    {
        let mut state = self.lock();
        let mut changed = 0;
        let mut jobs = std::mem::take(&mut state.heap).into_vec();

        for job in &mut jobs {
            if let Some(priority) = priority_of(job) {
                if priority != job.priority {
                    job.priority = priority;
                    changed += 1;
                }
            }
        }

        state.heap = BinaryHeap::from(jobs);
        changed
    }
}

impl Default for PriorityQueue {
    fn default() -> Self {
        Self::new()
    }
}
