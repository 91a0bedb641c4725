//! Leaflet Scheduler Library
//!
//! Priority scheduling and a bounded worker pool for page rasterization.
//!
//! Jobs for pages on screen run before lookahead jobs, and within each band
//! pages nearer the centre of the visible range run first. Queued jobs can
//! be dropped or re-ranked when the visible range moves; running jobs carry
//! a [`CancellationToken`] so their results can be discarded.
//!
//! # Example
//!
//! ```
//! use leaflet_scheduler::{JobPriority, JobScheduler};
//!
//! let scheduler = JobScheduler::new();
//!
//! // Visible range 10..=12, lookahead of two pages.
//! let ids: Vec<_> = (8..=14)
//!     .map(|page| scheduler.submit(page, JobPriority::for_page(page, 10, 12)).0)
//!     .collect();
//!
//! assert_eq!(scheduler.next_job().map(|job| job.page_index), Some(11));
//!
//! // The user scrolled away from page 14 before it started.
//! assert!(scheduler.cancel_job(ids[6]));
//! assert_eq!(scheduler.stats().queue_size, 5);
//! ```

mod cancel;
mod priority;
mod scheduler;
mod worker;

pub use cancel::{CancellationRegistry, CancellationToken};
pub use priority::{Job, JobId, JobPriority, PriorityQueue, PriorityTier};
pub use scheduler::{JobScheduler, SchedulerStats};
pub use worker::{JobExecutor, WorkerPool, WorkerPoolConfig};
