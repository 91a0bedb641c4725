//! Bounded cache of display-ready page bitmaps
//!
//! A miss either rasterizes inline or queues a job on the worker pool and
//! answers [`PageSlot::Pending`]; workers announce results on the event
//! channel. Mode changes re-transform resident bitmaps in place instead of
//! going back to the rasterizer.

use crate::color::{self, DisplayMode};
use crate::config::{RetryPolicy, ViewerConfig};
use crossbeam_channel::{Receiver, Sender};
use leaflet_engine::{PageRasterSource, RasterError, RgbaImage, ScaleFactor};
use leaflet_scheduler::{
    CancellationToken, Job, JobExecutor, JobId, JobPriority, JobScheduler, SchedulerStats,
    WorkerPool, WorkerPoolConfig,
};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A rasterized page in display form.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedBitmap {
    pub index: u32,
    /// Mode the pixels are currently transformed for
    pub mode: DisplayMode,
    /// Changes every time the resident pixels change
    pub version: u64,
    pub image: RgbaImage,
}

impl RenderedBitmap {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Terminal decode failure recorded for a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderFailure {
    pub index: u32,
    pub reason: String,
}

impl fmt::Display for RenderFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "page {} failed to render: {}", self.index, self.reason)
    }
}

/// What the cache can say about a page right now.
#[derive(Debug, Clone, PartialEq)]
pub enum PageSlot {
    Ready(Arc<RenderedBitmap>),
    Pending,
    Failed(RenderFailure),
}

impl PageSlot {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    pub fn bitmap(&self) -> Option<&Arc<RenderedBitmap>> {
        match self {
            Self::Ready(bitmap) => Some(bitmap),
            _ => None,
        }
    }
}

/// Completion notification from a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageEvent {
    /// The page is resident and should be redrawn.
    Ready(u32),
    /// The page failed to decode; draw its error placeholder.
    Failed(u32),
    /// A finished rasterization was thrown away because the page was no
    /// longer wanted.
    Discarded(u32),
}

impl PageEvent {
    pub fn index(self) -> u32 {
        match self {
            Self::Ready(index) | Self::Failed(index) | Self::Discarded(index) => index,
        }
    }
}

/// Statistics about cache usage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Pages currently resident
    pub resident: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    /// Calls into the raster source, retries included
    pub rasterizations: u64,
    /// Mode changes applied to already rasterized pixels
    pub retransforms: u64,
    pub evictions: u64,
    /// Finished rasterizations dropped because the page was cancelled
    pub discarded: u64,
    pub failures: u64,
}

impl CacheStats {
    /// Calculate the cache hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct CacheEntry {
    bitmap: Arc<RenderedBitmap>,
    last_access: u64,
}

/// Outstanding rasterization of one page.
struct InFlight {
    job_id: JobId,
    /// Clock tick of the latest request; the page enters the LRU with it
    requested_at: u64,
}

struct CacheState {
    entries: HashMap<u32, CacheEntry>,
    /// Page index to the job currently responsible for it
    in_flight: HashMap<u32, InFlight>,
    failed: HashMap<u32, String>,
    mode: DisplayMode,
    clock: u64,
    next_version: u64,
    closed: bool,
    stats: CacheStats,
}

impl CacheState {
    fn new(mode: DisplayMode, capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            in_flight: HashMap::new(),
            failed: HashMap::new(),
            mode,
            clock: 0,
            next_version: 0,
            closed: false,
            stats: CacheStats { capacity, ..Default::default() },
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn bump_version(&mut self) -> u64 {
        self.next_version += 1;
        self.next_version
    }

    /// Mark a resident page as used and bring it up to the current mode.
    fn touch(&mut self, index: u32) -> Option<Arc<RenderedBitmap>> {
        if !self.entries.contains_key(&index) {
            return None;
        }
        let tick = self.tick();
        let mode = self.mode;
        let entry = self.entries.get_mut(&index)?;
        entry.last_access = tick;

        if entry.bitmap.mode != mode {
            self.next_version += 1;
            let bitmap = Arc::make_mut(&mut entry.bitmap);
            color::convert(&mut bitmap.image, bitmap.mode, mode);
            bitmap.mode = mode;
            bitmap.version = self.next_version;
            self.stats.retransforms += 1;
        }
        Some(entry.bitmap.clone())
    }

    /// Store a buffer that is already in display form for the current mode.
    ///
    /// `last_access` is the tick at which the page was requested.
    fn insert(
        &mut self,
        index: u32,
        image: RgbaImage,
        last_access: u64,
        capacity: usize,
    ) -> Arc<RenderedBitmap> {
        let version = self.bump_version();
        let bitmap = Arc::new(RenderedBitmap { index, mode: self.mode, version, image });

        self.entries.insert(index, CacheEntry { bitmap: bitmap.clone(), last_access });
        self.failed.remove(&index);
        self.evict_to(capacity);
        self.stats.resident = self.entries.len();
        bitmap
    }

    fn evict_to(&mut self, capacity: usize) {
        while self.entries.len() > capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_access)
                .map(|(&index, _)| index);

            match oldest {
                Some(index) => {
                    self.entries.remove(&index);
                    self.stats.evictions += 1;
                    tracing::debug!(index, "evicted least recently used page");
                }
                None => break,
            }
        }
    }

    fn owns(&self, index: u32, job_id: JobId) -> bool {
        self.in_flight.get(&index).is_some_and(|pending| pending.job_id == job_id)
    }

    fn failure(&self, index: u32) -> Option<RenderFailure> {
        self.failed.get(&index).map(|reason| RenderFailure { index, reason: reason.clone() })
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.in_flight.clear();
        self.failed.clear();
        self.stats.resident = 0;
    }
}

/// State shared between the cache handle and its workers.
struct Shared {
    state: Mutex<CacheState>,
    source: Arc<dyn PageRasterSource>,
    page_count: u32,
    scale: ScaleFactor,
    capacity: usize,
    retry: RetryPolicy,
    events: Sender<PageEvent>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, event: PageEvent) {
        // Nobody listening once the cache handle is gone.
        let _ = self.events.send(event);
    }

    /// Call the source, retrying decode failures as the policy allows.
    fn rasterize(
        &self,
        index: u32,
        token: Option<&CancellationToken>,
    ) -> Result<RgbaImage, RasterError> {
        let attempts = self.retry.max_attempts();
        let mut attempt = 1;
        loop {
            self.lock().stats.rasterizations += 1;
            match self.source.rasterize(index, self.scale) {
                Err(RasterError::DecodeFailure { reason, .. })
                    if attempt < attempts && !token.is_some_and(CancellationToken::is_cancelled) =>
                {
                    tracing::warn!(index, attempt, %reason, "page decode failed, retrying");
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Worker side of a cache miss.
    fn run_job(&self, job: &Job, token: &CancellationToken) {
        let index = job.page_index;
        if token.is_cancelled() || !self.lock().owns(index, job.id) {
            tracing::trace!(index, job_id = job.id, "skipping cancelled rasterization");
            return;
        }

        let result = self.rasterize(index, Some(token));

        let mut state = self.lock();
        let owned = state
            .in_flight
            .get(&index)
            .filter(|pending| pending.job_id == job.id)
            .map(|pending| pending.requested_at);
        if owned.is_some() {
            state.in_flight.remove(&index);
        }
        let requested_at = match owned {
            Some(tick) if !token.is_cancelled() && !state.closed => tick,
            _ => {
                state.stats.discarded += 1;
                drop(state);
                tracing::debug!(index, "discarded rasterization of page no longer wanted");
                self.notify(PageEvent::Discarded(index));
                return;
            }
        };

        let event = match result {
            Ok(mut image) => {
                color::apply_in_place(&mut image, state.mode);
                state.insert(index, image, requested_at, self.capacity);
                if state.entries.contains_key(&index) {
                    PageEvent::Ready(index)
                } else {
                    // Every resident page was requested more recently.
                    state.stats.discarded += 1;
                    PageEvent::Discarded(index)
                }
            }
            Err(RasterError::DecodeFailure { reason, .. }) => {
                tracing::warn!(index, %reason, "page failed to decode");
                state.failed.insert(index, reason);
                state.stats.failures += 1;
                PageEvent::Failed(index)
            }
            Err(err) => {
                tracing::debug!(index, %err, "rasterization abandoned");
                state.stats.discarded += 1;
                PageEvent::Discarded(index)
            }
        };
        drop(state);
        self.notify(event);
    }
}

/// Bounded LRU store of rendered pages for one open document.
pub struct PageCache {
    shared: Arc<Shared>,
    scheduler: Option<Arc<JobScheduler>>,
    pool: Option<WorkerPool>,
    events: Receiver<PageEvent>,
}

impl PageCache {
    /// Create a cache over `source`, transforming new bitmaps for `mode`.
    ///
    /// With `config.workers == 0` misses rasterize inside the call that
    /// found them. Otherwise a worker pool of that size is started.
    pub fn new(
        source: Arc<dyn PageRasterSource>,
        config: &ViewerConfig,
        mode: DisplayMode,
    ) -> io::Result<Self> {
        let capacity = config.cache_capacity.max(1);
        let (sender, events) = crossbeam_channel::unbounded();
        let shared = Arc::new(Shared {
            state: Mutex::new(CacheState::new(mode, capacity)),
            page_count: source.page_count(),
            source,
            scale: config.scale,
            capacity,
            retry: config.retry,
            events: sender,
        });

        if config.workers == 0 {
            return Ok(Self { shared, scheduler: None, pool: None, events });
        }

        let scheduler = Arc::new(JobScheduler::new());
        let worker_shared = shared.clone();
        let executor: JobExecutor =
            Arc::new(move |job: &Job, token: &CancellationToken| worker_shared.run_job(job, token));
        let pool = WorkerPool::new(
            scheduler.clone(),
            executor,
            WorkerPoolConfig::new(config.workers).with_poll_interval(config.poll_interval),
        )?;

        Ok(Self { shared, scheduler: Some(scheduler), pool: Some(pool), events })
    }

    pub fn page_count(&self) -> u32 {
        self.shared.page_count
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn mode(&self) -> DisplayMode {
        self.shared.lock().mode
    }

    /// Whether misses are handed to worker threads.
    pub fn is_async(&self) -> bool {
        self.scheduler.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Completion notifications from workers.
    pub fn events(&self) -> &Receiver<PageEvent> {
        &self.events
    }

    /// [`request`](Self::request) at top priority.
    pub fn get(&self, index: u32) -> Result<PageSlot, RasterError> {
        self.request(index, JobPriority::default())
    }

    /// Look up a page, materializing it on a miss.
    ///
    /// `OutOfRange` and `DocumentClosed` are returned as errors and never
    /// cached. A decode failure is recorded and answered as
    /// [`PageSlot::Failed`] until cleared.
    pub fn request(&self, index: u32, priority: JobPriority) -> Result<PageSlot, RasterError> {
        let mut state = self.shared.lock();
        if state.closed {
            return Err(RasterError::DocumentClosed);
        }
        if index >= self.shared.page_count {
            return Err(RasterError::OutOfRange { index, page_count: self.shared.page_count });
        }

        if let Some(bitmap) = state.touch(index) {
            state.stats.hits += 1;
            tracing::trace!(index, "page cache hit");
            return Ok(PageSlot::Ready(bitmap));
        }
        if let Some(failure) = state.failure(index) {
            return Ok(PageSlot::Failed(failure));
        }
        let requested_at = state.tick();
        if let Some(pending) = state.in_flight.get_mut(&index) {
            pending.requested_at = requested_at;
            return Ok(PageSlot::Pending);
        }

        state.stats.misses += 1;
        tracing::debug!(index, "page cache miss");

        if let Some(scheduler) = &self.scheduler {
            let (job_id, _token) = scheduler.submit(index, priority);
            state.in_flight.insert(index, InFlight { job_id, requested_at });
            return Ok(PageSlot::Pending);
        }

        drop(state);
        let result = self.shared.rasterize(index, None);

        let mut state = self.shared.lock();
        if state.closed {
            return Err(RasterError::DocumentClosed);
        }
        match result {
            Ok(mut image) => {
                color::apply_in_place(&mut image, state.mode);
                let last_access = state.tick();
                Ok(PageSlot::Ready(state.insert(index, image, last_access, self.shared.capacity)))
            }
            Err(RasterError::DecodeFailure { reason, .. }) => {
                tracing::warn!(index, %reason, "page failed to decode");
                state.failed.insert(index, reason.clone());
                state.stats.failures += 1;
                Ok(PageSlot::Failed(RenderFailure { index, reason }))
            }
            Err(err) => Err(err),
        }
    }

    /// Switch display mode and re-transform every resident page in place.
    ///
    /// Clears failure markers so those pages are attempted again. Returns
    /// the pages whose display changed, in ascending order.
    pub fn invalidate_mode(&self, mode: DisplayMode) -> Vec<u32> {
        let mut state = self.shared.lock();
        let previous = state.mode;
        state.mode = mode;

        let mut affected: Vec<u32> = state.failed.drain().map(|(index, _)| index).collect();
        if previous != mode {
            let indices: Vec<u32> = state.entries.keys().copied().collect();
            for index in indices {
                let version = state.bump_version();
                if let Some(entry) = state.entries.get_mut(&index) {
                    let bitmap = Arc::make_mut(&mut entry.bitmap);
                    color::convert(&mut bitmap.image, bitmap.mode, mode);
                    bitmap.mode = mode;
                    bitmap.version = version;
                }
                state.stats.retransforms += 1;
                affected.push(index);
            }
        }
        affected.sort_unstable();
        affected.dedup();

        tracing::debug!(?mode, pages = affected.len(), "display mode applied to cached pages");
        affected
    }

    /// Drop resident pages and failure markers outside `first..=last`.
    /// Returns how many pages were released.
    pub fn release_outside(&self, first: u32, last: u32) -> usize {
        let keep = first..=last;
        let mut state = self.shared.lock();

        let before = state.entries.len();
        state.entries.retain(|index, _| keep.contains(index));
        state.failed.retain(|index, _| keep.contains(index));
        let released = before - state.entries.len();

        state.stats.resident = state.entries.len();
        state.stats.evictions += released as u64;
        if released > 0 {
            tracing::debug!(first, last, released, "released pages outside eviction window");
        }
        released
    }

    /// Cancel rasterizations of pages outside `first..=last`.
    ///
    /// Queued jobs never start. Running jobs finish and their result is
    /// discarded. Returns the number of pages cancelled.
    pub fn cancel_outside(&self, first: u32, last: u32) -> usize {
        let Some(scheduler) = &self.scheduler else {
            return 0;
        };
        let keep = first..=last;
        let mut state = self.shared.lock();

        let cancelled: Vec<(u32, JobId)> = state
            .in_flight
            .iter()
            .filter(|(index, _)| !keep.contains(*index))
            .map(|(&index, pending)| (index, pending.job_id))
            .collect();

        for (index, job_id) in &cancelled {
            state.in_flight.remove(index);
            scheduler.cancel_job(*job_id);
        }
        if !cancelled.is_empty() {
            tracing::debug!(first, last, count = cancelled.len(), "cancelled off-screen rasterizations");
        }
        cancelled.len()
    }

    /// Rank queued jobs against a new visible range.
    pub fn reprioritize(&self, first: u32, last: u32) -> usize {
        match &self.scheduler {
            Some(scheduler) => scheduler
                .reprioritize(|job| Some(JobPriority::for_page(job.page_index, first, last))),
            None => 0,
        }
    }

    /// Forget a failure so the next request rasterizes again.
    pub fn retry(&self, index: u32) -> bool {
        self.shared.lock().failed.remove(&index).is_some()
    }

    /// Whether `bitmap` is still the resident pixels for its page.
    pub fn is_current(&self, bitmap: &RenderedBitmap) -> bool {
        self.shared
            .lock()
            .entries
            .get(&bitmap.index)
            .is_some_and(|entry| entry.bitmap.version == bitmap.version)
    }

    pub fn contains(&self, index: u32) -> bool {
        self.shared.lock().entries.contains_key(&index)
    }

    pub fn is_pending(&self, index: u32) -> bool {
        self.shared.lock().in_flight.contains_key(&index)
    }

    pub fn len(&self) -> usize {
        self.shared.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resident page indices in ascending order.
    pub fn resident_indices(&self) -> Vec<u32> {
        let mut indices: Vec<u32> = self.shared.lock().entries.keys().copied().collect();
        indices.sort_unstable();
        indices
    }

    pub fn stats(&self) -> CacheStats {
        self.shared.lock().stats
    }

    pub fn scheduler_stats(&self) -> Option<SchedulerStats> {
        self.scheduler.as_ref().map(|scheduler| scheduler.stats())
    }

    /// Drop every page, marker and outstanding job. The cache stays usable.
    pub fn reset(&self) {
        let mut state = self.shared.lock();
        if let Some(scheduler) = &self.scheduler {
            scheduler.clear();
        }
        state.clear();
        tracing::debug!("page cache reset");
    }

    /// Release all pages and stop the workers. Later requests fail with
    /// `DocumentClosed`. Idempotent.
    pub fn close(&mut self) {
        {
            let mut state = self.shared.lock();
            state.closed = true;
            if let Some(scheduler) = &self.scheduler {
                scheduler.clear();
            }
            state.clear();
        }
        if let Some(pool) = self.pool.take() {
            pool.shutdown();
        }
    }
}

impl Drop for PageCache {
    fn drop(&mut self) {
        if let Some(scheduler) = &self.scheduler {
            scheduler.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::RecvTimeoutError;
    use image::Rgba;
    use leaflet_engine::RawPage;
    use std::collections::HashSet;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    /// In-memory source that counts rasterizations per page.
    struct MockSource {
        page_count: u32,
        calls: Mutex<HashMap<u32, usize>>,
        /// Pages that fail this many times before succeeding
        failing: HashMap<u32, usize>,
        /// When set, every rasterization reports its start and then blocks
        /// until released.
        gate: Option<(Sender<u32>, Receiver<()>)>,
    }

    impl MockSource {
        fn new(page_count: u32) -> Self {
            Self { page_count, calls: Mutex::new(HashMap::new()), failing: HashMap::new(), gate: None }
        }

        fn failing(mut self, index: u32, times: usize) -> Self {
            self.failing.insert(index, times);
            self
        }

        fn gated(mut self) -> (Self, Receiver<u32>, Sender<()>) {
            let (started_tx, started_rx) = crossbeam_channel::unbounded();
            let (release_tx, release_rx) = crossbeam_channel::unbounded();
            self.gate = Some((started_tx, release_rx));
            (self, started_rx, release_tx)
        }

        fn calls(&self, index: u32) -> usize {
            self.calls.lock().unwrap().get(&index).copied().unwrap_or(0)
        }

        fn colour(index: u32) -> Rgba<u8> {
            Rgba([(index as u8).wrapping_mul(10), 50, 200, 255])
        }
    }

    impl PageRasterSource for MockSource {
        fn page_count(&self) -> u32 {
            self.page_count
        }

        fn dimensions(&self, index: u32) -> Result<RawPage, RasterError> {
            if index >= self.page_count {
                return Err(RasterError::OutOfRange { index, page_count: self.page_count });
            }
            Ok(RawPage { width: 4, height: 3 })
        }

        fn rasterize(&self, index: u32, scale: ScaleFactor) -> Result<RgbaImage, RasterError> {
            let (width, height) = self.dimensions(index)?.scaled(scale);
            let call = {
                let mut calls = self.calls.lock().unwrap();
                let count = calls.entry(index).or_insert(0);
                *count += 1;
                *count
            };

            if let Some((started, release)) = &self.gate {
                started.send(index).unwrap();
                release.recv_timeout(WAIT).unwrap();
            }

            if self.failing.get(&index).is_some_and(|&times| call <= times) {
                return Err(RasterError::DecodeFailure { index, reason: "bad stream".into() });
            }
            Ok(RgbaImage::from_pixel(width, height, Self::colour(index)))
        }
    }

    fn inline_config(capacity: usize) -> ViewerConfig {
        ViewerConfig::default().with_cache_capacity(capacity).with_workers(0)
    }

    fn cache_over(source: &Arc<MockSource>, config: &ViewerConfig) -> PageCache {
        PageCache::new(source.clone(), config, DisplayMode::Normal).unwrap()
    }

    fn ready(slot: PageSlot) -> Arc<RenderedBitmap> {
        match slot {
            PageSlot::Ready(bitmap) => bitmap,
            other => panic!("expected a ready page, got {other:?}"),
        }
    }

    fn next_event(cache: &PageCache) -> PageEvent {
        match cache.events().recv_timeout(WAIT) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => panic!("no page event within {WAIT:?}"),
            Err(RecvTimeoutError::Disconnected) => panic!("event channel closed"),
        }
    }

    #[test]
    fn test_hit_does_not_rasterize_again() {
        let source = Arc::new(MockSource::new(3));
        let cache = cache_over(&source, &inline_config(4));

        let first = ready(cache.get(1).unwrap());
        let second = ready(cache.get(1).unwrap());

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(source.calls(1), 1);
        assert_eq!(first.image.dimensions(), (8, 6));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.rasterizations, 1);
        assert_eq!(stats.hit_rate(), 0.5);
    }

    #[test]
    fn test_eviction_keeps_capacity_most_recent() {
        let source = Arc::new(MockSource::new(10));
        let cache = cache_over(&source, &inline_config(4));

        for index in 0..6 {
            ready(cache.get(index).unwrap());
        }

        assert_eq!(cache.len(), 4);
        assert_eq!(cache.resident_indices(), vec![2, 3, 4, 5]);
        assert_eq!(cache.stats().evictions, 2);
    }

    #[test]
    fn test_eviction_follows_access_order() {
        let source = Arc::new(MockSource::new(5));
        let cache = cache_over(&source, &inline_config(2));

        ready(cache.get(0).unwrap());
        ready(cache.get(1).unwrap());
        ready(cache.get(0).unwrap());
        ready(cache.get(2).unwrap());

        assert_eq!(cache.resident_indices(), vec![0, 2]);
    }

    #[test]
    fn test_mode_change_retransforms_without_rasterizing() {
        let source = Arc::new(MockSource::new(3));
        let cache = cache_over(&source, &inline_config(4));
        let original = *ready(cache.get(2).unwrap()).image.get_pixel(0, 0);

        assert_eq!(cache.invalidate_mode(DisplayMode::Inverted), vec![2]);

        let inverted = ready(cache.get(2).unwrap());
        let pixel = inverted.image.get_pixel(0, 0);
        assert_eq!(pixel[0], 255 - original[0]);
        assert_eq!(pixel[1], 255 - original[1]);
        assert_eq!(pixel[2], 255 - original[2]);
        assert_eq!(pixel[3], original[3]);
        assert_eq!(inverted.mode, DisplayMode::Inverted);
        assert_eq!(source.calls(2), 1);
    }

    #[test]
    fn test_invalidate_same_mode_twice_is_idempotent() {
        let source = Arc::new(MockSource::new(2));
        let cache = cache_over(&source, &inline_config(4));
        let original = ready(cache.get(0).unwrap()).image.clone();

        cache.invalidate_mode(DisplayMode::Inverted);
        let once = ready(cache.get(0).unwrap()).image.clone();
        cache.invalidate_mode(DisplayMode::Inverted);
        let twice = ready(cache.get(0).unwrap()).image.clone();
        assert_eq!(once, twice);

        cache.invalidate_mode(DisplayMode::Normal);
        assert_eq!(ready(cache.get(0).unwrap()).image, original);
        assert_eq!(source.calls(0), 1);
    }

    #[test]
    fn test_new_pages_use_current_mode() {
        let source = Arc::new(MockSource::new(2));
        let cache = cache_over(&source, &inline_config(4));
        cache.invalidate_mode(DisplayMode::Inverted);

        let bitmap = ready(cache.get(1).unwrap());

        let expected = MockSource::colour(1);
        assert_eq!(bitmap.image.get_pixel(0, 0)[0], 255 - expected[0]);
        assert_eq!(bitmap.mode, DisplayMode::Inverted);
    }

    #[test]
    fn test_lent_bitmap_goes_stale() {
        let source = Arc::new(MockSource::new(2));
        let cache = cache_over(&source, &inline_config(1));

        let lent = ready(cache.get(0).unwrap());
        assert!(cache.is_current(&lent));

        cache.invalidate_mode(DisplayMode::Inverted);
        assert!(!cache.is_current(&lent));
        let refreshed = ready(cache.get(0).unwrap());
        assert!(cache.is_current(&refreshed));

        ready(cache.get(1).unwrap());
        assert!(!cache.is_current(&refreshed));
    }

    #[test]
    fn test_decode_failure_is_cached_until_cleared() {
        let source = Arc::new(MockSource::new(3).failing(1, usize::MAX));
        let cache = cache_over(&source, &inline_config(4));

        let failed = cache.get(1).unwrap();
        assert!(matches!(&failed, PageSlot::Failed(RenderFailure { index: 1, .. })));
        assert!(matches!(cache.get(1).unwrap(), PageSlot::Failed(_)));
        assert_eq!(source.calls(1), 1);

        assert!(cache.retry(1));
        assert!(!cache.retry(1));
        assert!(matches!(cache.get(1).unwrap(), PageSlot::Failed(_)));
        assert_eq!(source.calls(1), 2);

        assert_eq!(cache.invalidate_mode(DisplayMode::Inverted), vec![1]);
        cache.get(1).unwrap();
        assert_eq!(source.calls(1), 3);
        assert_eq!(cache.stats().failures, 3);
    }

    #[test]
    fn test_retry_policy_retries_inline() {
        let source = Arc::new(MockSource::new(1).failing(0, 2));
        let config = inline_config(2).with_retry(RetryPolicy::Attempts(3));
        let cache = cache_over(&source, &config);

        ready(cache.get(0).unwrap());
        assert_eq!(source.calls(0), 3);
        assert_eq!(cache.stats().rasterizations, 3);
    }

    #[test]
    fn test_contract_errors_are_not_cached() {
        let source = Arc::new(MockSource::new(3));
        let mut cache = cache_over(&source, &inline_config(4));

        assert_eq!(cache.get(3), Err(RasterError::OutOfRange { index: 3, page_count: 3 }));
        assert_eq!(source.calls(3), 0);

        ready(cache.get(0).unwrap());
        cache.close();
        cache.close();

        assert!(cache.is_closed());
        assert!(cache.is_empty());
        assert_eq!(cache.get(0), Err(RasterError::DocumentClosed));
    }

    #[test]
    fn test_release_outside_window() {
        let source = Arc::new(MockSource::new(10).failing(9, usize::MAX));
        let cache = cache_over(&source, &inline_config(10));

        for index in 0..10 {
            cache.get(index).unwrap();
        }

        assert_eq!(cache.release_outside(3, 6), 5);
        assert_eq!(cache.resident_indices(), vec![3, 4, 5, 6]);

        // The failure marker for page 9 went too.
        cache.get(9).unwrap();
        assert_eq!(source.calls(9), 2);
    }

    #[test]
    fn test_reset_clears_everything() {
        let source = Arc::new(MockSource::new(3).failing(2, usize::MAX));
        let cache = cache_over(&source, &inline_config(4));
        ready(cache.get(0).unwrap());
        cache.get(2).unwrap();

        cache.reset();

        assert!(cache.is_empty());
        assert!(!cache.is_closed());
        ready(cache.get(0).unwrap());
        assert_eq!(source.calls(0), 2);
    }

    #[test]
    fn test_async_miss_is_pending_then_ready() {
        let source = Arc::new(MockSource::new(3));
        let cache = cache_over(&source, &ViewerConfig::default());
        assert!(cache.is_async());

        assert!(cache.get(0).unwrap().is_pending());
        assert!(cache.get(0).unwrap().is_pending() || cache.contains(0));

        assert_eq!(next_event(&cache), PageEvent::Ready(0));
        ready(cache.get(0).unwrap());
        assert_eq!(source.calls(0), 1);
    }

    #[test]
    fn test_async_delivery_keeps_request_order_in_lru() {
        let source = Arc::new(MockSource::new(30));
        let cache = cache_over(&source, &ViewerConfig::default().with_cache_capacity(4));

        // One worker completes these centre-out: 10 first, 8 and 12 last.
        for index in 8..=12 {
            let slot = cache.request(index, JobPriority::for_page(index, 10, 10)).unwrap();
            assert!(slot.is_pending());
        }
        for _ in 8..=12 {
            next_event(&cache);
        }

        assert_eq!(cache.resident_indices(), vec![9, 10, 11, 12]);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_pending_request_refreshes_recency() {
        let (source, started, release) = MockSource::new(8).gated();
        let source = Arc::new(source);
        let cache = cache_over(&source, &ViewerConfig::default().with_cache_capacity(2));

        for index in [0, 1, 2] {
            cache.request(index, JobPriority::visible(index)).unwrap();
        }
        // Asked for again while still queued, so page 0 outlives page 1.
        assert!(cache.get(0).unwrap().is_pending() || cache.contains(0));

        for _ in 0..3 {
            started.recv_timeout(WAIT).unwrap();
            release.send(()).unwrap();
        }
        for _ in 0..3 {
            next_event(&cache);
        }

        assert_eq!(cache.resident_indices(), vec![0, 2]);
    }

    #[test]
    fn test_async_failure_event() {
        let source = Arc::new(MockSource::new(2).failing(1, usize::MAX));
        let cache = cache_over(&source, &ViewerConfig::default());

        assert!(cache.get(1).unwrap().is_pending());
        assert_eq!(next_event(&cache), PageEvent::Failed(1));
        assert!(matches!(cache.get(1).unwrap(), PageSlot::Failed(_)));
    }

    #[test]
    fn test_cancelled_in_flight_result_is_discarded() {
        let (source, started, release) = MockSource::new(8).gated();
        let source = Arc::new(source);
        let cache = cache_over(&source, &ViewerConfig::default());

        assert!(cache.get(5).unwrap().is_pending());
        assert_eq!(started.recv_timeout(WAIT).unwrap(), 5);

        assert_eq!(cache.cancel_outside(0, 2), 1);
        assert!(!cache.is_pending(5));
        release.send(()).unwrap();

        assert_eq!(next_event(&cache), PageEvent::Discarded(5));
        assert!(!cache.contains(5));
        assert_eq!(cache.stats().discarded, 1);
    }

    #[test]
    fn test_cancelled_queued_job_never_starts() {
        let (source, started, release) = MockSource::new(8).gated();
        let source = Arc::new(source);
        let cache = cache_over(&source, &ViewerConfig::default());

        assert!(cache.get(0).unwrap().is_pending());
        assert_eq!(started.recv_timeout(WAIT).unwrap(), 0);
        assert!(cache.request(6, JobPriority::lookahead(4)).unwrap().is_pending());

        assert_eq!(cache.cancel_outside(0, 1), 1);
        release.send(()).unwrap();

        assert_eq!(next_event(&cache), PageEvent::Ready(0));
        assert_eq!(source.calls(6), 0);
        assert_eq!(cache.scheduler_stats().unwrap().jobs_cancelled, 1);
    }

    #[test]
    fn test_queued_jobs_follow_reprioritized_range() {
        let (source, started, release) = MockSource::new(20).gated();
        let source = Arc::new(source);
        let cache = cache_over(&source, &ViewerConfig::default().with_cache_capacity(20));

        // Occupy the single worker so the rest stay queued.
        cache.get(0).unwrap();
        assert_eq!(started.recv_timeout(WAIT).unwrap(), 0);
        for index in [2, 15, 16] {
            cache.request(index, JobPriority::for_page(index, 0, 3)).unwrap();
        }

        cache.reprioritize(15, 16);

        let mut order = Vec::new();
        release.send(()).unwrap();
        for _ in 0..3 {
            order.push(started.recv_timeout(WAIT).unwrap());
            release.send(()).unwrap();
        }
        assert_eq!(order, vec![15, 16, 2]);

        let mut ready_pages = HashSet::new();
        while ready_pages.len() < 4 {
            ready_pages.insert(next_event(&cache).index());
        }
    }
}
