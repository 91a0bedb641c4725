//! Virtualized page list
//!
//! Only the visible range plus a lookahead margin on each side is ever
//! materialized. Pages further away than the eviction margin are released,
//! and rasterizations for pages that left the window are cancelled.

use crate::ViewerError;
use leaflet_cache::{DisplayMode, PageCache, PageEvent, PageSlot, ViewerConfig};
use leaflet_scheduler::JobPriority;
use std::ops::RangeInclusive;
use std::time::{Duration, Instant};

/// Inclusive range of page indices on screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VisibleRange {
    pub first: u32,
    pub last: u32,
}

impl VisibleRange {
    /// Endpoints may be given in either order.
    pub fn new(first: u32, last: u32) -> Self {
        Self { first: first.min(last), last: first.max(last) }
    }

    fn bounds(&self) -> (u32, u32) {
        (self.first.min(self.last), self.first.max(self.last))
    }

    /// Number of pages on screen.
    pub fn span(&self) -> u32 {
        self.first.abs_diff(self.last) + 1
    }

    pub fn contains(&self, index: u32) -> bool {
        let (low, high) = self.bounds();
        (low..=high).contains(&index)
    }

    /// Middle page, the lower one when the range has an even length.
    pub fn centre(&self) -> u32 {
        let (low, high) = self.bounds();
        low + (high - low) / 2
    }

    /// Grow by `margin` on both ends, clamped to `[0, page_count)`.
    pub fn expand(&self, margin: u32, page_count: u32) -> RangeInclusive<u32> {
        let (low, high) = self.bounds();
        let max = page_count.saturating_sub(1);
        low.saturating_sub(margin)..=high.saturating_add(margin).min(max)
    }
}

/// Scroll-driven front of the page cache.
pub struct VirtualizedPageList {
    cache: PageCache,
    page_count: u32,
    lookahead_margin: u32,
    eviction_margin: u32,
    range: Option<VisibleRange>,
}

impl VirtualizedPageList {
    pub fn new(cache: PageCache, config: &ViewerConfig) -> Self {
        Self {
            page_count: cache.page_count(),
            cache,
            lookahead_margin: config.lookahead_margin,
            eviction_margin: config.effective_eviction_margin(),
            range: None,
        }
    }

    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    pub fn visible_range(&self) -> Option<VisibleRange> {
        self.range
    }

    pub fn cache(&self) -> &PageCache {
        &self.cache
    }

    /// Pages kept materialized for the current range.
    pub fn materialization_window(&self) -> Option<RangeInclusive<u32>> {
        self.range.map(|range| range.expand(self.lookahead_margin, self.page_count))
    }

    /// Page in the middle of the visible range.
    pub fn focused_page(&self) -> Option<u32> {
        self.range.map(|range| range.centre())
    }

    /// Report a new visible range from the host.
    ///
    /// Requests every page of the materialization window in ascending order
    /// and returns them. Jobs are ranked by distance from the centre of the
    /// range, so the order of requests does not decide completion order.
    pub fn set_visible_range(&mut self, first: u32, last: u32) -> Result<Vec<u32>, ViewerError> {
        if first > last || last >= self.page_count {
            return Err(ViewerError::InvalidRange { first, last, page_count: self.page_count });
        }
        let range = VisibleRange::new(first, last);
        let window = range.expand(self.lookahead_margin, self.page_count);
        self.range = Some(range);

        self.cache.cancel_outside(*window.start(), *window.end());
        self.cache.reprioritize(first, last);

        let mut requested = Vec::with_capacity(window.clone().count());
        for index in window {
            self.cache.request(index, JobPriority::for_page(index, first, last))?;
            requested.push(index);
        }

        let keep = range.expand(self.eviction_margin, self.page_count);
        self.cache.release_outside(*keep.start(), *keep.end());

        tracing::debug!(first, last, requested = requested.len(), "visible range updated");
        Ok(requested)
    }

    /// Current state of a page, requesting it if it is not resident.
    pub fn item_at(&self, index: u32) -> Result<PageSlot, ViewerError> {
        if index >= self.page_count {
            return Err(ViewerError::OutOfRange { index, page_count: self.page_count });
        }
        let priority = match self.range {
            Some(range) => JobPriority::for_page(index, range.first, range.last),
            None => JobPriority::default(),
        };
        Ok(self.cache.request(index, priority)?)
    }

    /// Re-transform resident pages for `mode`. Returns the pages to redraw.
    pub fn apply_mode(&self, mode: DisplayMode) -> Vec<u32> {
        self.cache.invalidate_mode(mode)
    }

    /// Drain pending completion notifications without blocking.
    ///
    /// Returns the pages whose display changed, ascending and deduplicated.
    pub fn poll_events(&self) -> Vec<u32> {
        redraw_set(self.cache.events().try_iter())
    }

    /// Block up to `timeout` for the next notification, then drain the rest.
    ///
    /// Returns an empty list on timeout.
    pub fn wait_event(&self, timeout: Duration) -> Vec<u32> {
        match self.cache.events().recv_timeout(timeout) {
            Ok(first) => redraw_set(std::iter::once(first).chain(self.cache.events().try_iter())),
            Err(_) => Vec::new(),
        }
    }

    /// Wait until no page of the materialization window is still pending.
    ///
    /// Returns the pages that changed while waiting, or `None` if `timeout`
    /// elapsed first.
    pub fn wait_for_window(&self, timeout: Duration) -> Option<Vec<u32>> {
        let deadline = Instant::now() + timeout;
        let mut seen = Vec::new();
        loop {
            let pending = self
                .materialization_window()
                .is_some_and(|mut window| window.any(|index| self.cache.is_pending(index)));
            if !pending {
                seen.extend(self.cache.events().try_iter());
                return Some(redraw_set(seen.into_iter()));
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            if let Ok(event) = self.cache.events().recv_timeout(deadline - now) {
                seen.push(event);
            }
        }
    }

    /// Drop every materialized page and forget the visible range.
    pub fn reset(&mut self) {
        self.cache.reset();
        self.range = None;
    }

    pub fn close(&mut self) {
        self.cache.close();
        self.range = None;
    }
}

fn redraw_set(events: impl Iterator<Item = PageEvent>) -> Vec<u32> {
    let mut indices: Vec<u32> = events
        .filter_map(|event| match event {
            PageEvent::Ready(index) | PageEvent::Failed(index) => Some(index),
            PageEvent::Discarded(_) => None,
        })
        .collect();
    indices.sort_unstable();
    indices.dedup();
    indices
}
