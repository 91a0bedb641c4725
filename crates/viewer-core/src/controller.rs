//! Viewer façade
//!
//! Owns the document session and the display mode. A controller is either
//! closed or holds exactly one open document.

use crate::bookmarks::BookmarkRegistry;
use crate::fetch;
use crate::page_list::{VirtualizedPageList, VisibleRange};
use crate::ViewerError;
use leaflet_cache::{CacheStats, DisplayMode, PageCache, PageSlot, ViewerConfig};
use leaflet_engine::{DocumentRasterSource, OpenSource, PageRasterSource, PdfEngine, RawPage};
use std::sync::Arc;
use std::time::Duration;

struct Session {
    source: Arc<dyn PageRasterSource>,
    list: VirtualizedPageList,
    bookmarks: BookmarkRegistry,
}

pub struct ViewerController {
    config: ViewerConfig,
    mode: DisplayMode,
    session: Option<Session>,
}

impl Default for ViewerController {
    fn default() -> Self {
        Self { config: ViewerConfig::default(), mode: DisplayMode::Normal, session: None }
    }
}

impl ViewerController {
    pub fn new(config: ViewerConfig) -> Result<Self, ViewerError> {
        config.validate()?;
        Ok(Self { config, mode: DisplayMode::Normal, session: None })
    }

    pub fn config(&self) -> &ViewerConfig {
        &self.config
    }

    pub fn mode(&self) -> DisplayMode {
        self.mode
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    fn session(&self) -> Result<&Session, ViewerError> {
        self.session.as_ref().ok_or(ViewerError::NotOpen)
    }

    fn session_mut(&mut self) -> Result<&mut Session, ViewerError> {
        self.session.as_mut().ok_or(ViewerError::NotOpen)
    }

    /// Start a session over `source` and request the first screenful.
    ///
    /// Returns the pages requested for the initial range.
    pub fn open(&mut self, source: Arc<dyn PageRasterSource>) -> Result<Vec<u32>, ViewerError> {
        if self.session.is_some() {
            return Err(ViewerError::AlreadyOpen);
        }

        let page_count = source.page_count();
        let (list, requested) = match self.start_list(&source, page_count) {
            Ok(started) => started,
            Err(err) => {
                source.close();
                return Err(err);
            }
        };

        self.session =
            Some(Session { source, list, bookmarks: BookmarkRegistry::new(page_count) });
        tracing::info!(page_count, mode = ?self.mode, "document opened");
        Ok(requested)
    }

    fn start_list(
        &self,
        source: &Arc<dyn PageRasterSource>,
        page_count: u32,
    ) -> Result<(VirtualizedPageList, Vec<u32>), ViewerError> {
        let cache =
            PageCache::new(source.clone(), &self.config, self.mode).map_err(ViewerError::Worker)?;
        let mut list = VirtualizedPageList::new(cache, &self.config);

        let requested = if page_count == 0 {
            Vec::new()
        } else {
            let last = self.config.screenful.clamp(1, page_count) - 1;
            list.set_visible_range(0, last)?
        };
        Ok((list, requested))
    }

    /// Decode `source` with `engine` and open it.
    pub fn open_source<E>(&mut self, engine: E, source: OpenSource) -> Result<Vec<u32>, ViewerError>
    where
        E: PdfEngine + 'static,
    {
        if self.session.is_some() {
            return Err(ViewerError::AlreadyOpen);
        }
        let document = DocumentRasterSource::open(engine, source)?;
        self.open(Arc::new(document))
    }

    /// Fetch a remote document and open it. Nothing is opened if the
    /// download fails.
    pub fn open_url<E>(&mut self, engine: E, url: &str) -> Result<Vec<u32>, ViewerError>
    where
        E: PdfEngine + 'static,
    {
        if self.session.is_some() {
            return Err(ViewerError::AlreadyOpen);
        }
        let bytes = fetch::fetch(url)?;
        self.open_source(engine, OpenSource::Bytes(bytes))
    }

    /// Release every page and the document. Idempotent.
    pub fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.list.close();
            session.source.close();
            tracing::info!("document closed");
        }
    }

    /// Flip the display mode and re-transform resident pages.
    ///
    /// Returns the pages to redraw.
    pub fn toggle_mode(&mut self) -> Result<Vec<u32>, ViewerError> {
        let session = self.session.as_ref().ok_or(ViewerError::NotOpen)?;
        let mode = self.mode.toggled();
        let redraw = session.list.apply_mode(mode);
        self.mode = mode;

        tracing::info!(?mode, pages = redraw.len(), "display mode toggled");
        Ok(redraw)
    }

    pub fn page_count(&self) -> Result<u32, ViewerError> {
        Ok(self.session()?.list.page_count())
    }

    /// Natural size of a page.
    pub fn dimensions(&self, index: u32) -> Result<RawPage, ViewerError> {
        Ok(self.session()?.source.dimensions(index)?)
    }

    pub fn set_visible_range(&mut self, first: u32, last: u32) -> Result<Vec<u32>, ViewerError> {
        self.session_mut()?.list.set_visible_range(first, last)
    }

    pub fn visible_range(&self) -> Option<VisibleRange> {
        self.session.as_ref().and_then(|session| session.list.visible_range())
    }

    pub fn item_at(&self, index: u32) -> Result<PageSlot, ViewerError> {
        self.session()?.list.item_at(index)
    }

    pub fn poll_events(&self) -> Result<Vec<u32>, ViewerError> {
        Ok(self.session()?.list.poll_events())
    }

    pub fn wait_event(&self, timeout: Duration) -> Result<Vec<u32>, ViewerError> {
        Ok(self.session()?.list.wait_event(timeout))
    }

    /// See [`VirtualizedPageList::wait_for_window`].
    pub fn wait_for_window(&self, timeout: Duration) -> Result<Option<Vec<u32>>, ViewerError> {
        Ok(self.session()?.list.wait_for_window(timeout))
    }

    pub fn focused_page(&self) -> Option<u32> {
        self.session.as_ref().and_then(|session| session.list.focused_page())
    }

    pub fn add_bookmark(&mut self, index: u32) -> Result<bool, ViewerError> {
        self.session_mut()?.bookmarks.add(index)
    }

    pub fn remove_bookmark(&mut self, index: u32) -> Result<bool, ViewerError> {
        Ok(self.session_mut()?.bookmarks.remove(index))
    }

    /// Bookmark the page in the middle of the visible range.
    pub fn bookmark_focused(&mut self) -> Result<u32, ViewerError> {
        let session = self.session_mut()?;
        let index = session.list.focused_page().ok_or(ViewerError::InvalidRange {
            first: 0,
            last: 0,
            page_count: session.list.page_count(),
        })?;
        session.bookmarks.add(index)?;
        Ok(index)
    }

    /// Bookmarks of the open document; empty when closed.
    pub fn bookmarks(&self) -> &[u32] {
        match &self.session {
            Some(session) => session.bookmarks.list(),
            None => &[],
        }
    }

    pub fn cache_stats(&self) -> Result<CacheStats, ViewerError> {
        Ok(self.session()?.list.cache().stats())
    }
}

impl Drop for ViewerController {
    fn drop(&mut self) {
        self.close();
    }
}
