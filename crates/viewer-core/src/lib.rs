//! Leaflet viewer core
//!
//! Host-facing layer of the page viewer: the virtualized page list driven
//! by the host's visible range, session bookmarks, and the controller that
//! owns the open document and the display mode.
//!
//! # Example
//!
//! ```
//! use leaflet_engine::{sample, LopdfEngine, OpenSource};
//! use leaflet_viewer::{PageSlot, ViewerConfig, ViewerController};
//!
//! let bytes = sample::letter_pdf(3).unwrap();
//! let mut viewer = ViewerController::new(ViewerConfig::default().with_workers(0)).unwrap();
//! viewer.open_source(LopdfEngine::new(), OpenSource::Bytes(bytes)).unwrap();
//!
//! viewer.set_visible_range(0, 0).unwrap();
//! assert!(matches!(viewer.item_at(0).unwrap(), PageSlot::Ready(_)));
//!
//! viewer.toggle_mode().unwrap();
//! viewer.close();
//! ```

mod bookmarks;
mod controller;
mod error;
pub mod fetch;
mod page_list;
#[cfg(test)]
mod testing;

pub use bookmarks::BookmarkRegistry;
pub use controller::ViewerController;
pub use error::ViewerError;
pub use fetch::{fetch, is_remote, FetchError};
pub use page_list::{VirtualizedPageList, VisibleRange};

pub use leaflet_cache::{
    CacheStats, DisplayMode, PageCache, PageEvent, PageSlot, RenderFailure, RenderedBitmap,
    RetryPolicy, ViewerConfig,
};
