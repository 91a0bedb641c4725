//! Leaflet page cache
//!
//! Display-mode colour transform, the bounded cache of rendered pages and
//! the viewer configuration shared by every layer above the decoder.

pub mod color;
pub mod config;
pub mod page_cache;

pub use color::DisplayMode;
pub use config::{ConfigError, RetryPolicy, ViewerConfig};
pub use page_cache::{CacheStats, PageCache, PageEvent, PageSlot, RenderFailure, RenderedBitmap};
