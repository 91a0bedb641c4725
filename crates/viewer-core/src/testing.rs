//! Raster source double shared by the viewer tests.

use image::Rgba;
use leaflet_engine::{PageRasterSource, RasterError, RawPage, RgbaImage, ScaleFactor};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Fixed-size pages in a per-page colour; counts every rasterization.
pub struct CountingSource {
    page_count: u32,
    /// Pages past this index fail as if the document were shorter
    readable: u32,
    calls: Mutex<BTreeMap<u32, usize>>,
    closed: AtomicBool,
}

impl CountingSource {
    pub fn new(page_count: u32) -> Self {
        Self {
            page_count,
            readable: page_count,
            calls: Mutex::new(BTreeMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_readable_pages(mut self, readable: u32) -> Self {
        self.readable = readable;
        self
    }

    pub fn colour(index: u32) -> Rgba<u8> {
        Rgba([(index as u8).wrapping_mul(20).wrapping_add(5), 60, 180, 255])
    }

    pub fn calls(&self, index: u32) -> usize {
        self.calls.lock().unwrap().get(&index).copied().unwrap_or(0)
    }

    /// Pages rasterized at least once, ascending.
    pub fn rasterized_pages(&self) -> Vec<u32> {
        self.calls.lock().unwrap().keys().copied().collect()
    }

    fn check(&self, index: u32) -> Result<(), RasterError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RasterError::DocumentClosed);
        }
        if index >= self.readable {
            return Err(RasterError::OutOfRange { index, page_count: self.readable });
        }
        Ok(())
    }
}

impl PageRasterSource for CountingSource {
    fn page_count(&self) -> u32 {
        self.page_count
    }

    fn dimensions(&self, index: u32) -> Result<RawPage, RasterError> {
        self.check(index)?;
        Ok(RawPage { width: 5, height: 7 })
    }

    fn rasterize(&self, index: u32, scale: ScaleFactor) -> Result<RgbaImage, RasterError> {
        let (width, height) = self.dimensions(index)?.scaled(scale);
        *self.calls.lock().unwrap().entry(index).or_insert(0) += 1;
        Ok(RgbaImage::from_pixel(width, height, Self::colour(index)))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }
}
