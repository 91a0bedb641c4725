//! Page rasterization contract
//!
//! [`PageRasterSource`] is the narrow view of a document used by the page
//! cache: page geometry plus "draw page `i` at scale `s`". Every call to
//! [`PageRasterSource::rasterize`] allocates a fresh buffer that the caller
//! owns.

use crate::{DocumentHandle, OpenSource, PdfEngine, PdfEngineError, RgbaImage};
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Errors surfaced by a raster source.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RasterError {
    #[error("page {index} out of range (page_count={page_count})")]
    OutOfRange { index: u32, page_count: u32 },
    #[error("document is closed")]
    DocumentClosed,
    #[error("failed to decode page {index}: {reason}")]
    DecodeFailure { index: u32, reason: String },
    #[error("failed to decode document: {0}")]
    Unreadable(String),
    #[error("scale factor must be a positive rational, got {0}")]
    InvalidScale(String),
}

impl RasterError {
    fn from_engine(index: u32, error: PdfEngineError) -> Self {
        match error {
            PdfEngineError::PageOutOfRange { page, page_count } => {
                Self::OutOfRange { index: page, page_count }
            }
            PdfEngineError::InvalidHandle(_) => Self::DocumentClosed,
            other => Self::DecodeFailure { index, reason: other.to_string() },
        }
    }
}

/// Positive rational scale factor applied to page dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScaleFactor {
    numerator: u32,
    denominator: u32,
}

impl ScaleFactor {
    /// 2x oversampling for display sharpness.
    pub const OVERSAMPLE: Self = Self { numerator: 2, denominator: 1 };

    pub fn new(numerator: u32, denominator: u32) -> Result<Self, RasterError> {
        if numerator == 0 || denominator == 0 {
            return Err(RasterError::InvalidScale(format!("{numerator}/{denominator}")));
        }
        Ok(Self { numerator, denominator })
    }

    pub fn numerator(self) -> u32 {
        self.numerator
    }

    pub fn denominator(self) -> u32 {
        self.denominator
    }

    /// Scale a length in source units to pixels, rounding to nearest and
    /// never producing an empty axis.
    pub fn apply(self, length: u32) -> u32 {
        let scaled = (u64::from(length) * u64::from(self.numerator)
            + u64::from(self.denominator) / 2)
            / u64::from(self.denominator);
        scaled.clamp(1, u64::from(u32::MAX)) as u32
    }
}

impl Default for ScaleFactor {
    fn default() -> Self {
        Self::OVERSAMPLE
    }
}

impl fmt::Display for ScaleFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.denominator == 1 {
            write!(f, "{}", self.numerator)
        } else {
            write!(f, "{}/{}", self.numerator, self.denominator)
        }
    }
}

impl FromStr for ScaleFactor {
    type Err = RasterError;

    /// Accepts `"2"` or `"3/2"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RasterError::InvalidScale(s.to_owned());
        let (numerator, denominator) = match s.trim().split_once('/') {
            Some((n, d)) => (n.trim(), d.trim()),
            None => (s.trim(), "1"),
        };
        let numerator = numerator.parse::<u32>().map_err(|_| invalid())?;
        let denominator = denominator.parse::<u32>().map_err(|_| invalid())?;
        Self::new(numerator, denominator).map_err(|_| invalid())
    }
}

/// Natural page dimensions in source units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawPage {
    pub width: u32,
    pub height: u32,
}

impl RawPage {
    pub fn scaled(self, scale: ScaleFactor) -> (u32, u32) {
        (scale.apply(self.width), scale.apply(self.height))
    }
}

/// A document that can report page geometry and rasterize pages.
pub trait PageRasterSource: Send + Sync {
    fn page_count(&self) -> u32;

    fn dimensions(&self, index: u32) -> Result<RawPage, RasterError>;

    /// Rasterize a page into a newly allocated RGBA8 buffer of
    /// `dimensions(index)` scaled by `scale`.
    fn rasterize(&self, index: u32, scale: ScaleFactor) -> Result<RgbaImage, RasterError>;

    /// Release the underlying document. Later page operations fail with
    /// [`RasterError::DocumentClosed`].
    fn close(&self) {}

    fn is_open(&self) -> bool {
        true
    }
}

struct SourceState<E> {
    engine: E,
    handle: Option<DocumentHandle>,
}

/// [`PageRasterSource`] over one document opened in a [`PdfEngine`].
///
/// The engine sits behind a mutex, so pages are decoded one at a time even
/// when several workers share the source.
pub struct DocumentRasterSource<E: PdfEngine> {
    state: Mutex<SourceState<E>>,
    page_count: u32,
}

impl<E: PdfEngine> DocumentRasterSource<E> {
    /// Open `source` in `engine`.
    pub fn open(mut engine: E, source: OpenSource) -> Result<Self, RasterError> {
        let handle =
            engine.open(source).map_err(|err| RasterError::Unreadable(err.to_string()))?;
        let page_count = engine
            .page_count(handle)
            .map_err(|err| RasterError::Unreadable(err.to_string()))?;

        Ok(Self { state: Mutex::new(SourceState { engine, handle: Some(handle) }), page_count })
    }

    fn lock(&self) -> MutexGuard<'_, SourceState<E>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_index(&self, index: u32) -> Result<(), RasterError> {
        if index >= self.page_count {
            return Err(RasterError::OutOfRange { index, page_count: self.page_count });
        }
        Ok(())
    }

    fn raw_page(state: &SourceState<E>, index: u32) -> Result<(DocumentHandle, RawPage), RasterError> {
        let handle = state.handle.ok_or(RasterError::DocumentClosed)?;
        let size =
            state.engine.page_size(handle, index).map_err(|err| RasterError::from_engine(index, err))?;

        Ok((
            handle,
            RawPage {
                width: size.width_pt.round().max(1.0) as u32,
                height: size.height_pt.round().max(1.0) as u32,
            },
        ))
    }
}

impl<E: PdfEngine> PageRasterSource for DocumentRasterSource<E> {
    fn page_count(&self) -> u32 {
        self.page_count
    }

    fn dimensions(&self, index: u32) -> Result<RawPage, RasterError> {
        let state = self.lock();
        if state.handle.is_none() {
            return Err(RasterError::DocumentClosed);
        }
        self.check_index(index)?;
        Self::raw_page(&state, index).map(|(_, page)| page)
    }

    fn rasterize(&self, index: u32, scale: ScaleFactor) -> Result<RgbaImage, RasterError> {
        let state = self.lock();
        if state.handle.is_none() {
            return Err(RasterError::DocumentClosed);
        }
        self.check_index(index)?;

        let (handle, page) = Self::raw_page(&state, index)?;
        let (width, height) = page.scaled(scale);
        let mut buffer = RgbaImage::new(width, height);

        state
            .engine
            .render_page(handle, index, &mut buffer)
            .map_err(|err| RasterError::from_engine(index, err))?;

        tracing::trace!(index, width, height, "rasterized page");
        Ok(buffer)
    }

    fn close(&self) {
        let mut state = self.lock();
        if let Some(handle) = state.handle.take() {
            if let Err(err) = state.engine.close(handle) {
                tracing::warn!(handle = handle.raw(), %err, "engine refused to close document");
            }
        }
    }

    fn is_open(&self) -> bool {
        self.lock().handle.is_some()
    }
}
