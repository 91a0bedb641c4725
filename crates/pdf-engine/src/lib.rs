//! Leaflet document engine
//!
//! Decoder capability for the page viewer. A [`PdfEngine`] opens documents,
//! reports page geometry and draws a page into a caller-provided RGBA buffer.
//! [`DocumentRasterSource`] wraps one open document behind the
//! [`PageRasterSource`] contract consumed by the page cache.

mod raster;
pub mod sample;

pub use raster::{DocumentRasterSource, PageRasterSource, RasterError, RawPage, ScaleFactor};

use image::{ImageBuffer, Rgba};
use lopdf::Document;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

pub type RgbaImage = ImageBuffer<Rgba<u8>, Vec<u8>>;

/// Fill colour of an empty page.
const PAPER: Rgba<u8> = Rgba([255, 255, 255, 255]);

/// Colour of the one-pixel page frame.
const FRAME: Rgba<u8> = Rgba([220, 220, 220, 255]);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DocumentHandle(u64);

impl DocumentHandle {
    pub fn raw(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageSize {
    pub width_pt: f32,
    pub height_pt: f32,
}

impl PageSize {
    pub const LETTER: Self = Self { width_pt: 612.0, height_pt: 792.0 };
}

#[derive(Debug, Clone)]
pub enum OpenSource {
    Path(PathBuf),
    Bytes(Vec<u8>),
}

impl From<PathBuf> for OpenSource {
    fn from(value: PathBuf) -> Self {
        Self::Path(value)
    }
}

impl From<&Path> for OpenSource {
    fn from(value: &Path) -> Self {
        Self::Path(value.to_path_buf())
    }
}

impl From<Vec<u8>> for OpenSource {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PdfEngineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("PDF parse error: {0}")]
    Parse(#[from] lopdf::Error),
    #[error("invalid handle {0}")]
    InvalidHandle(u64),
    #[error("page {page} out of range (page_count={page_count})")]
    PageOutOfRange { page: u32, page_count: u32 },
    #[error("encrypted PDFs are not supported in the default backend")]
    EncryptedUnsupported,
    #[error("backend error: {0}")]
    Backend(String),
}

/// Opaque document decoder.
///
/// Implementations are not required to be thread-safe for concurrent page
/// access; callers serialize access to a single engine.
pub trait PdfEngine: Send {
    fn open(&mut self, source: OpenSource) -> Result<DocumentHandle, PdfEngineError>;
    fn page_count(&self, handle: DocumentHandle) -> Result<u32, PdfEngineError>;
    fn page_size(
        &self,
        handle: DocumentHandle,
        page_index: u32,
    ) -> Result<PageSize, PdfEngineError>;
    /// Draw a page so that it fills `target`. The buffer dimensions decide
    /// the effective scale.
    fn render_page(
        &self,
        handle: DocumentHandle,
        page_index: u32,
        target: &mut RgbaImage,
    ) -> Result<(), PdfEngineError>;
    fn close(&mut self, handle: DocumentHandle) -> Result<(), PdfEngineError>;
}

#[derive(Debug, Clone, Copy)]
struct PageRecord {
    size: PageSize,
    /// Content streams failed to decode when the document was opened.
    corrupt: bool,
}

#[derive(Debug, Clone)]
struct DocumentRecord {
    pages: Vec<PageRecord>,
}

#[derive(Debug, Default)]
pub struct LopdfEngine {
    next_handle: u64,
    docs: HashMap<DocumentHandle, DocumentRecord>,
}

impl LopdfEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn parse_pages(bytes: &[u8]) -> Result<Vec<PageRecord>, PdfEngineError> {
        if bytes.windows("/Encrypt".len()).any(|window| window == b"/Encrypt") {
            return Err(PdfEngineError::EncryptedUnsupported);
        }

        let doc = Document::load_mem(bytes)?;
        let pages = doc.get_pages();
        let mut records = Vec::with_capacity(pages.len());

        for (_, object_id) in pages {
            let dict = doc.get_dictionary(object_id)?;
            let size = dict
                .get(b"MediaBox")
                .ok()
                .and_then(|obj| obj.as_array().ok())
                .and_then(|array| {
                    if array.len() != 4 {
                        return None;
                    }
                    let x0 = array[0].as_float().ok()?;
                    let y0 = array[1].as_float().ok()?;
                    let x1 = array[2].as_float().ok()?;
                    let y1 = array[3].as_float().ok()?;
                    Some(PageSize { width_pt: (x1 - x0).abs(), height_pt: (y1 - y0).abs() })
                })
                .unwrap_or(PageSize::LETTER);

            let corrupt = !Self::contents_decode(&doc, object_id);
            if corrupt {
                tracing::warn!(page = records.len(), "page content stream does not decode");
            }

            records.push(PageRecord { size, corrupt });
        }

        if records.is_empty() {
            return Err(PdfEngineError::Backend("document has no pages".to_owned()));
        }

        Ok(records)
    }

    /// Whether every content stream of a page can be read and decompressed.
    fn contents_decode(doc: &Document, page_id: lopdf::ObjectId) -> bool {
        doc.get_page_contents(page_id).into_iter().all(|stream_id| {
            match doc.get_object(stream_id).and_then(lopdf::Object::as_stream) {
                Ok(stream) if stream.dict.has(b"Filter") => stream.decompressed_content().is_ok(),
                Ok(_) => true,
                Err(_) => false,
            }
        })
    }

    fn record(&self, handle: DocumentHandle) -> Result<&DocumentRecord, PdfEngineError> {
        self.docs.get(&handle).ok_or(PdfEngineError::InvalidHandle(handle.raw()))
    }

    fn page(&self, handle: DocumentHandle, page_index: u32) -> Result<PageRecord, PdfEngineError> {
        let record = self.record(handle)?;
        record.pages.get(page_index as usize).copied().ok_or(PdfEngineError::PageOutOfRange {
            page: page_index,
            page_count: record.pages.len() as u32,
        })
    }
}

impl PdfEngine for LopdfEngine {
    fn open(&mut self, source: OpenSource) -> Result<DocumentHandle, PdfEngineError> {
        let bytes = match source {
            OpenSource::Path(path) => fs::read(path)?,
            OpenSource::Bytes(bytes) => bytes,
        };

        let pages = Self::parse_pages(&bytes)?;

        self.next_handle += 1;
        let handle = DocumentHandle(self.next_handle);
        tracing::debug!(handle = handle.raw(), pages = pages.len(), "opened document");
        self.docs.insert(handle, DocumentRecord { pages });

        Ok(handle)
    }

    fn page_count(&self, handle: DocumentHandle) -> Result<u32, PdfEngineError> {
        Ok(self.record(handle)?.pages.len() as u32)
    }

    fn page_size(
        &self,
        handle: DocumentHandle,
        page_index: u32,
    ) -> Result<PageSize, PdfEngineError> {
        Ok(self.page(handle, page_index)?.size)
    }

    fn render_page(
        &self,
        handle: DocumentHandle,
        page_index: u32,
        target: &mut RgbaImage,
    ) -> Result<(), PdfEngineError> {
        let page = self.page(handle, page_index)?;
        if page.corrupt {
            return Err(PdfEngineError::Backend(format!(
                "content stream of page {page_index} is corrupt"
            )));
        }

        let (width, height) = target.dimensions();
        for pixel in target.pixels_mut() {
            *pixel = PAPER;
        }

        if width >= 4 && height >= 4 {
            for x in 0..width {
                target.put_pixel(x, 0, FRAME);
                target.put_pixel(x, height - 1, FRAME);
            }
            for y in 0..height {
                target.put_pixel(0, y, FRAME);
                target.put_pixel(width - 1, y, FRAME);
            }
        }

        Ok(())
    }

    fn close(&mut self, handle: DocumentHandle) -> Result<(), PdfEngineError> {
        self.docs.remove(&handle).map(|_| ()).ok_or(PdfEngineError::InvalidHandle(handle.raw()))
    }
}

pub fn default_engine() -> LopdfEngine {
    LopdfEngine::new()
}
