use crate::fetch::FetchError;
use leaflet_cache::ConfigError;
use leaflet_engine::RasterError;
use std::io;

/// Errors returned by the viewer.
#[derive(Debug, thiserror::Error)]
pub enum ViewerError {
    #[error("page {index} out of range (page_count={page_count})")]
    OutOfRange { index: u32, page_count: u32 },
    #[error("no document is open")]
    NotOpen,
    #[error("document is closed")]
    DocumentClosed,
    #[error("failed to decode document: {0}")]
    DecodeFailure(String),
    #[error(transparent)]
    NetworkFailure(#[from] FetchError),
    #[error("a document is already open")]
    AlreadyOpen,
    #[error("invalid visible range {first}..={last} for {page_count} pages")]
    InvalidRange { first: u32, last: u32, page_count: u32 },
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to start rasterization workers: {0}")]
    Worker(#[source] io::Error),
}

impl From<RasterError> for ViewerError {
    fn from(error: RasterError) -> Self {
        match error {
            RasterError::OutOfRange { index, page_count } => Self::OutOfRange { index, page_count },
            RasterError::DocumentClosed => Self::DocumentClosed,
            RasterError::DecodeFailure { index, reason } => {
                Self::DecodeFailure(format!("page {index}: {reason}"))
            }
            RasterError::Unreadable(reason) => Self::DecodeFailure(reason),
            RasterError::InvalidScale(_) => Self::Config(ConfigError::InvalidValue("scale".to_owned())),
        }
    }
}
