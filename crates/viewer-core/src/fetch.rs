//! Document retrieval over HTTP(S)

use std::io::Read;

/// Refuse bodies larger than this.
const MAX_DOCUMENT_BYTES: u64 = 512 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("network failure fetching {url}: {message}")]
    Network { url: String, message: String },
    #[error("unsupported URL {0}: expected http:// or https://")]
    UnsupportedUrl(String),
}

/// Whether `source` names a remote document rather than a local path.
pub fn is_remote(source: &str) -> bool {
    let lower = source.trim_start().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Download the document at `url`.
///
/// Non-success status codes, transport errors, interrupted bodies and
/// bodies over 512 MiB are all reported as [`FetchError::Network`].
pub fn fetch(url: &str) -> Result<Vec<u8>, FetchError> {
    fetch_limited(url, MAX_DOCUMENT_BYTES)
}

fn fetch_limited(url: &str, max_bytes: u64) -> Result<Vec<u8>, FetchError> {
    if !is_remote(url) {
        return Err(FetchError::UnsupportedUrl(url.to_owned()));
    }
    let network = |message: String| FetchError::Network { url: url.to_owned(), message };

    tracing::info!(url, "fetching document");
    let agent = ureq::agent();
    let resp = agent
        .get(url)
        .set("User-Agent", concat!("leaflet/", env!("CARGO_PKG_VERSION")))
        .call()
        .map_err(|e| network(e.to_string()))?;

    let mut bytes = Vec::new();
    resp.into_reader()
        .take(max_bytes + 1)
        .read_to_end(&mut bytes)
        .map_err(|e| network(e.to_string()))?;
    if bytes.len() as u64 > max_bytes {
        return Err(network(format!("document exceeds {max_bytes} bytes")));
    }

    tracing::debug!(url, bytes = bytes.len(), "document fetched");
    Ok(bytes)
}
