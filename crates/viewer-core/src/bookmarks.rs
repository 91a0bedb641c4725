//! Session bookmarks

use crate::ViewerError;

/// Bookmarked pages in the order they were added, without duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookmarkRegistry {
    page_count: u32,
    pages: Vec<u32>,
}

impl BookmarkRegistry {
    pub fn new(page_count: u32) -> Self {
        Self { page_count, pages: Vec::new() }
    }

    /// Bookmark a page. Returns `false` if it was already bookmarked.
    pub fn add(&mut self, index: u32) -> Result<bool, ViewerError> {
        if index >= self.page_count {
            return Err(ViewerError::OutOfRange { index, page_count: self.page_count });
        }
        if self.pages.contains(&index) {
            return Ok(false);
        }
        self.pages.push(index);
        Ok(true)
    }

    /// No-op if the page is not bookmarked.
    pub fn remove(&mut self, index: u32) -> bool {
        let before = self.pages.len();
        self.pages.retain(|&page| page != index);
        self.pages.len() != before
    }

    pub fn list(&self) -> &[u32] {
        &self.pages
    }
}
