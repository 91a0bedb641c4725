//! In-memory sample documents for tests and demos.

use crate::{PageSize, PdfEngineError};
use lopdf::{dictionary, Document, Object, Stream};

/// One page of a generated sample document.
#[derive(Debug, Clone, Copy)]
pub struct SamplePage {
    pub size: PageSize,
    /// Give the page a content stream that claims Flate compression but
    /// holds garbage, so decoding it fails.
    pub corrupt: bool,
}

impl SamplePage {
    pub fn sized(width_pt: f32, height_pt: f32) -> Self {
        Self { size: PageSize { width_pt, height_pt }, corrupt: false }
    }

    pub fn letter() -> Self {
        Self { size: PageSize::LETTER, corrupt: false }
    }

    pub fn corrupt() -> Self {
        Self { size: PageSize::LETTER, corrupt: true }
    }
}

/// Serialize a PDF with the given pages.
pub fn build_pdf(pages: &[SamplePage]) -> Result<Vec<u8>, PdfEngineError> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let mut kids: Vec<Object> = Vec::with_capacity(pages.len());

    for page in pages {
        let media_box: Vec<Object> = vec![
            Object::from(0i64),
            Object::from(0i64),
            Object::from(page.size.width_pt),
            Object::from(page.size.height_pt),
        ];

        let mut page_dict = dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "MediaBox" => media_box,
        };

        if page.corrupt {
            let stream = Stream::new(
                dictionary! { "Filter" => "FlateDecode" },
                b"this is not deflate data".to_vec(),
            );
            let contents_id = doc.add_object(stream);
            page_dict.set("Contents", contents_id);
        }

        kids.push(doc.add_object(page_dict).into());
    }

    let pages_dict = dictionary! {
        "Type" => "Pages",
        "Kids" => kids,
        "Count" => Object::from(pages.len() as i64),
    };
    doc.objects.insert(pages_id, Object::Dictionary(pages_dict));

    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes)?;
    Ok(bytes)
}

/// A document of `count` letter-sized pages.
pub fn letter_pdf(count: usize) -> Result<Vec<u8>, PdfEngineError> {
    build_pdf(&vec![SamplePage::letter(); count])
}
