//! PDF text extraction
//!
//! Extracts text with pdf-extract and splits it into pages on form feeds.

use std::path::Path;

use crate::error::{RagError, Result};

use super::LoadedDocument;

/// One document per non-empty page, tagged with its 1-based `page`
pub fn load(path: &Path) -> Result<Vec<LoadedDocument>> {
    let bytes = std::fs::read(path).map_err(|e| RagError::load(path, e))?;

    let text = pdf_extract::extract_text_from_mem(&bytes)
        .map_err(|e| RagError::load(path, format!("PDF extraction failed: {}", e)))?;

    pages_to_documents(path, &text)
}

/// Extracted text to page documents; no text at all is a load failure
fn pages_to_documents(path: &Path, text: &str) -> Result<Vec<LoadedDocument>> {
    let pages = split_pages(text);
    if pages.is_empty() {
        return Err(RagError::load(path, "no extractable text (scanned PDF?)"));
    }

    Ok(pages
        .into_iter()
        .map(|(page, text)| LoadedDocument::new(path, text).with("page", page))
        .collect())
}

/// `(page number, text)` for every page that has text.
///
/// Blank pages are dropped without renumbering the rest.
fn split_pages(text: &str) -> Vec<(usize, String)> {
    text.split('\x0c')
        .enumerate()
        .map(|(i, page)| (i + 1, page.trim().to_string()))
        .filter(|(_, page)| !page.is_empty())
        .collect()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_no_text_is_load_error() {
        let path = Path::new("/scans/receipt.pdf");
        let err = pages_to_documents(path, "  \x0c\n \x0c").unwrap_err();
        match err {
            RagError::Load { path: p, reason } => {
                assert_eq!(p, path);
                assert!(reason.contains("no extractable text"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_pages_to_documents_tags_pages() {
        let docs = pages_to_documents(Path::new("a.pdf"), "first\x0c\x0cthird").unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[1].metadata["page"], "3");
        assert_eq!(docs[1].text, "third");
    }

    #[test]
    fn test_split_pages_with_formfeed() {
        let pages = split_pages("Page 1 content\x0cPage 2 content\x0cPage 3 content");
        assert_eq!(pages.len(), 3);
        assert_eq!(pages[0], (1, "Page 1 content".to_string()));
        assert_eq!(pages[1], (2, "Page 2 content".to_string()));
    }

    #[test]
    fn test_split_pages_keeps_numbering_over_blank_pages() {
        let pages = split_pages("intro\x0c  \n\x0cbody");
        assert_eq!(
            pages,
            vec![(1, "intro".to_string()), (3, "body".to_string())]
        );
    }

    #[test]
    fn test_split_pages_no_separator() {
        let pages = split_pages("Just some text without page breaks");
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].0, 1);
    }

    #[test]
    fn test_garbage_pdf_is_load_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.pdf");
        std::fs::write(&path, b"this is not a pdf").unwrap();

        let err = load(&path).unwrap_err();
        assert!(matches!(err, RagError::Load { .. }));
    }
}
