use lopdf::Document;
use tracing::{debug, warn};

#[derive(Debug, Default, Clone)]
pub struct PdfText {
    pub text: String,
    pub page_count: usize,
}

impl PdfText {
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// Extract plain text from PDF bytes, page by page, joined with blank
/// lines. Never fails: malformed input, non-PDF input, or pages the parser
/// cannot read all degrade to an empty result so the caller escalates.
pub fn extract_pdf_text(bytes: &[u8]) -> PdfText {
    if !bytes.starts_with(b"%PDF-") {
        debug!("input lacks PDF magic; skipping local text extraction");
        return PdfText::default();
    }

    let document = match Document::load_mem(bytes) {
        Ok(document) => document,
        Err(err) => {
            warn!(?err, "failed to parse PDF; returning empty text");
            return PdfText::default();
        }
    };

    let pages = document.get_pages();
    let page_count = pages.len();
    let mut chunks = Vec::with_capacity(page_count);
    for page_number in pages.keys() {
        match document.extract_text(&[*page_number]) {
            Ok(text) => {
                let trimmed = text.trim().to_string();
                if !trimmed.is_empty() {
                    chunks.push(trimmed);
                }
            }
            Err(err) => {
                warn!(?err, page_number, "failed to extract text from page");
            }
        }
    }

    PdfText {
        text: chunks.join("\n\n"),
        page_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_pdf_bytes_yield_empty_text() {
        let result = extract_pdf_text(b"\xff\xd8\xff\xe0 jpeg bytes");
        assert!(result.is_empty());
        assert_eq!(result.page_count, 0);
    }

    #[test]
    fn truncated_pdf_yields_empty_text() {
        let result = extract_pdf_text(b"%PDF-1.7 garbage with no xref");
        assert!(result.is_empty());
    }

    #[test]
    fn empty_input_yields_empty_text() {
        assert!(extract_pdf_text(&[]).is_empty());
    }
}
