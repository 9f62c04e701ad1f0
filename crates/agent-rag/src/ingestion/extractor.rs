//! Text extraction keyed by declared content type

use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::ContentType;

/// Fraction of replacement characters above which a best-effort decode is
/// treated as binary data
const MAX_REPLACEMENT_RATIO: f64 = 0.1;

/// Text pulled out of an uploaded artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedText {
    /// Extracted text, never empty or whitespace-only
    pub text: String,
    /// Page count for paginated formats
    pub page_count: Option<u32>,
}

/// Maps (bytes, declared content type) to text
#[derive(Debug, Clone)]
pub struct DocumentExtractor {
    /// Deadline for the primary PDF parser
    pdf_timeout: Duration,
}

impl Default for DocumentExtractor {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl DocumentExtractor {
    /// Create an extractor
    pub fn new(pdf_timeout: Duration) -> Self {
        Self { pdf_timeout }
    }

    /// Extract text, failing with `NoExtractableText` when the result is blank
    pub fn extract(
        &self,
        data: &[u8],
        content_type: &ContentType,
        filename: &str,
    ) -> Result<ExtractedText> {
        let extracted = match content_type {
            ContentType::Pdf => self.extract_pdf(data, filename)?,
            ContentType::PlainText | ContentType::Markdown => ExtractedText {
                text: decode_utf8(data, filename)?,
                page_count: None,
            },
            ContentType::Other(essence) => {
                tracing::debug!("[{}] Best-effort decode for '{}'", filename, essence);
                ExtractedText {
                    text: decode_best_effort(data, filename)?,
                    page_count: None,
                }
            }
        };

        if extracted.text.trim().is_empty() {
            return Err(Error::no_text(filename));
        }

        Ok(extracted)
    }

    /// Extract the text layer of a PDF, page by page
    fn extract_pdf(&self, data: &[u8], filename: &str) -> Result<ExtractedText> {
        let page_count = lopdf::Document::load_mem(data)
            .ok()
            .map(|doc| doc.get_pages().len() as u32);

        let raw = match self.extract_pdf_with_timeout(data) {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => {
                tracing::debug!("[{}] pdf-extract returned no text, trying fallback", filename);
                extract_pdf_text_fallback(data, filename)?
            }
            Err(reason) => {
                tracing::warn!("[{}] pdf-extract failed: {}, trying fallback", filename, reason);
                extract_pdf_text_fallback(data, filename)?
            }
        };

        let text = normalize_pdf_text(&raw);
        if text.trim().is_empty() {
            return Err(Error::no_text(filename));
        }

        Ok(ExtractedText { text, page_count })
    }

    /// Run pdf-extract on its own thread so a pathological font table cannot
    /// hang or take down the caller
    fn extract_pdf_with_timeout(&self, data: &[u8]) -> std::result::Result<String, String> {
        use std::sync::mpsc;
        use std::thread;

        let data_vec = data.to_vec();
        let (tx, rx) = mpsc::channel();

        let spawned = thread::Builder::new()
            .name("pdf-extract".to_string())
            .spawn(move || {
                let result = pdf_extract::extract_text_from_mem(&data_vec);
                let _ = tx.send(result);
            });

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => return Err(format!("failed to spawn extraction thread: {}", e)),
        };

        match rx.recv_timeout(self.pdf_timeout) {
            Ok(Ok(text)) => {
                let _ = handle.join();
                Ok(text)
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e.to_string())
            }
            // The thread cannot be killed; it is left to finish on its own
            Err(mpsc::RecvTimeoutError::Timeout) => Err(format!(
                "timed out after {}ms",
                self.pdf_timeout.as_millis()
            )),
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err("extraction thread panicked".to_string())
            }
        }
    }
}

/// Fallback PDF text extraction using lopdf directly
fn extract_pdf_text_fallback(data: &[u8], filename: &str) -> Result<String> {
    let doc = lopdf::Document::load_mem(data)
        .map_err(|e| Error::extraction(filename, format!("Failed to load PDF: {}", e)))?;

    let mut all_text = String::new();
    for page_number in doc.get_pages().keys() {
        match doc.extract_text(&[*page_number]) {
            Ok(text) if !text.trim().is_empty() => {
                if !all_text.is_empty() {
                    all_text.push('\n');
                }
                all_text.push_str(&text);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!("[{}] Could not read text of page {}: {}", filename, page_number, e);
            }
        }
    }

    if all_text.trim().is_empty() {
        tracing::warn!("[{}] PDF has no text layer (image-only or encrypted)", filename);
        return Err(Error::no_text(filename));
    }

    Ok(all_text)
}

/// Clean up PDF output: strip NULs, fold ligatures and non-breaking spaces,
/// trim line ends and collapse runs of blank lines
fn normalize_pdf_text(text: &str) -> String {
    let folded = text
        .replace('\0', "")
        .replace('\u{00A0}', " ")
        .replace('\u{FB00}', "ff")
        .replace('\u{FB01}', "fi")
        .replace('\u{FB02}', "fl")
        .replace('\u{FB03}', "ffi")
        .replace('\u{FB04}', "ffl");

    let mut out = String::with_capacity(folded.len());
    let mut blank_run = 0usize;
    for line in folded.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }

    out.trim().to_string()
}

/// Strict UTF-8 decode for text formats
fn decode_utf8(data: &[u8], filename: &str) -> Result<String> {
    let data = data.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(data);
    String::from_utf8(data.to_vec())
        .map_err(|e| Error::extraction(filename, format!("content is not valid UTF-8: {}", e)))
}

/// Lossy UTF-8 decode that still refuses data that is clearly binary
fn decode_best_effort(data: &[u8], filename: &str) -> Result<String> {
    if let Ok(text) = decode_utf8(data, filename) {
        return Ok(text);
    }

    if data.contains(&0) {
        return Err(Error::extraction(filename, "content looks binary (NUL bytes)"));
    }

    let text = String::from_utf8_lossy(data).into_owned();
    let total = text.chars().count().max(1);
    let replaced = text.chars().filter(|c| *c == char::REPLACEMENT_CHARACTER).count();
    if replaced as f64 / total as f64 > MAX_REPLACEMENT_RATIO {
        return Err(Error::extraction(
            filename,
            format!("content could not be decoded as text ({} of {} characters invalid)", replaced, total),
        ));
    }

    tracing::warn!("[{}] Decoded with {} replacement characters", filename, replaced);
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{blank_pdf, text_pdf};

    fn extractor() -> DocumentExtractor {
        DocumentExtractor::new(Duration::from_secs(10))
    }

    #[test]
    fn test_plain_and_markdown() {
        let out = extractor()
            .extract(b"hello world", &ContentType::PlainText, "a.txt")
            .unwrap();
        assert_eq!(out.text, "hello world");
        assert_eq!(out.page_count, None);

        let md = "# Title\n\nSome *markdown*.";
        let out = extractor()
            .extract(md.as_bytes(), &ContentType::Markdown, "a.md")
            .unwrap();
        assert_eq!(out.text, md);
    }

    #[test]
    fn test_bom_is_stripped() {
        let out = extractor()
            .extract(b"\xEF\xBB\xBFhi", &ContentType::PlainText, "bom.txt")
            .unwrap();
        assert_eq!(out.text, "hi");
    }

    #[test]
    fn test_invalid_utf8_text_fails() {
        let err = extractor()
            .extract(&[0x66, 0x6f, 0xff, 0xfe], &ContentType::PlainText, "bad.txt")
            .unwrap_err();
        assert!(matches!(err, Error::Extraction { .. }));
    }

    #[test]
    fn test_whitespace_only_is_distinguishable() {
        let err = extractor()
            .extract(b" \n\t  \n", &ContentType::Markdown, "blank.md")
            .unwrap_err();
        assert!(matches!(err, Error::NoExtractableText { .. }));
    }

    #[test]
    fn test_best_effort_decode() {
        let other = ContentType::Other("application/json".to_string());
        let out = extractor().extract(br#"{"a": 1}"#, &other, "a.json").unwrap();
        assert_eq!(out.text, r#"{"a": 1}"#);

        // One stray byte in otherwise readable text is tolerated
        let mut mostly_text = b"caf".to_vec();
        mostly_text.push(0xE9);
        mostly_text.extend_from_slice(b" au lait and a long enough sentence");
        let out = extractor().extract(&mostly_text, &other, "latin1.csv").unwrap();
        assert!(out.text.contains("au lait"));

        let binary = [0x89, 0x50, 0x4e, 0x47, 0x00, 0x00, 0xff, 0xd8];
        assert!(extractor().extract(&binary, &other, "image.png").is_err());
    }

    #[test]
    fn test_pdf_text_layer() {
        let pdf = text_pdf(&["Hello World"]);
        let out = extractor().extract(&pdf, &ContentType::Pdf, "hello.pdf").unwrap();
        assert!(out.text.contains("Hello"), "got {:?}", out.text);
        assert_eq!(out.page_count, Some(1));
    }

    #[test]
    fn test_pdf_without_text_layer_fails() {
        let err = extractor()
            .extract(&blank_pdf(), &ContentType::Pdf, "scan.pdf")
            .unwrap_err();
        assert!(matches!(err, Error::NoExtractableText { .. }), "got {:?}", err);
    }

    #[test]
    fn test_garbage_pdf_fails() {
        let err = extractor()
            .extract(b"definitely not a pdf", &ContentType::Pdf, "junk.pdf")
            .unwrap_err();
        assert!(err.is_extraction(), "got {:?}", err);
    }

    #[test]
    fn test_normalize_pdf_text() {
        let raw = "\u{FB01}rst\0 line   \n\n\n\nsecond\u{00A0}line\n";
        assert_eq!(normalize_pdf_text(raw), "first line\n\nsecond line");
    }
}
