//! Document and fragment types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Declared content type of an uploaded artifact
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    /// PDF document (text layer required)
    Pdf,
    /// Plain text file
    PlainText,
    /// Markdown file
    Markdown,
    /// Anything else; decoded best-effort as UTF-8
    Other(String),
}

impl ContentType {
    pub const PDF_MIME: &'static str = "application/pdf";
    pub const TEXT_MIME: &'static str = "text/plain";
    pub const MARKDOWN_MIME: &'static str = "text/markdown";

    /// Parse a declared MIME type. Parameters such as `; charset=utf-8` are ignored.
    pub fn from_mime(mime: &str) -> Self {
        let essence = mime
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();

        match essence.as_str() {
            "application/pdf" | "application/x-pdf" => Self::Pdf,
            "text/plain" => Self::PlainText,
            "text/markdown" | "text/x-markdown" => Self::Markdown,
            _ => Self::Other(essence),
        }
    }

    /// Resolve the declared type, guessing from the filename when the
    /// declaration carries no information
    pub fn resolve(declared: &str, filename: &str) -> Self {
        let parsed = Self::from_mime(declared);
        match &parsed {
            Self::Other(essence) if essence.is_empty() || essence == "application/octet-stream" => {
                mime_guess::from_path(filename)
                    .first()
                    .map(|guess| Self::from_mime(guess.essence_str()))
                    .unwrap_or(parsed)
            }
            _ => parsed,
        }
    }

    /// MIME string recorded on the stored document
    pub fn as_mime(&self) -> &str {
        match self {
            Self::Pdf => Self::PDF_MIME,
            Self::PlainText => Self::TEXT_MIME,
            Self::Markdown => Self::MARKDOWN_MIME,
            Self::Other(essence) => essence.as_str(),
        }
    }

    pub fn is_pdf(&self) -> bool {
        matches!(self, Self::Pdf)
    }
}

/// Which component created a stored document
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Written by the service on the caller's path (non-PDF)
    MainUpload,
    /// Written by the agent's worker after PDF extraction
    PdfWorker,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MainUpload => "main_upload",
            Self::PdfWorker => "pdf_worker",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "pdf_worker" => Self::PdfWorker,
            _ => Self::MainUpload,
        }
    }
}

/// A document that has been ingested
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Caller-assigned correlation ID
    pub correlation_id: Uuid,
    /// Store-assigned ID, present only once persisted
    pub store_id: Option<Uuid>,
    /// Owning agent
    pub agent_id: Uuid,
    /// Owning tenant / world
    pub tenant_id: Uuid,
    /// Original filename as uploaded
    pub filename: String,
    /// Declared content type (MIME)
    pub content_type: String,
    /// Extracted full text
    pub text: String,
    /// Size of the uploaded bytes
    pub byte_size: u64,
    /// SHA-256 of the extracted text
    pub content_hash: String,
    /// Page count for paginated formats
    pub page_count: Option<u32>,
    /// Who created it
    pub provenance: Provenance,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl Document {
    /// Create an unpersisted document from extracted text
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        correlation_id: Uuid,
        agent_id: Uuid,
        tenant_id: Uuid,
        filename: String,
        content_type: &ContentType,
        text: String,
        byte_size: u64,
        provenance: Provenance,
    ) -> Self {
        Self {
            correlation_id,
            store_id: None,
            agent_id,
            tenant_id,
            filename,
            content_type: content_type.as_mime().to_string(),
            content_hash: hash_content(&text),
            text,
            byte_size,
            page_count: None,
            provenance,
            created_at: Utc::now(),
        }
    }

    /// Return the persisted form carrying the store-assigned ID
    pub fn persisted(mut self, store_id: Uuid) -> Self {
        self.store_id = Some(store_id);
        self
    }
}

/// One retrievable chunk of a document's text
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Fragment {
    /// Parent document's correlation ID (never its store ID)
    pub document_id: Uuid,
    /// Zero-based position within the document
    pub position: u32,
    /// Text content
    pub text: String,
    /// Character offset of the first character in the parent text
    pub char_start: usize,
    /// Character offset one past the last character
    pub char_end: usize,
    /// Owning agent
    pub agent_id: Uuid,
    /// Owning tenant / world
    pub tenant_id: Uuid,
}

/// Hash content for deduplication and integrity checks
pub fn hash_content(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_mime() {
        assert_eq!(ContentType::from_mime("application/pdf"), ContentType::Pdf);
        assert_eq!(
            ContentType::from_mime("text/plain; charset=utf-8"),
            ContentType::PlainText
        );
        assert_eq!(ContentType::from_mime("TEXT/X-MARKDOWN"), ContentType::Markdown);
        assert_eq!(
            ContentType::from_mime("application/json"),
            ContentType::Other("application/json".to_string())
        );
    }

    #[test]
    fn test_resolve_guesses_from_filename() {
        assert_eq!(
            ContentType::resolve("application/octet-stream", "report.pdf"),
            ContentType::Pdf
        );
        assert_eq!(ContentType::resolve("", "notes.md"), ContentType::Markdown);
        // A real declaration is never second-guessed
        assert_eq!(ContentType::resolve("text/plain", "report.pdf"), ContentType::PlainText);
    }

    #[test]
    fn test_document_is_unpersisted_until_stored() {
        let doc = Document::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            "a.txt".to_string(),
            &ContentType::PlainText,
            "hello".to_string(),
            5,
            Provenance::MainUpload,
        );
        assert!(doc.store_id.is_none());
        assert_eq!(doc.content_type, "text/plain");
        assert_eq!(doc.content_hash.len(), 64);

        let store_id = Uuid::new_v4();
        assert_eq!(doc.persisted(store_id).store_id, Some(store_id));
    }
}
