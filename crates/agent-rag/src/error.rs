//! Error types for knowledge ingestion

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for ingestion operations
pub type Result<T> = std::result::Result<T, Error>;

/// Knowledge ingestion errors
#[derive(Debug, Error)]
pub enum Error {
    /// Request rejected before anything was dispatched
    #[error("Invalid request: {0}")]
    Validation(String),

    /// Text extraction failed
    #[error("Failed to extract text from '{filename}': {message}")]
    Extraction { filename: String, message: String },

    /// Extraction succeeded but produced nothing usable
    #[error("No extractable text in '{filename}'")]
    NoExtractableText { filename: String },

    /// Content type the extractor cannot handle
    #[error("Unsupported content type: {0}")]
    UnsupportedContentType(String),

    /// Memory store write failed
    #[error("Memory store write failed: {0}")]
    StoreWrite(String),

    /// Worker could not connect its store adapter
    #[error("Worker for agent {agent_id} failed to initialize: {message}")]
    WorkerInit { agent_id: Uuid, message: String },

    /// Worker crashed, exited or was stopped while work was outstanding
    #[error("Worker for agent {agent_id} unavailable: {reason}")]
    WorkerUnavailable { agent_id: Uuid, reason: String },

    /// Dispatched request did not complete before its deadline
    #[error("Request {correlation_id} timed out after {after_ms}ms")]
    Timeout { correlation_id: Uuid, after_ms: u64 },

    /// Failure reported by a worker, carrying the originating error's kind label
    #[error("{message}")]
    Reported { kind: String, message: String },

    /// Malformed or unrecognized protocol message
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Base64 payload could not be decoded
    #[error("Invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

const EXTRACTION_KINDS: &[&str] = &[
    "extraction",
    "no_extractable_text",
    "unsupported_content_type",
    "base64",
];

impl Error {
    /// Create an extraction error
    pub fn extraction(filename: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Extraction {
            filename: filename.into(),
            message: message.into(),
        }
    }

    /// Create a "no extractable text" error
    pub fn no_text(filename: impl Into<String>) -> Self {
        Self::NoExtractableText {
            filename: filename.into(),
        }
    }

    /// Create a store write error
    pub fn store_write(message: impl Into<String>) -> Self {
        Self::StoreWrite(message.into())
    }

    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a worker-unavailable error
    pub fn worker_unavailable(agent_id: Uuid, reason: impl Into<String>) -> Self {
        Self::WorkerUnavailable {
            agent_id,
            reason: reason.into(),
        }
    }

    /// Rebuild an error from a worker's result message
    pub fn reported(kind: Option<&str>, message: impl Into<String>) -> Self {
        Self::Reported {
            kind: kind.unwrap_or("internal").to_string(),
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Stable label for logs and protocol payloads
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::Extraction { .. } => "extraction",
            Error::NoExtractableText { .. } => "no_extractable_text",
            Error::UnsupportedContentType(_) => "unsupported_content_type",
            Error::StoreWrite(_) => "store_write",
            Error::WorkerInit { .. } => "worker_init",
            Error::WorkerUnavailable { .. } => "worker_unavailable",
            Error::Timeout { .. } => "timeout",
            Error::Reported { .. } => "reported",
            Error::Protocol(_) => "protocol",
            Error::Config(_) => "config",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Base64(_) => "base64",
            Error::Internal(_) => "internal",
        }
    }

    /// Whether the error belongs to the extraction class (no text layer,
    /// undecodable bytes, empty result)
    pub fn is_extraction(&self) -> bool {
        match self {
            Error::Extraction { .. }
            | Error::NoExtractableText { .. }
            | Error::UnsupportedContentType(_)
            | Error::Base64(_) => true,
            Error::Reported { kind, .. } => EXTRACTION_KINDS.contains(&kind.as_str()),
            _ => false,
        }
    }

    /// Kind label to send alongside a reported failure
    pub fn origin_kind(&self) -> &str {
        match self {
            Error::Reported { kind, .. } => kind,
            other => other.kind(),
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::StoreWrite(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_labels() {
        assert_eq!(Error::validation("empty").kind(), "validation");
        assert_eq!(Error::no_text("a.pdf").kind(), "no_extractable_text");
        assert_eq!(
            Error::Timeout { correlation_id: Uuid::nil(), after_ms: 10 }.kind(),
            "timeout"
        );
    }

    #[test]
    fn test_extraction_class() {
        assert!(Error::extraction("a.pdf", "broken xref").is_extraction());
        assert!(Error::no_text("a.txt").is_extraction());
        assert!(!Error::store_write("disk full").is_extraction());
    }

    #[test]
    fn test_reported_keeps_origin_class() {
        let original = Error::no_text("scan.pdf");
        let reported = Error::reported(Some(original.origin_kind()), original.to_string());
        assert!(reported.is_extraction());
        assert_eq!(reported.origin_kind(), "no_extractable_text");
        assert_eq!(reported.to_string(), "No extractable text in 'scan.pdf'");

        assert!(!Error::reported(None, "boom").is_extraction());
    }

    #[test]
    fn test_display_includes_filename() {
        let err = Error::no_text("scan.pdf");
        assert_eq!(err.to_string(), "No extractable text in 'scan.pdf'");
    }
}
