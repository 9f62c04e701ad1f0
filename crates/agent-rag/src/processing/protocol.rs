//! Message protocol between the service and its workers
//!
//! Every message crosses the channel as a serialized [`Envelope`]
//! `{ "type": KIND, "payload": {...} }`. Payload fields are camelCase.
//! Kinds a side does not recognize are surfaced as `None` so the receiver
//! can log and ignore them.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Wire form of every message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message kind
    #[serde(rename = "type")]
    pub kind: String,
    /// Kind-specific payload
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// A typed message that travels inside an [`Envelope`]
pub trait Message: Serialize + DeserializeOwned {
    /// Canonical kinds this message type understands
    const KINDS: &'static [&'static str];

    /// Map a received kind (including legacy aliases) to its canonical form
    fn canonical_kind(kind: &str) -> Option<&'static str> {
        Self::KINDS.iter().copied().find(|k| *k == kind)
    }
}

impl Envelope {
    /// Serialize a typed message
    pub fn encode<M: Message>(message: &M) -> Result<Self> {
        Ok(serde_json::from_value(serde_json::to_value(message)?)?)
    }

    /// Decode into a typed message. Unknown kinds yield `Ok(None)`; a known
    /// kind with a malformed payload is a protocol error.
    pub fn decode<M: Message>(&self) -> Result<Option<M>> {
        let Some(kind) = M::canonical_kind(&self.kind) else {
            return Ok(None);
        };

        let payload = match &self.payload {
            serde_json::Value::Null => serde_json::json!({}),
            other => other.clone(),
        };

        serde_json::from_value(serde_json::json!({ "type": kind, "payload": payload }))
            .map(Some)
            .map_err(|e| Error::Protocol(format!("malformed {} message: {}", self.kind, e)))
    }

    /// Serialize to JSON text
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse from JSON text
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| Error::Protocol(format!("invalid envelope: {}", e)))
    }
}

/// Service → worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum WorkerRequest {
    /// Open the worker's private store connection
    InitStoreAdapter {},
    /// Fragment an already stored document and write its fragments
    ProcessDocument {
        document_id: Uuid,
        file_content_base64: String,
        content_type: String,
        original_filename: String,
        tenant_id: Uuid,
    },
    /// Extract, store and fragment a PDF
    ProcessPdfThenFragments {
        client_document_id: Uuid,
        file_content_base64: String,
        content_type: String,
        original_filename: String,
        tenant_id: Uuid,
    },
}

impl Message for WorkerRequest {
    const KINDS: &'static [&'static str] = &[
        "INIT_STORE_ADAPTER",
        "PROCESS_DOCUMENT",
        "PROCESS_PDF_THEN_FRAGMENTS",
    ];
}

impl WorkerRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InitStoreAdapter {} => "INIT_STORE_ADAPTER",
            Self::ProcessDocument { .. } => "PROCESS_DOCUMENT",
            Self::ProcessPdfThenFragments { .. } => "PROCESS_PDF_THEN_FRAGMENTS",
        }
    }
}

/// Worker → service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum WorkerEvent {
    /// Store adapter connected
    Ready { agent_id: Uuid },
    /// Store adapter could not be connected
    InitError { agent_id: Uuid, error: String },
    /// Outcome of the main-document write for a PDF
    MainDocumentStored {
        client_document_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stored_document_id: Option<Uuid>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_kind: Option<String>,
    },
    /// Fragments written for a document
    #[serde(rename = "KNOWLEDGE_ADDED")]
    FragmentsAdded { document_id: Uuid, count: usize },
    /// Fragmentation or fragment writes failed
    ProcessingError {
        document_id: Uuid,
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stack: Option<String>,
    },
}

impl Message for WorkerEvent {
    const KINDS: &'static [&'static str] = &[
        "READY",
        "INIT_ERROR",
        "MAIN_DOCUMENT_STORED",
        "KNOWLEDGE_ADDED",
        "PROCESSING_ERROR",
    ];

    fn canonical_kind(kind: &str) -> Option<&'static str> {
        match kind {
            "FRAGMENTS_ADDED" => Some("KNOWLEDGE_ADDED"),
            other => Self::KINDS.iter().copied().find(|k| *k == other),
        }
    }
}

impl WorkerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ready { .. } => "READY",
            Self::InitError { .. } => "INIT_ERROR",
            Self::MainDocumentStored { .. } => "MAIN_DOCUMENT_STORED",
            Self::FragmentsAdded { .. } => "KNOWLEDGE_ADDED",
            Self::ProcessingError { .. } => "PROCESSING_ERROR",
        }
    }

    /// Successful main-document write
    pub fn stored(client_document_id: Uuid, stored_document_id: Uuid) -> Self {
        Self::MainDocumentStored {
            client_document_id,
            stored_document_id: Some(stored_document_id),
            error: None,
            error_kind: None,
        }
    }

    /// Failed main-document write or extraction
    pub fn store_failed(client_document_id: Uuid, error: &Error) -> Self {
        Self::MainDocumentStored {
            client_document_id,
            stored_document_id: None,
            error: Some(error.to_string()),
            error_kind: Some(error.origin_kind().to_string()),
        }
    }
}
