//! agent-rag: per-agent knowledge ingestion
//!
//! Accepts uploaded documents (plain text, markdown, PDF) on behalf of an
//! agent, extracts their text, splits it into retrievable fragments and
//! persists both the document and its fragments into a memory store. Heavy
//! work runs on one isolated worker per agent, so a slow or crashing upload
//! never blocks the caller or another agent.

pub mod config;
pub mod error;
pub mod ingestion;
pub mod processing;
pub mod storage;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::{KnowledgeConfig, StoreConfig, StoreConnection};
pub use error::{Error, Result};
pub use processing::{Acceptance, AddKnowledgeRequest, CompletionHandler, RagService};
pub use storage::{InMemoryStore, MemoryStore, SqliteConnector, StoreConnector};
pub use types::{ContentType, Document, Fragment};
