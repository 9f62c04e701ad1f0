//! Memory store adapter traits
//!
//! A memory store durably holds "document" and "fragment" records keyed by
//! agent. Each worker opens its own store through a [`StoreConnector`] so no
//! connection is ever shared across workers.

use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::StoreConnection;
use crate::error::Result;
use crate::types::{Document, Fragment};

/// Target table of a write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryTable {
    Documents,
    Fragments,
}

impl MemoryTable {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Documents => "documents",
            Self::Fragments => "fragments",
        }
    }
}

impl std::fmt::Display for MemoryTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record written through [`MemoryStore::create_memory`]
#[derive(Debug, Clone)]
pub enum MemoryRecord {
    Document(Document),
    Fragment(Fragment),
}

impl MemoryRecord {
    /// The table this record belongs in
    pub fn table(&self) -> MemoryTable {
        match self {
            Self::Document(_) => MemoryTable::Documents,
            Self::Fragment(_) => MemoryTable::Fragments,
        }
    }
}

/// Durable storage for documents and fragments
///
/// Implementations:
/// - `SqliteMemoryStore`: embedded or file-backed SQLite
/// - `InMemoryStore`: process-local, for embedding and tests
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Persist a record into `table` and return its store-assigned ID.
    /// Writing a record into the wrong table is a store-write error.
    async fn create_memory(&self, record: &MemoryRecord, table: MemoryTable) -> Result<Uuid>;

    /// Fetch a document by its store-assigned ID
    async fn get_document(&self, store_id: Uuid) -> Result<Option<Document>>;

    /// All documents an agent stored under a correlation ID, oldest first
    async fn documents_by_correlation(
        &self,
        agent_id: Uuid,
        correlation_id: Uuid,
    ) -> Result<Vec<Document>>;

    /// Fragments referencing a correlation ID, ordered by position
    async fn fragments_for_document(
        &self,
        agent_id: Uuid,
        correlation_id: Uuid,
    ) -> Result<Vec<Fragment>>;

    /// Get provider name for logging
    fn name(&self) -> &str;
}

/// Opens a private store connection for one agent's worker
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(
        &self,
        agent_id: Uuid,
        connection: &StoreConnection,
    ) -> Result<Arc<dyn MemoryStore>>;
}
