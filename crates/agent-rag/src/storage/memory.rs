//! Process-local memory store

use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::StoreConnection;
use crate::error::{Error, Result};
use crate::types::{Document, Fragment};

use super::memory_store::{MemoryRecord, MemoryStore, MemoryTable, StoreConnector};

/// Memory store kept entirely in process memory
#[derive(Debug, Default)]
pub struct InMemoryStore {
    documents: RwLock<Vec<Document>>,
    fragments: RwLock<Vec<Fragment>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored documents
    pub fn document_count(&self) -> usize {
        self.documents.read().len()
    }

    /// Number of stored fragments
    pub fn fragment_count(&self) -> usize {
        self.fragments.read().len()
    }

    /// Snapshot of every stored document
    pub fn documents(&self) -> Vec<Document> {
        self.documents.read().clone()
    }
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn create_memory(&self, record: &MemoryRecord, table: MemoryTable) -> Result<Uuid> {
        let id = Uuid::new_v4();
        match (record, table) {
            (MemoryRecord::Document(doc), MemoryTable::Documents) => {
                self.documents.write().push(doc.clone().persisted(id));
            }
            (MemoryRecord::Fragment(fragment), MemoryTable::Fragments) => {
                self.fragments.write().push(fragment.clone());
            }
            (record, table) => {
                return Err(Error::store_write(format!(
                    "cannot write a {} record into '{}'",
                    record.table(),
                    table
                )));
            }
        }
        Ok(id)
    }

    async fn get_document(&self, store_id: Uuid) -> Result<Option<Document>> {
        Ok(self
            .documents
            .read()
            .iter()
            .find(|d| d.store_id == Some(store_id))
            .cloned())
    }

    async fn documents_by_correlation(
        &self,
        agent_id: Uuid,
        correlation_id: Uuid,
    ) -> Result<Vec<Document>> {
        Ok(self
            .documents
            .read()
            .iter()
            .filter(|d| d.agent_id == agent_id && d.correlation_id == correlation_id)
            .cloned()
            .collect())
    }

    async fn fragments_for_document(
        &self,
        agent_id: Uuid,
        correlation_id: Uuid,
    ) -> Result<Vec<Fragment>> {
        let mut fragments: Vec<Fragment> = self
            .fragments
            .read()
            .iter()
            .filter(|f| f.agent_id == agent_id && f.document_id == correlation_id)
            .cloned()
            .collect();
        fragments.sort_by_key(|f| f.position);
        Ok(fragments)
    }

    fn name(&self) -> &str {
        "in-memory"
    }
}

/// Hands the same store to every worker, ignoring the connection descriptor
#[derive(Clone)]
pub struct SharedStoreConnector {
    store: Arc<dyn MemoryStore>,
}

impl SharedStoreConnector {
    pub fn new(store: Arc<dyn MemoryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl StoreConnector for SharedStoreConnector {
    async fn connect(
        &self,
        agent_id: Uuid,
        _connection: &StoreConnection,
    ) -> Result<Arc<dyn MemoryStore>> {
        tracing::debug!("[{}] Using shared {} store", agent_id, self.store.name());
        Ok(self.store.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ContentType, Provenance};

    #[tokio::test]
    async fn test_store_assigns_ids() {
        let store = InMemoryStore::new();
        let agent = Uuid::new_v4();
        let correlation = Uuid::new_v4();
        let doc = Document::new(
            correlation,
            agent,
            Uuid::new_v4(),
            "a.txt".to_string(),
            &ContentType::PlainText,
            "hello".to_string(),
            5,
            Provenance::MainUpload,
        );

        let id = store
            .create_memory(&MemoryRecord::Document(doc), MemoryTable::Documents)
            .await
            .unwrap();
        let loaded = store.get_document(id).await.unwrap().unwrap();
        assert_eq!(loaded.correlation_id, correlation);
        assert_eq!(
            store.documents_by_correlation(agent, correlation).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_table_mismatch_is_store_error() {
        let store = InMemoryStore::new();
        let fragment = Fragment {
            document_id: Uuid::new_v4(),
            position: 0,
            text: "x".to_string(),
            char_start: 0,
            char_end: 1,
            agent_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
        };
        let err = store
            .create_memory(&MemoryRecord::Fragment(fragment), MemoryTable::Documents)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StoreWrite(_)));
        assert_eq!(store.fragment_count(), 0);
    }

    #[tokio::test]
    async fn test_shared_connector_returns_same_store() {
        let store: Arc<dyn MemoryStore> = Arc::new(InMemoryStore::new());
        let connector = SharedStoreConnector::new(store.clone());
        let connection = StoreConnection::Remote { url: "unused".to_string() };

        let a = connector.connect(Uuid::new_v4(), &connection).await.unwrap();
        let b = connector.connect(Uuid::new_v4(), &connection).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
