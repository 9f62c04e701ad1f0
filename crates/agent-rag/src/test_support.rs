//! Shared test fixtures: generated PDFs and scripted store connectors

use async_trait::async_trait;
use dashmap::DashMap;
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document as PdfDocument, Object, ObjectId, Stream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::config::StoreConnection;
use crate::error::{Error, Result};
use crate::storage::{InMemoryStore, MemoryRecord, MemoryStore, MemoryTable, StoreConnector};
use crate::types::{Document, Fragment};

/// A PDF with one page per entry, each showing its text in Courier
pub(crate) fn text_pdf(pages: &[&str]) -> Vec<u8> {
    build_pdf(pages.iter().map(|text| {
        vec![
            Operation::new("BT", vec![]),
            Operation::new("Tf", vec!["F1".into(), 24.into()]),
            Operation::new("Td", vec![72.into(), 720.into()]),
            Operation::new("Tj", vec![Object::string_literal(*text)]),
            Operation::new("ET", vec![]),
        ]
    }))
}

/// A one-page PDF without any text layer
pub(crate) fn blank_pdf() -> Vec<u8> {
    build_pdf(std::iter::once(vec![
        Operation::new("re", vec![72.into(), 72.into(), 100.into(), 100.into()]),
        Operation::new("f", vec![]),
    ]))
}

fn build_pdf(pages: impl Iterator<Item = Vec<Operation>>) -> Vec<u8> {
    let mut doc = PdfDocument::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Courier",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    });

    let kids: Vec<ObjectId> = pages
        .map(|operations| {
            let content = Content { operations };
            let content_id = doc.add_object(Stream::new(
                dictionary! {},
                content.encode().expect("encode page content"),
            ));
            doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
                "Resources" => resources_id,
            })
        })
        .collect();

    let pages = dictionary! {
        "Type" => "Pages",
        "Count" => kids.len() as i64,
        "Kids" => kids.into_iter().map(Object::from).collect::<Vec<_>>(),
        "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
    };
    doc.objects.insert(pages_id, Object::Dictionary(pages));

    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut out = Vec::new();
    doc.save_to(&mut out).expect("serialize pdf");
    out
}

/// Connector with scripted failures and per-agent gating
pub(crate) struct TestConnector {
    store: Arc<dyn MemoryStore>,
    failures: AtomicUsize,
    gate: Option<(Uuid, Arc<Notify>)>,
    connects: DashMap<Uuid, usize>,
}

impl TestConnector {
    pub fn new(store: Arc<dyn MemoryStore>) -> Self {
        Self {
            store,
            failures: AtomicUsize::new(0),
            gate: None,
            connects: DashMap::new(),
        }
    }

    /// Fail the next `n` connection attempts
    pub fn failing(self, n: usize) -> Self {
        self.failures.store(n, Ordering::SeqCst);
        self
    }

    /// Hold `agent_id`'s connection until the gate is notified
    pub fn gated(mut self, agent_id: Uuid, gate: Arc<Notify>) -> Self {
        self.gate = Some((agent_id, gate));
        self
    }

    /// How many times `agent_id` connected
    pub fn connects(&self, agent_id: Uuid) -> usize {
        self.connects.get(&agent_id).map(|c| *c).unwrap_or(0)
    }
}

#[async_trait]
impl StoreConnector for TestConnector {
    async fn connect(
        &self,
        agent_id: Uuid,
        _connection: &StoreConnection,
    ) -> Result<Arc<dyn MemoryStore>> {
        *self.connects.entry(agent_id).or_insert(0) += 1;

        if let Some((gated, gate)) = &self.gate {
            if *gated == agent_id {
                gate.notified().await;
            }
        }

        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(Error::store_write("connection refused"));
        }

        Ok(self.store.clone())
    }
}

/// Store whose writes crash the calling task
pub(crate) struct PanickingStore;

#[async_trait]
impl MemoryStore for PanickingStore {
    async fn create_memory(&self, _record: &MemoryRecord, _table: MemoryTable) -> Result<Uuid> {
        panic!("memory store crashed mid-write");
    }

    async fn get_document(&self, _store_id: Uuid) -> Result<Option<Document>> {
        Ok(None)
    }

    async fn documents_by_correlation(&self, _agent_id: Uuid, _correlation_id: Uuid) -> Result<Vec<Document>> {
        Ok(Vec::new())
    }

    async fn fragments_for_document(&self, _agent_id: Uuid, _correlation_id: Uuid) -> Result<Vec<Fragment>> {
        Ok(Vec::new())
    }

    fn name(&self) -> &str {
        "panicking"
    }
}

/// Store whose writes never complete
pub(crate) struct HangingStore;

#[async_trait]
impl MemoryStore for HangingStore {
    async fn create_memory(&self, _record: &MemoryRecord, _table: MemoryTable) -> Result<Uuid> {
        std::future::pending::<Result<Uuid>>().await
    }

    async fn get_document(&self, _store_id: Uuid) -> Result<Option<Document>> {
        Ok(None)
    }

    async fn documents_by_correlation(&self, _agent_id: Uuid, _correlation_id: Uuid) -> Result<Vec<Document>> {
        Ok(Vec::new())
    }

    async fn fragments_for_document(&self, _agent_id: Uuid, _correlation_id: Uuid) -> Result<Vec<Fragment>> {
        Ok(Vec::new())
    }

    fn name(&self) -> &str {
        "hanging"
    }
}

/// Store that accepts documents but rejects fragment writes after the first
/// `allowed` of them
pub(crate) struct FragmentRejectingStore {
    inner: InMemoryStore,
    allowed: usize,
    attempts: AtomicUsize,
}

impl FragmentRejectingStore {
    pub fn new(allowed: usize) -> Self {
        Self {
            inner: InMemoryStore::new(),
            allowed,
            attempts: AtomicUsize::new(0),
        }
    }

    /// Fragment writes attempted so far, rejected ones included
    pub fn fragment_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn fragment_count(&self) -> usize {
        self.inner.fragment_count()
    }
}

#[async_trait]
impl MemoryStore for FragmentRejectingStore {
    async fn create_memory(&self, record: &MemoryRecord, table: MemoryTable) -> Result<Uuid> {
        if table == MemoryTable::Fragments
            && self.attempts.fetch_add(1, Ordering::SeqCst) >= self.allowed
        {
            return Err(Error::store_write("fragments table is read-only"));
        }
        self.inner.create_memory(record, table).await
    }

    async fn get_document(&self, store_id: Uuid) -> Result<Option<Document>> {
        self.inner.get_document(store_id).await
    }

    async fn documents_by_correlation(&self, agent_id: Uuid, correlation_id: Uuid) -> Result<Vec<Document>> {
        self.inner.documents_by_correlation(agent_id, correlation_id).await
    }

    async fn fragments_for_document(&self, agent_id: Uuid, correlation_id: Uuid) -> Result<Vec<Fragment>> {
        self.inner.fragments_for_document(agent_id, correlation_id).await
    }

    fn name(&self) -> &str {
        "fragment-rejecting"
    }
}
