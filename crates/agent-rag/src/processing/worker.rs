//! Per-agent execution unit
//!
//! A worker is a tokio task that owns a private memory store connection and
//! is driven entirely by envelopes arriving on its request channel. Requests
//! are handled strictly one after another in arrival order. Extraction and
//! write failures come back as result messages; only a crash of the task
//! itself ends the event stream unexpectedly.

use base64::Engine as _;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::StoreConnection;
use crate::error::{Error, Result};
use crate::ingestion::{DocumentExtractor, ExtractedText, Fragmenter};
use crate::storage::{MemoryRecord, MemoryStore, MemoryTable, StoreConnector};
use crate::types::{ContentType, Document, Provenance};

use super::protocol::{Envelope, WorkerEvent, WorkerRequest};

/// Everything a worker needs, handed over at spawn
pub(crate) struct WorkerContext {
    pub agent_id: Uuid,
    pub connection: StoreConnection,
    pub connector: Arc<dyn StoreConnector>,
    pub extractor: DocumentExtractor,
    pub fragmenter: Fragmenter,
}

/// A file carried by a processing request
struct Upload {
    correlation_id: Uuid,
    file_content_base64: String,
    content_type: String,
    filename: String,
    tenant_id: Uuid,
}

struct Worker {
    ctx: WorkerContext,
    store: Option<Arc<dyn MemoryStore>>,
    events: mpsc::UnboundedSender<Envelope>,
}

/// Run a worker until its request channel closes or store initialization fails
pub(crate) async fn run_worker(
    ctx: WorkerContext,
    mut requests: mpsc::Receiver<Envelope>,
    events: mpsc::UnboundedSender<Envelope>,
) {
    let agent_id = ctx.agent_id;
    let mut worker = Worker {
        ctx,
        store: None,
        events,
    };

    tracing::debug!("[{}] Worker started", agent_id);

    while let Some(envelope) = requests.recv().await {
        let request = match envelope.decode::<WorkerRequest>() {
            Ok(Some(request)) => request,
            Ok(None) => {
                tracing::warn!("[{}] Ignoring unknown request kind '{}'", agent_id, envelope.kind);
                continue;
            }
            Err(e) => {
                tracing::warn!("[{}] Dropping request: {}", agent_id, e);
                continue;
            }
        };

        tracing::debug!("[{}] Handling {}", agent_id, request.kind());

        match request {
            WorkerRequest::InitStoreAdapter {} => {
                if !worker.init_store().await {
                    break;
                }
            }
            WorkerRequest::ProcessPdfThenFragments {
                client_document_id,
                file_content_base64,
                content_type,
                original_filename,
                tenant_id,
            } => {
                worker
                    .process_pdf(Upload {
                        correlation_id: client_document_id,
                        file_content_base64,
                        content_type,
                        filename: original_filename,
                        tenant_id,
                    })
                    .await;
            }
            WorkerRequest::ProcessDocument {
                document_id,
                file_content_base64,
                content_type,
                original_filename,
                tenant_id,
            } => {
                worker
                    .process_document(Upload {
                        correlation_id: document_id,
                        file_content_base64,
                        content_type,
                        filename: original_filename,
                        tenant_id,
                    })
                    .await;
            }
        }
    }

    tracing::debug!("[{}] Worker exiting", agent_id);
}

impl Worker {
    fn agent_id(&self) -> Uuid {
        self.ctx.agent_id
    }

    fn emit(&self, event: WorkerEvent) {
        let kind = event.kind();
        match Envelope::encode(&event) {
            Ok(envelope) => {
                if self.events.send(envelope).is_err() {
                    tracing::debug!("[{}] No listener for {}", self.agent_id(), kind);
                }
            }
            Err(e) => tracing::error!("[{}] Failed to encode {}: {}", self.agent_id(), kind, e),
        }
    }

    /// Connect the private store. Returns false when the worker must exit.
    async fn init_store(&mut self) -> bool {
        let agent_id = self.agent_id();
        if self.store.is_some() {
            tracing::debug!("[{}] Store adapter already initialized", agent_id);
            self.emit(WorkerEvent::Ready { agent_id });
            return true;
        }

        match self.ctx.connector.connect(agent_id, &self.ctx.connection).await {
            Ok(store) => {
                tracing::info!("[{}] Store adapter ready ({})", agent_id, store.name());
                self.store = Some(store);
                self.emit(WorkerEvent::Ready { agent_id });
                true
            }
            Err(e) => {
                tracing::error!("[{}] Store adapter failed to initialize: {}", agent_id, e);
                self.emit(WorkerEvent::InitError {
                    agent_id,
                    error: e.to_string(),
                });
                false
            }
        }
    }

    fn store(&self) -> Result<Arc<dyn MemoryStore>> {
        self.store.clone().ok_or_else(|| {
            Error::worker_unavailable(self.agent_id(), "store adapter not initialized")
        })
    }

    /// Extract, store the main document, then fragment. Always emits exactly
    /// one MAIN_DOCUMENT_STORED.
    async fn process_pdf(&self, upload: Upload) {
        let correlation_id = upload.correlation_id;
        tracing::info!("[{}] Processing PDF '{}'", correlation_id, upload.filename);

        let (store, text) = match self.store_main_document(&upload).await {
            Ok((store, store_id, text)) => {
                tracing::info!("[{}] Main document stored as {}", correlation_id, store_id);
                self.emit(WorkerEvent::stored(correlation_id, store_id));
                (store, text)
            }
            Err(e) => {
                tracing::warn!("[{}] PDF '{}' not stored: {}", correlation_id, upload.filename, e);
                self.emit(WorkerEvent::store_failed(correlation_id, &e));
                return;
            }
        };

        self.report_fragments(
            correlation_id,
            self.write_fragments(&store, &text, correlation_id, upload.tenant_id).await,
        );
    }

    /// Re-extract an already stored document and write its fragments.
    /// Writes are not transactional: fragments stored before a failed write
    /// stay stored, and the PROCESSING_ERROR says how many there were.
    async fn process_document(&self, upload: Upload) {
        let correlation_id = upload.correlation_id;
        tracing::info!("[{}] Fragmenting '{}'", correlation_id, upload.filename);

        let outcome = self.fragment_document(&upload).await;
        self.report_fragments(correlation_id, outcome);
    }

    async fn fragment_document(&self, upload: &Upload) -> Result<usize> {
        let store = self.store()?;
        let extracted = self.extract(upload).await?;
        self.write_fragments(&store, &extracted.text, upload.correlation_id, upload.tenant_id)
            .await
    }

    fn report_fragments(&self, correlation_id: Uuid, outcome: Result<usize>) {
        match outcome {
            Ok(count) => {
                tracing::info!("[{}] Added {} fragments", correlation_id, count);
                self.emit(WorkerEvent::FragmentsAdded {
                    document_id: correlation_id,
                    count,
                });
            }
            Err(e) => {
                tracing::warn!("[{}] Fragmentation failed: {}", correlation_id, e);
                self.emit(WorkerEvent::ProcessingError {
                    document_id: correlation_id,
                    error: e.to_string(),
                    stack: Some(format!("{:?}", e)),
                });
            }
        }
    }

    async fn store_main_document(
        &self,
        upload: &Upload,
    ) -> Result<(Arc<dyn MemoryStore>, Uuid, String)> {
        let store = self.store()?;
        let extracted = self.extract(upload).await?;
        let byte_size = base64_decoded_len(&upload.file_content_base64);

        let mut doc = Document::new(
            upload.correlation_id,
            self.agent_id(),
            upload.tenant_id,
            upload.filename.clone(),
            &ContentType::from_mime(&upload.content_type),
            extracted.text.clone(),
            byte_size,
            Provenance::PdfWorker,
        );
        doc.page_count = extracted.page_count;

        let store_id = store
            .create_memory(&MemoryRecord::Document(doc), MemoryTable::Documents)
            .await?;

        Ok((store, store_id, extracted.text))
    }

    /// Decode the payload and extract its text off the async runtime
    async fn extract(&self, upload: &Upload) -> Result<ExtractedText> {
        let data = base64::engine::general_purpose::STANDARD.decode(&upload.file_content_base64)?;
        if data.is_empty() {
            return Err(Error::validation("file content is empty"));
        }

        let extractor = self.ctx.extractor.clone();
        let content_type = ContentType::from_mime(&upload.content_type);
        let filename = upload.filename.clone();

        tokio::task::spawn_blocking(move || extractor.extract(&data, &content_type, &filename))
            .await
            .map_err(|e| Error::Internal(format!("Task join error: {}", e)))?
    }

    async fn write_fragments(
        &self,
        store: &Arc<dyn MemoryStore>,
        text: &str,
        correlation_id: Uuid,
        tenant_id: Uuid,
    ) -> Result<usize> {
        let fragments = self
            .ctx
            .fragmenter
            .fragment(text, correlation_id, self.agent_id(), tenant_id);

        let total = fragments.len();
        for (written, fragment) in fragments.into_iter().enumerate() {
            if let Err(e) = store
                .create_memory(&MemoryRecord::Fragment(fragment), MemoryTable::Fragments)
                .await
            {
                return Err(Error::store_write(format!(
                    "{} of {} fragments written before failure: {}",
                    written, total, e
                )));
            }
        }

        Ok(total)
    }
}

/// Decoded size of a standard base64 string
fn base64_decoded_len(encoded: &str) -> u64 {
    let trimmed = encoded.trim_end_matches('=');
    (trimmed.len() as u64 * 3) / 4
}
