//! Knowledge ingestion service
//!
//! Owns at most one worker per agent, gates dispatch on each worker's
//! readiness and correlates asynchronous results back to callers.
//!
//! Non-PDF uploads are extracted and stored on the caller's path; their
//! fragmentation is handed to the agent's worker afterwards. PDF uploads are
//! handed to the worker whole and complete asynchronously.

use base64::Engine as _;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::{KnowledgeConfig, StoreConnection};
use crate::error::{Error, Result};
use crate::ingestion::{DocumentExtractor, Fragmenter};
use crate::storage::{MemoryRecord, MemoryStore, MemoryTable, StoreConnector};
use crate::types::{ContentType, Document, Provenance};

use super::pending::{fire, CompletionHandler, CompletionKind, PendingTable, Ticket};
use super::protocol::{Envelope, WorkerEvent, WorkerRequest};
use super::worker::{run_worker, WorkerContext};

/// An upload for one agent
#[derive(Debug, Clone)]
pub struct AddKnowledgeRequest {
    /// Caller-chosen ID echoed back in every result
    pub correlation_id: Uuid,
    /// Raw file bytes
    pub data: Vec<u8>,
    /// Declared MIME type
    pub content_type: String,
    /// Original filename
    pub filename: String,
    /// Owning tenant / world
    pub tenant_id: Uuid,
}

/// How `add_knowledge` accepted a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acceptance {
    /// Non-PDF document stored; fragmentation dispatched
    Stored { store_id: Uuid },
    /// Non-PDF document could not be extracted or stored; the handler
    /// already received the error
    Failed { error: String },
    /// PDF handed to the worker; the handler fires when it finishes
    Dispatched,
}

/// Worker readiness, assigned once
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Pending,
    Ready,
    Failed(String),
}

/// Live worker for one agent
pub struct WorkerHandle {
    agent_id: Uuid,
    generation: u64,
    requests: Mutex<Option<mpsc::Sender<Envelope>>>,
    readiness: watch::Sender<Readiness>,
    pending: Arc<PendingTable>,
    closing: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerHandle {
    pub fn agent_id(&self) -> Uuid {
        self.agent_id
    }

    /// Increases every time a worker is spawned, across all agents
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn readiness(&self) -> Readiness {
        self.readiness.borrow().clone()
    }

    /// Number of completions waiting on this worker
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Wait until the readiness handshake resolves
    pub async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.readiness.subscribe();
        let state = tokio::time::timeout(timeout, rx.wait_for(|s| *s != Readiness::Pending))
            .await
            .map_err(|_| Error::WorkerInit {
                agent_id: self.agent_id,
                message: format!("not ready after {}ms", timeout.as_millis()),
            })?
            .map_err(|_| Error::worker_unavailable(self.agent_id, "worker dropped"))?
            .clone();

        match state {
            Readiness::Ready => Ok(()),
            Readiness::Failed(message) => Err(Error::WorkerInit {
                agent_id: self.agent_id,
                message,
            }),
            Readiness::Pending => Err(Error::internal("readiness resolved to pending")),
        }
    }

    fn set_readiness(&self, state: Readiness) -> bool {
        self.readiness.send_if_modified(|current| {
            if *current == Readiness::Pending {
                *current = state;
                true
            } else {
                false
            }
        })
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    async fn send(&self, envelope: Envelope) -> Result<()> {
        let sender = self
            .requests
            .lock()
            .clone()
            .ok_or_else(|| Error::worker_unavailable(self.agent_id, "worker is shutting down"))?;

        sender
            .send(envelope)
            .await
            .map_err(|_| Error::worker_unavailable(self.agent_id, "request channel closed"))
    }

    /// Tear down after a lifecycle failure: fail readiness, stop accepting
    /// requests, kill the task and fail everything still pending
    fn retire(&self, reason: &str) {
        self.closing.store(true, Ordering::SeqCst);
        self.set_readiness(Readiness::Failed(reason.to_string()));
        self.requests.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
        }

        let agent_id = self.agent_id;
        let failed = self
            .pending
            .fail_all(|| Error::worker_unavailable(agent_id, reason));
        if failed > 0 {
            tracing::warn!("[{}] Failed {} pending completions: {}", agent_id, failed, reason);
        }
    }

    /// Graceful stop: close the queue, let the worker drain it, then fail
    /// whatever is still pending
    async fn shutdown(&self, grace: Duration) {
        self.closing.store(true, Ordering::SeqCst);
        self.requests.lock().take();

        let worker = self.worker.lock().take();
        if let Some(mut worker) = worker {
            if tokio::time::timeout(grace, &mut worker).await.is_err() {
                tracing::warn!(
                    "[{}] Worker did not stop within {}ms, aborting",
                    self.agent_id,
                    grace.as_millis()
                );
                worker.abort();
            }
        }

        let listener = self.listener.lock().take();
        if let Some(listener) = listener {
            if tokio::time::timeout(grace, listener).await.is_err() {
                tracing::warn!("[{}] Listener did not stop", self.agent_id);
            }
        }

        self.set_readiness(Readiness::Failed("stopped".to_string()));
        let agent_id = self.agent_id;
        self.pending
            .fail_all(|| Error::worker_unavailable(agent_id, "service stopped"));
    }
}

struct ServiceInner {
    config: KnowledgeConfig,
    connection: StoreConnection,
    connector: Arc<dyn StoreConnector>,
    primary: Arc<dyn MemoryStore>,
    extractor: DocumentExtractor,
    fragmenter: Fragmenter,
    workers: DashMap<Uuid, Arc<WorkerHandle>>,
    generation: AtomicU64,
}

/// Per-agent knowledge ingestion service
#[derive(Clone)]
pub struct RagService {
    inner: Arc<ServiceInner>,
}

impl RagService {
    /// Create a service writing non-PDF documents through `primary`
    pub fn new(
        config: KnowledgeConfig,
        connector: Arc<dyn StoreConnector>,
        primary: Arc<dyn MemoryStore>,
    ) -> Result<Self> {
        config.validate()?;
        let connection = config.store.resolve()?;

        tracing::info!(
            "Knowledge service configured: store={:?}, chunk_size={}, overlap={}",
            connection,
            config.chunking.chunk_size,
            config.chunking.chunk_overlap
        );

        Ok(Self {
            inner: Arc::new(ServiceInner {
                extractor: DocumentExtractor::new(config.worker.pdf_timeout()),
                fragmenter: Fragmenter::from_config(&config.chunking),
                config,
                connection,
                connector,
                primary,
                workers: DashMap::new(),
                generation: AtomicU64::new(0),
            }),
        })
    }

    /// Create a service whose primary store is opened through `connector`
    pub async fn connect(config: KnowledgeConfig, connector: Arc<dyn StoreConnector>) -> Result<Self> {
        let connection = config.store.resolve()?;
        let primary = connector.connect(Uuid::nil(), &connection).await?;
        Self::new(config, connector, primary)
    }

    pub fn config(&self) -> &KnowledgeConfig {
        &self.inner.config
    }

    /// Store used for documents written on the caller's path
    pub fn primary_store(&self) -> &Arc<dyn MemoryStore> {
        &self.inner.primary
    }

    /// Submit a document for an agent.
    ///
    /// Returns `Err` only when the request is rejected up front (empty file,
    /// blank filename); the handler is not fired in that case. Otherwise the
    /// handler fires exactly once with the stored document's ID or an error.
    pub async fn add_knowledge(
        &self,
        agent_id: Uuid,
        request: AddKnowledgeRequest,
        on_complete: Option<CompletionHandler>,
    ) -> Result<Acceptance> {
        if request.data.is_empty() {
            return Err(Error::validation(format!(
                "'{}' is empty (0 bytes)",
                request.filename
            )));
        }
        if request.filename.trim().is_empty() {
            return Err(Error::validation("filename must not be blank"));
        }

        let content_type = ContentType::resolve(&request.content_type, &request.filename);
        let correlation_id = request.correlation_id;

        if content_type.is_pdf() {
            let envelope = Envelope::encode(&WorkerRequest::ProcessPdfThenFragments {
                client_document_id: correlation_id,
                file_content_base64: base64::engine::general_purpose::STANDARD.encode(&request.data),
                content_type: content_type.as_mime().to_string(),
                original_filename: request.filename.clone(),
                tenant_id: request.tenant_id,
            })?;

            let handle = self.get_or_initialize_worker(agent_id);
            let ticket = handle.pending.register(
                correlation_id,
                CompletionKind::MainDocument,
                on_complete,
                self.inner.config.worker.request_timeout(),
            );
            tracing::info!(
                "[{}] Dispatching PDF '{}' ({} bytes) to worker for agent {}",
                correlation_id,
                request.filename,
                request.data.len(),
                agent_id
            );
            self.inner.spawn_dispatch(handle, ticket, envelope);
            return Ok(Acceptance::Dispatched);
        }

        match self.store_main_document(agent_id, request, &content_type).await {
            Ok((store_id, request)) => {
                fire(on_complete, Ok(store_id));
                self.dispatch_fragmentation(agent_id, request, &content_type);
                Ok(Acceptance::Stored { store_id })
            }
            Err(e) => {
                tracing::warn!("[{}] Document not stored: {}", correlation_id, e);
                let error = e.to_string();
                fire(on_complete, Err(e));
                Ok(Acceptance::Failed { error })
            }
        }
    }

    /// Submit a document and wait for its store ID
    pub async fn ingest(&self, agent_id: Uuid, request: AddKnowledgeRequest) -> Result<Uuid> {
        let (tx, rx) = oneshot::channel();
        let handler: CompletionHandler = Box::new(move |result| {
            let _ = tx.send(result);
        });

        self.add_knowledge(agent_id, request, Some(handler)).await?;

        rx.await
            .map_err(|_| Error::internal("completion handler dropped without firing"))?
    }

    /// Extract and write a non-PDF document on the caller's path. Hands the
    /// request back for fragmentation.
    async fn store_main_document(
        &self,
        agent_id: Uuid,
        request: AddKnowledgeRequest,
        content_type: &ContentType,
    ) -> Result<(Uuid, AddKnowledgeRequest)> {
        let extractor = self.inner.extractor.clone();
        let ct = content_type.clone();
        let (request, extracted) = tokio::task::spawn_blocking(move || {
            let extracted = extractor.extract(&request.data, &ct, &request.filename);
            (request, extracted)
        })
        .await
        .map_err(|e| Error::Internal(format!("Task join error: {}", e)))?;
        let extracted = extracted?;

        let mut doc = Document::new(
            request.correlation_id,
            agent_id,
            request.tenant_id,
            request.filename.clone(),
            content_type,
            extracted.text,
            request.data.len() as u64,
            Provenance::MainUpload,
        );
        doc.page_count = extracted.page_count;

        let store_id = self
            .inner
            .primary
            .create_memory(&MemoryRecord::Document(doc), MemoryTable::Documents)
            .await?;

        tracing::info!(
            "[{}] Stored '{}' as {} ({})",
            request.correlation_id,
            request.filename,
            store_id,
            self.inner.primary.name()
        );
        Ok((store_id, request))
    }

    /// Hand a stored document to the agent's worker for fragmentation.
    /// Failures are only logged; the caller already has its result.
    fn dispatch_fragmentation(
        &self,
        agent_id: Uuid,
        request: AddKnowledgeRequest,
        content_type: &ContentType,
    ) {
        let correlation_id = request.correlation_id;
        let envelope = match Envelope::encode(&WorkerRequest::ProcessDocument {
            document_id: correlation_id,
            file_content_base64: base64::engine::general_purpose::STANDARD.encode(&request.data),
            content_type: content_type.as_mime().to_string(),
            original_filename: request.filename,
            tenant_id: request.tenant_id,
        }) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::error!("[{}] Could not encode fragmentation request: {}", correlation_id, e);
                return;
            }
        };

        let handle = self.get_or_initialize_worker(agent_id);
        let ticket = handle.pending.register(
            correlation_id,
            CompletionKind::Fragments,
            None,
            self.inner.config.worker.request_timeout(),
        );
        self.inner.spawn_dispatch(handle, ticket, envelope);
    }

    /// Return the agent's live worker, spawning one on first use
    pub fn get_or_initialize_worker(&self, agent_id: Uuid) -> Arc<WorkerHandle> {
        match self.inner.workers.entry(agent_id) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let handle = self.inner.spawn_worker(agent_id);
                entry.insert(handle.clone());
                handle
            }
        }
    }

    /// Stop every worker and wait for them to finish. Safe with none running.
    pub async fn stop(&self) {
        let agents: Vec<Uuid> = self.inner.workers.iter().map(|e| *e.key()).collect();
        let handles: Vec<Arc<WorkerHandle>> = agents
            .into_iter()
            .filter_map(|agent| self.inner.workers.remove(&agent).map(|(_, h)| h))
            .collect();

        if handles.is_empty() {
            tracing::debug!("Knowledge service stopped (no workers)");
            return;
        }

        tracing::info!("Stopping {} knowledge workers", handles.len());
        let grace = self.inner.config.worker.shutdown_timeout();
        futures::future::join_all(handles.iter().map(|h| h.shutdown(grace))).await;
        tracing::info!("Knowledge service stopped");
    }

    /// Number of live workers
    pub fn worker_count(&self) -> usize {
        self.inner.workers.len()
    }

    pub fn has_worker(&self, agent_id: Uuid) -> bool {
        self.inner.workers.contains_key(&agent_id)
    }

    /// Completions waiting on an agent's worker
    pub fn pending_count(&self, agent_id: Uuid) -> usize {
        self.inner
            .workers
            .get(&agent_id)
            .map(|h| h.pending_count())
            .unwrap_or(0)
    }
}

impl ServiceInner {
    fn spawn_worker(self: &Arc<Self>, agent_id: Uuid) -> Arc<WorkerHandle> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (request_tx, request_rx) = mpsc::channel(self.config.worker.channel_capacity);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (readiness, _) = watch::channel(Readiness::Pending);

        let ctx = WorkerContext {
            agent_id,
            connection: self.connection.clone(),
            connector: self.connector.clone(),
            extractor: self.extractor.clone(),
            fragmenter: self.fragmenter.clone(),
        };
        let worker = tokio::spawn(run_worker(ctx, request_rx, event_tx));

        // The queue is empty, so the handshake request always fits
        let init = Envelope::encode(&WorkerRequest::InitStoreAdapter {})
            .map_err(|e| e.to_string())
            .and_then(|envelope| request_tx.try_send(envelope).map_err(|e| e.to_string()));

        let handle = Arc::new(WorkerHandle {
            agent_id,
            generation,
            requests: Mutex::new(Some(request_tx)),
            readiness,
            pending: Arc::new(PendingTable::new(agent_id)),
            closing: AtomicBool::new(false),
            worker: Mutex::new(Some(worker)),
            listener: Mutex::new(None),
        });

        let listener = tokio::spawn(listen(Arc::downgrade(self), handle.clone(), event_rx));
        *handle.listener.lock() = Some(listener);

        tracing::info!("[{}] Spawned knowledge worker (generation {})", agent_id, generation);

        if let Err(e) = init {
            tracing::error!("[{}] Could not send init request: {}", agent_id, e);
            handle.retire(&format!("init request not sent: {}", e));
        }

        handle
    }

    /// Wait for readiness off the caller's path, then send. Any failure
    /// resolves the ticket with the error.
    fn spawn_dispatch(self: &Arc<Self>, handle: Arc<WorkerHandle>, ticket: Ticket, envelope: Envelope) {
        let inner = self.clone();
        tokio::spawn(async move {
            let init_timeout = inner.config.worker.init_timeout();

            let result = match handle.wait_ready(init_timeout).await {
                Ok(()) => handle.send(envelope).await,
                Err(e) => {
                    inner.escalate(&handle, &e.to_string());
                    Err(e)
                }
            };

            if let Err(e) = result {
                if handle.pending.resolve_ticket(ticket, Err(e)) {
                    tracing::warn!("[{}] Dispatch to agent {} failed", ticket.correlation_id, handle.agent_id);
                }
            }
        });
    }

    /// Remove a failed worker from the registry and retire it
    fn escalate(&self, handle: &WorkerHandle, reason: &str) {
        let removed = self
            .workers
            .remove_if(&handle.agent_id, |_, current| current.generation == handle.generation)
            .is_some();
        if removed {
            tracing::error!("[{}] Worker removed: {}", handle.agent_id, reason);
        }
        handle.retire(reason);
    }
}

/// Route worker events to pending completions until the worker goes away
async fn listen(
    service: Weak<ServiceInner>,
    handle: Arc<WorkerHandle>,
    mut events: mpsc::UnboundedReceiver<Envelope>,
) {
    let agent_id = handle.agent_id;

    while let Some(envelope) = events.recv().await {
        let event = match envelope.decode::<WorkerEvent>() {
            Ok(Some(event)) => event,
            Ok(None) => {
                tracing::warn!("[{}] Ignoring unknown message kind '{}'", agent_id, envelope.kind);
                continue;
            }
            Err(e) => {
                tracing::warn!("[{}] Ignoring malformed message: {}", agent_id, e);
                continue;
            }
        };

        match event {
            WorkerEvent::Ready { .. } => {
                if handle.set_readiness(Readiness::Ready) {
                    tracing::info!("[{}] Knowledge worker ready", agent_id);
                }
            }
            WorkerEvent::InitError { error, .. } => {
                let reason = format!("store adapter failed to initialize: {}", error);
                fail_worker(&service, &handle, &reason);
                return;
            }
            WorkerEvent::MainDocumentStored {
                client_document_id,
                stored_document_id,
                error,
                error_kind,
            } => {
                let result = match (stored_document_id, error) {
                    (Some(store_id), None) => Ok(store_id),
                    (_, Some(message)) => Err(Error::reported(error_kind.as_deref(), message)),
                    (None, None) => Err(Error::Protocol(
                        "MAIN_DOCUMENT_STORED without storedDocumentId or error".to_string(),
                    )),
                };
                if !handle
                    .pending
                    .resolve(client_document_id, CompletionKind::MainDocument, result)
                {
                    tracing::debug!("[{}] No caller waiting for stored document", client_document_id);
                }
            }
            WorkerEvent::FragmentsAdded { document_id, count } => {
                tracing::info!("[{}] {} fragments added", document_id, count);
                handle
                    .pending
                    .resolve(document_id, CompletionKind::Fragments, Ok(document_id));
            }
            WorkerEvent::ProcessingError { document_id, error, stack } => {
                tracing::warn!("[{}] Fragmentation failed: {}", document_id, error);
                if let Some(stack) = stack {
                    tracing::debug!("[{}] {}", document_id, stack);
                }
                handle.pending.resolve(
                    document_id,
                    CompletionKind::Fragments,
                    Err(Error::reported(None, error)),
                );
            }
        }
    }

    if !handle.is_closing() {
        fail_worker(&service, &handle, "worker exited unexpectedly");
    }
}

fn fail_worker(service: &Weak<ServiceInner>, handle: &WorkerHandle, reason: &str) {
    match service.upgrade() {
        Some(inner) => inner.escalate(handle, reason),
        None => handle.retire(reason),
    }
}
