//! Worker orchestration: protocol, pending completions, workers and the service

mod pending;
pub mod protocol;
mod service;
mod worker;

pub use pending::{CompletionHandler, CompletionKind};
pub use protocol::{Envelope, Message, WorkerEvent, WorkerRequest};
pub use service::{Acceptance, AddKnowledgeRequest, RagService, Readiness, WorkerHandle};
