//! Pending completion table
//!
//! Correlates asynchronous worker results with caller completion handlers.
//! Entries are queued per correlation ID so identical IDs submitted more than
//! once resolve independently, first in first out. Every entry carries a
//! deadline and its handler fires exactly once: on a result, on timeout, or
//! when the worker fails.
//!
//! A timed-out entry stays queued as a tombstone until the worker's late
//! result for it arrives, so that result is discarded instead of being
//! matched to a newer request with the same correlation ID.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Caller callback fired once with the store ID or an error
pub type CompletionHandler = Box<dyn FnOnce(Result<Uuid>) + Send + 'static>;

/// Which result message resolves an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionKind {
    /// Resolved by MAIN_DOCUMENT_STORED
    MainDocument,
    /// Resolved by KNOWLEDGE_ADDED or PROCESSING_ERROR
    Fragments,
}

/// Identifies one registered entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    pub correlation_id: Uuid,
    id: u64,
}

struct PendingCompletion {
    ticket: u64,
    kind: CompletionKind,
    handler: Option<CompletionHandler>,
    deadline: Option<JoinHandle<()>>,
    expired: bool,
}

/// Pending completions for one worker
pub struct PendingTable {
    agent_id: Uuid,
    entries: Mutex<HashMap<Uuid, VecDeque<PendingCompletion>>>,
    next_ticket: AtomicU64,
}

impl PendingTable {
    pub fn new(agent_id: Uuid) -> Self {
        Self {
            agent_id,
            entries: Mutex::new(HashMap::new()),
            next_ticket: AtomicU64::new(1),
        }
    }

    /// Register an entry with a deadline. Must be called before the request
    /// it waits on is sent.
    pub fn register(
        self: &Arc<Self>,
        correlation_id: Uuid,
        kind: CompletionKind,
        handler: Option<CompletionHandler>,
        timeout: Duration,
    ) -> Ticket {
        let id = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let ticket = Ticket { correlation_id, id };

        // The lock is held across the spawn so the timer can never observe
        // the table before the entry is in it
        let mut entries = self.entries.lock();
        let table = Arc::downgrade(self);
        let deadline = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(table) = table.upgrade() {
                table.expire(ticket, timeout);
            }
        });

        entries
            .entry(correlation_id)
            .or_default()
            .push_back(PendingCompletion {
                ticket: id,
                kind,
                handler,
                deadline: Some(deadline),
                expired: false,
            });

        ticket
    }

    /// Resolve the oldest entry of `kind` for a correlation ID.
    /// Returns false when nothing was waiting, or when the oldest entry had
    /// already timed out and the result is a late one.
    pub fn resolve(&self, correlation_id: Uuid, kind: CompletionKind, result: Result<Uuid>) -> bool {
        let entry = {
            let mut entries = self.entries.lock();
            take_where(&mut entries, correlation_id, |e| e.kind == kind)
        };
        if entry.as_ref().is_some_and(|e| e.expired) {
            tracing::debug!("[{}] Discarding late result of a timed-out request", correlation_id);
            return false;
        }
        finish(entry, result)
    }

    /// Resolve one specific entry, if it is still pending. A tombstone
    /// matched here is dropped without firing anything.
    pub fn resolve_ticket(&self, ticket: Ticket, result: Result<Uuid>) -> bool {
        let entry = {
            let mut entries = self.entries.lock();
            take_where(&mut entries, ticket.correlation_id, |e| e.ticket == ticket.id)
        };
        if entry.as_ref().is_some_and(|e| e.expired) {
            return false;
        }
        finish(entry, result)
    }

    /// Fire the timeout and leave the entry queued as a tombstone
    fn expire(&self, ticket: Ticket, after: Duration) {
        let handler = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries
                .get_mut(&ticket.correlation_id)
                .and_then(|queue| queue.iter_mut().find(|e| e.ticket == ticket.id && !e.expired))
            else {
                return;
            };
            entry.expired = true;
            // This runs inside the deadline task itself
            entry.deadline.take();
            entry.handler.take()
        };

        let after_ms = after.as_millis() as u64;
        tracing::warn!(
            "[{}] Request for agent {} timed out after {}ms",
            ticket.correlation_id,
            self.agent_id,
            after_ms
        );
        fire(
            handler,
            Err(Error::Timeout {
                correlation_id: ticket.correlation_id,
                after_ms,
            }),
        );
    }

    /// Fail every pending entry, returning how many were resolved.
    /// Tombstones are dropped.
    pub fn fail_all(&self, make_error: impl Fn() -> Error) -> usize {
        let drained: Vec<PendingCompletion> = {
            let mut entries = self.entries.lock();
            entries
                .drain()
                .flat_map(|(_, queue)| queue)
                .filter(|e| !e.expired)
                .collect()
        };

        let count = drained.len();
        for entry in drained {
            finish(Some(entry), Err(make_error()));
        }
        count
    }

    /// Number of entries still waiting, tombstones excluded
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .values()
            .flat_map(|queue| queue.iter())
            .filter(|e| !e.expired)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn take_where(
    entries: &mut HashMap<Uuid, VecDeque<PendingCompletion>>,
    correlation_id: Uuid,
    matches: impl Fn(&PendingCompletion) -> bool,
) -> Option<PendingCompletion> {
    let queue = entries.get_mut(&correlation_id)?;
    let index = queue.iter().position(matches)?;
    let entry = queue.remove(index);
    if queue.is_empty() {
        entries.remove(&correlation_id);
    }
    entry
}

/// Stop the deadline and fire the handler, outside the table lock
fn finish(entry: Option<PendingCompletion>, result: Result<Uuid>) -> bool {
    let Some(mut entry) = entry else {
        return false;
    };
    if let Some(deadline) = entry.deadline.take() {
        deadline.abort();
    }
    fire(entry.handler.take(), result);
    true
}

/// Invoke a completion handler. A panicking handler is logged and contained.
pub(crate) fn fire(handler: Option<CompletionHandler>, result: Result<Uuid>) {
    let Some(handler) = handler else {
        return;
    };
    if std::panic::catch_unwind(AssertUnwindSafe(move || handler(result))).is_err() {
        tracing::error!("Completion handler panicked");
    }
}
