//! Registry of in-flight requests in both directions.
//!
//! Inbound entries are keyed by the id the client chose. Outbound entries
//! use ids allocated here. Each entry owns a cancellation source linked to
//! a parent token and a one-shot completion that fires exactly once, when
//! the entry is removed.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::protocol::{ErrorObject, RequestId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Terminal outcome of a request.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed(Value),
    Failed(ErrorObject),
    Cancelled(ErrorObject),
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("request id {0} is already in flight")]
    Duplicate(RequestId),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CancelError {
    #[error("cancellation source has already been disposed")]
    Disposed,
}

/// What a cancellation attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// No in-flight request has that id.
    NotFound,
    Signalled,
    /// Cancellation had already been requested; nothing changed.
    AlreadyRequested,
}

/// A cancellation token owned by one request.
///
/// The token is a child of the parent it was created from, so cancelling
/// the parent cancels it too. [`request_cancel`](Self::request_cancel)
/// records that the peer asked for it, which a parent cancellation does not.
#[derive(Debug)]
pub struct CancellationSource {
    token: CancellationToken,
    requested: AtomicBool,
    disposed: AtomicBool,
}

impl CancellationSource {
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            token: parent.child_token(),
            requested: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn request_cancel(&self) -> Result<CancelOutcome, CancelError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(CancelError::Disposed);
        }
        if self.requested.swap(true, Ordering::AcqRel) {
            return Ok(CancelOutcome::AlreadyRequested);
        }
        self.token.cancel();
        Ok(CancelOutcome::Signalled)
    }

    /// Whether the peer asked for cancellation, as opposed to a parent.
    pub fn is_cancel_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Returns `true` the first time only.
    pub fn dispose(&self) -> bool {
        !self.disposed.swap(true, Ordering::AcqRel)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

/// One ledger entry.
#[derive(Debug)]
pub struct InFlightRequest {
    pub id: RequestId,
    pub direction: Direction,
    pub cancellation: Arc<CancellationSource>,
    completion: Option<oneshot::Sender<Outcome>>,
    observer: Option<oneshot::Receiver<Outcome>>,
}

impl InFlightRequest {
    fn new(
        id: RequestId,
        direction: Direction,
        parent: &CancellationToken,
    ) -> (Self, oneshot::Receiver<Outcome>) {
        let (tx, rx) = oneshot::channel();
        let entry = Self {
            id,
            direction,
            cancellation: Arc::new(CancellationSource::new(parent)),
            completion: Some(tx),
            observer: None,
        };
        (entry, rx)
    }

    fn complete(mut self, outcome: Outcome) {
        self.cancellation.dispose();
        if let Some(tx) = self.completion.take() {
            // The observer may have gone away; the outcome is still final.
            let _ = tx.send(outcome);
        }
    }
}

pub struct RequestLedger {
    inbound: Mutex<HashMap<RequestId, InFlightRequest>>,
    outbound: Mutex<HashMap<RequestId, InFlightRequest>>,
    next_outbound_id: AtomicI64,
}

impl Default for RequestLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestLedger {
    pub fn new() -> Self {
        Self {
            inbound: Mutex::new(HashMap::new()),
            outbound: Mutex::new(HashMap::new()),
            next_outbound_id: AtomicI64::new(1),
        }
    }

    // ── inbound ─────────────────────────────────────────────────────

    /// Insert an entry for a request the peer sent us.
    pub fn register_inbound(
        &self,
        id: RequestId,
        parent: &CancellationToken,
    ) -> Result<Arc<CancellationSource>, LedgerError> {
        let mut inbound = self.inbound.lock();
        if inbound.contains_key(&id) {
            return Err(LedgerError::Duplicate(id));
        }
        let (mut entry, rx) = InFlightRequest::new(id.clone(), Direction::Inbound, parent);
        entry.observer = Some(rx);
        let source = entry.cancellation.clone();
        inbound.insert(id, entry);
        Ok(source)
    }

    /// Take the completion receiver of an inbound entry. Only the first
    /// caller gets it.
    pub fn observe_inbound(&self, id: &RequestId) -> Option<oneshot::Receiver<Outcome>> {
        self.inbound.lock().get_mut(id).and_then(|e| e.observer.take())
    }

    /// Signal cancellation of an inbound request. Unknown ids are a no-op.
    pub fn cancel_inbound(&self, id: &RequestId) -> Result<CancelOutcome, CancelError> {
        let source = match self.inbound.lock().get(id) {
            Some(entry) => entry.cancellation.clone(),
            None => return Ok(CancelOutcome::NotFound),
        };
        source.request_cancel()
    }

    /// Remove an inbound entry and deliver its outcome.
    ///
    /// Returns the number of inbound entries left, or `None` if the id was
    /// not in flight.
    pub fn retire_inbound(&self, id: &RequestId, outcome: Outcome) -> Option<usize> {
        let (entry, remaining) = {
            let mut inbound = self.inbound.lock();
            let entry = inbound.remove(id)?;
            (entry, inbound.len())
        };
        entry.complete(outcome);
        Some(remaining)
    }

    pub fn inbound_len(&self) -> usize {
        self.inbound.lock().len()
    }

    pub fn is_inbound_empty(&self) -> bool {
        self.inbound.lock().is_empty()
    }

    pub fn contains_inbound(&self, id: &RequestId) -> bool {
        self.inbound.lock().contains_key(id)
    }

    // ── outbound ────────────────────────────────────────────────────

    /// Allocate an id for a request we are about to send.
    pub fn register_outbound(
        &self,
        parent: &CancellationToken,
    ) -> (RequestId, oneshot::Receiver<Outcome>) {
        let id = RequestId::Number(self.next_outbound_id.fetch_add(1, Ordering::Relaxed));
        let (entry, rx) = InFlightRequest::new(id.clone(), Direction::Outbound, parent);
        self.outbound.lock().insert(id.clone(), entry);
        (id, rx)
    }

    /// Deliver the peer's answer. Unknown ids are ignored and return `false`.
    pub fn resolve_outbound(&self, id: &RequestId, outcome: Outcome) -> bool {
        let entry = self.outbound.lock().remove(id);
        match entry {
            Some(entry) => {
                entry.complete(outcome);
                true
            }
            None => false,
        }
    }

    /// Drop an outbound entry without an answer (timeout, local cancel).
    pub fn abandon_outbound(&self, id: &RequestId) -> bool {
        let entry = self.outbound.lock().remove(id);
        match entry {
            Some(entry) => {
                entry.cancellation.token().cancel();
                entry.cancellation.dispose();
                true
            }
            None => false,
        }
    }

    /// Abandon every outbound request. Waiters see their receiver close.
    pub fn abandon_all_outbound(&self) -> usize {
        let entries: Vec<InFlightRequest> = self.outbound.lock().drain().map(|(_, e)| e).collect();
        for entry in &entries {
            entry.cancellation.token().cancel();
            entry.cancellation.dispose();
        }
        entries.len()
    }

    pub fn outbound_len(&self) -> usize {
        self.outbound.lock().len()
    }
}
