//! Per-request execution context.
//!
//! A [`RequestScope`] is opened for every discover or run request. It owns
//! a fresh engine and a cancellation token linked to the request's ledger
//! entry, and must be disposed before the entry is retired.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, Span};
use uuid::Uuid;

use crate::bus::NotificationBus;
use crate::config::SessionConfig;
use crate::engine::{EngineError, TestEngine, TestEngineFactory};
use crate::ledger::CancellationSource;
use crate::peer::Peer;
use crate::protocol::{RequestId, TestNode};
use crate::updates::{BusItem, UpdateSink};

/// Session-wide services every request scope is derived from.
#[derive(Clone)]
pub struct Services {
    pub config: Arc<SessionConfig>,
    pub peer: Peer,
    pub bus: NotificationBus<BusItem>,
    pub engines: Arc<dyn TestEngineFactory>,
}

/// What an engine sees while serving one request.
#[derive(Clone)]
pub struct ExecutionContext {
    request_id: RequestId,
    cancellation: CancellationToken,
    updates: UpdateSink,
}

impl ExecutionContext {
    pub fn new(request_id: RequestId, cancellation: CancellationToken, updates: UpdateSink) -> Self {
        Self {
            request_id,
            cancellation,
            updates,
        }
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub fn run_id(&self) -> Uuid {
        self.updates.run_id()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// `Err(EngineError::Cancelled)` once the request has been cancelled.
    pub fn check_cancelled(&self) -> Result<(), EngineError> {
        if self.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Publish a node update for this run. Dropped if the bus is closed.
    pub fn report(&self, node: TestNode) {
        if let Err(e) = self.updates.report(node) {
            debug!(request_id = %self.request_id, ?e, "node update dropped");
        }
    }

    pub fn updates(&self) -> &UpdateSink {
        &self.updates
    }
}

pub struct RequestScope {
    source: Arc<CancellationSource>,
    token: CancellationToken,
    context: ExecutionContext,
    services: Services,
    engine: Option<Box<dyn TestEngine>>,
    span: Span,
}

impl RequestScope {
    pub fn open(
        request_id: RequestId,
        run_id: Uuid,
        services: &Services,
        source: Arc<CancellationSource>,
    ) -> Result<Self, EngineError> {
        let engine = services.engines.create()?;
        let token = source.token().child_token();
        let span = tracing::info_span!("request_scope", request_id = %request_id, %run_id);
        let updates = UpdateSink::new(run_id, services.bus.clone());
        let context = ExecutionContext::new(request_id, token.clone(), updates);
        Ok(Self {
            source,
            token,
            context,
            services: services.clone(),
            engine: Some(engine),
            span,
        })
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn engine(&self) -> Result<&dyn TestEngine, EngineError> {
        self.engine
            .as_deref()
            .ok_or_else(|| EngineError::Failed("request scope already disposed".into()))
    }

    pub fn is_disposed(&self) -> bool {
        self.engine.is_none()
    }

    /// Release the engine and stop any work still tied to this scope.
    /// Safe to call more than once.
    pub fn dispose(&mut self) {
        let Some(engine) = self.engine.take() else {
            return;
        };
        drop(engine);
        self.token.cancel();
        self.source.dispose();
        debug!(parent: &self.span, "request scope disposed");
    }
}

impl Drop for RequestScope {
    fn drop(&mut self) {
        self.dispose();
    }
}
