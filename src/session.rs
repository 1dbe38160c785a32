//! The session protocol engine.
//!
//! A [`ProtocolSession`] owns one client connection from handshake to exit:
//!
//! 1. **Handshaking**: only `initialize` is served, inline, by the read loop.
//! 2. **Serving**: every request runs on its own task; the read loop never
//!    waits for a handler, so `$/cancelRequest` is always seen promptly.
//! 3. **Draining**: after `exit`, new requests are refused while accepted
//!    ones finish. The read loop stops once the last one is retired.
//! 4. **Closed**: end hooks ran, the bus is flushed and disabled.
//!
//! Every request is answered exactly once: a result, a cancellation error,
//! or an error describing what went wrong.

use futures::FutureExt;
use serde_json::{json, Value};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::bus::{DataConsumer, NotificationBus};
use crate::channel::{Channel, MessageReader};
use crate::config::SessionConfig;
use crate::context::Services;
use crate::engine::TestEngineFactory;
use crate::error::diagnostic_text;
use crate::handlers::{self, HandlerError};
use crate::hooks::{run_hooks, HookContext, HookPhase, SessionLifetimeHook};
use crate::ledger::{CancelOutcome, CancellationSource, Outcome, RequestLedger};
use crate::peer::Peer;
use crate::protocol::{
    methods, ControlNotification, ErrorCode, ErrorObject, LogLevel, Message, Notification,
    Request, RequestId,
};
use crate::shutdown::{OutstandingGuard, ShutdownCoordinator};
use crate::updates::{BusItem, PeerUpdateForwarder};

/// Extra time granted to cancelled work after the shutdown timeout expires.
const FORCED_ABORT_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Handshaking,
    Serving,
    Draining,
    Closed,
}

/// Process exit status derived from how a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    GenericFailure,
    SessionAborted,
    IncompatibleProtocolVersion,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::GenericFailure => 1,
            ExitStatus::SessionAborted => 3,
            ExitStatus::IncompatibleProtocolVersion => 12,
        }
    }
}

/// Observable lifecycle state of a session.
pub struct SessionState {
    phase: watch::Sender<Phase>,
    served: AtomicBool,
    closing: AtomicBool,
}

impl SessionState {
    fn new() -> Self {
        let (phase, _) = watch::channel(Phase::Handshaking);
        Self {
            phase,
            served: AtomicBool::new(false),
            closing: AtomicBool::new(false),
        }
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    /// Whether the session ever reached [`Phase::Serving`].
    pub fn has_served(&self) -> bool {
        self.served.load(Ordering::Acquire)
    }

    /// Whether the peer sent `exit`.
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    fn transition(&self, from: Phase, to: Phase) -> bool {
        let changed = self.phase.send_if_modified(|phase| {
            if *phase == from {
                *phase = to;
                true
            } else {
                false
            }
        });
        if changed && to == Phase::Serving {
            self.served.store(true, Ordering::Release);
        }
        changed
    }

    fn mark_closing(&self) {
        self.closing.store(true, Ordering::Release);
    }

    fn close(&self) {
        self.phase.send_replace(Phase::Closed);
    }
}

/// Why the read loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopEnd {
    /// `exit` received and every accepted request retired.
    Shutdown,
    EndOfStream,
    ProcessCancelled,
    TransportFailed,
    HandshakeTimedOut,
    VersionMismatch,
}

pub struct ProtocolSession {
    id: Uuid,
    config: Arc<SessionConfig>,
    engines: Arc<dyn TestEngineFactory>,
    hooks: Vec<Arc<dyn SessionLifetimeHook>>,
    consumers: Vec<Arc<dyn DataConsumer<BusItem>>>,
    process_cancel: CancellationToken,
    ledger: Arc<RequestLedger>,
    shutdown: ShutdownCoordinator,
    state: Arc<SessionState>,
}

impl ProtocolSession {
    /// `process_cancel` is the process-wide token; cancelling it aborts the
    /// session and every request in it.
    pub fn new(
        config: SessionConfig,
        engines: Arc<dyn TestEngineFactory>,
        process_cancel: CancellationToken,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            config: Arc::new(config),
            engines,
            hooks: Vec::new(),
            consumers: Vec::new(),
            process_cancel,
            ledger: Arc::new(RequestLedger::new()),
            shutdown: ShutdownCoordinator::new(),
            state: Arc::new(SessionState::new()),
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn SessionLifetimeHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Attach an extra bus consumer alongside the client forwarder.
    pub fn with_consumer(mut self, consumer: Arc<dyn DataConsumer<BusItem>>) -> Self {
        self.consumers.push(consumer);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn ledger(&self) -> Arc<RequestLedger> {
        self.ledger.clone()
    }

    pub fn shutdown_coordinator(&self) -> ShutdownCoordinator {
        self.shutdown.clone()
    }

    pub fn state(&self) -> Arc<SessionState> {
        self.state.clone()
    }

    /// Serve the channel until the session ends.
    pub async fn run(self, channel: Channel) -> ExitStatus {
        let Channel { reader, writer } = channel;
        let session_token = self.process_cancel.child_token();
        let peer = Peer::new(
            writer,
            self.ledger.clone(),
            session_token.clone(),
            self.config.outbound_request_timeout(),
        );

        let bus = NotificationBus::new();
        let forwarder: Arc<dyn DataConsumer<BusItem>> =
            Arc::new(PeerUpdateForwarder::new(peer.clone()));
        for consumer in std::iter::once(forwarder).chain(self.consumers.iter().cloned()) {
            if let Err(e) = bus.subscribe(consumer) {
                warn!("failed to subscribe bus consumer: {}", e);
            }
        }

        let services = Services {
            config: self.config.clone(),
            peer,
            bus,
            engines: self.engines.clone(),
        };

        let span = tracing::info_span!("session", session_id = %self.id);
        self.serve(reader, services, session_token)
            .instrument(span)
            .await
    }

    async fn serve(
        self,
        mut reader: Box<dyn MessageReader>,
        services: Services,
        session_token: CancellationToken,
    ) -> ExitStatus {
        let hold_open = self.shutdown.hold();
        let hook_ctx = HookContext {
            session_id: self.id,
            bus: services.bus.clone(),
            cancellation: session_token.clone(),
        };
        let drain_timeout = self.config.drain_timeout();

        let end = match self.handshake(reader.as_mut(), &services).await {
            Ok(()) => {
                self.state.transition(Phase::Handshaking, Phase::Serving);
                info!("session serving");
                run_hooks(&self.hooks, HookPhase::Start, &hook_ctx, drain_timeout).await;
                self.read_loop(reader.as_mut(), &services, &session_token)
                    .await
            }
            Err(end) => end,
        };
        debug!(?end, "read loop finished");
        drop(reader);

        // In-flight work still answers after end of stream, bounded by the
        // shutdown timeout.
        drop(hold_open);
        let settled = self.settle(&session_token).await;

        if self.state.has_served() {
            run_hooks(&self.hooks, HookPhase::End, &hook_ctx, drain_timeout).await;
        }
        if let Err(e) = services.bus.drain(drain_timeout).await {
            warn!("final drain: {}", e);
        }
        services.bus.disable().await;

        let abandoned = self.ledger.abandon_all_outbound();
        if abandoned > 0 {
            debug!(abandoned, "abandoned unanswered outbound requests");
        }
        services.peer.close().await;
        self.state.close();

        let status = self.exit_status(end, settled);
        info!(?status, code = status.code(), "session closed");
        status
    }

    fn exit_status(&self, end: LoopEnd, settled: bool) -> ExitStatus {
        if end == LoopEnd::VersionMismatch {
            return ExitStatus::IncompatibleProtocolVersion;
        }
        if self.state.is_closing() && !self.process_cancel.is_cancelled() && settled {
            ExitStatus::Success
        } else {
            ExitStatus::SessionAborted
        }
    }

    /// Wait for outstanding work. On timeout, cancel it and give it a short
    /// grace period. Returns `false` if the timeout was hit.
    async fn settle(&self, session_token: &CancellationToken) -> bool {
        if self.shutdown.wait_idle(self.config.shutdown_timeout()).await {
            return true;
        }
        warn!(
            outstanding = self.shutdown.outstanding(),
            "in-flight work did not finish in time, cancelling it"
        );
        session_token.cancel();
        if !self.shutdown.wait_idle(FORCED_ABORT_GRACE).await {
            error!(
                outstanding = self.shutdown.outstanding(),
                "abandoning work that ignored cancellation"
            );
        }
        false
    }

    // ── handshake ───────────────────────────────────────────────────

    async fn handshake(
        &self,
        reader: &mut dyn MessageReader,
        services: &Services,
    ) -> Result<(), LoopEnd> {
        let deadline = tokio::time::sleep(self.config.handshake_timeout());
        tokio::pin!(deadline);

        loop {
            let read = tokio::select! {
                biased;
                _ = self.process_cancel.cancelled() => return Err(LoopEnd::ProcessCancelled),
                _ = &mut deadline => {
                    warn!(
                        timeout_ms = self.config.handshake_timeout_ms,
                        "no initialize request received in time"
                    );
                    return Err(LoopEnd::HandshakeTimedOut);
                }
                read = reader.read_message() => read,
            };

            let message = match read {
                Ok(Some(message)) => message,
                Ok(None) => return Err(LoopEnd::EndOfStream),
                Err(e) if e.is_recoverable() => {
                    warn!("skipping malformed message: {}", e);
                    continue;
                }
                Err(e) => {
                    error!("transport failed during handshake: {}", e);
                    return Err(LoopEnd::TransportFailed);
                }
            };

            match message {
                Message::Request(request) if request.method == methods::INITIALIZE => {
                    match handlers::initialize(&request, &self.config) {
                        Ok(result) => {
                            let value = match serde_json::to_value(&result) {
                                Ok(value) => value,
                                Err(e) => {
                                    error!("failed to encode initialize result: {}", e);
                                    return Err(LoopEnd::TransportFailed);
                                }
                            };
                            if let Err(e) = services.peer.respond(request.id, value).await {
                                error!("failed to answer initialize: {}", e);
                                return Err(LoopEnd::TransportFailed);
                            }
                            return Ok(());
                        }
                        Err(error) => {
                            let fatal = error.kind() == Some(ErrorCode::IncompatibleProtocolVersion);
                            warn!(code = error.code, "initialize rejected: {}", error.message);
                            if let Err(e) = services.peer.respond_error(request.id, error).await {
                                warn!("failed to answer initialize: {}", e);
                            }
                            if fatal {
                                return Err(LoopEnd::VersionMismatch);
                            }
                        }
                    }
                }
                Message::Request(request) => {
                    debug!(id = %request.id, method = %request.method, "request before initialize");
                    let error = ErrorObject::new(
                        ErrorCode::ServerNotInitialized,
                        "Server has not been initialized.",
                    );
                    if let Err(e) = services.peer.respond_error(request.id, error).await {
                        warn!("failed to answer request: {}", e);
                    }
                }
                Message::Notification(notification) => match notification.control() {
                    Ok(Some(ControlNotification::Shutdown)) => {
                        info!("exit received before initialize");
                        self.state.mark_closing();
                        return Err(LoopEnd::Shutdown);
                    }
                    Ok(Some(ControlNotification::Cancel(id))) => {
                        debug!(%id, "cancel before initialize ignored");
                    }
                    Ok(None) => {
                        debug!(method = %notification.method, "notification before initialize ignored");
                    }
                    Err(e) => warn!(method = %notification.method, "invalid notification: {}", e),
                },
                Message::Response(response) => {
                    self.resolve_outbound(&response.id, Outcome::Completed(response.result))
                }
                Message::Error(response) => {
                    self.resolve_outbound(&response.id, Outcome::Failed(response.error))
                }
            }
        }
    }

    // ── serving ─────────────────────────────────────────────────────

    async fn read_loop(
        &self,
        reader: &mut dyn MessageReader,
        services: &Services,
        session_token: &CancellationToken,
    ) -> LoopEnd {
        let stop_reading = CancellationToken::new();

        loop {
            let read = tokio::select! {
                biased;
                _ = self.process_cancel.cancelled() => return LoopEnd::ProcessCancelled,
                _ = stop_reading.cancelled() => return LoopEnd::Shutdown,
                read = reader.read_message() => read,
            };

            let message = match read {
                Ok(Some(message)) => message,
                Ok(None) => return LoopEnd::EndOfStream,
                Err(e) if e.is_recoverable() => {
                    warn!("skipping malformed message: {}", e);
                    continue;
                }
                Err(e) => {
                    error!("transport failed: {}", e);
                    return LoopEnd::TransportFailed;
                }
            };

            match message {
                Message::Request(request) => {
                    self.accept_request(request, services, session_token, &stop_reading)
                }
                Message::Notification(notification) => {
                    self.accept_notification(notification, services, &stop_reading)
                }
                Message::Response(response) => {
                    self.resolve_outbound(&response.id, Outcome::Completed(response.result))
                }
                Message::Error(response) => {
                    self.resolve_outbound(&response.id, Outcome::Failed(response.error))
                }
            }
        }
    }

    fn accept_request(
        &self,
        request: Request,
        services: &Services,
        session_token: &CancellationToken,
        stop_reading: &CancellationToken,
    ) {
        let guard = self.shutdown.hold();

        if self.state.phase() != Phase::Serving {
            debug!(id = %request.id, method = %request.method, "refusing request while closing");
            let error = ErrorObject::new(
                ErrorCode::InvalidRequest,
                "The session is shutting down and no longer accepts requests.",
            );
            spawn_reject(services.peer.clone(), request.id, error, guard);
            return;
        }

        let source = match self.ledger.register_inbound(request.id.clone(), session_token) {
            Ok(source) => source,
            Err(e) => {
                warn!(method = %request.method, "{}", e);
                let error = ErrorObject::new(ErrorCode::InvalidRequest, e.to_string());
                spawn_reject(services.peer.clone(), request.id, error, guard);
                return;
            }
        };

        let task = RequestTask {
            request,
            source,
            services: services.clone(),
            ledger: self.ledger.clone(),
            state: self.state.clone(),
            process_cancel: self.process_cancel.clone(),
            stop_reading: stop_reading.clone(),
            _guard: guard,
        };
        tokio::spawn(task.run());
    }

    fn accept_notification(
        &self,
        notification: Notification,
        services: &Services,
        stop_reading: &CancellationToken,
    ) {
        let guard = self.shutdown.hold();

        match notification.control() {
            Ok(Some(ControlNotification::Cancel(id))) => self.cancel_request(&id, services),
            Ok(Some(ControlNotification::Shutdown)) => self.begin_shutdown(stop_reading),
            Ok(None) => {
                let services = services.clone();
                tokio::spawn(async move {
                    let method = notification.method.clone();
                    let result = AssertUnwindSafe(handlers::handle_notification(
                        &notification,
                        &services,
                    ))
                    .catch_unwind()
                    .await;
                    let problem = match result {
                        Ok(Ok(())) => None,
                        Ok(Err(e)) => Some(format!("{:#}", e)),
                        Err(panic) => Some(format!("handler panicked: {}", panic_message(&panic))),
                    };
                    if let Some(problem) = problem {
                        warn!(%method, "notification handler failed: {}", problem);
                        services
                            .peer
                            .log(
                                LogLevel::Warning,
                                format!("Handling {} failed: {}", method, problem),
                            )
                            .await;
                    }
                    drop(guard);
                });
                return;
            }
            Err(e) => {
                warn!(method = %notification.method, "invalid notification: {}", e);
                self.warn_client(
                    services,
                    format!("Ignored invalid {} notification: {}", notification.method, e),
                );
            }
        }
        drop(guard);
    }

    fn cancel_request(&self, id: &RequestId, services: &Services) {
        match self.ledger.cancel_inbound(id) {
            Ok(CancelOutcome::NotFound) => debug!(%id, "cancel for unknown request ignored"),
            Ok(CancelOutcome::Signalled) => debug!(%id, "cancellation signalled"),
            Ok(CancelOutcome::AlreadyRequested) => debug!(%id, "cancellation already requested"),
            Err(e) => {
                warn!(%id, "could not cancel request: {}", e);
                self.warn_client(services, format!("Could not cancel request {}: {}", id, e));
            }
        }
    }

    fn begin_shutdown(&self, stop_reading: &CancellationToken) {
        self.state.mark_closing();
        if !self.state.transition(Phase::Serving, Phase::Draining) {
            debug!("repeated exit ignored");
            return;
        }
        info!(in_flight = self.ledger.inbound_len(), "exit received, draining");
        if self.ledger.is_inbound_empty() {
            stop_reading.cancel();
        }
    }

    fn resolve_outbound(&self, id: &RequestId, outcome: Outcome) {
        if !self.ledger.resolve_outbound(id, outcome) {
            debug!(%id, "answer for unknown outbound request ignored");
        }
    }

    /// Forward a warning to the client without blocking the read loop.
    fn warn_client(&self, services: &Services, message: String) {
        let guard = self.shutdown.hold();
        let peer = services.peer.clone();
        tokio::spawn(async move {
            peer.log(LogLevel::Warning, message).await;
            drop(guard);
        });
    }
}

fn spawn_reject(peer: Peer, id: RequestId, error: ErrorObject, guard: OutstandingGuard) {
    tokio::spawn(async move {
        if let Err(e) = peer.respond_error(id, error).await {
            warn!("failed to send error response: {}", e);
        }
        drop(guard);
    });
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// One accepted request, from spawn to retirement.
struct RequestTask {
    request: Request,
    source: Arc<CancellationSource>,
    services: Services,
    ledger: Arc<RequestLedger>,
    state: Arc<SessionState>,
    process_cancel: CancellationToken,
    stop_reading: CancellationToken,
    _guard: OutstandingGuard,
}

impl RequestTask {
    async fn run(self) {
        // Let the read loop get back to the channel before any work starts.
        tokio::task::yield_now().await;

        let span = tracing::info_span!(
            "request",
            request_id = %self.request.id,
            method = %self.request.method
        );
        let result = AssertUnwindSafe(handlers::handle_request(
            &self.request,
            &self.services,
            &self.source,
        ))
        .catch_unwind()
        .instrument(span.clone())
        .await;

        let (message, outcome) = self.classify(result);
        if let Err(e) = self.services.peer.send(&message).await {
            warn!(parent: &span, "failed to send response: {}", e);
        }

        let remaining = self.ledger.retire_inbound(&self.request.id, outcome);
        if remaining == Some(0) && self.state.phase() == Phase::Draining {
            debug!(parent: &span, "last in-flight request retired");
            self.stop_reading.cancel();
        }
    }

    fn classify(
        &self,
        result: Result<Result<Value, HandlerError>, Box<dyn Any + Send>>,
    ) -> (Message, Outcome) {
        let id = self.request.id.clone();
        let error = match result {
            Ok(Ok(value)) => {
                return (Message::response(id, value.clone()), Outcome::Completed(value));
            }
            Ok(Err(err)) if err.is_cancellation() && self.source.is_cancelled() => {
                let error = self.cancelled_error();
                debug!(%id, "request cancelled");
                return (Message::error(id, error.clone()), Outcome::Cancelled(error));
            }
            Ok(Err(HandlerError::Protocol(error))) => error,
            Ok(Err(err)) => {
                let diagnostic = diagnostic_text(&err);
                warn!(%id, method = %self.request.method, "request failed: {}", diagnostic);
                ErrorObject::new(ErrorCode::InternalError, err.to_string())
                    .with_data(Value::String(diagnostic))
            }
            Err(panic) => {
                let message = panic_message(&panic);
                error!(%id, method = %self.request.method, "request handler panicked: {}", message);
                ErrorObject::new(
                    ErrorCode::InternalError,
                    format!("Request handler panicked: {}", message),
                )
                .with_data(Value::String(message))
            }
        };
        (Message::error(id, error.clone()), Outcome::Failed(error))
    }

    /// Peer-requested cancellation is reported tersely; anything else says
    /// why the host gave up on the request.
    fn cancelled_error(&self) -> ErrorObject {
        if self.source.is_cancel_requested() {
            return ErrorObject::new(ErrorCode::RequestCancelled, "Request was cancelled.");
        }
        let reason = if self.process_cancel.is_cancelled() {
            "the host process is shutting down"
        } else {
            "the session was aborted"
        };
        let diagnostic = format!("Request was cancelled because {}.", reason);
        ErrorObject::new(ErrorCode::RequestCancelled, diagnostic.clone())
            .with_data(json!({ "reason": diagnostic }))
    }
}
