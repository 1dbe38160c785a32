//! Method handlers.
//!
//! `initialize` is answered inline by the session during the handshake.
//! Every other request runs on its own task through [`handle_request`].

use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::context::{ExecutionContext, RequestScope, Services};
use crate::engine::{EngineError, TestSelection};
use crate::ledger::CancellationSource;
use crate::peer::PeerError;
use crate::protocol::{
    methods, parse_params, AttachDebuggerParams, DiscoverParams, DiscoverResult, ErrorCode,
    ErrorObject, InitializeParams, InitializeResult, LogLevel, LogParams, Notification, PeerInfo,
    ProtocolVersion, Request, RunParams, RunResult, ServerCapabilities, TestUpdatesParams,
    TestingCapabilities,
};

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Rejected before any work started; sent back as-is.
    #[error("{0}")]
    Protocol(ErrorObject),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error("failed to encode result: {0}")]
    Encode(#[from] serde_json::Error),
}

impl HandlerError {
    /// Whether the handler stopped because its cancellation token fired.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            HandlerError::Engine(EngineError::Cancelled)
                | HandlerError::Peer(PeerError::Cancelled { .. })
        )
    }
}

impl From<ErrorObject> for HandlerError {
    fn from(error: ErrorObject) -> Self {
        HandlerError::Protocol(error)
    }
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// Answer `initialize`. An error carrying
/// [`ErrorCode::IncompatibleProtocolVersion`] ends the session.
pub(crate) fn initialize(
    request: &Request,
    config: &SessionConfig,
) -> Result<InitializeResult, ErrorObject> {
    let params: InitializeParams = parse_params(request.params.as_ref())?;

    let server_version: ProtocolVersion = config.protocol_version.parse().map_err(|e| {
        ErrorObject::new(
            ErrorCode::InternalError,
            format!("Server protocol version is invalid: {}", e),
        )
    })?;
    let compatible = params
        .protocol_version
        .parse::<ProtocolVersion>()
        .map(|client| client.is_compatible_with(&server_version))
        .unwrap_or(false);
    if !compatible {
        return Err(ErrorObject::new(
            ErrorCode::IncompatibleProtocolVersion,
            format!(
                "Incompatible protocol version: client requested '{}', server supports '{}'.",
                params.protocol_version, server_version
            ),
        ));
    }

    info!(
        client = %params.client_info.name,
        client_version = %params.client_info.version,
        protocol_version = %params.protocol_version,
        "client initialized"
    );

    Ok(InitializeResult {
        server_info: PeerInfo {
            name: config.server_name.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
        protocol_version: server_version.to_string(),
        process_id: std::process::id(),
        module_path: config.module_path(),
        capabilities: ServerCapabilities {
            testing: TestingCapabilities {
                supports_discovery: true,
                multi_request_support: true,
                attachments_support: true,
                debugger_support: true,
            },
        },
    })
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

pub(crate) async fn handle_request(
    request: &Request,
    services: &Services,
    source: &Arc<CancellationSource>,
) -> Result<Value, HandlerError> {
    match request.method.as_str() {
        methods::DISCOVER_TESTS => discover(request, services, source).await,
        methods::RUN_TESTS => run(request, services, source).await,
        methods::INITIALIZE => Err(ErrorObject::new(
            ErrorCode::InvalidRequest,
            "Session is already initialized.",
        )
        .into()),
        other => Err(ErrorObject::new(
            ErrorCode::MethodNotFound,
            format!("Method not found: {}", other),
        )
        .into()),
    }
}

async fn discover(
    request: &Request,
    services: &Services,
    source: &Arc<CancellationSource>,
) -> Result<Value, HandlerError> {
    let params: DiscoverParams = parse_params(request.params.as_ref())?;
    let run_id = params.run_id.unwrap_or_else(Uuid::new_v4);
    let selection = TestSelection::new(params.tests, params.filter);
    let started = Instant::now();

    let mut scope = RequestScope::open(request.id.clone(), run_id, services, source.clone())?;
    let result = async { scope.engine()?.discover(&selection, scope.context()).await }
        .instrument(scope.span().clone())
        .await;
    scope.dispose();
    drain_updates(services, run_id).await;

    let metrics = result?;
    debug!(%run_id, discovered = metrics.discovered, "discovery finished");
    Ok(serde_json::to_value(DiscoverResult {
        run_id,
        discovered: metrics.discovered,
        duration_ms: started.elapsed().as_millis() as u64,
    })?)
}

async fn run(
    request: &Request,
    services: &Services,
    source: &Arc<CancellationSource>,
) -> Result<Value, HandlerError> {
    let params: RunParams = parse_params(request.params.as_ref())?;
    let run_id = params.run_id.unwrap_or_else(Uuid::new_v4);
    let selection = TestSelection::new(params.tests, params.filter);
    let started = Instant::now();

    // The completion below goes out even when no engine could be created.
    let result = match RequestScope::open(request.id.clone(), run_id, services, source.clone()) {
        Ok(mut scope) => {
            drain_updates(services, run_id).await;
            let result = async {
                if params.debug {
                    attach_debugger(services, scope.context()).await?;
                }
                Ok::<_, HandlerError>(scope.engine()?.run(&selection, scope.context()).await?)
            }
            .instrument(scope.span().clone())
            .await;
            scope.dispose();
            result
        }
        Err(e) => Err(e.into()),
    };

    drain_updates(services, run_id).await;
    let complete = TestUpdatesParams {
        run_id,
        changes: None,
    };
    if let Err(e) = services.peer.notify(methods::TEST_UPDATES, &complete).await {
        warn!(%run_id, ?e, "failed to send run completion");
    }

    let report = result?;
    let metrics = report.metrics;
    info!(
        %run_id,
        total = metrics.total,
        passed = metrics.passed,
        failed = metrics.failed,
        skipped = metrics.skipped,
        "run finished"
    );
    Ok(serde_json::to_value(RunResult {
        run_id,
        total: metrics.total,
        passed: metrics.passed,
        failed: metrics.failed,
        skipped: metrics.skipped,
        duration_ms: started.elapsed().as_millis() as u64,
        attachments: report.artifacts,
    })?)
}

async fn attach_debugger(services: &Services, ctx: &ExecutionContext) -> Result<(), HandlerError> {
    let params = AttachDebuggerParams {
        process_id: std::process::id(),
    };
    services
        .peer
        .request(methods::ATTACH_DEBUGGER, &params, ctx.cancellation())
        .await?;
    debug!(run_id = %ctx.run_id(), "debugger attached");
    Ok(())
}

/// Flush pending node updates so they reach the client before whatever
/// comes next. A timeout is logged and otherwise ignored.
async fn drain_updates(services: &Services, run_id: Uuid) {
    if let Err(e) = services.bus.drain(services.config.drain_timeout()).await {
        warn!(%run_id, "{}", e);
        services
            .peer
            .log(
                LogLevel::Warning,
                format!("Test updates for run {} may be incomplete: {}", run_id, e),
            )
            .await;
    }
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

pub(crate) async fn handle_notification(
    notification: &Notification,
    _services: &Services,
) -> anyhow::Result<()> {
    match notification.method.as_str() {
        methods::TELEMETRY_UPDATE => {
            debug!(params = ?notification.params, "client telemetry");
        }
        methods::CLIENT_LOG => {
            let params: LogParams = parse_params(notification.params.as_ref())
                .map_err(|e| anyhow::anyhow!("{}: {}", methods::CLIENT_LOG, e))?;
            info!(level = ?params.level, "client: {}", params.message);
        }
        other => {
            debug!(method = other, "ignoring unknown notification");
        }
    }
    Ok(())
}
