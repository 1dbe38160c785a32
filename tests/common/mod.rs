#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use testhost::channel::{memory_pair, MemoryPeer};
use testhost::config::SessionConfig;
use testhost::context::ExecutionContext;
use testhost::engine::{
    DiscoveryMetrics, EngineError, RunMetrics, RunReport, TestEngine, TestEngineFactory,
    TestSelection,
};
use testhost::hooks::{HookContext, SessionLifetimeHook};
use testhost::ledger::RequestLedger;
use testhost::protocol::{methods, ErrorObject, Message, NodeState, RequestId, TestNode};
use testhost::session::SessionState;
use testhost::shutdown::ShutdownCoordinator;
use testhost::{ExitStatus, ProtocolSession};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Config with short timeouts so failing tests fail fast.
pub fn test_config() -> SessionConfig {
    SessionConfig {
        handshake_timeout_ms: 5_000,
        drain_timeout_ms: 2_000,
        shutdown_timeout_ms: 5_000,
        outbound_request_timeout_ms: 2_000,
        ..SessionConfig::default()
    }
}

// ---------------------------------------------------------------------------
// Scripted engine
// ---------------------------------------------------------------------------

/// What every engine created by a [`ScriptedFactory`] does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Report `t1` as in progress then passed, and return.
    Succeed,
    /// Wait for a permit from [`ScriptedFactory::release`] or cancellation.
    Block,
    Fail,
    Panic,
    /// The factory refuses to create an engine at all.
    Unavailable,
}

/// One engine call, recorded in the order engines were entered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub engine: usize,
    pub operation: &'static str,
    pub request_id: RequestId,
}

#[derive(Default)]
struct Shared {
    created: AtomicUsize,
    dropped: AtomicUsize,
    invocations: Mutex<Vec<Invocation>>,
}

pub struct ScriptedFactory {
    behavior: Behavior,
    shared: Arc<Shared>,
    gate: Arc<Semaphore>,
}

impl ScriptedFactory {
    pub fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            shared: Arc::new(Shared::default()),
            gate: Arc::new(Semaphore::new(0)),
        })
    }

    /// Let `n` blocked engine calls finish successfully.
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    pub fn created(&self) -> usize {
        self.shared.created.load(Ordering::SeqCst)
    }

    pub fn dropped(&self) -> usize {
        self.shared.dropped.load(Ordering::SeqCst)
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.shared.invocations.lock().clone()
    }

    /// Wait until `n` engine calls have started.
    pub async fn wait_entered(&self, n: usize) {
        tokio::time::timeout(RECV_TIMEOUT, async {
            while self.shared.invocations.lock().len() < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("fewer than {} engine calls started", n));
    }
}

impl TestEngineFactory for ScriptedFactory {
    fn create(&self) -> Result<Box<dyn TestEngine>, EngineError> {
        if self.behavior == Behavior::Unavailable {
            return Err(EngineError::Failed("engine unavailable".into()));
        }
        let id = self.shared.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedEngine {
            id,
            behavior: self.behavior,
            shared: self.shared.clone(),
            gate: self.gate.clone(),
        }))
    }
}

struct ScriptedEngine {
    id: usize,
    behavior: Behavior,
    shared: Arc<Shared>,
    gate: Arc<Semaphore>,
}

impl ScriptedEngine {
    async fn perform(
        &self,
        operation: &'static str,
        ctx: &ExecutionContext,
    ) -> Result<(), EngineError> {
        self.shared.invocations.lock().push(Invocation {
            engine: self.id,
            operation,
            request_id: ctx.request_id().clone(),
        });
        match self.behavior {
            Behavior::Succeed => Ok(()),
            Behavior::Block => {
                tokio::select! {
                    permit = self.gate.acquire() => {
                        permit.map_err(|e| EngineError::Failed(e.to_string()))?.forget();
                        Ok(())
                    }
                    _ = ctx.cancellation().cancelled() => Err(EngineError::Cancelled),
                }
            }
            Behavior::Fail => Err(EngineError::Failed("scripted failure".into())),
            Behavior::Panic => panic!("scripted panic"),
            Behavior::Unavailable => unreachable!("no engine is ever created"),
        }
    }
}

pub fn node(uid: &str, state: NodeState) -> TestNode {
    TestNode {
        uid: uid.to_string(),
        display_name: uid.to_string(),
        state,
        duration_ms: None,
        message: None,
    }
}

#[async_trait]
impl TestEngine for ScriptedEngine {
    async fn discover(
        &self,
        _selection: &TestSelection,
        ctx: &ExecutionContext,
    ) -> Result<DiscoveryMetrics, EngineError> {
        self.perform("discover", ctx).await?;
        ctx.report(node("t1", NodeState::Discovered));
        Ok(DiscoveryMetrics { discovered: 1 })
    }

    async fn run(
        &self,
        _selection: &TestSelection,
        ctx: &ExecutionContext,
    ) -> Result<RunReport, EngineError> {
        ctx.report(node("t1", NodeState::InProgress));
        self.perform("run", ctx).await?;
        ctx.report(node("t1", NodeState::Passed));
        Ok(RunReport {
            metrics: RunMetrics {
                total: 1,
                passed: 1,
                failed: 0,
                skipped: 0,
            },
            artifacts: Vec::new(),
        })
    }
}

impl Drop for ScriptedEngine {
    fn drop(&mut self) {
        self.shared.dropped.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Hooks
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct CountingHook {
    pub starts: AtomicUsize,
    pub ends: AtomicUsize,
}

#[async_trait]
impl SessionLifetimeHook for CountingHook {
    fn name(&self) -> &str {
        "counting"
    }

    async fn on_session_start(&self, _ctx: &HookContext) -> anyhow::Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_session_end(&self, _ctx: &HookContext) -> anyhow::Result<()> {
        self.ends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Scripted client
// ---------------------------------------------------------------------------

/// A running session and the handles tests inspect it through.
pub struct TestHost {
    pub client: TestClient,
    pub status: JoinHandle<ExitStatus>,
    pub process_cancel: CancellationToken,
    pub ledger: Arc<RequestLedger>,
    pub shutdown: ShutdownCoordinator,
    pub state: Arc<SessionState>,
}

impl TestHost {
    pub fn start(config: SessionConfig, engines: Arc<dyn TestEngineFactory>) -> Self {
        Self::start_with(config, engines, |session| session)
    }

    pub fn start_with(
        config: SessionConfig,
        engines: Arc<dyn TestEngineFactory>,
        customize: impl FnOnce(ProtocolSession) -> ProtocolSession,
    ) -> Self {
        let process_cancel = CancellationToken::new();
        let session = customize(ProtocolSession::new(config, engines, process_cancel.clone()));
        let ledger = session.ledger();
        let shutdown = session.shutdown_coordinator();
        let state = session.state();
        let (channel, peer) = memory_pair();
        let status = tokio::spawn(session.run(channel));
        Self {
            client: TestClient::new(peer),
            status,
            process_cancel,
            ledger,
            shutdown,
            state,
        }
    }

    /// Wait for the session to end.
    pub async fn finish(&mut self) -> ExitStatus {
        tokio::time::timeout(Duration::from_secs(15), &mut self.status)
            .await
            .expect("session did not end")
            .expect("session task panicked")
    }
}

pub struct TestClient {
    peer: MemoryPeer,
    /// Responses read while waiting for a different id.
    responses: HashMap<RequestId, Message>,
    /// Notifications and server requests, in arrival order.
    pub received: Vec<Message>,
}

impl TestClient {
    pub fn new(peer: MemoryPeer) -> Self {
        Self {
            peer,
            responses: HashMap::new(),
            received: Vec::new(),
        }
    }

    pub fn send(&self, message: Message) {
        self.peer.send(message).expect("session stopped reading");
    }

    pub fn request(&self, id: i64, method: &str, params: Value) {
        self.send(Message::request(id, method, Some(params)));
    }

    pub fn notify(&self, method: &str, params: Value) {
        self.send(Message::notification(method, Some(params)));
    }

    pub fn cancel(&self, id: i64) {
        self.notify(methods::CANCEL_REQUEST, json!({ "id": id }));
    }

    pub fn exit(&self) {
        self.send(Message::notification(methods::EXIT, None));
    }

    /// End the stream without sending `exit`.
    pub fn close(&mut self) {
        self.peer.close();
    }

    pub async fn recv(&mut self) -> Message {
        tokio::time::timeout(RECV_TIMEOUT, self.peer.recv())
            .await
            .expect("timed out waiting for a message")
            .expect("session closed its writer")
    }

    /// Read until the response for `id` arrives.
    pub async fn response(&mut self, id: i64) -> Message {
        let id = RequestId::Number(id);
        if let Some(message) = self.responses.remove(&id) {
            return message;
        }
        loop {
            let message = self.recv().await;
            let answered = match &message {
                Message::Response(r) => Some(r.id.clone()),
                Message::Error(e) => Some(e.id.clone()),
                _ => None,
            };
            match answered {
                Some(answered) if answered == id => return message,
                Some(answered) => {
                    self.responses.insert(answered, message);
                }
                None => self.received.push(message),
            }
        }
    }

    /// Read until the response for `id` arrives and return its result.
    pub async fn result(&mut self, id: i64) -> Value {
        match self.response(id).await {
            Message::Response(r) => r.result,
            other => panic!("expected a result for {}, got {:?}", id, other),
        }
    }

    /// Read until the response for `id` arrives and return its error.
    pub async fn error(&mut self, id: i64) -> ErrorObject {
        match self.response(id).await {
            Message::Error(e) => e.error,
            other => panic!("expected an error for {}, got {:?}", id, other),
        }
    }

    /// Read until the server sends a request for `method`.
    pub async fn server_request(&mut self, method: &str) -> (RequestId, Option<Value>) {
        loop {
            match self.recv().await {
                Message::Request(r) if r.method == method => return (r.id, r.params),
                Message::Response(r) => {
                    self.responses.insert(r.id.clone(), Message::Response(r));
                }
                Message::Error(e) => {
                    self.responses.insert(e.id.clone(), Message::Error(e));
                }
                other => self.received.push(other),
            }
        }
    }

    pub async fn initialize_with_version(&mut self, version: &str) -> Message {
        self.request(
            0,
            methods::INITIALIZE,
            json!({
                "clientInfo": { "name": "test-client", "version": "0.0.1" },
                "protocolVersion": version,
            }),
        );
        self.response(0).await
    }

    pub async fn initialize(&mut self) -> Value {
        match self.initialize_with_version("1.0.0").await {
            Message::Response(r) => r.result,
            other => panic!("initialize failed: {:?}", other),
        }
    }

    /// Collect whatever has already arrived without waiting.
    pub fn drain_pending(&mut self) {
        while let Some(message) = self.peer.try_recv() {
            self.received.push(message);
        }
    }

    /// Notifications received so far for `method`, as their params.
    pub fn notifications(&self, method: &str) -> Vec<Value> {
        self.received
            .iter()
            .filter_map(|m| match m {
                Message::Notification(n) if n.method == method => {
                    Some(n.params.clone().unwrap_or(Value::Null))
                }
                _ => None,
            })
            .collect()
    }
}
