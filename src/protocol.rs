//! JSON-RPC message model for the test host session protocol.
//!
//! Every message on the wire is a JSON-RPC 2.0 envelope. Incoming envelopes
//! are classified into exactly one [`Message`] variant; anything that does
//! not fit is a [`ProtocolError`] and is skipped by the session.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub const JSONRPC_VERSION: &str = "2.0";

/// Protocol version spoken by this server unless overridden by config.
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Method names used on the wire.
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const DISCOVER_TESTS: &str = "testing/discoverTests";
    pub const RUN_TESTS: &str = "testing/runTests";
    pub const CANCEL_REQUEST: &str = "$/cancelRequest";
    pub const EXIT: &str = "exit";
    pub const TEST_UPDATES: &str = "testing/testUpdates/tests";
    pub const CLIENT_LOG: &str = "client/log";
    pub const TELEMETRY_UPDATE: &str = "telemetry/update";
    pub const ATTACH_DEBUGGER: &str = "client/attachDebugger";
}

// ---------------------------------------------------------------------------
// Identifiers and errors
// ---------------------------------------------------------------------------

/// A JSON-RPC request id. Integers and strings are both accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::String(s) => write!(f, "\"{}\"", s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        RequestId::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::String(s.to_owned())
    }
}

/// Error codes this server emits and understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    /// Also used for unclassified failures.
    InternalError,
    ServerNotInitialized,
    IncompatibleProtocolVersion,
    RequestCancelled,
}

impl ErrorCode {
    pub fn code(self) -> i64 {
        match self {
            ErrorCode::ParseError => -32700,
            ErrorCode::InvalidRequest => -32600,
            ErrorCode::MethodNotFound => -32601,
            ErrorCode::InvalidParams => -32602,
            ErrorCode::InternalError => -32603,
            ErrorCode::ServerNotInitialized => -32002,
            ErrorCode::IncompatibleProtocolVersion => -32010,
            ErrorCode::RequestCancelled => -32800,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            -32700 => Some(ErrorCode::ParseError),
            -32600 => Some(ErrorCode::InvalidRequest),
            -32601 => Some(ErrorCode::MethodNotFound),
            -32602 => Some(ErrorCode::InvalidParams),
            -32603 => Some(ErrorCode::InternalError),
            -32002 => Some(ErrorCode::ServerNotInitialized),
            -32010 => Some(ErrorCode::IncompatibleProtocolVersion),
            -32800 => Some(ErrorCode::RequestCancelled),
            _ => None,
        }
    }
}

/// Error payload carried by an [`ErrorResponse`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// The known error code, if this is one of ours.
    pub fn kind(&self) -> Option<ErrorCode> {
        ErrorCode::from_code(self.code)
    }
}

impl fmt::Display for ErrorObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

// ---------------------------------------------------------------------------
// Envelope types
// ---------------------------------------------------------------------------

/// A call that expects exactly one terminal reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    pub params: Option<Value>,
}

/// A one-way message; never answered.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Option<Value>,
}

/// Successful reply to a prior [`Request`].
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: RequestId,
    pub result: Value,
}

/// Failed or cancelled reply to a prior [`Request`].
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorResponse {
    pub id: RequestId,
    pub error: ErrorObject,
}

/// Every message that can travel over the channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Notification(Notification),
    Response(Response),
    Error(ErrorResponse),
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("message is not a JSON object")]
    NotAnObject,
    #[error("unsupported jsonrpc version: {0}")]
    BadVersion(String),
    #[error("request id must be an integer or a string")]
    InvalidId,
    #[error("method must be a string")]
    InvalidMethod,
    #[error("malformed error object: {0}")]
    InvalidError(serde_json::Error),
    #[error("message is neither a request, notification, response nor error")]
    Unclassifiable,
}

impl Message {
    pub fn request(id: impl Into<RequestId>, method: &str, params: Option<Value>) -> Self {
        Message::Request(Request {
            id: id.into(),
            method: method.to_owned(),
            params,
        })
    }

    pub fn notification(method: &str, params: Option<Value>) -> Self {
        Message::Notification(Notification {
            method: method.to_owned(),
            params,
        })
    }

    pub fn response(id: RequestId, result: Value) -> Self {
        Message::Response(Response { id, result })
    }

    pub fn error(id: RequestId, error: ErrorObject) -> Self {
        Message::Error(ErrorResponse { id, error })
    }

    /// The id this message carries or answers, if any.
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Message::Request(r) => Some(&r.id),
            Message::Notification(_) => None,
            Message::Response(r) => Some(&r.id),
            Message::Error(e) => Some(&e.id),
        }
    }

    /// Classify a decoded JSON-RPC envelope.
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let Value::Object(mut map) = value else {
            return Err(ProtocolError::NotAnObject);
        };

        match map.remove("jsonrpc") {
            Some(Value::String(v)) if v == JSONRPC_VERSION => {}
            Some(other) => return Err(ProtocolError::BadVersion(other.to_string())),
            None => return Err(ProtocolError::BadVersion("<missing>".to_owned())),
        }

        let id = match map.remove("id") {
            None | Some(Value::Null) => None,
            Some(raw) => Some(
                serde_json::from_value::<RequestId>(raw).map_err(|_| ProtocolError::InvalidId)?,
            ),
        };
        let params = map.remove("params");

        if let Some(method) = map.remove("method") {
            let Value::String(method) = method else {
                return Err(ProtocolError::InvalidMethod);
            };
            return Ok(match id {
                Some(id) => Message::Request(Request { id, method, params }),
                None => Message::Notification(Notification { method, params }),
            });
        }

        let id = id.ok_or(ProtocolError::Unclassifiable)?;
        if let Some(error) = map.remove("error") {
            let error: ErrorObject =
                serde_json::from_value(error).map_err(ProtocolError::InvalidError)?;
            return Ok(Message::Error(ErrorResponse { id, error }));
        }
        match map.remove("result") {
            Some(result) => Ok(Message::Response(Response { id, result })),
            None => Err(ProtocolError::Unclassifiable),
        }
    }

    pub fn from_slice(body: &[u8]) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_slice(body)?;
        Self::from_value(value)
    }

    /// Render this message as a JSON-RPC envelope.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("jsonrpc".to_owned(), Value::from(JSONRPC_VERSION));
        match self {
            Message::Request(r) => {
                map.insert("id".to_owned(), id_value(&r.id));
                map.insert("method".to_owned(), Value::from(r.method.as_str()));
                if let Some(params) = &r.params {
                    map.insert("params".to_owned(), params.clone());
                }
            }
            Message::Notification(n) => {
                map.insert("method".to_owned(), Value::from(n.method.as_str()));
                if let Some(params) = &n.params {
                    map.insert("params".to_owned(), params.clone());
                }
            }
            Message::Response(r) => {
                map.insert("id".to_owned(), id_value(&r.id));
                map.insert("result".to_owned(), r.result.clone());
            }
            Message::Error(e) => {
                map.insert("id".to_owned(), id_value(&e.id));
                let mut error = json!({ "code": e.error.code, "message": e.error.message });
                if let (Some(data), Value::Object(obj)) = (&e.error.data, &mut error) {
                    obj.insert("data".to_owned(), data.clone());
                }
                map.insert("error".to_owned(), error);
            }
        }
        Value::Object(map)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.to_value())
    }
}

fn id_value(id: &RequestId) -> Value {
    match id {
        RequestId::Number(n) => Value::from(*n),
        RequestId::String(s) => Value::from(s.as_str()),
    }
}

/// Protocol-level notifications the session itself acts on.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlNotification {
    Cancel(RequestId),
    Shutdown,
}

impl Notification {
    /// Returns `Ok(None)` for domain-level notifications.
    pub fn control(&self) -> Result<Option<ControlNotification>, ErrorObject> {
        match self.method.as_str() {
            methods::CANCEL_REQUEST => {
                let params: CancelParams = parse_params(self.params.as_ref())?;
                Ok(Some(ControlNotification::Cancel(params.id)))
            }
            methods::EXIT => Ok(Some(ControlNotification::Shutdown)),
            _ => Ok(None),
        }
    }
}

/// Parse method params, treating absent params as an empty object.
pub fn parse_params<T: DeserializeOwned>(params: Option<&Value>) -> Result<T, ErrorObject> {
    let params = params
        .cloned()
        .unwrap_or_else(|| Value::Object(Default::default()));
    serde_json::from_value(params).map_err(|e| {
        ErrorObject::new(ErrorCode::InvalidParams, format!("Invalid params: {}.", e))
    })
}

// ---------------------------------------------------------------------------
// Protocol version
// ---------------------------------------------------------------------------

/// A `MAJOR.MINOR.PATCH` protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ProtocolVersion {
    /// Versions agree when major and minor match; patch is informational.
    pub fn is_compatible_with(&self, other: &ProtocolVersion) -> bool {
        self.major == other.major && self.minor == other.minor
    }
}

impl FromStr for ProtocolVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().split('.');
        let mut next = |name: &str| -> Result<u32, String> {
            parts
                .next()
                .ok_or_else(|| format!("missing {} component in '{}'", name, s))?
                .parse::<u32>()
                .map_err(|e| format!("invalid {} component in '{}': {}", name, s, e))
        };
        let version = ProtocolVersion {
            major: next("major")?,
            minor: next("minor")?,
            patch: next("patch")?,
        };
        if parts.next().is_some() {
            return Err(format!("too many components in '{}'", s));
        }
        Ok(version)
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

// ---------------------------------------------------------------------------
// Method-specific param and result types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub name: String,
    pub version: String,
}

/// Parameters for `initialize`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub client_info: PeerInfo,
    pub protocol_version: String,
    #[serde(default)]
    pub process_id: Option<u32>,
    #[serde(default)]
    pub module_path: Option<String>,
    #[serde(default)]
    pub capabilities: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestingCapabilities {
    pub supports_discovery: bool,
    pub multi_request_support: bool,
    pub attachments_support: bool,
    pub debugger_support: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerCapabilities {
    pub testing: TestingCapabilities,
}

/// Result of a successful `initialize`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub server_info: PeerInfo,
    pub protocol_version: String,
    pub process_id: u32,
    pub module_path: String,
    pub capabilities: ServerCapabilities,
}

/// Parameters for `$/cancelRequest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelParams {
    pub id: RequestId,
}

/// Reference to a single test node by uid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRef {
    pub uid: String,
}

/// Parameters for `testing/discoverTests`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoverParams {
    #[serde(default)]
    pub run_id: Option<Uuid>,
    #[serde(default)]
    pub tests: Option<Vec<TestRef>>,
    #[serde(default)]
    pub filter: Option<String>,
}

/// Parameters for `testing/runTests`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunParams {
    #[serde(default)]
    pub run_id: Option<Uuid>,
    #[serde(default)]
    pub tests: Option<Vec<TestRef>>,
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoverResult {
    pub run_id: Uuid,
    pub discovered: u64,
    pub duration_ms: u64,
}

/// A file or other output produced by a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub uri: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub run_id: Uuid,
    pub total: u64,
    pub passed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub duration_ms: u64,
    pub attachments: Vec<Artifact>,
}

/// Execution state of a test node as reported to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeState {
    Discovered,
    InProgress,
    Passed,
    Failed,
    Skipped,
    TimedOut,
    Cancelled,
}

impl NodeState {
    /// Whether this state is a final outcome for the node.
    pub fn is_terminal(self) -> bool {
        !matches!(self, NodeState::Discovered | NodeState::InProgress)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestNode {
    pub uid: String,
    pub display_name: String,
    pub state: NodeState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// One entry of a `testing/testUpdates/tests` notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeChange {
    pub node: TestNode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

/// Parameters of `testing/testUpdates/tests`. `changes: null` marks the
/// end of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestUpdatesParams {
    pub run_id: Uuid,
    pub changes: Option<Vec<NodeChange>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
}

/// Parameters of `client/log`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogParams {
    pub level: LogLevel,
    pub message: String,
}

/// Parameters of `client/attachDebugger`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachDebuggerParams {
    pub process_id: u32,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
