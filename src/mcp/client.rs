//! MCP client: the connection state machine and protocol driver.
//!
//! A client owns one transport. Outbound requests are allocated increasing
//! integer ids and parked in a pending table; a dispatcher task consumes the
//! transport's inbound sink and resolves waiters by id. The handshake
//! (`initialize` + `notifications/initialized`) moves the client from
//! HANDSHAKING to READY; every other request requires READY.

use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use super::error::{McpError, McpResult, CODE_INTERNAL_ERROR};
use super::transport::{McpTransport, SINK_CAPACITY};
use super::types::*;

/// Default wall-clock deadline for a request.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Deadline for the best-effort `shutdown` issued during close.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(500);

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    New,
    Handshaking,
    Ready,
    /// Terminal: the server negotiated a protocol version the predicate
    /// rejected.
    Failed,
    /// Terminal: closed by request or by transport death.
    Closed,
}

/// Per-request knobs. The progress token, when supplied, rides in the
/// `_meta` envelope of the request params.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub timeout: Option<Duration>,
    pub progress_token: Option<Value>,
}

struct PendingRequest {
    method: String,
    tx: oneshot::Sender<McpResult<Value>>,
}

/// State shared with the dispatcher task.
struct Shared {
    name: String,
    state: RwLock<ClientState>,
    pending: Mutex<HashMap<i64, PendingRequest>>,
}

impl Shared {
    /// Reject every waiter still in the pending table.
    fn fail_all_pending(&self, reason: &str) {
        let drained: Vec<(i64, PendingRequest)> = self.pending.lock().drain().collect();
        for (id, pending) in drained {
            debug!(
                "[{}] rejecting pending {} (id {}): {}",
                self.name, pending.method, id, reason
            );
            let _ = pending
                .tx
                .send(Err(McpError::ConnectionClosed(reason.to_string())));
        }
    }
}

pub struct McpClient {
    shared: Arc<Shared>,
    transport: tokio::sync::Mutex<Box<dyn McpTransport>>,
    transport_kind: &'static str,
    next_id: AtomicI64,
    request_timeout: Duration,
    version_supported: Arc<dyn Fn(&str) -> bool + Send + Sync>,
    negotiated_version: RwLock<String>,
    server_capabilities: RwLock<Option<ServerCapabilities>>,
    server_info: RwLock<Option<ServerInfo>>,
    dispatcher: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for McpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpClient")
            .field("transport_kind", &self.transport_kind)
            .finish_non_exhaustive()
    }
}

impl McpClient {
    pub fn new(name: &str, transport: Box<dyn McpTransport>) -> Self {
        let transport_kind = transport.kind();
        Self {
            shared: Arc::new(Shared {
                name: name.to_string(),
                state: RwLock::new(ClientState::New),
                pending: Mutex::new(HashMap::new()),
            }),
            transport: tokio::sync::Mutex::new(transport),
            transport_kind,
            next_id: AtomicI64::new(1),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            // Permissive on purpose: the check point exists, but the default
            // predicate accepts whatever the server negotiates.
            version_supported: Arc::new(|_| true),
            negotiated_version: RwLock::new(MCP_PROTOCOL_VERSION.to_string()),
            server_capabilities: RwLock::new(None),
            server_info: RwLock::new(None),
            dispatcher: Mutex::new(None),
        }
    }

    /// Install a stricter protocol-version predicate.
    pub fn with_version_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.version_supported = Arc::new(predicate);
        self
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn transport_kind(&self) -> &'static str {
        self.transport_kind
    }

    pub fn state(&self) -> ClientState {
        *self.shared.state.read()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ClientState::Ready
    }

    pub fn server_capabilities(&self) -> Option<ServerCapabilities> {
        self.server_capabilities.read().clone()
    }

    pub fn server_info(&self) -> Option<ServerInfo> {
        self.server_info.read().clone()
    }

    pub fn negotiated_version(&self) -> String {
        self.negotiated_version.read().clone()
    }

    /// Open the transport and run the handshake. On any failure the
    /// partially-opened connection is fully torn down.
    pub async fn connect(&self) -> McpResult<()> {
        {
            let mut state = self.shared.state.write();
            if *state != ClientState::New {
                return Err(McpError::InvalidRequest(format!(
                    "client '{}' already connected",
                    self.shared.name
                )));
            }
            *state = ClientState::Handshaking;
        }

        let (sink, inbound) = mpsc::channel(SINK_CAPACITY);
        if let Err(e) = self.transport.lock().await.open(sink).await {
            *self.shared.state.write() = ClientState::Closed;
            return Err(e);
        }
        self.spawn_dispatcher(inbound);

        match self.handshake().await {
            Ok(()) => {
                *self.shared.state.write() = ClientState::Ready;
                info!(
                    "[{}] ready ({} transport, protocol {})",
                    self.shared.name,
                    self.transport_kind,
                    self.negotiated_version.read()
                );
                Ok(())
            }
            Err(e) => {
                let terminal = if matches!(e, McpError::UnsupportedProtocolVersion(_)) {
                    ClientState::Failed
                } else {
                    ClientState::Closed
                };
                *self.shared.state.write() = terminal;
                let _ = self.transport.lock().await.close().await;
                self.shared.fail_all_pending("handshake failed");
                Err(e)
            }
        }
    }

    async fn handshake(&self) -> McpResult<()> {
        let params = serde_json::to_value(InitializeParams::default())?;
        let result = self
            .send_once("initialize", Some(params), self.request_timeout)
            .await?;
        let init: InitializeResult = serde_json::from_value(result)?;

        let version = init
            .protocol_version
            .unwrap_or_else(|| MCP_PROTOCOL_VERSION.to_string());
        if !(self.version_supported)(&version) {
            return Err(McpError::UnsupportedProtocolVersion(version));
        }

        *self.negotiated_version.write() = version.clone();
        *self.server_capabilities.write() = Some(init.capabilities);
        *self.server_info.write() = init.server_info;

        let transport = self.transport.lock().await;
        transport.set_protocol_version(&version);

        // Fire-and-forget: a lost notification does not block READY.
        let note = JsonRpcNotification::new("notifications/initialized", None);
        if let Err(e) = transport.send(&serde_json::to_value(&note)?).await {
            warn!("[{}] initialized notification failed: {}", self.shared.name, e);
        }
        Ok(())
    }

    /// Re-run the handshake over the existing transport. Used after an HTTP
    /// session expires; the transport itself stays open.
    async fn rehandshake(&self) -> McpResult<()> {
        info!("[{}] session expired, re-running handshake", self.shared.name);
        *self.shared.state.write() = ClientState::Handshaking;
        match self.handshake().await {
            Ok(()) => {
                *self.shared.state.write() = ClientState::Ready;
                Ok(())
            }
            Err(e) => {
                *self.shared.state.write() = ClientState::Closed;
                let _ = self.transport.lock().await.close().await;
                self.shared.fail_all_pending("re-handshake failed");
                Err(e)
            }
        }
    }

    fn spawn_dispatcher(&self, mut inbound: mpsc::Receiver<Value>) {
        let shared = self.shared.clone();
        let handle = tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                dispatch_message(&shared, message);
            }
            // All sink senders dropped: the transport's read side is gone.
            let was_live = {
                let mut state = shared.state.write();
                match *state {
                    ClientState::Closed | ClientState::Failed => false,
                    _ => {
                        *state = ClientState::Closed;
                        true
                    }
                }
            };
            if was_live {
                warn!("[{}] transport closed", shared.name);
            }
            shared.fail_all_pending("connection closed");
        });
        *self.dispatcher.lock() = Some(handle);
    }

    /// READY guard with the handshake bypass for `initialize` and
    /// `shutdown`.
    fn check_ready(&self, method: &str) -> McpResult<()> {
        match *self.shared.state.read() {
            ClientState::Ready => Ok(()),
            ClientState::Handshaking if method == "initialize" || method == "shutdown" => Ok(()),
            _ => Err(McpError::NotConnected),
        }
    }

    /// Send a request and await its response. A transport-reported expired
    /// session triggers one transparent re-handshake and retry.
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        options: RequestOptions,
    ) -> McpResult<Value> {
        self.check_ready(method)?;
        let params = attach_meta(params, options.progress_token);
        let deadline = options.timeout.unwrap_or(self.request_timeout);

        match self.send_once(method, params.clone(), deadline).await {
            Err(McpError::SessionExpired) => {
                self.rehandshake().await?;
                self.send_once(method, params, deadline).await
            }
            other => other,
        }
    }

    async fn send_once(
        &self,
        method: &str,
        params: Option<Value>,
        deadline: Duration,
    ) -> McpResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(
            id,
            PendingRequest {
                method: method.to_string(),
                tx,
            },
        );

        let request = JsonRpcRequest::new(method, params, id);
        let message = serde_json::to_value(&request)?;
        let sent = { self.transport.lock().await.send(&message).await };
        if let Err(e) = sent {
            self.shared.pending.lock().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(McpError::ConnectionClosed(
                "connection closed before response".to_string(),
            )),
            Err(_) => {
                self.shared.pending.lock().remove(&id);
                Err(McpError::RequestTimeout(deadline.as_millis() as u64))
            }
        }
    }

    /// `tools/list`. A server that answers with no `tools` field yields the
    /// empty list.
    pub async fn list_tools(&self) -> McpResult<ToolsListResult> {
        let result = self
            .send_request("tools/list", Some(json!({})), RequestOptions::default())
            .await?;
        if result.is_null() {
            return Ok(ToolsListResult::default());
        }
        Ok(serde_json::from_value(result)?)
    }

    /// `tools/call`. Arguments are validated against `schema` before the
    /// request goes out; the result is unwrapped, and an `isError` result is
    /// surfaced as an error rather than a value.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Value>,
        schema: Option<&Value>,
    ) -> McpResult<Value> {
        if let Some(schema) = schema {
            let instance = arguments.clone().unwrap_or_else(|| json!({}));
            validate_tool_arguments(schema, &instance)?;
        }

        let params = serde_json::to_value(ToolCallParams {
            name: name.to_string(),
            arguments,
        })?;
        let result = self
            .send_request("tools/call", Some(params), RequestOptions::default())
            .await?;

        let unwrapped = unwrap_tool_result(result);
        if unwrapped
            .get("isError")
            .and_then(|b| b.as_bool())
            .unwrap_or(false)
        {
            let message = first_text_content(&unwrapped)
                .unwrap_or_else(|| format!("tool '{}' reported an error", name));
            return Err(McpError::Internal {
                message,
                data: Some(unwrapped),
            });
        }
        Ok(unwrapped)
    }

    /// Lightweight liveness probe.
    pub async fn ping(&self) -> McpResult<()> {
        self.send_request("ping", None, RequestOptions::default())
            .await
            .map(|_| ())
    }

    /// Close the connection: best-effort `shutdown`, transport teardown,
    /// and rejection of anything still pending. No-op unless the client got
    /// at least as far as the handshake.
    pub async fn close(&self) {
        {
            let state = *self.shared.state.read();
            if matches!(
                state,
                ClientState::New | ClientState::Failed | ClientState::Closed
            ) {
                return;
            }
        }

        if let Err(e) = self.send_once("shutdown", None, SHUTDOWN_TIMEOUT).await {
            debug!("[{}] shutdown request failed: {}", self.shared.name, e);
        }

        *self.shared.state.write() = ClientState::Closed;
        {
            let mut transport = self.transport.lock().await;
            if let Err(e) = transport.close().await {
                warn!("[{}] transport close failed: {}", self.shared.name, e);
            }
        }
        self.shared.fail_all_pending("connection closed");
        if let Some(handle) = self.dispatcher.lock().take() {
            handle.abort();
        }
        info!("[{}] closed", self.shared.name);
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.shared.pending.lock().len()
    }
}

/// Route one inbound frame: notification, matched response, or noise.
fn dispatch_message(shared: &Shared, message: Value) {
    let Some(id_value) = message.get("id") else {
        let method = message
            .get("method")
            .and_then(|m| m.as_str())
            .unwrap_or("<none>");
        if method == "notifications/initialized" {
            debug!("[{}] server acknowledged initialization", shared.name);
        } else {
            debug!("[{}] ignoring notification '{}'", shared.name, method);
        }
        return;
    };

    if message.get("method").is_some() {
        // A server-initiated request. The broker serves no client-side
        // methods, so it is logged and dropped.
        warn!(
            "[{}] dropping server request {:?}",
            shared.name,
            message.get("method")
        );
        return;
    }

    let Some(id) = id_value.as_i64() else {
        warn!("[{}] response with non-integer id dropped", shared.name);
        return;
    };

    let Some(pending) = shared.pending.lock().remove(&id) else {
        warn!("[{}] response for unknown id {} dropped", shared.name, id);
        return;
    };

    if let Some(error_value) = message.get("error") {
        let error: JsonRpcError = serde_json::from_value(error_value.clone()).unwrap_or(
            JsonRpcError {
                code: CODE_INTERNAL_ERROR,
                message: "malformed error object".to_string(),
                data: None,
            },
        );
        debug!(
            "[{}] {} (id {}) failed: {} {}",
            shared.name, pending.method, id, error.code, error.message
        );
        let _ = pending.tx.send(Err(McpError::Protocol {
            code: error.code,
            message: error.message,
            data: error.data,
        }));
    } else {
        let result = message.get("result").cloned().unwrap_or(Value::Null);
        let _ = pending.tx.send(Ok(result));
    }
}

/// Attach the `_meta` envelope to the params when a progress token was
/// supplied.
fn attach_meta(params: Option<Value>, progress_token: Option<Value>) -> Option<Value> {
    let Some(token) = progress_token else {
        return params;
    };
    let mut map = match params {
        Some(Value::Object(map)) => map,
        Some(other) => return Some(other),
        None => serde_json::Map::new(),
    };
    map.insert("_meta".to_string(), json!({ "progressToken": token }));
    Some(Value::Object(map))
}

/// Some servers wrap the canonical `{ content: [...] }` payload inside an
/// arbitrarily-named single-key object. Descend through single-key objects
/// until a `content` field appears or there is nothing left to descend into.
pub fn unwrap_tool_result(value: Value) -> Value {
    let mut current = value;
    loop {
        let descend = match current.as_object() {
            Some(obj) if !obj.contains_key("content") && obj.len() == 1 => {
                obj.values().next().filter(|v| v.is_object()).cloned()
            }
            _ => None,
        };
        match descend {
            Some(inner) => current = inner,
            None => return current,
        }
    }
}

/// First textual content entry of an unwrapped tool result.
fn first_text_content(node: &Value) -> Option<String> {
    node.get("content")?
        .as_array()?
        .iter()
        .find(|entry| entry.get("type").and_then(|t| t.as_str()) == Some("text"))
        .and_then(|entry| entry.get("text"))
        .and_then(|t| t.as_str())
        .map(|s| s.to_string())
}

/// Validate tool arguments against the tool's input schema. Validation is
/// delegated wholesale to the JSON Schema engine.
pub fn validate_tool_arguments(schema: &Value, arguments: &Value) -> McpResult<()> {
    let validator = jsonschema::validator_for(schema)
        .map_err(|e| McpError::InvalidParams(format!("invalid tool schema: {}", e)))?;
    let errors: Vec<String> = validator
        .iter_errors(arguments)
        .map(|e| e.to_string())
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(McpError::InvalidParams(errors.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::transport::MessageSink;

    /// In-process MCP server good enough to drive the client state machine:
    /// answers initialize/tools requests, stays silent on `slow/op`, and
    /// drops the connection on `die/now`.
    struct ScriptedTransport {
        sink: RwLock<Option<MessageSink>>,
        wrap_tool_results: bool,
        error_tool_results: bool,
        advertised_version: Option<String>,
    }

    impl ScriptedTransport {
        fn new() -> Self {
            Self {
                sink: RwLock::new(None),
                wrap_tool_results: false,
                error_tool_results: false,
                advertised_version: Some("2025-06-18".to_string()),
            }
        }
    }

    #[async_trait::async_trait]
    impl McpTransport for ScriptedTransport {
        async fn open(&mut self, sink: MessageSink) -> McpResult<()> {
            *self.sink.write() = Some(sink);
            Ok(())
        }

        async fn send(&self, message: &Value) -> McpResult<()> {
            let method = message["method"].as_str().unwrap_or("");
            let id = message.get("id").cloned().unwrap_or(Value::Null);

            let reply = match method {
                "initialize" => {
                    let mut result = json!({
                        "capabilities": { "tools": { "listChanged": false } },
                        "serverInfo": { "name": "scripted" }
                    });
                    if let Some(ref version) = self.advertised_version {
                        result["protocolVersion"] = json!(version);
                    }
                    Some(json!({ "jsonrpc": "2.0", "id": id, "result": result }))
                }
                "tools/list" => Some(json!({
                    "jsonrpc": "2.0", "id": id,
                    "result": { "tools": [
                        { "name": "echo",
                          "inputSchema": { "type": "object",
                                           "properties": { "msg": { "type": "string" } },
                                           "required": ["msg"] } }
                    ] }
                })),
                "tools/call" => {
                    let inner = if self.error_tool_results {
                        json!({ "content": [{ "type": "text", "text": "boom" }], "isError": true })
                    } else {
                        json!({ "content": [{ "type": "text", "text": "ok" }] })
                    };
                    let result = if self.wrap_tool_results {
                        json!({ "toolResults": inner })
                    } else {
                        inner
                    };
                    Some(json!({ "jsonrpc": "2.0", "id": id, "result": result }))
                }
                "slow/op" => None,
                "die/now" => {
                    self.sink.write().take();
                    None
                }
                "notifications/initialized" | "shutdown" => None,
                other => Some(json!({
                    "jsonrpc": "2.0", "id": id,
                    "error": { "code": -32601, "message": format!("unknown method {}", other) }
                })),
            };

            if let Some(reply) = reply {
                if let Some(sink) = self.sink.read().clone() {
                    tokio::spawn(async move {
                        let _ = sink.send(reply).await;
                    });
                }
            }
            Ok(())
        }

        async fn close(&mut self) -> McpResult<()> {
            self.sink.write().take();
            Ok(())
        }

        fn kind(&self) -> &'static str {
            "scripted"
        }
    }

    fn client_with(transport: ScriptedTransport) -> McpClient {
        McpClient::new("scripted", Box::new(transport))
    }

    #[tokio::test]
    async fn test_handshake_reaches_ready() {
        let client = client_with(ScriptedTransport::new());
        client.connect().await.unwrap();
        assert!(client.is_ready());
        assert_eq!(client.negotiated_version(), "2025-06-18");
        assert!(client.server_capabilities().is_some());
        assert_eq!(client.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_version_fallback_when_server_omits_it() {
        let mut transport = ScriptedTransport::new();
        transport.advertised_version = None;
        let client = client_with(transport);
        client.connect().await.unwrap();
        assert_eq!(client.negotiated_version(), MCP_PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn test_version_predicate_rejection_is_terminal() {
        let client = client_with(ScriptedTransport::new())
            .with_version_predicate(|v| v == "1999-01-01");
        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, McpError::UnsupportedProtocolVersion(_)));
        assert_eq!(client.state(), ClientState::Failed);
        assert_eq!(client.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_guard_rejects_before_connect() {
        let client = client_with(ScriptedTransport::new());
        let err = client.list_tools().await.unwrap_err();
        assert!(matches!(err, McpError::NotConnected));
    }

    #[tokio::test]
    async fn test_list_tools() {
        let client = client_with(ScriptedTransport::new());
        client.connect().await.unwrap();
        let result = client.list_tools().await.unwrap();
        assert_eq!(result.tools.len(), 1);
        assert_eq!(result.tools[0].name, "echo");
        assert_eq!(client.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_call_tool_unwraps_wrapped_result() {
        let mut transport = ScriptedTransport::new();
        transport.wrap_tool_results = true;
        let client = client_with(transport);
        client.connect().await.unwrap();

        let result = client
            .call_tool("echo", Some(json!({ "msg": "hi" })), None)
            .await
            .unwrap();
        assert_eq!(result["content"][0]["text"], "ok");
        assert!(result.get("toolResults").is_none());
    }

    #[tokio::test]
    async fn test_call_tool_surfaces_is_error() {
        let mut transport = ScriptedTransport::new();
        transport.error_tool_results = true;
        let client = client_with(transport);
        client.connect().await.unwrap();

        let err = client.call_tool("echo", Some(json!({})), None).await.unwrap_err();
        match err {
            McpError::Internal { message, data } => {
                assert_eq!(message, "boom");
                assert!(data.is_some());
            }
            other => panic!("expected Internal, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_call_tool_validates_arguments() {
        let client = client_with(ScriptedTransport::new());
        client.connect().await.unwrap();

        let schema = json!({
            "type": "object",
            "properties": { "msg": { "type": "string" } },
            "required": ["msg"]
        });
        let err = client
            .call_tool("echo", Some(json!({ "msg": 42 })), Some(&schema))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::InvalidParams(_)));
        assert_eq!(err.code(), -32602);
    }

    #[tokio::test]
    async fn test_request_ids_strictly_increase() {
        let client = client_with(ScriptedTransport::new());
        client.connect().await.unwrap();
        // initialize consumed id 1; the next two requests take 2 and 3.
        client.list_tools().await.unwrap();
        client.list_tools().await.unwrap();
        assert_eq!(client.next_id.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_timeout_removes_waiter() {
        let client = client_with(ScriptedTransport::new());
        client.connect().await.unwrap();

        let err = client
            .send_request(
                "slow/op",
                None,
                RequestOptions {
                    timeout: Some(Duration::from_millis(50)),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::RequestTimeout(_)));
        assert_eq!(client.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_server_error_resolves_waiter() {
        let client = client_with(ScriptedTransport::new());
        client.connect().await.unwrap();
        let err = client
            .send_request("no/such", None, RequestOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), -32601);
        assert_eq!(client.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_transport_death_fails_inflight_requests() {
        let client = client_with(ScriptedTransport::new());
        client.connect().await.unwrap();

        let err = client
            .send_request("die/now", None, RequestOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::ConnectionClosed(_)));
        assert_eq!(client.state(), ClientState::Closed);
        assert_eq!(client.pending_len(), 0);

        // Subsequent operations report a clean not-running error.
        let err = client.list_tools().await.unwrap_err();
        assert!(matches!(err, McpError::NotConnected));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let client = client_with(ScriptedTransport::new());
        client.connect().await.unwrap();
        client.close().await;
        assert_eq!(client.state(), ClientState::Closed);
        client.close().await;
        assert_eq!(client.state(), ClientState::Closed);
    }

    /// Transport that expires its session on the first `tools/list`, like a
    /// streamable HTTP server returning 404 for a stale `Mcp-Session-Id`.
    struct ExpiringTransport {
        inner: ScriptedTransport,
        expired_once: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl McpTransport for ExpiringTransport {
        async fn open(&mut self, sink: MessageSink) -> McpResult<()> {
            self.inner.open(sink).await
        }

        async fn send(&self, message: &Value) -> McpResult<()> {
            let method = message["method"].as_str().unwrap_or("");
            if method == "tools/list"
                && !self.expired_once.swap(true, Ordering::SeqCst)
            {
                return Err(McpError::SessionExpired);
            }
            self.inner.send(message).await
        }

        async fn close(&mut self) -> McpResult<()> {
            self.inner.close().await
        }

        fn kind(&self) -> &'static str {
            "scripted"
        }
    }

    #[tokio::test]
    async fn test_session_expiry_rehandshakes_and_retries_once() {
        let transport = ExpiringTransport {
            inner: ScriptedTransport::new(),
            expired_once: std::sync::atomic::AtomicBool::new(false),
        };
        let client = McpClient::new("expiring", Box::new(transport));
        client.connect().await.unwrap();

        // The caller sees one successful response; the expiry, the second
        // handshake, and the retry all happen underneath.
        let result = client.list_tools().await.unwrap();
        assert_eq!(result.tools.len(), 1);
        assert!(client.is_ready());
        assert_eq!(client.pending_len(), 0);
    }

    #[test]
    fn test_unwrap_idempotent() {
        let cases = vec![
            json!({ "content": [{ "type": "text", "text": "hi" }] }),
            json!({ "toolResults": { "content": [] } }),
            json!({ "a": { "b": { "content": [] } } }),
            json!({ "a": 1, "b": 2 }),
            json!([1, 2, 3]),
            json!("bare"),
            json!(null),
            json!({ "single": "leaf" }),
        ];
        for case in cases {
            let once = unwrap_tool_result(case.clone());
            let twice = unwrap_tool_result(once.clone());
            assert_eq!(once, twice, "unwrap not idempotent for {}", case);
        }
    }

    #[test]
    fn test_unwrap_strips_single_key_wrappers() {
        let wrapped = json!({ "toolResults": { "content": [{ "type": "text", "text": "ok" }] } });
        let unwrapped = unwrap_tool_result(wrapped);
        assert_eq!(unwrapped["content"][0]["text"], "ok");
    }

    #[test]
    fn test_attach_meta() {
        let params = attach_meta(Some(json!({ "name": "echo" })), Some(json!("tok-1")));
        assert_eq!(params.unwrap()["_meta"]["progressToken"], "tok-1");

        let params = attach_meta(Some(json!({ "name": "echo" })), None);
        assert!(params.unwrap().get("_meta").is_none());
    }
}
