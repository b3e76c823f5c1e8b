//! Tool-Call Endpoint
//!
//! JSON-RPC 2.0 over `POST /rpc` plus an SSE heartbeat stream on `GET /rpc`,
//! exposing a curated tool catalogue to an external tool-calling agent. Tool
//! execution is delegated to the same capability table the relay dispatches
//! into; the endpoint itself is stateless across requests.
//!
//! Every tool failure - unknown name, bad arguments, handler error - is
//! reported as `isError: true` content. Transport-level JSON-RPC errors are
//! reserved for malformed requests and unknown methods, and a notification
//! (no `id`) never gets a body, even then.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::get,
    Json, Router,
};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use stomplink_core::capability::CapabilityTable;
use stomplink_core::error::ServerError;
use stomplink_core::protocol::{rpc_codes, JsonRpcRequest, JsonRpcResponse};

use crate::config::{defaults, RpcConfig};

/// Protocol revision reported by `initialize`.
const PROTOCOL_VERSION: &str = "2025-06-18";

/// What a tool call dispatches into on the capability table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "channel", rename_all = "lowercase")]
pub enum ToolTarget {
    /// A query; its value becomes the tool's text content.
    Query(String),
    /// An action; success reports `"ok"`.
    Action(String),
}

/// One entry of the static tool catalogue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
    #[serde(skip)]
    pub target: Option<ToolTarget>,
}

/// The curated tool catalogue. Configuration, not logic: built once by the
/// host and handed to [`RpcServer`].
#[derive(Debug, Clone, Default)]
pub struct ToolSet {
    tools: Vec<ToolSpec>,
}

impl ToolSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool backed by a capability query.
    pub fn query_tool(
        mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        channel: impl Into<String>,
    ) -> Self {
        self.tools.push(ToolSpec {
            name: name.into(),
            description: description.into(),
            input_schema,
            target: Some(ToolTarget::Query(channel.into())),
        });
        self
    }

    /// Add a tool backed by a capability action.
    pub fn action_tool(
        mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        channel: impl Into<String>,
    ) -> Self {
        self.tools.push(ToolSpec {
            name: name.into(),
            description: description.into(),
            input_schema,
            target: Some(ToolTarget::Action(channel.into())),
        });
        self
    }

    fn find(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.iter().find(|t| t.name == name)
    }

    fn catalogue(&self) -> Value {
        json!({ "tools": self.tools })
    }
}

/// State shared across endpoint handlers.
#[derive(Clone)]
struct RpcState {
    caps: Arc<dyn CapabilityTable>,
    tools: Arc<ToolSet>,
    heartbeat: Duration,
}

struct Running {
    shutdown_tx: broadcast::Sender<()>,
    join: JoinHandle<()>,
}

/// The tool-call endpoint server.
pub struct RpcServer {
    state: RpcState,
    config: RpcConfig,
    running: Mutex<Option<Running>>,
}

impl RpcServer {
    pub fn new(caps: Arc<dyn CapabilityTable>, tools: ToolSet, config: RpcConfig) -> Self {
        let state = RpcState {
            caps,
            tools: Arc::new(tools),
            heartbeat: config.heartbeat_interval(),
        };
        Self {
            state,
            config,
            running: Mutex::new(None),
        }
    }

    /// Bind and start serving. Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr, ServerError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(ServerError::AlreadyRunning);
        }

        let listener = TcpListener::bind(&self.config.bind)
            .await
            .map_err(|source| ServerError::Bind {
                addr: self.config.bind.clone(),
                source,
            })?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let app = Router::new()
            .route(
                defaults::RPC_PATH,
                get(sse_handler).post(rpc_post_handler),
            )
            .route("/health", get(health_handler))
            .with_state(self.state.clone())
            .layer(crate::permissive_cors());

        let mut shutdown_rx = shutdown_tx.subscribe();
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        });

        info!(%addr, "tool-call endpoint listening");

        let join = tokio::spawn(async move {
            if let Err(e) = server.await {
                error!(error = %e, "tool-call endpoint error");
            }
        });

        *running = Some(Running { shutdown_tx, join });
        Ok(addr)
    }

    /// Stop serving. Idempotent.
    pub async fn stop(&self) {
        let running = self.running.lock().await.take();
        let Some(running) = running else {
            return;
        };
        let _ = running.shutdown_tx.send(());
        if let Err(e) = running.join.await {
            if e.is_panic() {
                error!("tool-call endpoint task panicked during shutdown");
            }
        }
        info!("tool-call endpoint stopped");
    }
}

async fn health_handler() -> (StatusCode, &'static str) {
    (StatusCode::OK, "Tool-call endpoint is healthy")
}

async fn rpc_post_handler(State(state): State<RpcState>, body: String) -> Response {
    match dispatch(&state, &body).await {
        Some(response) => Json(response).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

/// Dispatch one JSON-RPC request. Returns `None` when no body is owed (the
/// request was a notification), which the HTTP layer maps to 204.
async fn dispatch(state: &RpcState, body: &str) -> Option<Value> {
    let raw: Value = match serde_json::from_str(body) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(error = %e, "unparseable JSON-RPC body");
            return Some(failure(Value::Null, rpc_codes::PARSE_ERROR, "parse error"));
        }
    };

    let request: JsonRpcRequest = match serde_json::from_value(raw) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "malformed JSON-RPC request");
            return Some(failure(
                Value::Null,
                rpc_codes::INVALID_REQUEST,
                "invalid request",
            ));
        }
    };

    let notification = request.is_notification();
    let id = request.id.clone().unwrap_or(Value::Null);

    if request.jsonrpc != "2.0" {
        if notification {
            return None;
        }
        return Some(failure(id, rpc_codes::INVALID_REQUEST, "invalid request"));
    }

    let result = match request.method.as_str() {
        "initialize" => initialize_result(),
        "tools/list" => state.tools.catalogue(),
        "tools/call" => {
            let call = call_tool(state, request.params.unwrap_or(Value::Null)).await;
            if notification {
                return None;
            }
            call
        }
        "notifications/initialized" => {
            debug!("tool agent initialized");
            if notification {
                return None;
            }
            json!({})
        }
        other => {
            warn!(method = %other, "unknown JSON-RPC method");
            if notification {
                return None;
            }
            return Some(failure(id, rpc_codes::METHOD_NOT_FOUND, "method not found"));
        }
    };

    if notification {
        return None;
    }
    match serde_json::to_value(JsonRpcResponse::success(id.clone(), result)) {
        Ok(value) => Some(value),
        Err(e) => {
            error!(error = %e, "failed to encode JSON-RPC response");
            Some(failure(id, rpc_codes::INTERNAL_ERROR, "internal error"))
        }
    }
}

fn failure(id: Value, code: i64, message: &str) -> Value {
    serde_json::to_value(JsonRpcResponse::failure(id, code, message)).unwrap_or_else(|_| {
        // JsonRpcResponse is plain data; encoding it cannot realistically
        // fail, but the endpoint must never panic on behalf of a caller.
        json!({ "jsonrpc": "2.0", "id": null, "error": { "code": code, "message": message } })
    })
}

fn initialize_result() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": { "tools": { "listChanged": false } },
        "serverInfo": {
            "name": "stomplink",
            "version": env!("CARGO_PKG_VERSION"),
        },
        "instructions": "Tools drive the pedal host's control surface; state changes are observable on the relay's event stream."
    })
}

/// Execute `tools/call`. Always produces a tool-result value; failures are
/// `isError: true` content, never a transport error.
async fn call_tool(state: &RpcState, params: Value) -> Value {
    let Some(name) = params.get("name").and_then(Value::as_str) else {
        return tool_error_result("missing tool name".to_string());
    };
    let arguments = params
        .get("arguments")
        .cloned()
        .unwrap_or_else(|| json!({}));

    let Some(tool) = state.tools.find(name) else {
        warn!(tool = %name, "unknown tool requested");
        return tool_error_result(format!("unknown tool: {name}"));
    };

    let outcome = match &tool.target {
        Some(ToolTarget::Query(channel)) => state
            .caps
            .query(channel, vec![arguments])
            .await
            .map(render_text),
        Some(ToolTarget::Action(channel)) => state
            .caps
            .action(channel, arguments)
            .await
            .map(|()| "ok".to_string()),
        None => {
            error!(tool = %name, "tool has no capability target");
            return tool_error_result(format!("tool '{name}' is not wired to a capability"));
        }
    };

    match outcome {
        Ok(text) => tool_text_result(text),
        Err(e) => tool_error_result(e.to_string()),
    }
}

fn render_text(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => serde_json::to_string_pretty(&other).unwrap_or_default(),
    }
}

fn tool_text_result(text: String) -> Value {
    json!({
        "content": [{ "type": "text", "text": text }],
        "isError": false
    })
}

fn tool_error_result(text: String) -> Value {
    json!({
        "content": [{ "type": "text", "text": text }],
        "isError": true
    })
}

/// Logs when the heartbeat stream is dropped, i.e. the client went away and
/// the interval timer with it.
struct HeartbeatGuard;

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        debug!("SSE client disconnected, heartbeat timer released");
    }
}

/// `GET /rpc`: long-lived `text/event-stream` carrying a comment heartbeat on
/// a fixed interval so intermediaries keep the connection open. The timer is
/// owned by the stream and dropped with it on disconnect.
async fn sse_handler(
    State(state): State<RpcState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    debug!("SSE client connected");
    let interval = tokio::time::interval(state.heartbeat);
    let stream = futures::stream::unfold(
        (interval, HeartbeatGuard),
        |(mut interval, guard)| async move {
            interval.tick().await;
            Some((Ok(Event::default().comment("heartbeat")), (interval, guard)))
        },
    );
    Sse::new(stream)
}
