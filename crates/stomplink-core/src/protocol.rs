//! Wire Protocol Types
//!
//! Messages exchanged between the relay server and remote proxies, plus the
//! JSON-RPC 2.0 structures used by the tool-call endpoint. Wire messages are
//! UTF-8 JSON text frames using serde's internally-tagged representation
//! (`"type": "..."` field).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Channel name under which audio passthrough frames are dispatched to
/// subscribers.
pub const AUDIO_DATA_CHANNEL: &str = "audioData";

/// Channel name under which shader passthrough frames are dispatched to
/// subscribers.
pub const SHADER_UPDATE_CHANNEL: &str = "shaderUpdate";

/// A control-plane message carried over the relay WebSocket.
///
/// `Send`/`Invoke` travel client → server, `Response`/`Event` and the
/// visualizer passthrough variants travel server → client. All variants share
/// one socket; ordering is guaranteed per connection, not across connections.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum WireMessage {
    /// Fire-and-forget command. No acknowledgement is ever produced.
    #[serde(rename = "ipc-send")]
    Send {
        channel: String,
        #[serde(default)]
        data: Value,
    },

    /// Correlated request. Exactly one `Response` with the same `request_id`
    /// is owed by the server.
    #[serde(rename = "ipc-invoke")]
    Invoke {
        channel: String,
        #[serde(default)]
        args: Vec<Value>,
        #[serde(rename = "requestId")]
        request_id: u64,
    },

    /// Reply to an `Invoke`. `result` and `error` are mutually exclusive;
    /// both fields are always present on the wire (explicit `null`).
    #[serde(rename = "ipc-response")]
    Response {
        #[serde(rename = "requestId")]
        request_id: u64,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<String>,
    },

    /// Server-push state-change notification, dispatched to channel
    /// subscribers on the client side.
    #[serde(rename = "ipc-event")]
    Event {
        channel: String,
        #[serde(default)]
        data: Value,
    },

    /// Visualizer audio frame, structurally distinct from `Event` but carried
    /// on the same socket.
    #[serde(rename = "audioData")]
    AudioData { payload: Value },

    /// Visualizer shader update, same carriage as `AudioData`.
    #[serde(rename = "shaderUpdate")]
    ShaderUpdate { payload: Value },
}

impl WireMessage {
    /// Build an `Event` message.
    pub fn event(channel: impl Into<String>, data: Value) -> Self {
        WireMessage::Event {
            channel: channel.into(),
            data,
        }
    }

    /// Build a `Response` carrying a result.
    pub fn response_ok(request_id: u64, result: Value) -> Self {
        WireMessage::Response {
            request_id,
            result: Some(result),
            error: None,
        }
    }

    /// Build a `Response` carrying an error.
    pub fn response_err(request_id: u64, error: impl Into<String>) -> Self {
        WireMessage::Response {
            request_id,
            result: None,
            error: Some(error.into()),
        }
    }

    /// The subscription channel this message dispatches to on the client, if
    /// it is a push message.
    pub fn push_channel(&self) -> Option<&str> {
        match self {
            WireMessage::Event { channel, .. } => Some(channel),
            WireMessage::AudioData { .. } => Some(AUDIO_DATA_CHANNEL),
            WireMessage::ShaderUpdate { .. } => Some(SHADER_UPDATE_CHANNEL),
            _ => None,
        }
    }
}

/// JSON-RPC 2.0 Request structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// A request without an `id` is a notification and never gets a reply.
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// JSON-RPC 2.0 Response structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

/// JSON-RPC 2.0 Error structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Standard JSON-RPC 2.0 error codes used by the tool-call endpoint.
pub mod rpc_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INTERNAL_ERROR: i64 = -32603;
}
