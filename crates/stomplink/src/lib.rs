//! Stomplink
//!
//! Control-plane transport for the pedal host process. Lets a remote,
//! possibly-disconnected browser client drive and observe the exact same
//! command/event surface the embedded UI uses, without application logic
//! knowing which transport is in play.
//!
//! # Modules
//!
//! - [`relay`] - the WebSocket relay server bridging remote clients onto the
//!   host's capability table
//! - [`rpc`] - the JSON-RPC 2.0 + SSE tool-call endpoint
//! - [`proxy`] - the client transport abstraction (embedded and remote
//!   backends behind one [`proxy::ControlPort`])
//! - [`config`] - configuration with defaults

pub mod config;
pub mod proxy;
pub mod relay;
pub mod rpc;

pub use config::{InitialStateEntry, ProxyConfig, RelayConfig, RpcConfig};
pub use proxy::{ControlPort, LocalProxy, RemoteProxy, StatusCallback};
pub use relay::RelayServer;
pub use rpc::{RpcServer, ToolSet};

use tower_http::cors::{Any, CorsLayer};

/// CORS for a trusted local network: remote-control pages are served from
/// the phone/browser's own origin, so the relay and tool endpoint accept any.
pub(crate) fn permissive_cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}
