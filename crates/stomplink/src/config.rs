//! Configuration for the relay server, tool-call endpoint and client proxy.
//!
//! Durations are stored as millisecond fields so configs stay serde-friendly
//! for loading from files or env.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Named defaults, kept in one place.
pub mod defaults {
    /// Bound wait for the socket to reach `connected` before an invoke.
    pub const CONNECT_TIMEOUT_MS: u64 = 10_000;
    /// Deadline for a pending invoke's response.
    pub const INVOKE_TIMEOUT_MS: u64 = 30_000;
    /// Base reconnect delay.
    pub const RECONNECT_BASE_MS: u64 = 500;
    /// Reconnect delay growth factor per attempt.
    pub const RECONNECT_GROWTH: f64 = 2.0;
    /// Reconnect attempts before the proxy parks in `failed`.
    pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;
    /// SSE heartbeat comment interval.
    pub const HEARTBEAT_INTERVAL_MS: u64 = 10_000;
    /// Relay WebSocket endpoint path.
    pub const WS_PATH: &str = "/ws";
    /// Tool-call endpoint path.
    pub const RPC_PATH: &str = "/rpc";
    /// Default relay bind address.
    pub const RELAY_BIND: &str = "127.0.0.1:9870";
    /// Default tool-call endpoint bind address.
    pub const RPC_BIND: &str = "127.0.0.1:9871";
}

/// Client proxy tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// How long `invoke()` waits for the socket to connect (milliseconds).
    pub connect_timeout_ms: u64,
    /// Per-invoke response deadline (milliseconds).
    pub invoke_timeout_ms: u64,
    /// Base reconnect delay (milliseconds).
    pub reconnect_base_ms: u64,
    /// Growth factor applied per reconnect attempt.
    pub reconnect_growth: f64,
    /// Reconnect attempts before giving up permanently.
    pub max_reconnect_attempts: u32,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: defaults::CONNECT_TIMEOUT_MS,
            invoke_timeout_ms: defaults::INVOKE_TIMEOUT_MS,
            reconnect_base_ms: defaults::RECONNECT_BASE_MS,
            reconnect_growth: defaults::RECONNECT_GROWTH,
            max_reconnect_attempts: defaults::MAX_RECONNECT_ATTEMPTS,
        }
    }
}

impl ProxyConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn invoke_timeout(&self) -> Duration {
        Duration::from_millis(self.invoke_timeout_ms)
    }

    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }
}

/// One entry of the initial-state bundle unicast to every new relay
/// connection: execute `query` against the capability table, deliver the
/// value as an `ipc-event` on `event`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitialStateEntry {
    pub query: String,
    pub event: String,
}

impl InitialStateEntry {
    pub fn new(query: impl Into<String>, event: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            event: event.into(),
        }
    }
}

/// Relay server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Listen address, e.g. `127.0.0.1:9870`. Port 0 picks an ephemeral port.
    pub bind: String,
    /// Snapshot queries replayed as events to each connection on accept, so a
    /// client joining mid-session is not left blank.
    pub initial_state: Vec<InitialStateEntry>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: defaults::RELAY_BIND.to_string(),
            initial_state: Vec::new(),
        }
    }
}

/// Tool-call endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    /// Listen address, e.g. `127.0.0.1:9871`. Port 0 picks an ephemeral port.
    pub bind: String,
    /// SSE heartbeat interval (milliseconds).
    pub heartbeat_interval_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            bind: defaults::RPC_BIND.to_string(),
            heartbeat_interval_ms: defaults::HEARTBEAT_INTERVAL_MS,
        }
    }
}

impl RpcConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}
