//! Transport Abstraction
//!
//! One client-facing API over two backends: [`LocalProxy`] dispatches
//! straight into the capability table when the UI runs embedded in the host
//! process, [`RemoteProxy`] relays the same calls over a WebSocket when the
//! UI runs in a browser. The backend is chosen exactly once at construction
//! by the composition root; call sites only ever see [`ControlPort`].

mod local;
mod remote;

pub use local::LocalProxy;
pub use remote::RemoteProxy;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use stomplink_core::error::ProxyError;
use stomplink_core::events::{EventCallback, ListenerId};
use stomplink_core::status::ConnectionStatus;

use crate::config::ProxyConfig;

/// Internal bus channel carrying status transitions to status subscribers.
pub(crate) const STATUS_CHANNEL: &str = "connection-status";

/// Callback invoked on every connection status transition, and immediately
/// with the current status upon subscribing.
pub type StatusCallback = Arc<dyn Fn(ConnectionStatus) + Send + Sync>;

/// The transport surface UI code programs against. Identical semantics in
/// embedded and remote mode; the caller never branches on which is in play.
#[async_trait]
pub trait ControlPort: Send + Sync {
    /// Fire-and-forget command. No delivery acknowledgement; while a remote
    /// socket is down the message is queued and flushed, in order, on
    /// reconnect.
    async fn send(&self, channel: &str, data: Value);

    /// Correlated request/response call.
    async fn invoke(&self, channel: &str, args: Vec<Value>) -> Result<Value, ProxyError>;

    /// Subscribe to an event channel.
    fn on(&self, channel: &str, callback: EventCallback) -> ListenerId;

    /// Subscribe for a single delivery.
    fn once(&self, channel: &str, callback: EventCallback) -> ListenerId;

    /// Remove one listener; returns whether it was present.
    fn remove_listener(&self, channel: &str, id: ListenerId) -> bool;

    /// Remove every listener on a channel.
    fn remove_all_listeners(&self, channel: &str);

    /// Subscribe to connection status. The callback fires immediately with
    /// the current status so late subscribers do not miss the initial state.
    fn on_status_change(&self, callback: StatusCallback) -> ListenerId;

    /// Remove a status subscription.
    fn remove_status_listener(&self, id: ListenerId) -> bool;

    /// Current connection status. Always `Connected` in embedded mode.
    fn status(&self) -> ConnectionStatus;
}

/// Build the embedded backend.
pub fn local(caps: Arc<dyn stomplink_core::capability::CapabilityTable>) -> Arc<LocalProxy> {
    Arc::new(LocalProxy::new(caps))
}

/// Build the remote backend and start its connection task.
pub fn remote(url: impl Into<String>, config: ProxyConfig) -> Arc<RemoteProxy> {
    let proxy = Arc::new(RemoteProxy::new(url, config));
    proxy.connect();
    proxy
}
