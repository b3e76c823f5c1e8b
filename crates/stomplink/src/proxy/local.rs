//! Embedded proxy backend: zero-copy dispatch straight into the capability
//! table. No socket, no queueing, no status machine - the transport is the
//! process itself.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use stomplink_core::capability::{CapabilityError, CapabilityTable};
use stomplink_core::error::ProxyError;
use stomplink_core::events::{EventBus, EventCallback, ListenerId};
use stomplink_core::protocol::{AUDIO_DATA_CHANNEL, SHADER_UPDATE_CHANNEL};
use stomplink_core::status::ConnectionStatus;

use super::{ControlPort, StatusCallback, STATUS_CHANNEL};

/// The embedded backend. The host pushes state-change events through
/// [`LocalProxy::emit`], which dispatches to subscribers exactly as the
/// remote backend dispatches incoming `ipc-event` frames.
pub struct LocalProxy {
    caps: Arc<dyn CapabilityTable>,
    bus: EventBus,
    status_bus: EventBus,
}

impl LocalProxy {
    pub fn new(caps: Arc<dyn CapabilityTable>) -> Self {
        Self {
            caps,
            bus: EventBus::new(),
            status_bus: EventBus::new(),
        }
    }

    /// Host-facing door: dispatch a state-change event to local subscribers.
    pub fn emit(&self, channel: &str, data: &Value) {
        self.bus.emit(channel, data);
    }

    /// Dispatch a visualizer audio frame to local subscribers.
    pub fn emit_audio_data(&self, payload: &Value) {
        self.bus.emit(AUDIO_DATA_CHANNEL, payload);
    }

    /// Dispatch a visualizer shader update to local subscribers.
    pub fn emit_shader_update(&self, payload: &Value) {
        self.bus.emit(SHADER_UPDATE_CHANNEL, payload);
    }
}

#[async_trait]
impl ControlPort for LocalProxy {
    async fn send(&self, channel: &str, data: Value) {
        match self.caps.action(channel, data).await {
            Ok(()) => {}
            Err(CapabilityError::UnknownChannel(name)) => {
                warn!(channel = %name, "ignoring send on unhandled channel")
            }
            Err(e) => warn!(%channel, error = %e, "action handler failed"),
        }
    }

    async fn invoke(&self, channel: &str, args: Vec<Value>) -> Result<Value, ProxyError> {
        // Same error text a remote caller would receive from an
        // `ipc-response`, so callers cannot tell the backends apart.
        self.caps
            .query(channel, args)
            .await
            .map_err(|e| ProxyError::Handler(e.to_string()))
    }

    fn on(&self, channel: &str, callback: EventCallback) -> ListenerId {
        self.bus.on(channel, callback)
    }

    fn once(&self, channel: &str, callback: EventCallback) -> ListenerId {
        self.bus.once(channel, callback)
    }

    fn remove_listener(&self, channel: &str, id: ListenerId) -> bool {
        self.bus.remove_listener(channel, id)
    }

    fn remove_all_listeners(&self, channel: &str) {
        self.bus.remove_all_listeners(channel)
    }

    fn on_status_change(&self, callback: StatusCallback) -> ListenerId {
        // Embedded mode never transitions, but the immediate initial
        // notification contract still holds.
        callback(ConnectionStatus::Connected);
        let callback = callback.clone();
        self.status_bus.on(
            STATUS_CHANNEL,
            Arc::new(move |value| {
                if let Ok(status) = serde_json::from_value::<ConnectionStatus>(value.clone()) {
                    callback(status);
                }
            }),
        )
    }

    fn remove_status_listener(&self, id: ListenerId) -> bool {
        self.status_bus.remove_listener(STATUS_CHANNEL, id)
    }

    fn status(&self) -> ConnectionStatus {
        ConnectionStatus::Connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use stomplink_core::capability::CapabilityRegistry;

    fn pedal_caps() -> Arc<dyn CapabilityTable> {
        let mut registry = CapabilityRegistry::new();
        registry.register_query("list-patches", |_args| async move {
            Ok(json!(["clean", "fuzz"]))
        });
        registry.register_query("fail", |_args| async move { Err("no engine".to_string()) });
        registry.register_action("select-patch", |_data| async move { Ok(()) });
        Arc::new(registry)
    }

    #[tokio::test]
    async fn test_invoke_returns_query_result() {
        let proxy = LocalProxy::new(pedal_caps());
        let result = proxy.invoke("list-patches", vec![]).await.unwrap();
        assert_eq!(result, json!(["clean", "fuzz"]));
    }

    #[tokio::test]
    async fn test_invoke_surfaces_handler_error() {
        let proxy = LocalProxy::new(pedal_caps());
        let err = proxy.invoke("fail", vec![]).await.unwrap_err();
        assert!(matches!(err, ProxyError::Handler(_)));
        assert_eq!(err.to_string(), "no engine");
    }

    #[tokio::test]
    async fn test_invoke_unknown_channel_is_handler_error() {
        let proxy = LocalProxy::new(pedal_caps());
        let err = proxy.invoke("nope", vec![]).await.unwrap_err();
        assert_eq!(err.to_string(), "unknown channel: nope");
    }

    #[tokio::test]
    async fn test_send_never_fails() {
        let proxy = LocalProxy::new(pedal_caps());
        proxy.send("select-patch", json!({"id": "fuzz"})).await;
        proxy.send("not-a-channel", Value::Null).await;
    }

    #[tokio::test]
    async fn test_events_reach_subscribers() {
        let proxy = LocalProxy::new(pedal_caps());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        proxy.on(
            "active-patch-changed",
            Arc::new(move |data| sink.lock().unwrap().push(data.clone())),
        );

        proxy.emit("active-patch-changed", &json!({"id": "fuzz"}));
        assert_eq!(&*seen.lock().unwrap(), &[json!({"id": "fuzz"})]);
    }

    #[tokio::test]
    async fn test_status_callback_fires_immediately() {
        let proxy = LocalProxy::new(pedal_caps());
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let id = proxy.on_status_change(Arc::new(move |status| {
            assert_eq!(status, ConnectionStatus::Connected);
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(proxy.status(), ConnectionStatus::Connected);
        assert!(proxy.remove_status_listener(id));
    }
}
