//! Event Bus
//!
//! Local subscription store shared by both proxy backends: the embedded proxy
//! dispatches host events through it directly, the remote proxy feeds it from
//! incoming `ipc-event`/passthrough frames. Decouples event producers from
//! whatever frontend is listening.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde_json::Value;
use tracing::trace;

/// Handle returned by [`EventBus::on`]/[`EventBus::once`], used to remove the
/// listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Callback invoked with the event payload. Runs synchronously on the
/// emitting task; must not block.
pub type EventCallback = std::sync::Arc<dyn Fn(&Value) + Send + Sync>;

struct Listener {
    id: ListenerId,
    once: bool,
    callback: EventCallback,
}

/// Channel → listener-set mapping with insertion-order dispatch.
#[derive(Default)]
pub struct EventBus {
    listeners: Mutex<HashMap<String, Vec<Listener>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a channel. Multiple callbacks per channel are allowed.
    pub fn on(&self, channel: &str, callback: EventCallback) -> ListenerId {
        self.subscribe(channel, callback, false)
    }

    /// Subscribe to a channel for a single delivery; the listener removes
    /// itself after firing.
    pub fn once(&self, channel: &str, callback: EventCallback) -> ListenerId {
        self.subscribe(channel, callback, true)
    }

    fn subscribe(&self, channel: &str, callback: EventCallback, once: bool) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut listeners = self.listeners.lock().unwrap();
        listeners
            .entry(channel.to_string())
            .or_default()
            .push(Listener { id, once, callback });
        id
    }

    /// Remove one listener. Returns whether it was present.
    pub fn remove_listener(&self, channel: &str, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock().unwrap();
        let Some(list) = listeners.get_mut(channel) else {
            return false;
        };
        let before = list.len();
        list.retain(|l| l.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            listeners.remove(channel);
        }
        removed
    }

    /// Remove every listener on a channel.
    pub fn remove_all_listeners(&self, channel: &str) {
        self.listeners.lock().unwrap().remove(channel);
    }

    /// Dispatch an event to every listener on the channel, in subscription
    /// order. `once` listeners are dropped before their callback runs, so a
    /// callback that re-emits cannot fire itself twice.
    pub fn emit(&self, channel: &str, data: &Value) {
        let to_call: Vec<EventCallback> = {
            let mut listeners = self.listeners.lock().unwrap();
            let Some(list) = listeners.get_mut(channel) else {
                return;
            };
            let callbacks = list.iter().map(|l| l.callback.clone()).collect();
            list.retain(|l| !l.once);
            if list.is_empty() {
                listeners.remove(channel);
            }
            callbacks
        };

        trace!(channel, listeners = to_call.len(), "dispatching event");
        for callback in to_call {
            callback(data);
        }
    }

    /// Number of live listeners on a channel.
    pub fn listener_count(&self, channel: &str) -> usize {
        self.listeners
            .lock()
            .unwrap()
            .get(channel)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn counting_callback() -> (EventCallback, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let callback: EventCallback = Arc::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (callback, count)
    }

    #[test]
    fn test_on_emit() {
        let bus = EventBus::new();
        let (callback, count) = counting_callback();
        bus.on("params-changed", callback);

        bus.emit("params-changed", &json!({"gain": 0.5}));
        bus.emit("params-changed", &json!({"gain": 0.7}));
        bus.emit("other", &Value::Null);

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_once_fires_exactly_once() {
        let bus = EventBus::new();
        let (callback, count) = counting_callback();
        bus.once("boot", callback);

        bus.emit("boot", &Value::Null);
        bus.emit("boot", &Value::Null);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count("boot"), 0);
    }

    #[test]
    fn test_multiple_listeners_all_fire() {
        let bus = EventBus::new();
        let (cb1, count1) = counting_callback();
        let (cb2, count2) = counting_callback();
        bus.on("tick", cb1);
        bus.on("tick", cb2);

        bus.emit("tick", &Value::Null);

        assert_eq!(count1.load(Ordering::SeqCst), 1);
        assert_eq!(count2.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_listener() {
        let bus = EventBus::new();
        let (callback, count) = counting_callback();
        let id = bus.on("tick", callback);

        assert!(bus.remove_listener("tick", id));
        assert!(!bus.remove_listener("tick", id));

        bus.emit("tick", &Value::Null);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_remove_all_listeners() {
        let bus = EventBus::new();
        let (cb1, count1) = counting_callback();
        let (cb2, count2) = counting_callback();
        bus.on("tick", cb1);
        bus.on("tick", cb2);

        bus.remove_all_listeners("tick");
        bus.emit("tick", &Value::Null);

        assert_eq!(count1.load(Ordering::SeqCst), 0);
        assert_eq!(count2.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_payload_reaches_callback() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Value::Null));
        let sink = seen.clone();
        bus.on(
            "selection-changed",
            Arc::new(move |data| {
                *sink.lock().unwrap() = data.clone();
            }),
        );

        bus.emit("selection-changed", &json!({"id": "x"}));
        assert_eq!(*seen.lock().unwrap(), json!({"id": "x"}));
    }
}
