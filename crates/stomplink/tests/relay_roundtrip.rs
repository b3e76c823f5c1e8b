//! End-to-end tests for the relay server and the remote proxy over real
//! sockets: response correlation, queue flushing, broadcast fan-out, unknown
//! channel tolerance and timeout exclusivity.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use stomplink::proxy::{ControlPort, RemoteProxy};
use stomplink::{InitialStateEntry, ProxyConfig, RelayConfig, RelayServer};
use stomplink_core::capability::CapabilityRegistry;
use stomplink_core::error::ProxyError;
use stomplink_core::status::ConnectionStatus;

fn test_caps() -> (Arc<CapabilityRegistry>, Arc<Mutex<Vec<Value>>>) {
    let actions = Arc::new(Mutex::new(Vec::new()));
    let mut registry = CapabilityRegistry::new();

    registry.register_query("echo", |args| async move {
        Ok(args.into_iter().next().unwrap_or(Value::Null))
    });

    // args[0] = value to return, args[1] = delay in ms. Lets tests force
    // completion order to differ from issue order.
    registry.register_query("echo-delayed", |args| async move {
        let value = args.first().cloned().unwrap_or(Value::Null);
        let delay = args.get(1).and_then(Value::as_u64).unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        Ok(value)
    });

    registry.register_query("slow", |_args| async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        Ok(json!("finally"))
    });

    registry.register_query("fail", |_args| async move { Err("engine offline".to_string()) });

    registry.register_query("list-patches", |_args| async move {
        Ok(json!(["clean", "fuzz"]))
    });
    registry.register_query("get-active-patch", |_args| async move { Ok(json!("clean")) });

    let log = actions.clone();
    registry.register_action("record", move |data| {
        let log = log.clone();
        async move {
            log.lock().unwrap().push(data);
            Ok(())
        }
    });

    (Arc::new(registry), actions)
}

fn fast_config() -> ProxyConfig {
    ProxyConfig {
        connect_timeout_ms: 5_000,
        invoke_timeout_ms: 5_000,
        reconnect_base_ms: 20,
        reconnect_growth: 1.5,
        max_reconnect_attempts: 50,
    }
}

async fn start_relay(config: RelayConfig) -> (Arc<RelayServer>, String, Arc<Mutex<Vec<Value>>>) {
    let (caps, actions) = test_caps();
    let relay = Arc::new(RelayServer::new(caps, config));
    let addr = relay.start().await.expect("relay start");
    (relay, format!("ws://{addr}/ws"), actions)
}

fn ephemeral_relay_config() -> RelayConfig {
    RelayConfig {
        bind: "127.0.0.1:0".to_string(),
        initial_state: Vec::new(),
    }
}

async fn connected_proxy(url: &str) -> Arc<RemoteProxy> {
    let proxy = Arc::new(RemoteProxy::new(url, fast_config()));
    proxy.connect();
    wait_for_status(&proxy, ConnectionStatus::Connected).await;
    proxy
}

async fn wait_for_status(proxy: &RemoteProxy, want: ConnectionStatus) {
    for _ in 0..500 {
        if proxy.status() == want {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("proxy never reached status {want}");
}

async fn wait_until(mut condition: impl FnMut() -> bool, what: &str) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn invoke_round_trip() {
    let (relay, url, _) = start_relay(ephemeral_relay_config()).await;
    let proxy = connected_proxy(&url).await;

    let result = proxy.invoke("echo", vec![json!({"gain": 0.8})]).await.unwrap();
    assert_eq!(result, json!({"gain": 0.8}));

    proxy.close().await;
    relay.stop().await;
}

// Every concurrently issued invoke resolves from the response carrying
// its own request id, even when completion order differs from issue order.
#[tokio::test]
async fn concurrent_invokes_correlate_by_request_id() {
    let (relay, url, _) = start_relay(ephemeral_relay_config()).await;
    let proxy = connected_proxy(&url).await;

    let mut tasks = Vec::new();
    for i in 0..8u64 {
        let proxy = proxy.clone();
        // Later invokes finish sooner.
        let delay = 160 - i * 20;
        tasks.push(tokio::spawn(async move {
            let value = proxy
                .invoke("echo-delayed", vec![json!(i), json!(delay)])
                .await
                .unwrap();
            (i, value)
        }));
    }

    for task in tasks {
        let (i, value) = task.await.unwrap();
        assert_eq!(value, json!(i));
    }

    proxy.close().await;
    relay.stop().await;
}

// Sends issued while disconnected are delivered, after connecting, in
// the exact order they were enqueued.
#[tokio::test]
async fn queued_sends_flush_in_fifo_order() {
    let (relay, url, actions) = start_relay(ephemeral_relay_config()).await;

    let proxy = Arc::new(RemoteProxy::new(url, fast_config()));
    proxy.send("record", json!("first")).await;
    proxy.send("record", json!("second")).await;
    proxy.send("record", json!("third")).await;
    assert_eq!(proxy.queued_len(), 3);

    proxy.connect();
    wait_for_status(&proxy, ConnectionStatus::Connected).await;
    wait_until(|| actions.lock().unwrap().len() == 3, "queued sends to land").await;

    assert_eq!(
        &*actions.lock().unwrap(),
        &[json!("first"), json!("second"), json!("third")]
    );

    proxy.close().await;
    relay.stop().await;
}

// An invoke issued while disconnected waits for the connection and then
// resolves normally.
#[tokio::test]
async fn invoke_waits_for_connection() {
    let (relay, url, _) = start_relay(ephemeral_relay_config()).await;

    let proxy = Arc::new(RemoteProxy::new(url, fast_config()));
    let pending = {
        let proxy = proxy.clone();
        tokio::spawn(async move { proxy.invoke("list-patches", vec![]).await })
    };

    // Give the invoke a moment to start waiting before the socket exists.
    tokio::time::sleep(Duration::from_millis(50)).await;
    proxy.connect();

    let result = pending.await.unwrap().unwrap();
    assert_eq!(result, json!(["clean", "fuzz"]));

    proxy.close().await;
    relay.stop().await;
}

// Broadcasting with no connections, and after every connection has
// closed, is a silent no-op.
#[tokio::test]
async fn broadcast_is_safe_with_no_connections() {
    let (relay, url, _) = start_relay(ephemeral_relay_config()).await;

    assert_eq!(relay.broadcast_event("tick", json!(1)).await, 0);

    let proxy = connected_proxy(&url).await;
    proxy.close().await;
    wait_until_count(&relay, 0).await;

    assert_eq!(relay.broadcast_event("tick", json!(2)).await, 0);
    relay.stop().await;
    assert_eq!(relay.broadcast_event("tick", json!(3)).await, 0);
}

async fn wait_until_count(relay: &Arc<RelayServer>, want: usize) {
    for _ in 0..500 {
        if relay.connection_count().await == want {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("relay never reached {want} connections");
}

// Unknown channels crash nothing; an invoke gets a structured error, a
// send is ignored, and the connection keeps working.
#[tokio::test]
async fn unknown_channels_are_tolerated() {
    let (relay, url, _) = start_relay(ephemeral_relay_config()).await;
    let proxy = connected_proxy(&url).await;

    let err = proxy.invoke("no-such-query", vec![]).await.unwrap_err();
    match err {
        ProxyError::Handler(message) => assert!(message.contains("unknown channel")),
        other => panic!("expected handler error, got {other:?}"),
    }

    proxy.send("no-such-action", json!({})).await;

    // Still alive afterwards.
    let result = proxy.invoke("echo", vec![json!("alive")]).await.unwrap();
    assert_eq!(result, json!("alive"));

    proxy.close().await;
    relay.stop().await;
}

// Handler failures surface verbatim and are distinguishable from timeouts.
#[tokio::test]
async fn handler_errors_surface_verbatim() {
    let (relay, url, _) = start_relay(ephemeral_relay_config()).await;
    let proxy = connected_proxy(&url).await;

    let err = proxy.invoke("fail", vec![]).await.unwrap_err();
    assert!(!err.is_timeout());
    assert_eq!(err.to_string(), "engine offline");

    proxy.close().await;
    relay.stop().await;
}

// A response arriving after the client-side timeout already fired is
// dropped without effect; the proxy keeps working.
#[tokio::test]
async fn late_response_after_timeout_is_dropped() {
    let (relay, url, _) = start_relay(ephemeral_relay_config()).await;

    let proxy = Arc::new(RemoteProxy::new(
        &url,
        ProxyConfig {
            invoke_timeout_ms: 50,
            ..fast_config()
        },
    ));
    proxy.connect();
    wait_for_status(&proxy, ConnectionStatus::Connected).await;

    // The "slow" query takes 300ms; the invoke times out at 50ms.
    let err = proxy.invoke("slow", vec![]).await.unwrap_err();
    assert!(matches!(err, ProxyError::InvokeTimeout { .. }));

    // Let the server-side execution complete and its response arrive.
    tokio::time::sleep(Duration::from_millis(400)).await;

    let result = proxy.invoke("echo", vec![json!("still fine")]).await.unwrap();
    assert_eq!(result, json!("still fine"));

    proxy.close().await;
    relay.stop().await;
}

// Broadcast reaches every open connection; a closed one receives nothing
// and produces no error.
#[tokio::test]
async fn broadcast_fans_out_to_open_connections() {
    let (relay, url, _) = start_relay(ephemeral_relay_config()).await;

    let first = connected_proxy(&url).await;
    let second = connected_proxy(&url).await;

    let (tx1, mut rx1) = mpsc::unbounded_channel();
    first.on(
        "selection-changed",
        Arc::new(move |data| {
            let _ = tx1.send(data.clone());
        }),
    );
    let (tx2, mut rx2) = mpsc::unbounded_channel();
    second.on(
        "selection-changed",
        Arc::new(move |data| {
            let _ = tx2.send(data.clone());
        }),
    );

    assert_eq!(
        relay.broadcast_event("selection-changed", json!({"id": "x"})).await,
        2
    );
    assert_eq!(rx1.recv().await.unwrap(), json!({"id": "x"}));
    assert_eq!(rx2.recv().await.unwrap(), json!({"id": "x"}));

    second.close().await;
    wait_until_count(&relay, 1).await;

    assert_eq!(
        relay.broadcast_event("selection-changed", json!({"id": "y"})).await,
        1
    );
    assert_eq!(rx1.recv().await.unwrap(), json!({"id": "y"}));

    first.close().await;
    relay.stop().await;
}

// A client joining mid-session receives the configured initial-state bundle
// as a unicast, without any broadcast having happened.
#[tokio::test]
async fn initial_state_is_unicast_on_accept() {
    let (relay, url, _) = start_relay(RelayConfig {
        bind: "127.0.0.1:0".to_string(),
        initial_state: vec![
            InitialStateEntry::new("list-patches", "patch-list"),
            InitialStateEntry::new("get-active-patch", "active-patch"),
            // Unknown snapshot queries are skipped, not fatal.
            InitialStateEntry::new("no-such-query", "never-sent"),
        ],
    })
    .await;

    let proxy = Arc::new(RemoteProxy::new(&url, fast_config()));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let patches = tx.clone();
    proxy.on(
        "patch-list",
        Arc::new(move |data| {
            let _ = patches.send(("patch-list", data.clone()));
        }),
    );
    let active = tx.clone();
    proxy.on(
        "active-patch",
        Arc::new(move |data| {
            let _ = active.send(("active-patch", data.clone()));
        }),
    );
    let never = tx;
    proxy.on(
        "never-sent",
        Arc::new(move |data| {
            let _ = never.send(("never-sent", data.clone()));
        }),
    );

    proxy.connect();

    let first = rx.recv().await.unwrap();
    let second = rx.recv().await.unwrap();
    assert_eq!(first, ("patch-list", json!(["clean", "fuzz"])));
    assert_eq!(second, ("active-patch", json!("clean")));
    assert!(
        tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .is_err(),
        "skipped snapshot query must produce no event"
    );

    proxy.close().await;
    relay.stop().await;
}

// Visualizer passthrough frames ride the same socket and dispatch on their
// own channels.
#[tokio::test]
async fn passthrough_frames_dispatch_to_subscribers() {
    let (relay, url, _) = start_relay(ephemeral_relay_config()).await;
    let proxy = connected_proxy(&url).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let audio = tx.clone();
    proxy.on(
        "audioData",
        Arc::new(move |data| {
            let _ = audio.send(("audio", data.clone()));
        }),
    );
    let shader = tx;
    proxy.on(
        "shaderUpdate",
        Arc::new(move |data| {
            let _ = shader.send(("shader", data.clone()));
        }),
    );

    relay.broadcast_audio_data(json!([0.1, 0.2, 0.3])).await;
    relay.broadcast_shader_update(json!({"pass": 2})).await;

    assert_eq!(rx.recv().await.unwrap(), ("audio", json!([0.1, 0.2, 0.3])));
    assert_eq!(rx.recv().await.unwrap(), ("shader", json!({"pass": 2})));

    proxy.close().await;
    relay.stop().await;
}

// `once` subscriptions fire for exactly one delivery.
#[tokio::test]
async fn once_listener_fires_single_delivery() {
    let (relay, url, _) = start_relay(ephemeral_relay_config()).await;
    let proxy = connected_proxy(&url).await;

    let count = Arc::new(AtomicUsize::new(0));
    let seen = count.clone();
    proxy.once(
        "tick",
        Arc::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        }),
    );

    relay.broadcast_event("tick", json!(1)).await;
    relay.broadcast_event("tick", json!(2)).await;

    // Drain with a follow-up invoke so both events have been processed.
    proxy.invoke("echo", vec![json!(null)]).await.unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 1);

    proxy.close().await;
    relay.stop().await;
}

// Status subscribers get the current status immediately and every
// subsequent transition.
#[tokio::test]
async fn status_transitions_reach_subscribers() {
    let (relay, url, _) = start_relay(ephemeral_relay_config()).await;

    let proxy = Arc::new(RemoteProxy::new(&url, fast_config()));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    proxy.on_status_change(Arc::new(move |status| sink.lock().unwrap().push(status)));

    assert_eq!(seen.lock().unwrap()[0], ConnectionStatus::Disconnected);

    proxy.connect();
    wait_for_status(&proxy, ConnectionStatus::Connected).await;
    wait_until(
        || {
            seen.lock()
                .unwrap()
                .contains(&ConnectionStatus::Connected)
        },
        "connected transition",
    )
    .await;

    relay.stop().await;
    wait_until(
        || seen.lock().unwrap().iter().filter(|s| **s == ConnectionStatus::Disconnected).count() >= 2,
        "disconnect transition after relay stop",
    )
    .await;

    proxy.close().await;
}

// The reconnect budget is finite: with nothing listening, the proxy parks
// in `failed` and invoke rejects immediately.
#[tokio::test]
async fn reconnect_budget_exhaustion_parks_proxy() {
    // Nothing ever listens on this URL; discard-port connects are refused.
    let proxy = Arc::new(RemoteProxy::new(
        "ws://127.0.0.1:9/ws",
        ProxyConfig {
            connect_timeout_ms: 5_000,
            invoke_timeout_ms: 5_000,
            reconnect_base_ms: 10,
            reconnect_growth: 1.2,
            max_reconnect_attempts: 3,
        },
    ));
    proxy.connect();
    wait_for_status(&proxy, ConnectionStatus::Failed).await;

    let err = proxy.invoke("echo", vec![]).await.unwrap_err();
    assert!(matches!(err, ProxyError::Disconnected));

    proxy.close().await;
}
