//! Relay Server
//!
//! Hosts the single WebSocket endpoint remote proxies connect to. Incoming
//! `ipc-send`/`ipc-invoke` frames are demultiplexed into calls against the
//! injected capability table; the rest of the host application pushes state
//! changes to every attached client through the broadcast primitives.
//!
//! Each connection gets an unbounded outbound queue drained by its own writer
//! task, so responses and broadcasts never contend for the socket and a write
//! to a connection that is already closing degrades to a silent no-op.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use stomplink_core::capability::{CapabilityError, CapabilityTable};
use stomplink_core::error::ServerError;
use stomplink_core::protocol::WireMessage;

use crate::config::{defaults, InitialStateEntry, RelayConfig};

/// One attached client.
///
/// Owned exclusively by the relay; the rest of the application only ever
/// reaches a connection through [`RelayServer::broadcast`].
struct Connection {
    id: u64,
    tx: mpsc::UnboundedSender<String>,
    /// Set the first time the client sends a command; distinguishes active
    /// controllers from passive visualizer viewers in the logs.
    remote_control: AtomicBool,
}

impl Connection {
    fn mark_remote_control(&self) {
        if !self.remote_control.swap(true, Ordering::Relaxed) {
            info!(conn_id = self.id, "connection identified as remote control client");
        }
    }

    fn is_remote_control(&self) -> bool {
        self.remote_control.load(Ordering::Relaxed)
    }
}

type ConnectionMap = Arc<RwLock<HashMap<u64, Arc<Connection>>>>;

/// State shared across WebSocket handlers.
#[derive(Clone)]
struct RelayState {
    caps: Arc<dyn CapabilityTable>,
    connections: ConnectionMap,
    initial_state: Arc<Vec<InitialStateEntry>>,
    next_conn_id: Arc<AtomicU64>,
    shutdown_tx: broadcast::Sender<()>,
}

struct Running {
    shutdown_tx: broadcast::Sender<()>,
    join: JoinHandle<()>,
}

/// The relay server. Construct once, `start()`, broadcast from anywhere in
/// the host, `stop()` on shutdown.
pub struct RelayServer {
    caps: Arc<dyn CapabilityTable>,
    config: RelayConfig,
    initial_state: Arc<Vec<InitialStateEntry>>,
    connections: ConnectionMap,
    next_conn_id: Arc<AtomicU64>,
    running: Mutex<Option<Running>>,
}

impl RelayServer {
    pub fn new(caps: Arc<dyn CapabilityTable>, config: RelayConfig) -> Self {
        let initial_state = Arc::new(config.initial_state.clone());
        Self {
            caps,
            config,
            initial_state,
            connections: Arc::new(RwLock::new(HashMap::new())),
            next_conn_id: Arc::new(AtomicU64::new(1)),
            running: Mutex::new(None),
        }
    }

    /// Bind and start serving. Returns the bound address (useful with a
    /// port-0 config).
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
        let state = RelayState {
            caps: self.caps.clone(),
            connections: self.connections.clone(),
            initial_state: self.initial_state.clone(),
            next_conn_id: self.next_conn_id.clone(),
            shutdown_tx: shutdown_tx.clone(),
        };

        let app = Router::new()
            .route(defaults::WS_PATH, get(ws_handler))
            .route("/health", get(health_handler))
            .with_state(state)
            .layer(crate::permissive_cors());

        let mut shutdown_rx = shutdown_tx.subscribe();
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        });

        info!(%addr, "relay listening");

        let join = tokio::spawn(async move {
            if let Err(e) = server.await {
                error!(error = %e, "relay server error");
            }
        });

        *running = Some(Running { shutdown_tx, join });
        Ok(addr)
    }

    /// Stop serving and drop every live connection. Idempotent; safe to call
    /// when nothing is running.
    pub async fn stop(&self) {
        let running = self.running.lock().await.take();
        let Some(running) = running else {
            return;
        };
        let _ = running.shutdown_tx.send(());
        if let Err(e) = running.join.await {
            if e.is_panic() {
                error!("relay server task panicked during shutdown");
            }
        }
        self.connections.write().await.clear();
        info!("relay stopped");
    }

    /// Serialize once and fan out to every open connection. Connections that
    /// are closing are skipped without error; broadcasting with zero
    /// connections is a normal no-op. Returns the number of sockets the frame
    /// was queued on.
    pub async fn broadcast(&self, message: &WireMessage) -> usize {
        let frame = match serde_json::to_string(message) {
            Ok(frame) => frame,
            Err(e) => {
                error!(error = %e, "failed to serialize broadcast");
                return 0;
            }
        };

        let connections = self.connections.read().await;
        let mut delivered = 0;
        for conn in connections.values() {
            if conn.tx.send(frame.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Push a state-change event to every attached client.
    pub async fn broadcast_event(&self, channel: impl Into<String>, data: Value) -> usize {
        self.broadcast(&WireMessage::event(channel.into(), data)).await
    }

    /// Push a visualizer audio frame to every attached client.
    pub async fn broadcast_audio_data(&self, payload: Value) -> usize {
        self.broadcast(&WireMessage::AudioData { payload }).await
    }

    /// Push a visualizer shader update to every attached client.
    pub async fn broadcast_shader_update(&self, payload: Value) -> usize {
        self.broadcast(&WireMessage::ShaderUpdate { payload }).await
    }

    /// Number of currently attached clients.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }
}

async fn health_handler() -> (StatusCode, &'static str) {
    (StatusCode::OK, "Relay is healthy")
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<RelayState>,
) -> impl IntoResponse {
    debug!("WebSocket upgrade request received");
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Full lifecycle of one client connection.
async fn handle_socket(socket: WebSocket, state: RelayState) {
    let conn_id = state.next_conn_id.fetch_add(1, Ordering::SeqCst);
    let (mut ws_sink, mut ws_stream) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let conn = Arc::new(Connection {
        id: conn_id,
        tx,
        remote_control: AtomicBool::new(false),
    });
    state.connections.write().await.insert(conn_id, conn.clone());
    info!(conn_id, "client connected");

    // Writer task: drains the outbound queue into the socket. Ends when the
    // socket rejects a write or every sender is gone.
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if ws_sink.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    // A client joining mid-session gets the current state as a unicast, not
    // a broadcast.
    send_initial_state(&state, &conn).await;

    let mut shutdown_rx = state.shutdown_tx.subscribe();
    loop {
        tokio::select! {
            msg = ws_stream.next() => match msg {
                Some(Ok(Message::Text(text))) => handle_frame(&state, &conn, &text).await,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(conn_id, error = %e, "socket error");
                    break;
                }
            },
            _ = shutdown_rx.recv() => break,
        }
    }

    state.connections.write().await.remove(&conn_id);
    writer.abort();
    info!(
        conn_id,
        remote_control = conn.is_remote_control(),
        "client disconnected"
    );
}

async fn send_initial_state(state: &RelayState, conn: &Connection) {
    for entry in state.initial_state.iter() {
        match state.caps.query(&entry.query, Vec::new()).await {
            Ok(value) => {
                let event = WireMessage::event(entry.event.clone(), value);
                match serde_json::to_string(&event) {
                    Ok(frame) => {
                        let _ = conn.tx.send(frame);
                    }
                    Err(e) => error!(event = %entry.event, error = %e, "failed to serialize initial state"),
                }
            }
            Err(e) => {
                warn!(query = %entry.query, error = %e, "initial-state query failed, skipping")
            }
        }
    }
}

/// Demultiplex one inbound frame. Must never take the connection down: every
/// failure path is a log line or an `ipc-response` error, not a propagated
/// error.
///
/// Actions run inline so commands from one connection execute in frame
/// order; invokes run on their own tasks so slow queries never hold up this
/// connection's other in-flight invokes.
async fn handle_frame(state: &RelayState, conn: &Arc<Connection>, text: &str) {
    let message = match serde_json::from_str::<WireMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            warn!(
                conn_id = conn.id,
                error = %e,
                "dropping malformed frame: {}",
                &text[..text.len().min(100)]
            );
            return;
        }
    };

    match message {
        WireMessage::Send { channel, data } => {
            conn.mark_remote_control();
            // Fire-and-forget: a send owes no response, so failures only log.
            match state.caps.action(&channel, data).await {
                Ok(()) => {}
                Err(CapabilityError::UnknownChannel(name)) => {
                    warn!(channel = %name, "ignoring send on unhandled channel")
                }
                Err(e) => warn!(%channel, error = %e, "action handler failed"),
            }
        }

        WireMessage::Invoke {
            channel,
            args,
            request_id,
        } => {
            conn.mark_remote_control();
            let caps = state.caps.clone();
            let reply = conn.tx.clone();
            // Each invoke runs on its own task so slow queries never block
            // this connection's other in-flight invokes.
            tokio::spawn(async move {
                let response = match caps.query(&channel, args).await {
                    Ok(value) => WireMessage::response_ok(request_id, value),
                    Err(e) => WireMessage::response_err(request_id, e.to_string()),
                };
                match serde_json::to_string(&response) {
                    // The client may already be gone; a dropped response is
                    // normal, not an error.
                    Ok(frame) => {
                        let _ = reply.send(frame);
                    }
                    Err(e) => error!(request_id, error = %e, "failed to serialize response"),
                }
            });
        }

        other => {
            debug!(
                conn_id = conn.id,
                "ignoring unexpected client frame kind: {:?}",
                other.push_channel()
            );
        }
    }
}
