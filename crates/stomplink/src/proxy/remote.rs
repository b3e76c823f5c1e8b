//! Remote proxy backend: the relay client running in a detached browser or
//! phone. Owns a background connection task with bounded exponential
//! reconnect, a FIFO pending-message queue flushed on connect, and a
//! pending-invoke map correlating `ipc-response` frames back to callers.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsFrame, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

use stomplink_core::error::ProxyError;
use stomplink_core::events::{EventBus, EventCallback, ListenerId};
use stomplink_core::protocol::{WireMessage, AUDIO_DATA_CHANNEL, SHADER_UPDATE_CHANNEL};
use stomplink_core::status::{Backoff, ConnectionStatus};

use super::{ControlPort, StatusCallback, STATUS_CHANNEL};
use crate::config::ProxyConfig;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type PendingMap = HashMap<u64, oneshot::Sender<Result<Value, String>>>;

/// Where outbound frames go: buffered while the socket is down, straight
/// onto the writer queue while it is up.
enum Outbox {
    Buffered(VecDeque<String>),
    Live(mpsc::UnboundedSender<String>),
}

struct RemoteInner {
    url: String,
    config: ProxyConfig,
    bus: EventBus,
    status_bus: EventBus,
    /// PendingInvoke registry: removed exactly once, by whichever of
    /// {response, timeout} happens first.
    pending: Mutex<PendingMap>,
    /// Monotonic per-proxy allocator; id reuse is structurally impossible.
    next_request_id: AtomicU64,
    outbox: Mutex<Outbox>,
    status_tx: watch::Sender<ConnectionStatus>,
    shutdown_tx: broadcast::Sender<()>,
}

/// The relay client backend.
pub struct RemoteProxy {
    inner: Arc<RemoteInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RemoteProxy {
    pub fn new(url: impl Into<String>, config: ProxyConfig) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        Self {
            inner: Arc::new(RemoteInner {
                url: url.into(),
                config,
                bus: EventBus::new(),
                status_bus: EventBus::new(),
                pending: Mutex::new(HashMap::new()),
                next_request_id: AtomicU64::new(1),
                outbox: Mutex::new(Outbox::Buffered(VecDeque::new())),
                status_tx,
                shutdown_tx,
            }),
            task: Mutex::new(None),
        }
    }

    /// Spawn the connection task. A no-op while one is already running; after
    /// the proxy has parked in `Failed`, calling this again starts a fresh
    /// reconnect cycle (the "page reload").
    pub fn connect(&self) {
        let mut task = self.task.lock().unwrap();
        if task.as_ref().map(|t| !t.is_finished()).unwrap_or(false) {
            return;
        }
        let inner = self.inner.clone();
        *task = Some(tokio::spawn(async move { inner.run().await }));
    }

    /// Tear the connection down and cancel any pending reconnect timer.
    /// Idempotent.
    pub async fn close(&self) {
        let _ = self.inner.shutdown_tx.send(());
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Frames waiting for the socket to come up.
    pub fn queued_len(&self) -> usize {
        match &*self.inner.outbox.lock().unwrap() {
            Outbox::Buffered(queue) => queue.len(),
            Outbox::Live(_) => 0,
        }
    }
}

impl RemoteInner {
    async fn run(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut backoff = Backoff::new(
            self.config.reconnect_base(),
            self.config.reconnect_growth,
            self.config.max_reconnect_attempts,
        );

        loop {
            self.set_status(ConnectionStatus::Connecting);
            let attempt = tokio::select! {
                result = connect_async(self.url.as_str()) => result,
                _ = shutdown_rx.recv() => return,
            };

            match attempt {
                Ok((socket, _response)) => {
                    info!(url = %self.url, "connected to relay");
                    backoff.reset();
                    let shutdown = self.drive(socket, &mut shutdown_rx).await;
                    self.set_status(ConnectionStatus::Disconnected);
                    if shutdown {
                        return;
                    }
                }
                Err(e) => {
                    warn!(url = %self.url, error = %e, "connection attempt failed");
                    self.set_status(ConnectionStatus::Disconnected);
                }
            }

            match backoff.next_delay() {
                Some(delay) => {
                    debug!(?delay, attempt = backoff.attempt(), "scheduling reconnect");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown_rx.recv() => return,
                    }
                }
                None => {
                    warn!(url = %self.url, "reconnect attempts exhausted, giving up");
                    self.set_status(ConnectionStatus::Failed);
                    return;
                }
            }
        }
    }

    /// Service one live connection until it drops. Returns whether shutdown
    /// was requested.
    async fn drive(&self, socket: Socket, shutdown_rx: &mut broadcast::Receiver<()>) -> bool {
        let (mut sink, mut read) = socket.split();

        // Swap the outbox to live, flushing everything queued while down in
        // FIFO order ahead of anything enqueued from here on.
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        {
            let mut outbox = self.outbox.lock().unwrap();
            if let Outbox::Buffered(queue) = &mut *outbox {
                if !queue.is_empty() {
                    debug!(count = queue.len(), "flushing queued messages");
                }
                for frame in queue.drain(..) {
                    let _ = tx.send(frame);
                }
            }
            *outbox = Outbox::Live(tx);
        }
        self.set_status(ConnectionStatus::Connected);

        let mut shutdown = false;
        loop {
            tokio::select! {
                frame = rx.recv() => match frame {
                    Some(text) => {
                        if sink.send(WsFrame::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                message = read.next() => match message {
                    Some(Ok(WsFrame::Text(text))) => self.handle_frame(&text),
                    Some(Ok(WsFrame::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "socket error");
                        break;
                    }
                },
                _ = shutdown_rx.recv() => {
                    let _ = sink.send(WsFrame::Close(None)).await;
                    shutdown = true;
                    break;
                }
            }
        }

        *self.outbox.lock().unwrap() = Outbox::Buffered(VecDeque::new());
        shutdown
    }

    fn handle_frame(&self, text: &str) {
        match serde_json::from_str::<WireMessage>(text) {
            Ok(WireMessage::Response {
                request_id,
                result,
                error,
            }) => {
                let sender = self.pending.lock().unwrap().remove(&request_id);
                match sender {
                    Some(tx) => {
                        let outcome = match error {
                            Some(message) => Err(message),
                            None => Ok(result.unwrap_or(Value::Null)),
                        };
                        let _ = tx.send(outcome);
                    }
                    // Already timed out (or never ours): dropping the late
                    // response is the whole contract.
                    None => debug!(request_id, "dropping late or unsolicited response"),
                }
            }
            Ok(WireMessage::Event { channel, data }) => self.bus.emit(&channel, &data),
            Ok(WireMessage::AudioData { payload }) => self.bus.emit(AUDIO_DATA_CHANNEL, &payload),
            Ok(WireMessage::ShaderUpdate { payload }) => {
                self.bus.emit(SHADER_UPDATE_CHANNEL, &payload)
            }
            Ok(_) => warn!("ignoring client-bound frame of client-to-server kind"),
            Err(e) => warn!(error = %e, "dropping malformed frame"),
        }
    }

    /// Queue a frame for delivery: immediately if the socket is up, buffered
    /// in FIFO order if not.
    fn enqueue(&self, frame: String) {
        let mut outbox = self.outbox.lock().unwrap();
        match &mut *outbox {
            Outbox::Live(tx) => {
                if let Err(rejected) = tx.send(frame) {
                    // Connection is tearing down; start buffering again.
                    let mut queue = VecDeque::new();
                    queue.push_back(rejected.0);
                    *outbox = Outbox::Buffered(queue);
                }
            }
            Outbox::Buffered(queue) => queue.push_back(frame),
        }
    }

    fn set_status(&self, status: ConnectionStatus) {
        let changed = self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            debug!(%status, "connection status changed");
            if let Ok(value) = serde_json::to_value(status) {
                self.status_bus.emit(STATUS_CHANNEL, &value);
            }
        }
    }

    /// Suspend until the socket reaches `connected`, the status machine
    /// parks in `failed`, or the bounded wait expires.
    async fn wait_for_connection(&self) -> Result<(), ProxyError> {
        let timeout = self.config.connect_timeout();
        let mut rx = self.status_tx.subscribe();
        let wait = async {
            loop {
                match *rx.borrow_and_update() {
                    ConnectionStatus::Connected => return Ok(()),
                    ConnectionStatus::Failed => return Err(ProxyError::Disconnected),
                    _ => {}
                }
                if rx.changed().await.is_err() {
                    return Err(ProxyError::Disconnected);
                }
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ProxyError::ConnectTimeout(timeout)),
        }
    }
}

#[async_trait]
impl ControlPort for RemoteProxy {
    async fn send(&self, channel: &str, data: Value) {
        let message = WireMessage::Send {
            channel: channel.to_string(),
            data,
        };
        match serde_json::to_string(&message) {
            Ok(frame) => self.inner.enqueue(frame),
            Err(e) => error!(%channel, error = %e, "failed to serialize send"),
        }
    }

    async fn invoke(&self, channel: &str, args: Vec<Value>) -> Result<Value, ProxyError> {
        self.inner.wait_for_connection().await?;

        let request_id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed);
        let frame = serde_json::to_string(&WireMessage::Invoke {
            channel: channel.to_string(),
            args,
            request_id,
        })?;

        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().unwrap().insert(request_id, tx);
        self.inner.enqueue(frame);

        let timeout = self.inner.config.invoke_timeout();
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(message))) => Err(ProxyError::Handler(message)),
            Ok(Err(_)) => Err(ProxyError::Disconnected),
            Err(_) => {
                // Remove the entry so a response arriving from here on finds
                // nothing to resolve.
                self.inner.pending.lock().unwrap().remove(&request_id);
                Err(ProxyError::InvokeTimeout {
                    channel: channel.to_string(),
                    timeout,
                })
            }
        }
    }

    fn on(&self, channel: &str, callback: EventCallback) -> ListenerId {
        self.inner.bus.on(channel, callback)
    }

    fn once(&self, channel: &str, callback: EventCallback) -> ListenerId {
        self.inner.bus.once(channel, callback)
    }

    fn remove_listener(&self, channel: &str, id: ListenerId) -> bool {
        self.inner.bus.remove_listener(channel, id)
    }

    fn remove_all_listeners(&self, channel: &str) {
        self.inner.bus.remove_all_listeners(channel)
    }

    fn on_status_change(&self, callback: StatusCallback) -> ListenerId {
        callback(self.status());
        let callback = callback.clone();
        self.inner.status_bus.on(
            STATUS_CHANNEL,
            Arc::new(move |value| {
                if let Ok(status) = serde_json::from_value::<ConnectionStatus>(value.clone()) {
                    callback(status);
                }
            }),
        )
    }

    fn remove_status_listener(&self, id: ListenerId) -> bool {
        self.inner.status_bus.remove_listener(STATUS_CHANNEL, id)
    }

    fn status(&self) -> ConnectionStatus {
        *self.inner.status_tx.borrow()
    }
}
