use crate::protocol::{self, Ack, ClientFrame, ServerFrame};
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use incident_core::error::StoreError;
use incident_core::pushkey::PushKeyGenerator;
use incident_core::store::{Listener, ListenerSender, RemoteStore, StoreEvent};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type PendingAcks = Arc<DashMap<u64, oneshot::Sender<Ack>>>;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);
const IDLE_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Debug, Clone)]
pub struct WsStoreConfig {
    /// Websocket endpoint of an incident server, e.g. `ws://127.0.0.1:8080/ws`.
    pub url: String,
    pub request_timeout: Duration,
    pub ping_interval: Duration,
    /// A listener that hears nothing (not even pongs) for this long is cancelled.
    pub idle_timeout: Duration,
}

impl WsStoreConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            ping_interval: DEFAULT_PING_INTERVAL,
            idle_timeout: IDLE_TIMEOUT,
        }
    }
}

/// One websocket used for writes, shared by all `create_at` calls.
struct WriteConnection {
    sink: WsSink,
    pending: PendingAcks,
    alive: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl Drop for WriteConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// [`RemoteStore`] backed by a remote incident server.
///
/// Keys are generated locally. Writes share one lazily opened connection and
/// are matched to their acks by `req_id`; every listener gets its own
/// connection. Broken connections are reported, never silently reopened in
/// the background: the next write opens a fresh one.
pub struct WsRemoteStore {
    config: WsStoreConfig,
    keys: PushKeyGenerator,
    next_req_id: Arc<AtomicU64>,
    writer: Mutex<Option<WriteConnection>>,
}

impl WsRemoteStore {
    pub fn new(config: WsStoreConfig) -> Self {
        Self {
            config,
            keys: PushKeyGenerator::new(),
            next_req_id: Arc::new(AtomicU64::new(1)),
            writer: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    fn req_id(&self) -> u64 {
        self.next_req_id.fetch_add(1, Ordering::Relaxed)
    }

    fn timeout_error(&self) -> StoreError {
        StoreError::Timeout(self.config.request_timeout.as_millis() as u64)
    }

    /// Open a websocket, giving up after `request_timeout` if the handshake stalls.
    async fn connect(&self) -> Result<WsStream, StoreError> {
        info!("Connecting to {}", self.config.url);
        let (stream, _) = timeout(self.config.request_timeout, connect_async(self.config.url.as_str()))
            .await
            .map_err(|_| {
                warn!("Handshake with {} timed out", self.config.url);
                self.timeout_error()
            })?
            .map_err(|e| StoreError::Unavailable(format!("failed to connect to {}: {}", self.config.url, e)))?;
        Ok(stream)
    }

    async fn open_write_connection(&self) -> Result<WriteConnection, StoreError> {
        let (sink, stream) = self.connect().await?.split();
        let pending: PendingAcks = Arc::new(DashMap::new());
        let alive = Arc::new(AtomicBool::new(true));
        let reader = tokio::spawn(route_acks(stream, pending.clone(), alive.clone()));
        Ok(WriteConnection {
            sink,
            pending,
            alive,
            reader,
        })
    }

    /// Send a request and return the receiver its ack will arrive on, along
    /// with the pending table of the connection it went out on.
    async fn request(&self, req_id: u64, frame: &ClientFrame) -> Result<(oneshot::Receiver<Ack>, PendingAcks), StoreError> {
        let text = protocol::to_text(frame)?;
        let mut writer = self.writer.lock().await;

        let reuse = writer
            .as_ref()
            .map(|conn| conn.alive.load(Ordering::SeqCst))
            .unwrap_or(false);
        if !reuse {
            *writer = Some(self.open_write_connection().await?);
        }
        let Some(conn) = writer.as_mut() else {
            return Err(StoreError::Unavailable("no connection".to_string()));
        };

        let (tx, rx) = oneshot::channel();
        conn.pending.insert(req_id, tx);
        let sent = timeout(self.config.request_timeout, conn.sink.send(Message::Text(text))).await;
        match sent {
            Ok(Ok(())) => Ok((rx, conn.pending.clone())),
            Ok(Err(e)) => {
                conn.pending.remove(&req_id);
                *writer = None;
                Err(StoreError::Unavailable(format!("failed to send request: {}", e)))
            }
            Err(_) => {
                conn.pending.remove(&req_id);
                *writer = None;
                Err(self.timeout_error())
            }
        }
    }

    /// Drop the write connection after a timed out request, unless it has
    /// already been replaced by a newer one.
    async fn discard_writer(&self, req_id: u64, pending: &PendingAcks) {
        let mut writer = self.writer.lock().await;
        pending.remove(&req_id);
        let current = writer
            .as_ref()
            .map(|conn| Arc::ptr_eq(&conn.pending, pending))
            .unwrap_or(false);
        if current {
            *writer = None;
        }
    }
}

async fn route_acks(
    mut stream: SplitStream<WsStream>,
    pending: PendingAcks,
    alive: Arc<AtomicBool>,
) {
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => match protocol::parse_server_frame(&text) {
                Ok(ServerFrame::Ack(ack)) => {
                    if let Some((_, tx)) = pending.remove(&ack.req_id) {
                        let _ = tx.send(ack);
                    } else {
                        debug!("Ack for unknown request {}", ack.req_id);
                    }
                }
                Ok(other) => debug!("Ignoring frame on write connection: {:?}", other),
                Err(e) => warn!("Failed to parse frame: {} (frame: {})", e, text),
            },
            Ok(Message::Close(_)) => {
                info!("Write connection closed by server");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                error!("Write connection error: {}", e);
                break;
            }
        }
    }
    alive.store(false, Ordering::SeqCst);
    // Dropping the senders fails every request still waiting on this connection.
    pending.clear();
}

#[async_trait]
impl RemoteStore for WsRemoteStore {
    async fn allocate_key(&self, _collection: &str) -> Result<String, StoreError> {
        Ok(self.keys.next_key())
    }

    async fn create_at(&self, collection: &str, key: &str, value: Value) -> Result<(), StoreError> {
        let req_id = self.req_id();
        let frame = protocol::create(collection, key, value, req_id);
        let (rx, pending) = self.request(req_id, &frame).await?;

        match timeout(self.config.request_timeout, rx).await {
            Ok(Ok(ack)) => ack.into_result(key),
            Ok(Err(_)) => Err(StoreError::Unavailable(
                "connection closed before the write was acknowledged".to_string(),
            )),
            Err(_) => {
                // The connection is in an unknown state; start over next time.
                self.discard_writer(req_id, &pending).await;
                Err(self.timeout_error())
            }
        }
    }

    async fn listen(&self, collection: &str) -> Result<Listener, StoreError> {
        let (mut sink, stream) = self.connect().await?.split();

        let req_id = self.req_id();
        let text = protocol::to_text(&protocol::subscribe(collection, req_id))?;
        timeout(self.config.request_timeout, sink.send(Message::Text(text)))
            .await
            .map_err(|_| self.timeout_error())?
            .map_err(|e| StoreError::Unavailable(format!("failed to subscribe: {}", e)))?;
        info!("Subscribed to {} at {}", collection, self.config.url);

        let (tx, listener) = Listener::channel();
        tokio::spawn(run_listener(
            collection.to_string(),
            sink,
            stream,
            tx,
            self.next_req_id.clone(),
            self.config.ping_interval,
            self.config.idle_timeout,
        ));
        Ok(listener)
    }
}

async fn run_listener(
    collection: String,
    mut sink: WsSink,
    mut stream: SplitStream<WsStream>,
    tx: ListenerSender,
    req_ids: Arc<AtomicU64>,
    ping_interval: Duration,
    idle_timeout: Duration,
) {
    let mut ping = tokio::time::interval(ping_interval);
    ping.tick().await;
    let mut last_activity = Instant::now();

    let reason = loop {
        tokio::select! {
            _ = tx.closed() => {
                let req_id = req_ids.fetch_add(1, Ordering::Relaxed);
                if let Ok(text) = protocol::to_text(&protocol::unsubscribe(&collection, req_id)) {
                    let _ = sink.send(Message::Text(text)).await;
                }
                let _ = sink.close().await;
                debug!("Listener on {} released", collection);
                return;
            }
            _ = ping.tick() => {
                if last_activity.elapsed() > idle_timeout {
                    warn!("Idle timeout on {} listener", collection);
                    break "idle timeout".to_string();
                }
                let req_id = req_ids.fetch_add(1, Ordering::Relaxed);
                let Ok(text) = protocol::to_text(&protocol::ping(req_id)) else {
                    continue;
                };
                if let Err(e) = sink.send(Message::Text(text)).await {
                    break format!("failed to send ping: {}", e);
                }
                debug!("Sent ping");
            }
            msg = stream.next() => {
                let msg = match msg {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        error!("Listener connection error: {}", e);
                        break format!("connection error: {}", e);
                    }
                    None => break "connection closed".to_string(),
                };
                last_activity = Instant::now();

                let text = match msg {
                    Message::Text(text) => text,
                    Message::Close(_) => {
                        info!("Listener connection closed by server");
                        break "connection closed by server".to_string();
                    }
                    _ => continue,
                };

                match protocol::parse_server_frame(&text) {
                    Ok(ServerFrame::Snapshot { collection: c, entries }) if c == collection => {
                        debug!("Snapshot of {} with {} entries", c, entries.len());
                        if tx.send(StoreEvent::Snapshot(entries)).is_err() {
                            return;
                        }
                    }
                    Ok(ServerFrame::Cancelled { collection: c, reason }) if c == collection => {
                        break reason;
                    }
                    Ok(ServerFrame::Ack(ack)) if !ack.success => {
                        break ack.error.unwrap_or_else(|| "subscription rejected".to_string());
                    }
                    Ok(ServerFrame::Pong { .. }) => debug!("Received pong"),
                    Ok(other) => debug!("Ignoring frame: {:?}", other),
                    Err(e) => warn!("Failed to parse frame: {} (frame: {})", e, text),
                }
            }
        }
    };

    let _ = tx.send(StoreEvent::Cancelled(reason));
}
