//! Long-lived WebSocket client to the administrative backend.
//!
//! Multiplexes request/response RPC over one socket, serves
//! server-initiated requests through a path handler table, keeps the
//! connection alive with pings, and reconnects with exponential backoff.

use crate::control::types::{classify, Frame, RpcRequest, RpcResponse};
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// Paths the backend calls into the edge server.
pub const PATH_SYSTEM_CONFIG: &str = "/api/server/system_config";
pub const PATH_INJECT_MESSAGE: &str = "/api/server/inject_message";

/// Path the edge server reports device online/offline transitions to.
pub const PATH_DEVICE_EVENT: &str = "/api/device/event";

const CONNECT_DEADLINE: Duration = Duration::from_secs(10);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const PING_DEADLINE: Duration = Duration::from_secs(10);
const BACKOFF_INITIAL: Duration = Duration::from_secs(3);
const BACKOFF_MAX: Duration = Duration::from_secs(60);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Handler for a server-initiated request: returns a response body or an
/// (http-status, message) error.
pub type RpcHandler =
    Arc<dyn Fn(RpcRequest) -> BoxFuture<'static, Result<serde_json::Value, (u16, String)>> + Send + Sync>;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("not connected to backend")]
    NotConnected,
    #[error("disconnected while waiting for response")]
    Disconnected,
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport: {0}")]
    Transport(String),
}

struct ControlInner {
    ws_url: String,
    origin: String,
    client_uuid: String,
    request_timeout: Duration,
    writer: tokio::sync::Mutex<Option<WsSink>>,
    pending: DashMap<String, oneshot::Sender<RpcResponse>>,
    handlers: DashMap<String, RpcHandler>,
    connected: AtomicBool,
    shutting_down: AtomicBool,
    reconnecting: AtomicBool,
    stop_tx: watch::Sender<bool>,
    conn_tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Singleton per process; clone to share.
#[derive(Clone)]
pub struct ControlClient {
    inner: Arc<ControlInner>,
}

impl ControlClient {
    pub fn new(backend_url: &str, request_timeout: Duration) -> Self {
        let (stop_tx, _) = watch::channel(false);
        let client = Self {
            inner: Arc::new(ControlInner {
                ws_url: ws_url_from_backend(backend_url),
                origin: backend_url.to_string(),
                client_uuid: uuid::Uuid::new_v4().to_string(),
                request_timeout,
                writer: tokio::sync::Mutex::new(None),
                pending: DashMap::new(),
                handlers: DashMap::new(),
                connected: AtomicBool::new(false),
                shutting_down: AtomicBool::new(false),
                reconnecting: AtomicBool::new(false),
                stop_tx,
                conn_tasks: Mutex::new(Vec::new()),
            }),
        };
        client.register_builtin_handlers();
        client
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Register a handler for a server-initiated request path.
    pub fn register_handler(&self, path: &str, handler: RpcHandler) {
        self.inner.handlers.insert(path.to_string(), handler);
    }

    fn register_builtin_handlers(&self) {
        self.register_handler(
            "/api/server/ping",
            Arc::new(|_req| {
                Box::pin(async {
                    Ok(serde_json::json!({
                        "message": "pong from server",
                        "time": unix_seconds(),
                    }))
                })
            }),
        );
        self.register_handler(
            "/api/server/info",
            Arc::new(|req| {
                Box::pin(async move {
                    Ok(serde_json::json!({
                        "server_name": "voxedge",
                        "version": env!("CARGO_PKG_VERSION"),
                        "request_id": req.id,
                    }))
                })
            }),
        );
        self.register_handler(
            "/api/ws/echo",
            Arc::new(|req| Box::pin(async move { Ok(req.body) })),
        );
        self.register_handler(
            "/api/ws/status",
            Arc::new(|_req| {
                Box::pin(async { Ok(serde_json::json!({ "status": "ok", "connected": true })) })
            }),
        );
    }

    /// Initial bring-up: try to connect once and fall back to the backoff
    /// loop on failure. Safe to call repeatedly.
    pub async fn start(&self) {
        if let Err(err) = self.connect().await {
            tracing::warn!("initial backend connect failed: {err}, starting reconnect loop");
            self.trigger_reconnect();
        }
    }

    /// Open the socket if it is not open. Spawns the reader and heartbeat
    /// for the new connection.
    pub async fn connect(&self) -> Result<(), RpcError> {
        if self.is_connected() {
            return Ok(());
        }
        if self.inner.shutting_down.load(Ordering::Acquire) {
            return Err(RpcError::NotConnected);
        }

        let mut request = self
            .inner
            .ws_url
            .clone()
            .into_client_request()
            .map_err(|err| RpcError::Transport(err.to_string()))?;
        let headers = request.headers_mut();
        if let Ok(origin) = self.inner.origin.parse() {
            headers.insert("Origin", origin);
        }
        if let Ok(uuid) = self.inner.client_uuid.parse() {
            headers.insert("UUID", uuid);
        }

        let (stream, _) = tokio::time::timeout(
            CONNECT_DEADLINE,
            tokio_tungstenite::connect_async(request),
        )
        .await
        .map_err(|_| RpcError::Timeout(CONNECT_DEADLINE))?
        .map_err(|err| RpcError::Transport(err.to_string()))?;

        let (sink, source) = stream.split();
        *self.inner.writer.lock().await = Some(sink);
        self.inner.connected.store(true, Ordering::Release);

        let mut tasks = self.inner.conn_tasks.lock();
        tasks.push(tokio::spawn(self.clone().read_loop(source)));
        tasks.push(tokio::spawn(self.clone().heartbeat_loop()));
        drop(tasks);

        tracing::info!(url = %self.inner.ws_url, "backend control socket connected");
        Ok(())
    }

    /// Send a request and await the matching response.
    pub async fn send_request(
        &self,
        method: &str,
        path: &str,
        body: serde_json::Value,
    ) -> Result<RpcResponse, RpcError> {
        if !self.is_connected() {
            self.connect().await?;
        }

        let request = RpcRequest::new(method, path, body);
        let request_id = request.id.clone();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(request_id.clone(), tx);

        let payload =
            serde_json::to_string(&request).map_err(|err| RpcError::Transport(err.to_string()))?;
        if let Err(err) = self.write_text(payload).await {
            self.inner.pending.remove(&request_id);
            return Err(err);
        }

        let result = tokio::time::timeout(self.inner.request_timeout, rx).await;
        self.inner.pending.remove(&request_id);
        match result {
            Ok(Ok(response)) => Ok(response),
            // Sender dropped: the pending table was cleared on disconnect.
            Ok(Err(_)) => Err(RpcError::Disconnected),
            Err(_) => Err(RpcError::Timeout(self.inner.request_timeout)),
        }
    }

    /// Respond to a server-initiated request.
    pub async fn send_response(&self, response: &RpcResponse) -> Result<(), RpcError> {
        let payload =
            serde_json::to_string(response).map_err(|err| RpcError::Transport(err.to_string()))?;
        self.write_text(payload).await
    }

    /// Fire-and-forget device online/offline notification.
    pub fn notify_device_event(&self, event: &str, device_id: &str) {
        let client = self.clone();
        let body = serde_json::json!({ "event": event, "device_id": device_id });
        let event = event.to_string();
        tokio::spawn(async move {
            if let Err(err) = client.send_request("POST", PATH_DEVICE_EVENT, body).await {
                tracing::debug!(%event, "device event not delivered: {err}");
            }
        });
    }

    async fn write_text(&self, payload: String) -> Result<(), RpcError> {
        let mut writer = self.inner.writer.lock().await;
        let Some(sink) = writer.as_mut() else {
            return Err(RpcError::NotConnected);
        };
        sink.send(Message::Text(payload))
            .await
            .map_err(|err| RpcError::Transport(err.to_string()))
    }

    async fn write_raw(&self, message: Message) -> Result<(), RpcError> {
        let mut writer = self.inner.writer.lock().await;
        let Some(sink) = writer.as_mut() else {
            return Err(RpcError::NotConnected);
        };
        sink.send(message)
            .await
            .map_err(|err| RpcError::Transport(err.to_string()))
    }

    /// Single reader for the socket; branches on frame type.
    async fn read_loop(self, mut source: WsSource) {
        loop {
            match source.next().await {
                Some(Ok(Message::Text(text))) => match serde_json::from_str(&text) {
                    Ok(value) => self.handle_frame(value),
                    Err(err) => tracing::error!("bad backend frame: {err}"),
                },
                Some(Ok(Message::Ping(data))) => {
                    if self.write_raw(Message::Pong(data)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Pong(_) | Message::Binary(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
            }
        }
        self.handle_connection_lost().await;
    }

    fn handle_frame(&self, value: serde_json::Value) {
        match classify(value) {
            Frame::Request(request) => {
                let client = self.clone();
                tokio::spawn(async move { client.dispatch_request(request).await });
            }
            Frame::Response(response) => {
                if let Some((_, waiter)) = self.inner.pending.remove(&response.id) {
                    let _ = waiter.send(response);
                } else {
                    tracing::debug!(id = %response.id, "response for unknown request id");
                }
            }
            Frame::Unknown(value) => {
                tracing::warn!("unrecognized backend frame: {value}");
            }
        }
    }

    async fn dispatch_request(&self, request: RpcRequest) {
        tracing::debug!(id = %request.id, method = %request.method, path = %request.path,
            "backend request");
        let handler = self.inner.handlers.get(&request.path).map(|h| h.clone());
        let response = match handler {
            Some(handler) => {
                let id = request.id.clone();
                match handler(request).await {
                    Ok(body) => RpcResponse::ok(&id, body),
                    Err((status, message)) => RpcResponse::error(&id, status, &message),
                }
            }
            None => {
                tracing::warn!(path = %request.path, "unknown backend request path");
                RpcResponse::error(&request.id, 404, "unknown endpoint")
            }
        };
        if let Err(err) = self.send_response(&response).await {
            tracing::error!("response write failed: {err}");
        }
    }

    async fn heartbeat_loop(self) {
        let mut stop_rx = self.inner.stop_tx.subscribe();
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await; // skip the immediate first tick
        loop {
            tokio::select! {
                _ = stop_rx.changed() => return,
                _ = ticker.tick() => {
                    if !self.is_connected() {
                        return;
                    }
                    let ping = tokio::time::timeout(
                        PING_DEADLINE,
                        self.write_raw(Message::Ping(Vec::new())),
                    )
                    .await;
                    match ping {
                        Ok(Ok(())) => tracing::trace!("backend ping sent"),
                        _ => {
                            tracing::warn!("backend ping failed, reconnecting");
                            self.handle_connection_lost().await;
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection_lost(&self) {
        if !self.disconnect_internal().await {
            return;
        }
        self.trigger_reconnect();
    }

    /// Tear down the socket. Returns false when already disconnected.
    async fn disconnect_internal(&self) -> bool {
        if !self.inner.connected.swap(false, Ordering::AcqRel) {
            return false;
        }
        *self.inner.writer.lock().await = None;
        // Fail every pending waiter rather than letting callers ride out
        // their own timeouts.
        let ids: Vec<String> = self.inner.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            drop(self.inner.pending.remove(&id));
        }
        tracing::info!("backend control socket disconnected");
        true
    }

    fn trigger_reconnect(&self) {
        if self.inner.shutting_down.load(Ordering::Acquire)
            || self.inner.reconnecting.swap(true, Ordering::AcqRel)
        {
            return;
        }
        let client = self.clone();
        tokio::spawn(async move {
            client.reconnect_loop().await;
            client.inner.reconnecting.store(false, Ordering::Release);
        });
    }

    /// Exponential backoff: 3 s doubling to a 60 s cap, reset on success.
    async fn reconnect_loop(&self) {
        let mut stop_rx = self.inner.stop_tx.subscribe();
        let mut delay = BACKOFF_INITIAL;
        let mut attempt = 0u32;
        loop {
            if self.inner.shutting_down.load(Ordering::Acquire) || self.is_connected() {
                return;
            }
            attempt += 1;
            tracing::warn!(attempt, "backend reconnect in {:?}", delay);
            tokio::select! {
                _ = stop_rx.changed() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            match self.connect().await {
                Ok(()) => {
                    tracing::info!("backend connection restored");
                    return;
                }
                Err(err) => {
                    tracing::warn!(attempt, "backend reconnect failed: {err}");
                    delay = (delay * 2).min(BACKOFF_MAX);
                }
            }
        }
    }

    /// Graceful shutdown; idempotent.
    pub async fn stop(&self) {
        if self.inner.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.inner.stop_tx.send(true);
        self.disconnect_internal().await;
        let tasks: Vec<JoinHandle<()>> = self.inner.conn_tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        tracing::info!("backend control client stopped");
    }
}

fn ws_url_from_backend(backend_url: &str) -> String {
    let trimmed = backend_url.trim_end_matches('/');
    if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{rest}/ws")
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{rest}/ws")
    } else if trimmed.starts_with("ws://") || trimmed.starts_with("wss://") {
        format!("{trimmed}/ws")
    } else {
        format!("ws://{trimmed}/ws")
    }
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_url_mapping() {
        assert_eq!(
            ws_url_from_backend("http://localhost:8080"),
            "ws://localhost:8080/ws"
        );
        assert_eq!(
            ws_url_from_backend("https://manager.example.com/"),
            "wss://manager.example.com/ws"
        );
        assert_eq!(
            ws_url_from_backend("manager.internal:8080"),
            "ws://manager.internal:8080/ws"
        );
    }

    #[tokio::test]
    async fn request_without_connection_fails_fast() {
        let client = ControlClient::new("http://127.0.0.1:1", Duration::from_secs(1));
        let err = client
            .send_request("GET", "/api/ws/status", serde_json::Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Transport(_) | RpcError::Timeout(_)));
        assert!(client.inner.pending.is_empty());
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let client = ControlClient::new("http://127.0.0.1:1", Duration::from_secs(1));
        client.stop().await;
        client.stop().await;
        assert!(!client.is_connected());
    }
}
