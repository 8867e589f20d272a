//! WebSocket device transport.
//!
//! Produces the same [`Connection`] abstraction as the MQTT-UDP front.
//! Audio rides in-band: binary frames are audio, text frames are commands.
//! No UDP session is involved.

use crate::transport::conn::{ConnError, ConnTransport, Connection, TransportKind};
use crate::transport::OnNewConnection;
use crate::udp::AUDIO_QUEUE_DEPTH;
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

enum WsOutbound {
    Cmd(Vec<u8>),
    Audio(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

struct WsTransport {
    out_tx: mpsc::Sender<WsOutbound>,
    audio_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    alive: Arc<AtomicBool>,
}

#[async_trait]
impl ConnTransport for WsTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    async fn send_cmd(&self, payload: &[u8]) -> Result<(), ConnError> {
        self.out_tx
            .send(WsOutbound::Cmd(payload.to_vec()))
            .await
            .map_err(|_| ConnError::Transport("websocket writer gone".to_string()))
    }

    fn send_audio(&self, frame: Vec<u8>) -> bool {
        self.out_tx.try_send(WsOutbound::Audio(frame)).is_ok()
    }

    fn take_audio_rx(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.audio_rx.lock().take()
    }

    fn hello_extra(&self, reply: &mut serde_json::Map<String, serde_json::Value>) {
        reply.insert("transport".into(), "websocket".into());
    }

    fn close(&self) {
        self.alive.store(false, Ordering::Release);
        let _ = self.out_tx.try_send(WsOutbound::Close);
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}

/// Accepts device WebSocket upgrades and hands connections to the shared
/// new-connection callback.
pub struct WsServer {
    listen_host: String,
    port: u16,
    on_new: OnNewConnection,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl WsServer {
    pub fn new(listen_host: String, port: u16, on_new: OnNewConnection) -> Self {
        Self {
            listen_host,
            port,
            on_new,
            accept_task: Mutex::new(None),
        }
    }

    pub async fn start(&self) -> Result<()> {
        let bind_addr = format!("{}:{}", self.listen_host, self.port);
        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("failed to bind WebSocket listener on {bind_addr}"))?;
        tracing::info!("WebSocket server listening on {bind_addr}");

        let on_new = self.on_new.clone();
        let handle = tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(err) => {
                        tracing::warn!("websocket accept error: {err}");
                        continue;
                    }
                };
                let on_new = on_new.clone();
                tokio::spawn(async move {
                    if let Err(err) = serve_upgrade(stream, peer, on_new).await {
                        tracing::debug!(%peer, "websocket session ended: {err}");
                    }
                });
            }
        });
        *self.accept_task.lock() = Some(handle);
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(handle) = self.accept_task.lock().take() {
            handle.abort();
        }
    }
}

async fn serve_upgrade(
    stream: TcpStream,
    peer: SocketAddr,
    on_new: OnNewConnection,
) -> Result<()> {
    let device_id: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let captured = device_id.clone();
    let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        *captured.lock() = extract_device_id(req);
        Ok(resp)
    };

    let ws = tokio_tungstenite::accept_hdr_async(stream, callback)
        .await
        .context("websocket handshake")?;

    let Some(device_id) = device_id.lock().take() else {
        tracing::warn!(%peer, "websocket upgrade without device-id rejected");
        return Ok(());
    };

    let (mut sink, mut source) = ws.split();
    let (out_tx, mut out_rx) = mpsc::channel::<WsOutbound>(AUDIO_QUEUE_DEPTH);
    let (audio_tx, audio_rx) = mpsc::channel::<Vec<u8>>(AUDIO_QUEUE_DEPTH);
    let pong_tx = out_tx.clone();
    let alive = Arc::new(AtomicBool::new(true));

    let transport = WsTransport {
        out_tx,
        audio_rx: Mutex::new(Some(audio_rx)),
        alive: alive.clone(),
    };
    let conn = Connection::new(device_id.clone(), Box::new(transport));
    tracing::info!(%peer, %device_id, "websocket device connected");
    on_new(conn.clone());

    let writer = tokio::spawn(async move {
        while let Some(outbound) = out_rx.recv().await {
            let result = match outbound {
                WsOutbound::Cmd(payload) => {
                    sink.send(Message::Text(String::from_utf8_lossy(&payload).into_owned()))
                        .await
                }
                WsOutbound::Audio(frame) => sink.send(Message::Binary(frame)).await,
                WsOutbound::Pong(data) => sink.send(Message::Pong(data)).await,
                WsOutbound::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            };
            if result.is_err() {
                break;
            }
        }
    });

    while let Some(message) = source.next().await {
        match message {
            Ok(Message::Text(text)) => {
                if let Err(err) = conn.push_cmd(text.into_bytes()) {
                    tracing::warn!(%device_id, "inbound command dropped: {err}");
                }
            }
            Ok(Message::Binary(frame)) => {
                conn.touch();
                if audio_tx.try_send(frame).is_err() {
                    tracing::warn!(%device_id, "inbound audio queue full, frame dropped");
                }
            }
            Ok(Message::Ping(data)) => {
                let _ = pong_tx.try_send(WsOutbound::Pong(data));
            }
            Ok(Message::Pong(_) | Message::Frame(_)) => {}
            Ok(Message::Close(_)) | Err(_) => break,
        }
    }

    alive.store(false, Ordering::Release);
    conn.destroy();
    writer.abort();
    Ok(())
}

fn extract_device_id(req: &Request) -> Option<String> {
    if let Some(value) = req.headers().get("device-id") {
        if let Ok(id) = value.to_str() {
            if !id.is_empty() {
                return Some(id.to_string());
            }
        }
    }
    // Fallback: ?device-id=… query parameter.
    let query = req.uri().query()?;
    for pair in query.split('&') {
        let mut parts = pair.splitn(2, '=');
        if parts.next() == Some("device-id") {
            let id = parts.next().unwrap_or_default();
            if !id.is_empty() {
                return Some(id.to_string());
            }
        }
    }
    None
}
