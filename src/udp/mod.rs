//! Encrypted UDP datagram plane.
//!
//! One listening socket serves every device. Datagrams are demultiplexed to
//! per-session inbound queues via two indexes: by remote address once the
//! first datagram has arrived, and always by the connection id carried in
//! the datagram header. Outbound frames are encrypted and written by one
//! sender task per session.

mod quarantine;
mod session;

pub use quarantine::Quarantine;
pub use session::{UdpSession, AUDIO_QUEUE_DEPTH};

use crate::codec::{ConnId, HEADER_LEN};
use anyhow::{Context, Result};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

/// Capability for prompting devices behind an IP to re-handshake. Installed
/// by the broker; modeled as a capability rather than a back-pointer so
/// teardown order stays straightforward.
pub trait GoodbyeSender: Send + Sync {
    /// Ask every device client whose control connection originates from
    /// `ip` to re-handshake. Returns how many clients were notified.
    fn send_goodbye(&self, ip: IpAddr) -> usize;
}

#[derive(Debug, Clone)]
pub struct UdpConfig {
    pub listen_host: String,
    pub listen_port: u16,
    pub external_host: String,
    pub external_port: u16,
}

pub struct UdpPlane {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    external_host: String,
    external_port: u16,
    by_conn: DashMap<ConnId, Arc<UdpSession>>,
    by_addr: DashMap<SocketAddr, Arc<UdpSession>>,
    quarantine: Quarantine,
    goodbye: RwLock<Option<Arc<dyn GoodbyeSender>>>,
    closed: AtomicBool,
    recv_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl UdpPlane {
    /// Bind the listening socket and start the inbound loop. A bind failure
    /// here is fatal to startup.
    pub async fn bind(cfg: &UdpConfig) -> Result<Arc<Self>> {
        let bind_addr = format!("{}:{}", cfg.listen_host, cfg.listen_port);
        let socket = UdpSocket::bind(&bind_addr)
            .await
            .with_context(|| format!("failed to bind UDP listener on {bind_addr}"))?;
        let local_addr = socket.local_addr().context("udp local addr")?;
        tracing::info!("UDP listener bound on {local_addr}");

        let plane = Arc::new(Self {
            socket: Arc::new(socket),
            local_addr,
            external_host: cfg.external_host.clone(),
            external_port: cfg.external_port,
            by_conn: DashMap::new(),
            by_addr: DashMap::new(),
            quarantine: Quarantine::new(),
            goodbye: RwLock::new(None),
            closed: AtomicBool::new(false),
            recv_task: parking_lot::Mutex::new(None),
        });

        let recv_plane = plane.clone();
        let handle = tokio::spawn(async move { recv_plane.recv_loop().await });
        *plane.recv_task.lock() = Some(handle);
        Ok(plane)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Endpoint advertised to devices in the hello reply.
    pub fn external_endpoint(&self) -> (String, u16) {
        let host = if self.external_host.is_empty() {
            self.local_addr.ip().to_string()
        } else {
            self.external_host.clone()
        };
        let port = if self.external_port == 0 {
            self.local_addr.port()
        } else {
            self.external_port
        };
        (host, port)
    }

    pub fn install_goodbye_sender(&self, sender: Arc<dyn GoodbyeSender>) {
        *self.goodbye.write() = Some(sender);
    }

    /// Mint a session: fresh key, connection id and nonce template, indexed
    /// by connection id. The per-session sender task starts immediately and
    /// drops frames until a remote address is learned.
    pub fn create_session(&self, device_id: &str, client_id: &str) -> Arc<UdpSession> {
        let (session, mut send_rx, mut closed_rx) =
            UdpSession::new(device_id.to_string(), client_id.to_string());
        let session = Arc::new(session);
        self.by_conn.insert(session.conn_id(), session.clone());

        let socket = self.socket.clone();
        let sender_session = session.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = closed_rx.changed() => break,
                    frame = send_rx.recv() => {
                        let Some(frame) = frame else { break };
                        let Some(addr) = sender_session.remote() else {
                            continue;
                        };
                        let datagram = sender_session.seal_next(&frame);
                        if let Err(err) = socket.send_to(&datagram, addr).await {
                            tracing::error!(device_id = %sender_session.device_id,
                                "udp send failed: {err}");
                        }
                    }
                }
            }
            tracing::debug!(device_id = %sender_session.device_id, "udp sender exited");
        });

        tracing::debug!(device_id, conn_id = %session.conn_id(), "udp session created");
        session
    }

    /// Remove both indexes, close the queues and stop the sender.
    pub fn close_session(&self, conn_id: ConnId) {
        if let Some((_, session)) = self.by_conn.remove(&conn_id) {
            if let Some(addr) = session.remote() {
                self.by_addr.remove(&addr);
            }
            session.close();
            tracing::debug!(conn_id = %conn_id, "udp session closed");
        }
    }

    pub fn session_by_conn(&self, conn_id: ConnId) -> Option<Arc<UdpSession>> {
        self.by_conn.get(&conn_id).map(|entry| entry.clone())
    }

    pub fn session_count(&self) -> usize {
        self.by_conn.len()
    }

    pub fn addr_index_len(&self) -> usize {
        self.by_addr.len()
    }

    /// Close the socket loop and every session. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.recv_task.lock().take() {
            handle.abort();
        }
        for entry in self.by_conn.iter() {
            entry.value().close();
        }
        self.by_conn.clear();
        self.by_addr.clear();
        tracing::info!("UDP plane on {} closed", self.local_addr);
    }

    async fn recv_loop(self: Arc<Self>) {
        let mut buf = [0u8; 4096];
        loop {
            let (len, addr) = match self.socket.recv_from(&mut buf).await {
                Ok(pair) => pair,
                Err(err) => {
                    if self.closed.load(Ordering::Acquire) {
                        return;
                    }
                    tracing::error!("udp recv failed: {err}");
                    continue;
                }
            };
            if self.closed.load(Ordering::Acquire) {
                return;
            }
            self.process_datagram(addr, &buf[..len]);
        }
    }

    fn process_datagram(&self, addr: SocketAddr, data: &[u8]) {
        if data.len() < HEADER_LEN {
            tracing::warn!(%addr, len = data.len(), "undersized datagram dropped");
            return;
        }

        let session = match self.by_addr.get(&addr) {
            Some(entry) => entry.clone(),
            None => {
                let conn_id = match ConnId::from_datagram(data) {
                    Some(id) => id,
                    None => return,
                };
                // Inside a drop window, only a now-known connection id
                // lifts the quarantine early.
                if self.quarantine.should_drop(addr) && !self.by_conn.contains_key(&conn_id) {
                    return;
                }
                match self.by_conn.get(&conn_id) {
                    Some(entry) => {
                        let session = entry.clone();
                        session.set_remote(addr);
                        self.by_addr.insert(addr, session.clone());
                        self.quarantine.clear(addr);
                        session
                    }
                    None => {
                        self.handle_unknown_peer(addr);
                        return;
                    }
                }
            }
        };

        session.touch();
        let frame = match session.open_datagram(data) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::error!(%addr, "datagram decrypt failed: {err}");
                return;
            }
        };
        if !session.push_audio(frame) {
            tracing::warn!(%addr, device_id = %session.device_id,
                "inbound audio queue full, frame dropped");
        }
    }

    fn handle_unknown_peer(&self, addr: SocketAddr) {
        if !self.quarantine.note_unknown(addr) {
            return;
        }
        let goodbye = self.goodbye.read().clone();
        if let Some(sender) = goodbye {
            let notified = sender.send_goodbye(addr.ip());
            if notified > 0 {
                tracing::info!(%addr, notified, "unknown udp session, goodbye sent by IP");
            }
        }
        tracing::debug!(%addr, "no session for datagram");
    }
}

impl Drop for UdpPlane {
    fn drop(&mut self) {
        if let Some(handle) = self.recv_task.lock().take() {
            handle.abort();
        }
    }
}
