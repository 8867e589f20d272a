//! Embedded MQTT broker.
//!
//! Accepts device connections over TCP and optionally TLS, authenticates
//! them against the configured credential list, and fans published messages
//! out to connected clients and in-process (inline) subscribers. The adapter
//! consumes it through the `publish`/`subscribe_inline` capabilities; the
//! UDP plane consumes it through the goodbye-by-IP fan-out.

use crate::core::config::{MqttServerConfig, TopicsConfig};
use crate::mqtt::codec::{
    read_packet, write_packet, CodecError, ConnectCode, Packet, Publish, Qos,
};
use crate::mqtt::topics::TopicTrieNode;
use crate::udp::GoodbyeSender;
use anyhow::{Context, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

const CONNECT_DEADLINE: Duration = Duration::from_secs(10);
const CLIENT_QUEUE_DEPTH: usize = 64;

type InlineHandler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

#[derive(Clone)]
struct InlineSub {
    id: u32,
    handler: InlineHandler,
}

struct BrokerClient {
    id: String,
    username: Option<String>,
    admin: bool,
    remote: SocketAddr,
    subs: Mutex<Vec<(String, Qos)>>,
    outbound: mpsc::Sender<Packet>,
    closed: AtomicBool,
}

impl BrokerClient {
    fn enqueue(&self, packet: Packet) {
        if self.outbound.try_send(packet).is_err() {
            tracing::warn!(client_id = %self.id, "client outbound queue full, packet dropped");
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

struct BrokerInner {
    cfg: MqttServerConfig,
    topics: TopicsConfig,
    clients: DashMap<String, Arc<BrokerClient>>,
    inline_subs: Mutex<TopicTrieNode<InlineSub>>,
    accept_tasks: Mutex<Vec<JoinHandle<()>>>,
    tcp_addr: Mutex<Option<SocketAddr>>,
    stopped: AtomicBool,
}

/// Cloneable broker handle. `stop()` synchronously releases the listeners
/// before returning, so a fresh `start()` can rebind the same ports.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl Broker {
    /// Bind listeners and start serving. Fails fast on bind errors.
    pub async fn start(cfg: MqttServerConfig, topics: TopicsConfig) -> Result<Self> {
        let inner = Arc::new(BrokerInner {
            cfg: cfg.clone(),
            topics,
            clients: DashMap::new(),
            inline_subs: Mutex::new(TopicTrieNode::new()),
            accept_tasks: Mutex::new(Vec::new()),
            tcp_addr: Mutex::new(None),
            stopped: AtomicBool::new(false),
        });
        let broker = Self { inner };

        let bind_addr = format!("{}:{}", cfg.listen_host, cfg.listen_port);
        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("failed to bind MQTT listener on {bind_addr}"))?;
        let local_addr = listener.local_addr().context("mqtt listener local addr")?;
        *broker.inner.tcp_addr.lock() = Some(local_addr);
        tracing::info!("MQTT broker listening on {local_addr}");
        broker.spawn_accept_loop(listener, None);

        if let Some(tls) = &cfg.tls {
            if tls.enable {
                let acceptor = build_tls_acceptor(&tls.pem, &tls.key)?;
                let tls_addr = format!("{}:{}", cfg.listen_host, tls.port);
                let tls_listener = TcpListener::bind(&tls_addr)
                    .await
                    .with_context(|| format!("failed to bind MQTT TLS listener on {tls_addr}"))?;
                tracing::info!("MQTT broker TLS listening on {tls_addr}");
                broker.spawn_accept_loop(tls_listener, Some(acceptor));
            }
        }

        Ok(broker)
    }

    fn spawn_accept_loop(&self, listener: TcpListener, acceptor: Option<TlsAcceptor>) {
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(err) => {
                        tracing::warn!("mqtt accept error: {err}");
                        continue;
                    }
                };
                let inner = inner.clone();
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    let result = match acceptor {
                        Some(acceptor) => match acceptor.accept(stream).await {
                            Ok(tls_stream) => serve_client(inner, tls_stream, peer).await,
                            Err(err) => {
                                tracing::warn!(%peer, "tls handshake failed: {err}");
                                return;
                            }
                        },
                        None => serve_client(inner, stream, peer).await,
                    };
                    if let Err(err) = result {
                        tracing::debug!(%peer, "client session ended: {err}");
                    }
                });
            }
        });
        self.inner.accept_tasks.lock().push(handle);
    }

    /// Stop listeners and disconnect every client. The listener sockets are
    /// released before this returns.
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let tasks: Vec<JoinHandle<()>> = self.inner.accept_tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
        for entry in self.inner.clients.iter() {
            entry.value().close();
            entry.value().enqueue(Packet::Disconnect);
        }
        self.inner.clients.clear();
        tracing::info!("MQTT broker stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Publish to inline subscribers and matching connected clients.
    /// Fan-out to subscribers is at QoS 0 regardless of `qos`; the flag is
    /// honored on the publisher side only (PUBACK).
    pub fn publish(&self, topic: &str, payload: &[u8], retain: bool, qos: u8) -> Result<()> {
        if self.inner.stopped.load(Ordering::Acquire) {
            anyhow::bail!("broker is stopped");
        }
        let _ = qos;
        self.inner.dispatch(topic, payload, retain);
        Ok(())
    }

    /// Register an in-process subscriber. Inline subscribers are tagged and
    /// excluded from the goodbye fan-out.
    pub fn subscribe_inline(
        &self,
        filter: &str,
        sub_id: u32,
        handler: impl Fn(&str, &[u8]) + Send + Sync + 'static,
    ) -> Result<()> {
        if self.inner.stopped.load(Ordering::Acquire) {
            anyhow::bail!("broker is stopped");
        }
        self.inner.inline_subs.lock().insert(
            filter,
            InlineSub {
                id: sub_id,
                handler: Arc::new(handler),
            },
        );
        Ok(())
    }

    pub fn unsubscribe_inline(&self, filter: &str, sub_id: u32) {
        self.inner
            .inline_subs
            .lock()
            .remove(filter, |sub| sub.id == sub_id);
    }

    /// Send a goodbye on the device-subscribe topic of every device client
    /// whose control connection originates from `remote_ip`, prompting a
    /// fresh handshake. Admin clients are skipped. Returns the number of
    /// clients notified.
    pub fn publish_goodbye_by_remote_ip(&self, remote_ip: IpAddr) -> usize {
        let payload = serde_json::json!({ "type": "goodbye" }).to_string();
        // Collect targets first: dispatch walks the client map itself.
        let topics: Vec<String> = self
            .inner
            .clients
            .iter()
            .filter(|entry| !entry.value().admin && entry.value().remote.ip() == remote_ip)
            .filter_map(|entry| parse_mac_from_client_id(&entry.value().id))
            .map(|mac| format!("{}/{}", self.inner.topics.device_sub_prefix, mac))
            .collect();
        for topic in &topics {
            self.inner.dispatch(topic, payload.as_bytes(), false);
        }
        topics.len()
    }

    pub fn client_count(&self) -> usize {
        self.inner.clients.len()
    }

    /// Bound address of the plain TCP listener.
    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        *self.inner.tcp_addr.lock()
    }

    /// Goodbye capability handed to the UDP plane.
    pub fn goodbye_sender(&self) -> Arc<dyn GoodbyeSender> {
        Arc::new(BrokerGoodbye {
            broker: self.clone(),
        })
    }
}

struct BrokerGoodbye {
    broker: Broker,
}

impl GoodbyeSender for BrokerGoodbye {
    fn send_goodbye(&self, ip: IpAddr) -> usize {
        self.broker.publish_goodbye_by_remote_ip(ip)
    }
}

impl BrokerInner {
    fn dispatch(&self, topic: &str, payload: &[u8], retain: bool) {
        let inline: Vec<InlineSub> = {
            let subs = self.inline_subs.lock();
            subs.find(topic).into_iter().cloned().collect()
        };
        for sub in inline {
            (sub.handler)(topic, payload);
        }

        for entry in self.clients.iter() {
            let client = entry.value();
            if client.closed.load(Ordering::Acquire) {
                continue;
            }
            let subscribed = {
                let subs = client.subs.lock();
                subs.iter()
                    .any(|(filter, _)| crate::mqtt::topics::topic_matches(filter, topic))
            };
            if !subscribed {
                continue;
            }
            client.enqueue(Packet::Publish(Publish {
                topic: topic.to_string(),
                payload: payload.to_vec(),
                qos: Qos::AtMostOnce,
                packet_id: None,
                retain,
            }));
        }
    }

    fn authenticate(&self, username: Option<&str>, password: Option<&[u8]>) -> ConnectCode {
        let auth = &self.cfg.auth;
        if !auth.enable {
            return ConnectCode::Accepted;
        }
        let Some(username) = username else {
            return ConnectCode::NotAuthorized;
        };
        let matched = auth.users.iter().any(|user| {
            user.username == username
                && password.map_or(user.password.is_empty(), |pw| pw == user.password.as_bytes())
        });
        if matched {
            ConnectCode::Accepted
        } else {
            ConnectCode::BadCredentials
        }
    }

    fn is_admin(&self, username: Option<&str>) -> bool {
        match (&self.cfg.auth.admin_username, username) {
            (Some(admin), Some(username)) => admin == username,
            _ => false,
        }
    }
}

async fn serve_client<S>(inner: Arc<BrokerInner>, stream: S, peer: SocketAddr) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);

    let connect = match tokio::time::timeout(CONNECT_DEADLINE, read_packet(&mut reader)).await {
        Ok(Ok(Packet::Connect(connect))) => connect,
        Ok(Ok(_)) => anyhow::bail!("first packet was not CONNECT"),
        Ok(Err(err)) => return Err(err.into()),
        Err(_) => anyhow::bail!("CONNECT deadline expired"),
    };

    let code = inner.authenticate(connect.username.as_deref(), connect.password.as_deref());
    write_packet(
        &mut writer,
        &Packet::ConnAck {
            session_present: false,
            code,
        },
    )
    .await?;
    if code != ConnectCode::Accepted {
        tracing::warn!(%peer, client_id = %connect.client_id, "connect refused: {code:?}");
        return Ok(());
    }

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Packet>(CLIENT_QUEUE_DEPTH);
    let client = Arc::new(BrokerClient {
        id: connect.client_id.clone(),
        username: connect.username.clone(),
        admin: inner.is_admin(connect.username.as_deref()),
        remote: peer,
        subs: Mutex::new(Vec::new()),
        outbound: outbound_tx,
        closed: AtomicBool::new(false),
    });

    // Duplicate client id takes over the existing connection.
    if let Some(previous) = inner.clients.insert(connect.client_id.clone(), client.clone()) {
        tracing::info!(client_id = %connect.client_id, "duplicate client id, closing previous");
        previous.close();
        previous.enqueue(Packet::Disconnect);
    }
    tracing::debug!(%peer, client_id = %client.id, admin = client.admin, "mqtt client connected");

    let writer_client = client.clone();
    let writer_task = tokio::spawn(async move {
        while let Some(packet) = outbound_rx.recv().await {
            let disconnect = matches!(packet, Packet::Disconnect);
            if write_packet(&mut writer, &packet).await.is_err() {
                break;
            }
            if disconnect || writer_client.closed.load(Ordering::Acquire) {
                break;
            }
        }
    });

    let result = client_read_loop(&inner, &client, &mut reader).await;

    client.close();
    // Remove only if this connection still owns the id.
    inner
        .clients
        .remove_if(&client.id, |_, current| Arc::ptr_eq(current, &client));
    writer_task.abort();
    tracing::debug!(client_id = %client.id, username = ?client.username, "mqtt client disconnected");
    result
}

async fn client_read_loop<R: AsyncRead + Unpin>(
    inner: &Arc<BrokerInner>,
    client: &Arc<BrokerClient>,
    reader: &mut R,
) -> Result<()> {
    loop {
        if client.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        let packet = match read_packet(reader).await {
            Ok(packet) => packet,
            Err(CodecError::Io(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        match packet {
            Packet::Publish(publish) => {
                if let (Qos::AtLeastOnce, Some(id)) = (publish.qos, publish.packet_id) {
                    client.enqueue(Packet::PubAck(id));
                }
                inner.dispatch(&publish.topic, &publish.payload, publish.retain);
            }
            Packet::Subscribe(subscribe) => {
                let codes: Vec<u8> = subscribe
                    .filters
                    .iter()
                    .map(|(_, qos)| qos.bits())
                    .collect();
                {
                    let mut subs = client.subs.lock();
                    for (filter, qos) in subscribe.filters {
                        subs.retain(|(existing, _)| *existing != filter);
                        subs.push((filter, qos));
                    }
                }
                client.enqueue(Packet::SubAck {
                    packet_id: subscribe.packet_id,
                    codes,
                });
            }
            Packet::Unsubscribe(unsubscribe) => {
                {
                    let mut subs = client.subs.lock();
                    subs.retain(|(filter, _)| !unsubscribe.filters.contains(filter));
                }
                client.enqueue(Packet::UnsubAck(unsubscribe.packet_id));
            }
            Packet::PingReq => client.enqueue(Packet::PingResp),
            Packet::Disconnect => return Ok(()),
            Packet::PubAck(_) => {}
            other => {
                tracing::warn!(client_id = %client.id, "unexpected packet from client: {other:?}");
            }
        }
    }
}

/// Extract the underscore-form mac from a client id. Accepts the group form
/// `<group>@@@<mac>@@@<uuid>` and a bare mac.
pub fn parse_mac_from_client_id(client_id: &str) -> Option<String> {
    if client_id.is_empty() {
        return None;
    }
    if client_id.contains("@@@") {
        let parts: Vec<&str> = client_id.split("@@@").collect();
        if parts.len() >= 2 && !parts[1].is_empty() {
            return Some(parts[1].to_string());
        }
        return None;
    }
    Some(client_id.to_string())
}

fn build_tls_acceptor(pem_path: &str, key_path: &str) -> Result<TlsAcceptor> {
    let cert_file =
        std::fs::File::open(pem_path).with_context(|| format!("open tls pem {pem_path}"))?;
    let certs: Vec<rustls::Certificate> = rustls_pemfile::certs(&mut std::io::BufReader::new(cert_file))
        .context("parse tls certificates")?
        .into_iter()
        .map(rustls::Certificate)
        .collect();
    if certs.is_empty() {
        anyhow::bail!("no certificates found in {pem_path}");
    }

    let key_file =
        std::fs::File::open(key_path).with_context(|| format!("open tls key {key_path}"))?;
    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut std::io::BufReader::new(key_file))
        .context("parse tls private key")?;
    let key = keys
        .pop()
        .map(rustls::PrivateKey)
        .ok_or_else(|| anyhow::anyhow!("no private key found in {key_path}"))?;

    let config = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("build tls server config")?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_parsing_handles_both_forms() {
        assert_eq!(
            parse_mac_from_client_id("GID_test@@@ba_8f_17_de_94_94@@@uuid"),
            Some("ba_8f_17_de_94_94".to_string())
        );
        assert_eq!(
            parse_mac_from_client_id("ba_8f_17_de_94_94"),
            Some("ba_8f_17_de_94_94".to_string())
        );
        assert_eq!(parse_mac_from_client_id(""), None);
        assert_eq!(parse_mac_from_client_id("@@@"), None);
    }
}
