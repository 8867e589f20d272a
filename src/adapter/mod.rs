//! MQTT-UDP adapter.
//!
//! Owns the join between the control plane (MQTT) and the media plane
//! (UDP): maps each device to its reply topic and UDP session, demultiplexes
//! inbound control messages, and emits a uniform [`Connection`] through the
//! new-connection callback. The broker may be reached in-process (inline)
//! or over its TCP port (network); only the publisher strategy differs.

mod conn;
pub mod publisher;

pub use conn::{MqttUdpTransport, PublisherSlot};
pub use publisher::{InlinePublisher, NetworkPublisher, Publisher};

use crate::codec::ConnId;
use crate::core::config::{MqttClientConfig, MqttMode, TopicsConfig};
use crate::mqtt::SharedBroker;
use crate::transport::conn::Connection;
use crate::transport::OnNewConnection;
use crate::udp::UdpPlane;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

const INLINE_RETRY_INTERVAL: Duration = Duration::from_secs(3);
const NETWORK_RETRY_INTERVAL: Duration = Duration::from_secs(5);
const LIVENESS_INTERVAL: Duration = Duration::from_secs(30);
const MSG_QUEUE_DEPTH: usize = 10_000;
const INLINE_SUB_ID: u32 = 10_001;

struct InboundMessage {
    topic: String,
    payload: Vec<u8>,
}

struct ConnEntry {
    conn: Arc<Connection>,
    udp_conn_id: ConnId,
}

struct AdapterInner {
    mqtt_cfg: RwLock<MqttClientConfig>,
    topics: TopicsConfig,
    broker: SharedBroker,
    udp: RwLock<Arc<UdpPlane>>,
    conns: DashMap<String, ConnEntry>,
    msg_tx: mpsc::Sender<InboundMessage>,
    on_new: OnNewConnection,
    publisher: PublisherSlot,
    network_client: RwLock<Option<rumqttc::AsyncClient>>,
    inline_subscribed: Mutex<bool>,
    stop_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// One adapter per process; replaced atomically on full reload.
#[derive(Clone)]
pub struct MqttUdpAdapter {
    inner: Arc<AdapterInner>,
}

impl MqttUdpAdapter {
    pub fn new(
        mqtt_cfg: MqttClientConfig,
        topics: TopicsConfig,
        broker: SharedBroker,
        udp: Arc<UdpPlane>,
        on_new: OnNewConnection,
    ) -> Self {
        let (msg_tx, msg_rx) = mpsc::channel(MSG_QUEUE_DEPTH);
        let (stop_tx, _) = watch::channel(false);
        let inner = Arc::new(AdapterInner {
            mqtt_cfg: RwLock::new(mqtt_cfg),
            topics,
            broker,
            udp: RwLock::new(udp),
            conns: DashMap::new(),
            msg_tx,
            on_new,
            publisher: Arc::new(RwLock::new(None)),
            network_client: RwLock::new(None),
            inline_subscribed: Mutex::new(false),
            stop_tx,
            tasks: Mutex::new(Vec::new()),
        });
        let adapter = Self { inner };
        adapter.spawn(adapter.clone().process_messages(msg_rx));
        adapter
    }

    fn spawn(&self, fut: impl std::future::Future<Output = ()> + Send + 'static) {
        self.inner.tasks.lock().push(tokio::spawn(fut));
    }

    fn stop_rx(&self) -> watch::Receiver<bool> {
        self.inner.stop_tx.subscribe()
    }

    fn mode(&self) -> MqttMode {
        self.inner.mqtt_cfg.read().mode()
    }

    /// Start the connector for the configured mode plus the liveness sweep.
    /// Non-blocking: connection retries run in the background.
    pub fn start(&self) {
        match self.mode() {
            MqttMode::Inline => {
                tracing::info!("mqtt-udp adapter starting in inline mode");
                self.spawn(self.clone().connect_inline_retry());
            }
            MqttMode::Network => {
                let cfg = self.inner.mqtt_cfg.read().clone();
                tracing::info!(
                    broker = %cfg.broker, port = cfg.port, client_id = %cfg.client_id,
                    "mqtt-udp adapter starting in network mode"
                );
                self.spawn(self.clone().connect_network(cfg));
            }
        }
        self.spawn(self.clone().liveness_sweep());
    }

    async fn connect_inline_retry(self) {
        let mut stop_rx = self.stop_rx();
        let mut attempt = 0u32;
        loop {
            if *stop_rx.borrow() {
                return;
            }
            match self.subscribe_inline() {
                Ok(()) => return,
                Err(err) => {
                    attempt += 1;
                    tracing::error!(
                        attempt,
                        "inline mqtt subscribe failed: {err}, retrying in {:?}",
                        INLINE_RETRY_INTERVAL
                    );
                    tokio::select! {
                        _ = stop_rx.changed() => return,
                        _ = tokio::time::sleep(INLINE_RETRY_INTERVAL) => {}
                    }
                }
            }
        }
    }

    fn subscribe_inline(&self) -> anyhow::Result<()> {
        let broker = self
            .inner
            .broker
            .read()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("mqtt broker is not running"))?;

        let filter = self.inner.topics.server_sub_filter();
        let msg_tx = self.inner.msg_tx.clone();
        broker.subscribe_inline(&filter, INLINE_SUB_ID, move |topic, payload| {
            let message = InboundMessage {
                topic: topic.to_string(),
                payload: payload.to_vec(),
            };
            if msg_tx.try_send(message).is_err() {
                tracing::debug!(topic, "adapter message queue full, control message dropped");
            }
        })?;

        *self.inner.inline_subscribed.lock() = true;
        *self.inner.publisher.write() =
            Some(Arc::new(InlinePublisher::new(self.inner.broker.clone())));
        tracing::info!(%filter, "inline mqtt subscription established");
        Ok(())
    }

    fn unsubscribe_inline(&self) {
        let mut subscribed = self.inner.inline_subscribed.lock();
        if !*subscribed {
            return;
        }
        *subscribed = false;
        if let Some(broker) = self.inner.broker.read().clone() {
            broker.unsubscribe_inline(&self.inner.topics.server_sub_filter(), INLINE_SUB_ID);
        }
    }

    /// Re-establish the inline subscription after a broker restart. The new
    /// broker instance starts with an empty inline table, so the adapter
    /// must subscribe again.
    pub fn resubscribe_inline(&self) {
        if self.mode() != MqttMode::Inline {
            return;
        }
        *self.inner.inline_subscribed.lock() = false;
        self.spawn(self.clone().connect_inline_retry());
    }

    async fn connect_network(self, cfg: MqttClientConfig) {
        let mut stop_rx = self.stop_rx();
        let mut options = rumqttc::MqttOptions::new(cfg.client_id.clone(), cfg.broker.clone(), cfg.port);
        options.set_keep_alive(Duration::from_secs(30));
        if !cfg.username.is_empty() {
            options.set_credentials(cfg.username.clone(), cfg.password.clone());
        }

        let (client, mut eventloop) = rumqttc::AsyncClient::new(options, 100);
        *self.inner.network_client.write() = Some(client.clone());
        *self.inner.publisher.write() = Some(Arc::new(NetworkPublisher::new(client.clone())));

        let filter = self.inner.topics.server_sub_filter();
        let mut attempt = 0u32;
        loop {
            tokio::select! {
                _ = stop_rx.changed() => return,
                result = eventloop.poll() => match result {
                    Ok(rumqttc::Event::Incoming(rumqttc::Incoming::ConnAck(_))) => {
                        attempt = 0;
                        tracing::info!("mqtt client connected, subscribing {filter}");
                        if let Err(err) = client
                            .subscribe(filter.clone(), rumqttc::QoS::AtMostOnce)
                            .await
                        {
                            tracing::error!("mqtt subscribe failed: {err}");
                        }
                    }
                    Ok(rumqttc::Event::Incoming(rumqttc::Incoming::Publish(publish))) => {
                        let message = InboundMessage {
                            topic: publish.topic.clone(),
                            payload: publish.payload.to_vec(),
                        };
                        if self.inner.msg_tx.try_send(message).is_err() {
                            tracing::debug!(topic = %publish.topic,
                                "adapter message queue full, control message dropped");
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        if *stop_rx.borrow() {
                            return;
                        }
                        attempt += 1;
                        tracing::error!(
                            attempt,
                            "mqtt connection lost: {err}, retrying in {:?}",
                            NETWORK_RETRY_INTERVAL
                        );
                        tokio::select! {
                            _ = stop_rx.changed() => return,
                            _ = tokio::time::sleep(NETWORK_RETRY_INTERVAL) => {}
                        }
                    }
                }
            }
        }
    }

    async fn liveness_sweep(self) {
        let mut stop_rx = self.stop_rx();
        let mut ticker = tokio::time::interval(LIVENESS_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = stop_rx.changed() => return,
                _ = ticker.tick() => {
                    let stale: Vec<Arc<Connection>> = self
                        .inner
                        .conns
                        .iter()
                        .filter(|entry| !entry.value().conn.is_active())
                        .map(|entry| entry.value().conn.clone())
                        .collect();
                    for conn in stale {
                        tracing::info!(device_id = %conn.device_id(), "reaping inactive connection");
                        conn.destroy();
                    }
                }
            }
        }
    }

    /// Single consumer of the inbound control queue; per-device session
    /// creation happens here, so a device's messages are handled in arrival
    /// order.
    async fn process_messages(self, mut msg_rx: mpsc::Receiver<InboundMessage>) {
        let mut stop_rx = self.stop_rx();
        loop {
            let message = tokio::select! {
                _ = stop_rx.changed() => return,
                message = msg_rx.recv() => match message {
                    Some(message) => message,
                    None => return,
                },
            };

            if let Err(err) = serde_json::from_slice::<crate::chat::ClientMessage>(&message.payload)
            {
                tracing::error!(topic = %message.topic, "invalid control payload: {err}");
                continue;
            }
            let Some((topic_mac, device_id)) = device_id_from_topic(&message.topic) else {
                tracing::error!(topic = %message.topic, "device id missing from topic");
                continue;
            };

            let conn = match self.inner.conns.get(&device_id) {
                Some(entry) => entry.conn.clone(),
                None => match self.create_device_conn(&topic_mac, &device_id) {
                    Some(conn) => conn,
                    None => continue,
                },
            };

            if let Err(err) = conn.push_cmd(message.payload) {
                tracing::error!(%device_id, "inbound command rejected: {err}");
            }
        }
    }

    fn create_device_conn(&self, topic_mac: &str, device_id: &str) -> Option<Arc<Connection>> {
        if self.inner.publisher.read().is_none() {
            tracing::error!(device_id, "mqtt publisher is not ready");
            return None;
        }
        let plane = self.inner.udp.read().clone();
        let session = plane.create_session(device_id, "");
        let udp_conn_id = session.conn_id();

        let transport = MqttUdpTransport::new(
            self.inner.topics.reply_topic(topic_mac),
            self.inner.publisher.clone(),
            session,
            plane.external_endpoint(),
        );
        let conn = Connection::new(device_id.to_string(), Box::new(transport));

        let weak: Weak<AdapterInner> = Arc::downgrade(&self.inner);
        conn.on_close(move |device_id| {
            if let Some(inner) = weak.upgrade() {
                AdapterInner::handle_disconnect(&inner, device_id);
            }
        });

        self.inner.conns.insert(
            device_id.to_string(),
            ConnEntry {
                conn: conn.clone(),
                udp_conn_id,
            },
        );
        tracing::info!(device_id, conn_id = %udp_conn_id, "mqtt-udp device connected");
        (self.inner.on_new)(conn.clone());
        Some(conn)
    }

    /// Tear down and forget every device connection; they must re-hello.
    fn clear_device_conns(&self) {
        let ids: Vec<String> = self.inner.conns.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, entry)) = self.inner.conns.remove(&id) {
                let plane = self.inner.udp.read().clone();
                plane.close_session(entry.udp_conn_id);
                entry.conn.destroy();
            }
        }
    }

    /// Reconnect MQTT only, keeping the UDP plane. A network-mode reload
    /// with an unchanged config is a no-op so unrelated pushes do not cause
    /// reconnect storms.
    pub async fn reload_mqtt_client(&self, new_cfg: MqttClientConfig) {
        {
            let current = self.inner.mqtt_cfg.read().clone();
            if new_cfg.mode() == MqttMode::Network && current == new_cfg {
                tracing::info!("mqtt config unchanged, skipping reconnect");
                return;
            }
        }
        *self.inner.mqtt_cfg.write() = new_cfg.clone();

        let old_client = self.inner.network_client.write().take();
        if let Some(client) = old_client {
            let _ = tokio::time::timeout(Duration::from_millis(250), client.disconnect()).await;
        }
        self.unsubscribe_inline();
        *self.inner.publisher.write() = None;
        self.clear_device_conns();

        match new_cfg.mode() {
            MqttMode::Inline => self.spawn(self.clone().connect_inline_retry()),
            MqttMode::Network => self.spawn(self.clone().connect_network(new_cfg)),
        }
    }

    /// Rebind UDP only, keeping the MQTT connection. Sessions are dropped;
    /// devices re-hello against the new plane.
    pub fn reload_udp(&self, new_plane: Arc<UdpPlane>) {
        self.clear_device_conns();
        let old_plane = {
            let mut slot = self.inner.udp.write();
            std::mem::replace(&mut *slot, new_plane)
        };
        old_plane.close();
    }

    /// Full stop: cancel tasks, disconnect publisher, unsubscribe inline,
    /// close the UDP plane, tear down all sessions.
    pub async fn stop(&self) {
        tracing::debug!("mqtt-udp adapter stopping");
        let _ = self.inner.stop_tx.send(true);

        let publisher = self.inner.publisher.write().take();
        if let Some(publisher) = publisher {
            publisher.disconnect().await;
        }
        self.inner.network_client.write().take();
        self.unsubscribe_inline();

        self.inner.udp.read().close();
        self.clear_device_conns();

        let tasks: Vec<JoinHandle<()>> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        tracing::debug!("mqtt-udp adapter stopped");
    }

    pub fn device_count(&self) -> usize {
        self.inner.conns.len()
    }

    pub fn udp_plane(&self) -> Arc<UdpPlane> {
        self.inner.udp.read().clone()
    }
}

impl AdapterInner {
    fn handle_disconnect(inner: &Arc<AdapterInner>, device_id: &str) {
        tracing::debug!(device_id, "device disconnect");
        if let Some((_, entry)) = inner.conns.remove(device_id) {
            let plane = inner.udp.read().clone();
            plane.close_session(entry.udp_conn_id);
        }
    }
}

/// Parse the device id from the control topic tail.
///
/// The `<mac>` segment is either underscore-separated hex
/// (`ba_8f_17_de_94_94`) or the group form `<group>@@@<mac>@@@<uuid>`.
/// Returns `(topic_mac, device_id)`: the raw tail for reply-topic
/// construction and the colon-form device id.
pub fn device_id_from_topic(topic: &str) -> Option<(String, String)> {
    let tail = topic.rsplit('/').next()?;
    if tail.is_empty() {
        return None;
    }
    let mac = if tail.contains("@@@") {
        let parts: Vec<&str> = tail.split("@@@").collect();
        if parts.len() < 2 || parts[1].is_empty() {
            return None;
        }
        parts[1]
    } else {
        tail
    };
    Some((tail.to_string(), mac.replace('_', ":")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_mac_topic() {
        let (topic_mac, device_id) =
            device_id_from_topic("/p2p/device_public/ba_8f_17_de_94_94").unwrap();
        assert_eq!(topic_mac, "ba_8f_17_de_94_94");
        assert_eq!(device_id, "ba:8f:17:de:94:94");
    }

    #[test]
    fn group_form_topic() {
        let (topic_mac, device_id) = device_id_from_topic(
            "/p2p/device_public/GID_test@@@ba_8f_17_de_94_94@@@e4b0c442-98fc",
        )
        .unwrap();
        assert_eq!(topic_mac, "GID_test@@@ba_8f_17_de_94_94@@@e4b0c442-98fc");
        assert_eq!(device_id, "ba:8f:17:de:94:94");
    }

    #[test]
    fn malformed_topics_rejected() {
        assert!(device_id_from_topic("").is_none());
        assert!(device_id_from_topic("/p2p/device_public/").is_none());
        assert!(device_id_from_topic("/p2p/device_public/@@@@@@").is_none());
    }
}
