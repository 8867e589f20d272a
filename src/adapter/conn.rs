//! The MQTT+UDP flavor of the device connection.

use crate::adapter::publisher::Publisher;
use crate::transport::conn::{ConnError, ConnTransport, TransportKind};
use crate::udp::UdpSession;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Shared slot the adapter swaps when the publisher strategy changes on
/// reload; every connection picks the change up immediately.
pub type PublisherSlot = Arc<RwLock<Option<Arc<dyn Publisher>>>>;

/// Control replies go out on the device-public MQTT topic; audio goes out
/// through the UDP session.
pub struct MqttUdpTransport {
    reply_topic: String,
    publisher: PublisherSlot,
    session: Arc<UdpSession>,
    udp_endpoint: (String, u16),
}

impl MqttUdpTransport {
    pub fn new(
        reply_topic: String,
        publisher: PublisherSlot,
        session: Arc<UdpSession>,
        udp_endpoint: (String, u16),
    ) -> Self {
        Self {
            reply_topic,
            publisher,
            session,
            udp_endpoint,
        }
    }

    pub fn session(&self) -> &Arc<UdpSession> {
        &self.session
    }
}

#[async_trait]
impl ConnTransport for MqttUdpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::MqttUdp
    }

    async fn send_cmd(&self, payload: &[u8]) -> Result<(), ConnError> {
        let publisher = self.publisher.read().clone();
        let Some(publisher) = publisher else {
            return Err(ConnError::Transport("mqtt publisher is not ready".into()));
        };
        publisher
            .publish(&self.reply_topic, payload)
            .await
            .map_err(|err| ConnError::Transport(err.to_string()))
    }

    fn send_audio(&self, frame: Vec<u8>) -> bool {
        self.session.send_audio(frame)
    }

    fn take_audio_rx(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.session.take_audio_rx()
    }

    fn hello_extra(&self, reply: &mut serde_json::Map<String, serde_json::Value>) {
        let (aes_key, full_nonce) = self.session.key_material();
        reply.insert("transport".into(), "udp".into());
        reply.insert("aes_key".into(), aes_key.clone().into());
        reply.insert("full_nonce".into(), full_nonce.clone().into());
        reply.insert(
            "udp".into(),
            serde_json::json!({
                "server": self.udp_endpoint.0,
                "port": self.udp_endpoint.1,
                "encryption": "aes-128-ctr",
                "key": aes_key,
                "nonce": full_nonce,
            }),
        );
    }

    fn close(&self) {
        // UDP teardown happens through the adapter's close observer, which
        // owns the session index.
    }

    fn is_alive(&self) -> bool {
        !self.session.is_closed()
    }
}
