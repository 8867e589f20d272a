//! Publisher strategies for the MQTT-UDP adapter.
//!
//! Inline mode publishes straight into the embedded broker; network mode
//! goes through a standard MQTT client. Everything downstream of the
//! adapter sees only the trait.

use crate::mqtt::SharedBroker;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

const DISCONNECT_DEADLINE: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("broker is not running")]
    BrokerNotRunning,
    #[error("mqtt client error: {0}")]
    Client(String),
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), PublishError>;
    async fn disconnect(&self);
}

/// Publishes through the in-process broker. Holds the shared slot rather
/// than a broker instance so it follows broker restarts automatically.
pub struct InlinePublisher {
    broker: SharedBroker,
}

impl InlinePublisher {
    pub fn new(broker: SharedBroker) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl Publisher for InlinePublisher {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), PublishError> {
        let broker = self.broker.read().clone();
        match broker {
            Some(broker) => broker
                .publish(topic, payload, false, 0)
                .map_err(|err| PublishError::Client(err.to_string())),
            None => Err(PublishError::BrokerNotRunning),
        }
    }

    async fn disconnect(&self) {}
}

/// Publishes through a rumqttc client connected to the broker's TCP port.
pub struct NetworkPublisher {
    client: rumqttc::AsyncClient,
}

impl NetworkPublisher {
    pub fn new(client: rumqttc::AsyncClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Publisher for NetworkPublisher {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), PublishError> {
        self.client
            .publish(topic, rumqttc::QoS::AtMostOnce, false, payload)
            .await
            .map_err(|err| PublishError::Client(err.to_string()))
    }

    async fn disconnect(&self) {
        let _ = tokio::time::timeout(DISCONNECT_DEADLINE, self.client.disconnect()).await;
    }
}
