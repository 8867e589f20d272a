//! Shared helpers for integration tests.

// Not every test file uses every helper.
#![allow(dead_code)]

use voxedge::config::{Config, MqttServerConfig, TopicsConfig, UdpSection};
use voxedge::udp::UdpConfig;

/// Loopback UDP config with an ephemeral port.
pub fn loopback_udp_config() -> UdpConfig {
    UdpConfig {
        listen_host: "127.0.0.1".to_string(),
        listen_port: 0,
        external_host: String::new(),
        external_port: 0,
    }
}

/// Broker config bound to an ephemeral loopback port, auth disabled.
pub fn loopback_broker_config() -> MqttServerConfig {
    MqttServerConfig {
        enable: true,
        listen_host: "127.0.0.1".to_string(),
        listen_port: 0,
        tls: None,
        auth: Default::default(),
    }
}

pub fn default_topics() -> TopicsConfig {
    TopicsConfig::default()
}

/// A minimal valid configuration for store-level tests.
pub fn base_config() -> Config {
    let mut config = Config::default();
    config.mqtt_server.enable = true;
    config.mqtt.enable = true;
    config.udp = UdpSection {
        listen_host: "127.0.0.1".to_string(),
        listen_port: 8990,
        external_host: String::new(),
        external_port: 0,
    };
    config
}
