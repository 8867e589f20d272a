use anyhow::{bail, Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Top-level configuration for the voxedge runtime.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub websocket: WebsocketConfig,
    #[serde(default)]
    pub mqtt: MqttClientConfig,
    #[serde(default)]
    pub mqtt_server: MqttServerConfig,
    #[serde(default)]
    pub udp: UdpSection,
    #[serde(default)]
    pub topics: TopicsConfig,
    #[serde(default)]
    pub manager: ManagerConfig,
    #[serde(default)]
    pub mcp: McpConfig,
    #[serde(default)]
    pub local_mcp: serde_json::Value,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub resource_pools: PoolSettings,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    // Provider sections are opaque to the core; the pool hands them to the
    // registered creators untouched.
    #[serde(default)]
    pub asr: serde_json::Value,
    #[serde(default)]
    pub llm: serde_json::Value,
    #[serde(default)]
    pub tts: serde_json::Value,
    #[serde(default)]
    pub vad: serde_json::Value,
    #[serde(default)]
    pub speaker_service: serde_json::Value,
    #[serde(default)]
    pub memory: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WebsocketConfig {
    #[serde(default = "default_enabled")]
    pub enable: bool,
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
    #[serde(default = "default_ws_port")]
    pub port: u16,
}

impl Default for WebsocketConfig {
    fn default() -> Self {
        Self {
            enable: default_enabled(),
            listen_host: default_listen_host(),
            port: default_ws_port(),
        }
    }
}

/// How the MQTT-UDP adapter reaches a broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MqttMode {
    /// In-process subscription on the embedded broker.
    Inline,
    /// Standard MQTT client against a (possibly remote) broker port.
    Network,
}

impl FromStr for MqttMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "embed" | "inline" => Ok(Self::Inline),
            "" | "tcp" | "network" | "ssl" => Ok(Self::Network),
            other => bail!("invalid mqtt.type {}", other),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MqttClientConfig {
    #[serde(default)]
    pub enable: bool,
    /// "embed" selects the inline publisher; anything else dials a broker.
    #[serde(default, rename = "type")]
    pub conn_type: String,
    #[serde(default)]
    pub broker: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl Default for MqttClientConfig {
    fn default() -> Self {
        Self {
            enable: false,
            conn_type: "embed".to_string(),
            broker: String::new(),
            port: 0,
            client_id: String::new(),
            username: String::new(),
            password: String::new(),
        }
    }
}

impl MqttClientConfig {
    pub fn mode(&self) -> MqttMode {
        MqttMode::from_str(&self.conn_type).unwrap_or(MqttMode::Network)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MqttServerConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
    #[serde(default = "default_mqtt_port")]
    pub listen_port: u16,
    #[serde(default)]
    pub tls: Option<BrokerTlsConfig>,
    #[serde(default)]
    pub auth: AuthConfig,
}

impl Default for MqttServerConfig {
    fn default() -> Self {
        Self {
            enable: false,
            listen_host: default_listen_host(),
            listen_port: default_mqtt_port(),
            tls: None,
            auth: AuthConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BrokerTlsConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default = "default_mqtts_port")]
    pub port: u16,
    #[serde(default)]
    pub pem: String,
    #[serde(default)]
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct AuthConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub users: Vec<AuthUser>,
    /// Clients connecting with this username are tagged admin and excluded
    /// from the goodbye-by-IP fan-out.
    #[serde(default)]
    pub admin_username: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthUser {
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UdpSection {
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
    #[serde(default = "default_udp_port")]
    pub listen_port: u16,
    #[serde(default)]
    pub external_host: String,
    #[serde(default)]
    pub external_port: u16,
}

impl Default for UdpSection {
    fn default() -> Self {
        Self {
            listen_host: default_listen_host(),
            listen_port: default_udp_port(),
            external_host: String::new(),
            external_port: 0,
        }
    }
}

/// Topic prefixes shared by the broker and the adapter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TopicsConfig {
    /// Device → server control topic prefix; the adapter subscribes
    /// `<prefix>/#`.
    #[serde(default = "default_server_sub_prefix")]
    pub server_sub_prefix: String,
    /// Server → device reply topic prefix.
    #[serde(default = "default_server_pub_prefix")]
    pub server_pub_prefix: String,
    /// Server → device goodbye topic prefix.
    #[serde(default = "default_device_sub_prefix")]
    pub device_sub_prefix: String,
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            server_sub_prefix: default_server_sub_prefix(),
            server_pub_prefix: default_server_pub_prefix(),
            device_sub_prefix: default_device_sub_prefix(),
        }
    }
}

impl TopicsConfig {
    pub fn server_sub_filter(&self) -> String {
        format!("{}/#", self.server_sub_prefix)
    }

    pub fn reply_topic(&self, topic_mac: &str) -> String {
        format!("{}/{}", self.server_pub_prefix, topic_mac)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManagerConfig {
    #[serde(default = "default_backend_url")]
    pub backend_url: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            backend_url: default_backend_url(),
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

impl ManagerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct McpConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionConfig {
    /// Seconds without audio or commands before an active session goes idle.
    #[serde(default = "default_idle_seconds")]
    pub idle_seconds: u64,
    /// Seconds without any activity before the session is destroyed.
    #[serde(default = "default_close_seconds")]
    pub close_seconds: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_seconds: default_idle_seconds(),
            close_seconds: default_close_seconds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct PoolSettings {
    pub max_size: Option<usize>,
    pub min_size: Option<usize>,
    pub max_idle: Option<usize>,
    pub acquire_timeout_seconds: Option<u64>,
    pub idle_timeout_seconds: Option<u64>,
    pub validate_on_borrow: Option<bool>,
    pub validate_on_return: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct TelemetryConfig {
    pub log_level: Option<String>,
    /// "json" switches the fmt layer to structured output.
    pub log_format: Option<String>,
}

impl Config {
    /// Load configuration from a path resolved via VOXEDGE_CONFIG or the
    /// default `config/voxedge.toml`.
    pub fn load_from_env() -> Result<Self> {
        let path = std::env::var("VOXEDGE_CONFIG")
            .unwrap_or_else(|_| "config/voxedge.toml".to_string());
        Self::load(path)
    }

    /// Load configuration from a specific file (TOML or JSON by extension).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path_ref = path.as_ref();
        let data = std::fs::read_to_string(path_ref)
            .with_context(|| format!("unable to read config {}", path_ref.display()))?;
        let mut cfg: Self = if is_json(path_ref) {
            serde_json::from_str(&data)
                .with_context(|| format!("invalid JSON config {}", path_ref.display()))?
        } else {
            toml::from_str(&data)
                .with_context(|| format!("invalid TOML config {}", path_ref.display()))?
        };
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("BACKEND_URL") {
            if !url.is_empty() {
                self.manager.backend_url = url;
            }
        }
    }

    /// Schema-level invariants checked before startup; failure is fatal.
    pub fn validate(&self) -> Result<()> {
        if self.mqtt.enable {
            MqttMode::from_str(&self.mqtt.conn_type)?;
            if self.mqtt.mode() == MqttMode::Network {
                if self.mqtt.broker.is_empty() {
                    bail!("mqtt.broker required in network mode");
                }
                if self.mqtt.port == 0 {
                    bail!("mqtt.port required in network mode");
                }
            }
            if self.mqtt.mode() == MqttMode::Inline && !self.mqtt_server.enable {
                tracing::warn!(
                    "mqtt.type=embed but mqtt_server.enable=false; inline mode cannot connect"
                );
            }
        }
        if self.mqtt_server.enable {
            if self.mqtt_server.listen_port == 0 {
                bail!("mqtt_server.listen_port must be set");
            }
            if let Some(tls) = &self.mqtt_server.tls {
                if tls.enable {
                    if tls.pem.is_empty() || tls.key.is_empty() {
                        bail!("mqtt_server.tls requires pem and key paths");
                    }
                    if tls.port == self.mqtt_server.listen_port {
                        bail!("mqtt_server.tls.port conflicts with listen_port");
                    }
                }
            }
        }
        if self.websocket.enable && self.websocket.port == 0 {
            bail!("websocket.port must be set");
        }
        if self.websocket.enable
            && self.mqtt_server.enable
            && self.websocket.port == self.mqtt_server.listen_port
            && self.websocket.listen_host == self.mqtt_server.listen_host
        {
            bail!("websocket.port conflicts with mqtt_server.listen_port");
        }
        if self.session.idle_seconds == 0 || self.session.close_seconds == 0 {
            bail!("session windows must be non-zero");
        }
        Ok(())
    }

    pub fn udp_config(&self) -> crate::udp::UdpConfig {
        crate::udp::UdpConfig {
            listen_host: self.udp.listen_host.clone(),
            listen_port: self.udp.listen_port,
            external_host: self.udp.external_host.clone(),
            external_port: self.udp.external_port,
        }
    }
}

/// Process-wide configuration store. Hot reload swaps sections in place; the
/// reload orchestrator diffs JSON snapshots taken from here.
pub struct ConfigStore {
    inner: RwLock<Config>,
}

impl ConfigStore {
    pub fn new(config: Config) -> Self {
        Self {
            inner: RwLock::new(config),
        }
    }

    pub fn snapshot(&self) -> Config {
        self.inner.read().clone()
    }

    /// Current value of one push-relevant section as JSON.
    pub fn section_value(&self, key: &str) -> serde_json::Value {
        let cfg = self.inner.read();
        let value = serde_json::to_value(&*cfg).unwrap_or_default();
        value.get(key).cloned().unwrap_or(serde_json::Value::Null)
    }

    /// Merge a pushed configuration object into the live config. Known
    /// sections are deserialized; unknown keys are ignored.
    pub fn apply_push(&self, push: &serde_json::Map<String, serde_json::Value>) {
        let mut cfg = self.inner.write();
        for (key, value) in push {
            let result: Result<()> = (|| {
                match key.as_str() {
                    "mqtt_server" => cfg.mqtt_server = parse_section(value)?,
                    "mqtt" => cfg.mqtt = parse_section(value)?,
                    "udp" => cfg.udp = parse_section(value)?,
                    "websocket" => cfg.websocket = parse_section(value)?,
                    "topics" => cfg.topics = parse_section(value)?,
                    "manager" => cfg.manager = parse_section(value)?,
                    "mcp" => cfg.mcp = parse_section(value)?,
                    "local_mcp" => cfg.local_mcp = value.clone(),
                    "session" => cfg.session = parse_section(value)?,
                    "resource_pools" => cfg.resource_pools = parse_section(value)?,
                    "asr" => cfg.asr = value.clone(),
                    "llm" => cfg.llm = value.clone(),
                    "tts" => cfg.tts = value.clone(),
                    "vad" => cfg.vad = value.clone(),
                    "speaker_service" => cfg.speaker_service = value.clone(),
                    "memory" => cfg.memory = value.clone(),
                    _ => {}
                }
                Ok(())
            })();
            if let Err(err) = result {
                tracing::error!(section = %key, "pushed config section rejected: {err}");
            }
        }
    }
}

fn parse_section<T: serde::de::DeserializeOwned>(value: &serde_json::Value) -> Result<T> {
    serde_json::from_value(value.clone()).context("deserialize section")
}

fn is_json(path: &Path) -> bool {
    matches!(path.extension().and_then(|s| s.to_str()), Some("json"))
}

fn default_enabled() -> bool {
    true
}

fn default_listen_host() -> String {
    "0.0.0.0".to_string()
}

fn default_ws_port() -> u16 {
    8989
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_mqtts_port() -> u16 {
    8883
}

fn default_udp_port() -> u16 {
    8990
}

fn default_server_sub_prefix() -> String {
    "/p2p/device_public".to_string()
}

fn default_server_pub_prefix() -> String {
    "/p2p/device_server".to_string()
}

fn default_device_sub_prefix() -> String {
    "/p2p/device_sub".to_string()
}

fn default_backend_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_idle_seconds() -> u64 {
    60
}

fn default_close_seconds() -> u64 {
    300
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_toml() -> String {
        r#"
[websocket]
port = 8989

[mqtt]
enable = true
type = "embed"

[mqtt_server]
enable = true
listen_host = "0.0.0.0"
listen_port = 1883

[udp]
listen_port = 8990
external_host = "edge.example.com"
external_port = 8990

[manager]
backend_url = "http://localhost:8080"
"#
        .to_string()
    }

    #[test]
    fn toml_parses_with_defaults() {
        let cfg: Config = toml::from_str(&base_toml()).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.mqtt.mode(), MqttMode::Inline);
        assert_eq!(cfg.topics.server_sub_filter(), "/p2p/device_public/#");
        assert_eq!(cfg.session.idle_seconds, 60);
    }

    #[test]
    fn network_mode_requires_broker() {
        let mut cfg: Config = toml::from_str(&base_toml()).unwrap();
        cfg.mqtt.conn_type = "tcp".to_string();
        cfg.mqtt.broker = String::new();
        let err = cfg.validate().unwrap_err();
        assert!(format!("{err}").contains("mqtt.broker"));
    }

    #[test]
    fn tls_port_conflict_rejected() {
        let mut cfg: Config = toml::from_str(&base_toml()).unwrap();
        cfg.mqtt_server.tls = Some(BrokerTlsConfig {
            enable: true,
            port: 1883,
            pem: "server.pem".into(),
            key: "server.key".into(),
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn store_applies_push_sections() {
        let cfg: Config = toml::from_str(&base_toml()).unwrap();
        let store = ConfigStore::new(cfg);
        let push: serde_json::Map<String, serde_json::Value> = serde_json::from_str(
            r#"{"udp": {"listen_host": "0.0.0.0", "listen_port": 9001},
                "asr": {"provider": "null"}}"#,
        )
        .unwrap();
        store.apply_push(&push);
        let snapshot = store.snapshot();
        assert_eq!(snapshot.udp.listen_port, 9001);
        assert_eq!(snapshot.asr["provider"], "null");
    }

    #[test]
    fn section_value_round_trips() {
        let cfg: Config = toml::from_str(&base_toml()).unwrap();
        let store = ConfigStore::new(cfg);
        let udp = store.section_value("udp");
        assert_eq!(udp["listen_port"], 8990);
        assert!(store.section_value("no_such_section").is_null());
    }
}
