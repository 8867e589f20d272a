//! Hot-reload orchestration.
//!
//! The backend pushes full configuration snapshots continuously; restarting
//! everything on every push would drop live device sessions for unrelated
//! changes. The orchestrator therefore reduces a push to the minimal set of
//! typed actions — only sections whose content actually changed restart —
//! and applies them while holding a lock so overlapping pushes serialize.

use crate::core::config::ConfigStore;
use async_trait::async_trait;
use std::sync::Arc;

/// A subsystem restart demanded by a configuration diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    RestartBroker,
    ReconnectMqtt,
    RebindUdp,
    RestartPlugins,
}

/// Diff a pushed configuration object against the live one.
///
/// - `mqtt_server`, `mqtt`: deep equality on the section value.
/// - `udp`: restricted to listen host and port; external endpoint changes
///   do not rebind the socket.
/// - `mcp` and `local_mcp` merge into one plugin-manager action.
///
/// Sections absent from the push never produce an action.
pub fn reconcile(
    store: &ConfigStore,
    push: &serde_json::Map<String, serde_json::Value>,
) -> Vec<Action> {
    let mut actions = Vec::new();

    if section_changed(store, push, "mqtt_server") {
        actions.push(Action::RestartBroker);
    }
    if section_changed(store, push, "mqtt") {
        actions.push(Action::ReconnectMqtt);
    }
    if udp_listen_changed(store, push) {
        actions.push(Action::RebindUdp);
    }
    if section_changed(store, push, "mcp") || section_changed(store, push, "local_mcp") {
        actions.push(Action::RestartPlugins);
    }

    actions
}

fn section_changed(
    store: &ConfigStore,
    push: &serde_json::Map<String, serde_json::Value>,
    key: &str,
) -> bool {
    match push.get(key) {
        Some(incoming) if !incoming.is_null() => *incoming != store.section_value(key),
        _ => false,
    }
}

fn udp_listen_changed(
    store: &ConfigStore,
    push: &serde_json::Map<String, serde_json::Value>,
) -> bool {
    let Some(incoming) = push.get("udp").filter(|v| !v.is_null()) else {
        return false;
    };
    let (new_host, new_port) = udp_listen_host_port(incoming);
    if new_host.is_empty() && new_port == 0 {
        return false;
    }
    let current = store.section_value("udp");
    let (old_host, old_port) = udp_listen_host_port(&current);
    new_host != old_host || new_port != old_port
}

fn udp_listen_host_port(section: &serde_json::Value) -> (String, u16) {
    let host = section
        .get("listen_host")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let port = section
        .get("listen_port")
        .and_then(|v| v.as_u64())
        .unwrap_or_default() as u16;
    (host, port)
}

/// Subsystem appliers registered at startup. The MQTT/UDP pair is one
/// applier because partial reloads differ from a full rebuild: both changed
/// → tear down and rebuild the adapter; only one changed → reconnect MQTT
/// keeping UDP, or rebind UDP keeping MQTT.
#[async_trait]
pub trait ReloadAppliers: Send + Sync {
    async fn restart_broker(&self);
    async fn reload_transport(&self, mqtt_changed: bool, udp_changed: bool);
    async fn restart_plugins(&self);
}

pub struct ReloadOrchestrator {
    store: Arc<ConfigStore>,
    appliers: Arc<dyn ReloadAppliers>,
    lock: tokio::sync::Mutex<()>,
}

impl ReloadOrchestrator {
    pub fn new(store: Arc<ConfigStore>, appliers: Arc<dyn ReloadAppliers>) -> Self {
        Self {
            store,
            appliers,
            lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Reconcile and apply one pushed snapshot. Holds the reload lock for
    /// the whole reconcile-apply cycle; a push arriving mid-apply waits.
    /// Returns the actions that were applied.
    pub async fn handle_push(
        &self,
        push: &serde_json::Map<String, serde_json::Value>,
    ) -> Vec<Action> {
        let _guard = self.lock.lock().await;

        let actions = reconcile(&self.store, push);
        self.store.apply_push(push);
        if actions.is_empty() {
            tracing::info!("config push produced no diffs, nothing to restart");
            return actions;
        }
        tracing::info!(?actions, "config push applying");

        let mqtt_changed = actions.contains(&Action::ReconnectMqtt);
        let udp_changed = actions.contains(&Action::RebindUdp);

        let mut pending = Vec::new();
        if actions.contains(&Action::RestartBroker) {
            pending.push(self.appliers.restart_broker());
        }
        if mqtt_changed || udp_changed {
            pending.push(self.appliers.reload_transport(mqtt_changed, udp_changed));
        }
        if actions.contains(&Action::RestartPlugins) {
            pending.push(self.appliers.restart_plugins());
        }
        futures_util::future::join_all(pending).await;

        tracing::info!(?actions, "config push applied");
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Config;
    use parking_lot::Mutex;

    fn store() -> Arc<ConfigStore> {
        let mut cfg = Config::default();
        cfg.mqtt_server.enable = true;
        cfg.mqtt.enable = true;
        Arc::new(ConfigStore::new(cfg))
    }

    fn full_push(store: &ConfigStore) -> serde_json::Map<String, serde_json::Value> {
        let value = serde_json::to_value(store.snapshot()).unwrap();
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn pushing_current_config_is_idempotent() {
        let store = store();
        let push = full_push(&store);
        assert!(reconcile(&store, &push).is_empty());
    }

    #[test]
    fn broker_section_change_restarts_broker_only() {
        let store = store();
        let mut push = full_push(&store);
        push["mqtt_server"]["listen_port"] = serde_json::json!(1884);
        assert_eq!(reconcile(&store, &push), vec![Action::RestartBroker]);
    }

    #[test]
    fn udp_external_change_does_not_rebind() {
        let store = store();
        let mut push = full_push(&store);
        push["udp"]["external_host"] = serde_json::json!("other.example.com");
        assert!(reconcile(&store, &push).is_empty());

        push["udp"]["listen_port"] = serde_json::json!(9999);
        assert_eq!(reconcile(&store, &push), vec![Action::RebindUdp]);
    }

    #[test]
    fn mcp_sections_merge_into_one_action() {
        let store = store();
        let mut push = full_push(&store);
        push["mcp"] = serde_json::json!({ "enabled": true });
        push["local_mcp"] = serde_json::json!({ "servers": {} });
        assert_eq!(reconcile(&store, &push), vec![Action::RestartPlugins]);
    }

    #[test]
    fn absent_sections_never_restart() {
        let store = store();
        let mut push = serde_json::Map::new();
        push.insert("asr".into(), serde_json::json!({ "provider": "null" }));
        assert!(reconcile(&store, &push).is_empty());
    }

    #[derive(Default)]
    struct RecordingAppliers {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ReloadAppliers for RecordingAppliers {
        async fn restart_broker(&self) {
            self.calls.lock().push("broker".into());
        }

        async fn reload_transport(&self, mqtt_changed: bool, udp_changed: bool) {
            self.calls
                .lock()
                .push(format!("transport:{mqtt_changed}:{udp_changed}"));
        }

        async fn restart_plugins(&self) {
            self.calls.lock().push("plugins".into());
        }
    }

    #[tokio::test]
    async fn orchestrator_applies_only_changed_sections() {
        let store = store();
        let appliers = Arc::new(RecordingAppliers::default());
        let orchestrator = ReloadOrchestrator::new(store.clone(), appliers.clone());

        let mut push = full_push(&store);
        push["mqtt"]["broker"] = serde_json::json!("other-broker");
        let actions = orchestrator.handle_push(&push).await;
        assert_eq!(actions, vec![Action::ReconnectMqtt]);
        assert_eq!(*appliers.calls.lock(), vec!["transport:true:false"]);

        // The push was applied; replaying it is a no-op.
        let actions = orchestrator.handle_push(&push).await;
        assert!(actions.is_empty());
        assert_eq!(appliers.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn both_transport_sections_produce_one_applier_call() {
        let store = store();
        let appliers = Arc::new(RecordingAppliers::default());
        let orchestrator = ReloadOrchestrator::new(store.clone(), appliers.clone());

        let mut push = full_push(&store);
        push["mqtt"]["port"] = serde_json::json!(2883);
        push["udp"]["listen_port"] = serde_json::json!(9999);
        let actions = orchestrator.handle_push(&push).await;
        assert_eq!(actions, vec![Action::ReconnectMqtt, Action::RebindUdp]);
        assert_eq!(*appliers.calls.lock(), vec!["transport:true:true"]);
    }
}
