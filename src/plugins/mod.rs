//! MCP plugin manager lifecycle.
//!
//! The tool servers themselves are external; the core owns only the
//! lifecycle shell the hot-reload orchestrator drives and the tool-name
//! listing surfaced over the control plane.

use crate::core::config::McpConfig;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Default)]
pub struct PluginManager {
    started: AtomicBool,
    tools: RwLock<Vec<String>>,
}

impl PluginManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Start the configured plugin set. Tool names come from the merged
    /// `mcp` + `local_mcp` sections; servers are launched lazily by the
    /// pipeline, not here.
    pub fn start(&self, cfg: &McpConfig, local: &serde_json::Value) -> anyhow::Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            anyhow::bail!("plugin manager already started");
        }
        let mut tools = Vec::new();
        collect_tool_names(&serde_json::Value::Object(cfg.extra.clone()), &mut tools);
        collect_tool_names(local, &mut tools);
        tools.sort();
        tools.dedup();
        let count = tools.len();
        *self.tools.write() = tools;
        tracing::info!(count, "plugin manager started");
        Ok(())
    }

    pub fn stop(&self) {
        if !self.started.swap(false, Ordering::AcqRel) {
            return;
        }
        self.tools.write().clear();
        tracing::info!("plugin manager stopped");
    }

    pub fn restart(&self, cfg: &McpConfig, local: &serde_json::Value) -> anyhow::Result<()> {
        self.stop();
        self.start(cfg, local)
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.read().clone()
    }
}

/// Pull tool names out of an `mcp`-shaped config section:
/// `{ "servers": { "<name>": { "tools": ["a", "b"] } } }`.
fn collect_tool_names(section: &serde_json::Value, out: &mut Vec<String>) {
    let Some(servers) = section.get("servers").and_then(|v| v.as_object()) else {
        return;
    };
    for (server, entry) in servers {
        match entry.get("tools").and_then(|v| v.as_array()) {
            Some(tools) => {
                for tool in tools {
                    if let Some(name) = tool.as_str() {
                        out.push(format!("{server}.{name}"));
                    }
                }
            }
            None => out.push(server.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_round_trip() {
        let manager = PluginManager::new();
        assert!(!manager.is_started());

        let cfg = McpConfig {
            enabled: true,
            extra: serde_json::from_str(
                r#"{ "servers": { "clock": { "tools": ["now", "alarm"] } } }"#,
            )
            .unwrap(),
        };
        manager.start(&cfg, &serde_json::Value::Null).unwrap();
        assert!(manager.is_started());
        assert_eq!(manager.tool_names(), vec!["clock.alarm", "clock.now"]);

        assert!(manager.start(&cfg, &serde_json::Value::Null).is_err());

        manager.restart(&cfg, &serde_json::Value::Null).unwrap();
        assert!(manager.is_started());

        manager.stop();
        assert!(!manager.is_started());
        assert!(manager.tool_names().is_empty());
    }
}
