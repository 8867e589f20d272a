//! Runtime wiring: broker, transports, sessions, events, pool, control
//! plane and hot reload, plus graceful shutdown.

use crate::adapter::MqttUdpAdapter;
use crate::chat::{ChatManager, ProviderSelection};
use crate::control::{ControlClient, RpcHandler, PATH_INJECT_MESSAGE, PATH_SYSTEM_CONFIG};
use crate::core::config::{Config, ConfigStore};
use crate::event::{topic, Event, EventBus, SessionSnapshot, TopicHandler, WorkerPool, DEFAULT_WORKERS};
use crate::mqtt::{Broker, SharedBroker};
use crate::plugins::PluginManager;
use crate::pool::{register_builtin_types, start_stats_monitor, PoolManager};
use crate::reload::{ReloadAppliers, ReloadOrchestrator};
use crate::transport::{Connection, DeviceRegistry, OnNewConnection, WsServer};
use crate::udp::UdpPlane;
use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;

const POOL_STATS_INTERVAL: Duration = Duration::from_secs(300);
const POOL_REPORT_INTERVAL: Duration = Duration::from_secs(30);

/// Owns every long-lived subsystem. One per process.
pub struct App {
    store: Arc<ConfigStore>,
    broker: SharedBroker,
    adapter: Mutex<Option<MqttUdpAdapter>>,
    ws_server: Mutex<Option<Arc<WsServer>>>,
    registry: Arc<DeviceRegistry<ChatManager>>,
    bus: Arc<EventBus>,
    workers: Arc<WorkerPool>,
    pools: Arc<PoolManager>,
    control: ControlClient,
    plugins: Arc<PluginManager>,
}

impl App {
    pub fn new(config: Config) -> Result<Arc<Self>> {
        config.validate()?;
        let pools = Arc::new(PoolManager::new(&config.resource_pools));
        register_builtin_types(&pools)?;
        let control = ControlClient::new(
            &config.manager.backend_url,
            config.manager.request_timeout(),
        );
        let app = Arc::new(Self {
            store: Arc::new(ConfigStore::new(config)),
            broker: Arc::new(parking_lot::RwLock::new(None)),
            adapter: Mutex::new(None),
            ws_server: Mutex::new(None),
            registry: Arc::new(DeviceRegistry::new()),
            bus: Arc::new(EventBus::new()),
            workers: Arc::new(WorkerPool::new(DEFAULT_WORKERS)),
            pools,
            control,
            plugins: Arc::new(PluginManager::new()),
        });
        app.register_event_handlers();
        app.register_control_handlers();
        Ok(app)
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry<ChatManager>> {
        &self.registry
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Bring every enabled subsystem up, then block until ctrl-c.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        let config = self.store.snapshot();

        if config.mqtt_server.enable {
            // Inline mode depends on the broker instance; start it before
            // the adapter to avoid a subscribe/startup race.
            let broker = Broker::start(config.mqtt_server.clone(), config.topics.clone())
                .await
                .context("start mqtt broker")?;
            *self.broker.write() = Some(broker);
        }

        if config.mqtt.enable {
            let adapter = self.build_adapter(&config).await?;
            adapter.start();
            *self.adapter.lock() = Some(adapter);
        }

        if config.websocket.enable {
            let ws = Arc::new(WsServer::new(
                config.websocket.listen_host.clone(),
                config.websocket.port,
                self.on_new_connection_callback(),
            ));
            ws.start().await.context("start websocket server")?;
            *self.ws_server.lock() = Some(ws);
        }

        if config.mcp.enabled {
            if let Err(err) = self.plugins.start(&config.mcp, &config.local_mcp) {
                tracing::error!("plugin manager start failed: {err}");
            }
        }

        let control = self.control.clone();
        tokio::spawn(async move { control.start().await });

        start_stats_monitor(&self.pools, POOL_STATS_INTERVAL);
        self.spawn_pool_stats_reporter();
        self.attach_reload_orchestrator();

        tracing::info!("voxedge running");
        tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
        tracing::warn!("shutdown signal received");
        self.shutdown().await;
        Ok(())
    }

    async fn build_adapter(self: &Arc<Self>, config: &Config) -> Result<MqttUdpAdapter> {
        let plane = UdpPlane::bind(&config.udp_config())
            .await
            .context("start udp plane")?;
        if let Some(broker) = self.broker.read().clone() {
            plane.install_goodbye_sender(broker.goodbye_sender());
        }
        Ok(MqttUdpAdapter::new(
            config.mqtt.clone(),
            config.topics.clone(),
            self.broker.clone(),
            plane,
            self.on_new_connection_callback(),
        ))
    }

    fn on_new_connection_callback(self: &Arc<Self>) -> OnNewConnection {
        let weak = Arc::downgrade(self);
        Arc::new(move |conn| {
            if let Some(app) = weak.upgrade() {
                app.handle_new_connection(conn);
            }
        })
    }

    /// Every transport funnels fresh connections here: replace any prior
    /// session for the device, then let the new session own its lifecycle.
    fn handle_new_connection(self: &Arc<Self>, conn: Arc<Connection>) {
        let device_id = conn.device_id().to_string();
        let config = self.store.snapshot();
        let manager = ChatManager::new(
            conn,
            self.bus.clone(),
            self.pools.clone(),
            &config.session,
            ProviderSelection::from_config(&config),
        );
        self.registry.insert_replacing(manager.clone());
        self.control.notify_device_event("device_online", &device_id);
        tracing::info!(%device_id, "session registered");

        let app = self.clone();
        tokio::spawn(async move {
            manager.clone().run().await;
            // Remove only while still the current owner: a replacement may
            // already hold the slot.
            if app.registry.remove_if_current(&manager) {
                app.bus.publish(
                    topic::DEVICE_OFFLINE,
                    &Event::DeviceOffline {
                        device_id: device_id.clone(),
                    },
                );
                app.control.notify_device_event("device_offline", &device_id);
                tracing::info!(%device_id, "session removed");
            }
        });
    }

    fn register_event_handlers(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.workers
            .register(topic::SESSION_END, Arc::new(SessionEndHandler));
        self.workers.register(
            topic::EXIT_CHAT,
            Arc::new(ExitChatHandler { app: weak.clone() }),
        );
        self.workers
            .register(topic::INJECT_MESSAGE, Arc::new(InjectHandler { app: weak }));

        // Bus subscribers push onto the worker pool so events for one
        // device stay ordered.
        let workers = self.workers.clone();
        self.bus.subscribe(topic::SESSION_END, move |event| {
            workers.route(topic::SESSION_END, event.clone());
        });
        let workers = self.workers.clone();
        self.bus.subscribe(topic::EXIT_CHAT, move |event| {
            workers.route(topic::EXIT_CHAT, event.clone());
        });
    }

    fn register_control_handlers(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let handler: RpcHandler = Arc::new(move |request| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(app) = weak.upgrade() else {
                    return Err((500, "server shutting down".to_string()));
                };
                let Some(push) = request.body.as_object().cloned() else {
                    return Err((400, "body must be a config object".to_string()));
                };
                app.bus.publish(topic::SYSTEM_CONFIG, &Event::SystemConfig { push });
                Ok(serde_json::json!({ "message": "config accepted" }))
            })
        });
        self.control.register_handler(PATH_SYSTEM_CONFIG, handler);

        let weak = Arc::downgrade(self);
        let handler: RpcHandler = Arc::new(move |request| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(app) = weak.upgrade() else {
                    return Err((500, "server shutting down".to_string()));
                };
                let device_id = request
                    .body
                    .get("device_id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let message = request
                    .body
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                if device_id.is_empty() || message.is_empty() {
                    return Err((400, "device_id and message are required".to_string()));
                }
                if app.registry.get(&device_id).is_none() {
                    return Err((404, format!("device {device_id} not found or offline")));
                }
                let routed = app.workers.route(
                    topic::INJECT_MESSAGE,
                    Event::InjectMessage {
                        device_id,
                        message,
                        skip_llm: request
                            .body
                            .get("skip_llm")
                            .and_then(|v| v.as_bool())
                            .unwrap_or(false),
                    },
                );
                if routed {
                    Ok(serde_json::json!({ "message": "message injected successfully" }))
                } else {
                    Err((500, "inject queue full".to_string()))
                }
            })
        });
        self.control.register_handler(PATH_INJECT_MESSAGE, handler);

        let plugins = self.plugins.clone();
        let handler: RpcHandler = Arc::new(move |_request| {
            let tools = plugins.tool_names();
            Box::pin(async move {
                let count = tools.len();
                Ok(serde_json::json!({ "tools": tools, "count": count }))
            })
        });
        self.control.register_handler("/api/mcp/tools", handler);
    }

    /// Periodically report pool usage to the backend; skipped while the
    /// control socket is down.
    fn spawn_pool_stats_reporter(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(POOL_REPORT_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(app) = weak.upgrade() else { return };
                if !app.control.is_connected() {
                    continue;
                }
                let stats = app.pools.stats();
                if let Err(err) = app
                    .control
                    .send_request("POST", "/api/server/pool_stats", stats)
                    .await
                {
                    tracing::debug!("pool stats report failed: {err}");
                }
            }
        });
    }

    fn attach_reload_orchestrator(self: &Arc<Self>) {
        let orchestrator = Arc::new(ReloadOrchestrator::new(
            self.store.clone(),
            Arc::new(AppAppliers {
                app: Arc::downgrade(self),
            }),
        ));
        self.bus.subscribe(topic::SYSTEM_CONFIG, move |event| {
            let Event::SystemConfig { push } = event else { return };
            let orchestrator = orchestrator.clone();
            let push = push.clone();
            tokio::spawn(async move {
                orchestrator.handle_push(&push).await;
            });
        });
    }

    async fn shutdown(self: &Arc<Self>) {
        let adapter = self.adapter.lock().take();
        if let Some(adapter) = adapter {
            adapter.stop().await;
        }
        if let Some(ws) = self.ws_server.lock().take() {
            ws.stop();
        }
        let broker = self.broker.write().take();
        if let Some(broker) = broker {
            broker.stop().await;
        }
        self.registry.close_all();
        self.workers.close().await;
        self.control.stop().await;
        self.plugins.stop();
        self.pools.close_all();
        tracing::info!("voxedge stopped");
    }
}

/// Subsystem appliers the reload orchestrator drives.
struct AppAppliers {
    app: Weak<App>,
}

#[async_trait]
impl ReloadAppliers for AppAppliers {
    async fn restart_broker(&self) {
        let Some(app) = self.app.upgrade() else { return };
        let config = app.store.snapshot();

        // Stop first and synchronously: the listener must be released
        // before the new instance binds the same port.
        let old = app.broker.write().take();
        if let Some(broker) = old {
            broker.stop().await;
        }
        if !config.mqtt_server.enable {
            return;
        }
        match Broker::start(config.mqtt_server.clone(), config.topics.clone()).await {
            Ok(broker) => {
                let adapter = app.adapter.lock().clone();
                if let Some(adapter) = &adapter {
                    adapter.udp_plane().install_goodbye_sender(broker.goodbye_sender());
                }
                *app.broker.write() = Some(broker);
                // Inline subscriptions live in the broker instance; rebind.
                if let Some(adapter) = adapter {
                    adapter.resubscribe_inline();
                }
            }
            Err(err) => tracing::error!("broker restart failed: {err}"),
        }
    }

    async fn reload_transport(&self, mqtt_changed: bool, udp_changed: bool) {
        let Some(app) = self.app.upgrade() else { return };
        let config = app.store.snapshot();
        let current = app.adapter.lock().clone();

        if !config.mqtt.enable {
            tracing::info!("mqtt disabled, stopping mqtt+udp");
            if let Some(adapter) = current {
                adapter.stop().await;
            }
            *app.adapter.lock() = None;
            return;
        }

        let Some(adapter) = current else {
            tracing::info!("mqtt enabled but adapter missing, starting mqtt+udp");
            match app.build_adapter(&config).await {
                Ok(adapter) => {
                    adapter.start();
                    *app.adapter.lock() = Some(adapter);
                }
                Err(err) => tracing::error!("adapter start failed: {err}"),
            }
            return;
        };

        if mqtt_changed && udp_changed {
            tracing::info!("mqtt and udp changed, rebuilding adapter");
            adapter.stop().await;
            *app.adapter.lock() = None;
            match app.build_adapter(&config).await {
                Ok(fresh) => {
                    fresh.start();
                    *app.adapter.lock() = Some(fresh);
                }
                Err(err) => tracing::error!("adapter rebuild failed: {err}"),
            }
        } else if mqtt_changed {
            tracing::info!("mqtt changed, reconnecting client only");
            adapter.reload_mqtt_client(config.mqtt.clone()).await;
        } else {
            tracing::info!("udp listen changed, rebinding udp only");
            match UdpPlane::bind(&config.udp_config()).await {
                Ok(plane) => {
                    if let Some(broker) = app.broker.read().clone() {
                        plane.install_goodbye_sender(broker.goodbye_sender());
                    }
                    adapter.reload_udp(plane);
                }
                Err(err) => tracing::error!("udp rebind failed: {err}"),
            }
        }
    }

    async fn restart_plugins(&self) {
        let Some(app) = self.app.upgrade() else { return };
        let config = app.store.snapshot();
        if !config.mcp.enabled {
            app.plugins.stop();
            return;
        }
        let result = if app.plugins.is_started() {
            app.plugins.restart(&config.mcp, &config.local_mcp)
        } else {
            app.plugins.start(&config.mcp, &config.local_mcp)
        };
        if let Err(err) = result {
            tracing::error!("plugin manager reload failed: {err}");
        }
    }
}

/// Worker-pool handlers.
struct SessionEndHandler;

impl TopicHandler for SessionEndHandler {
    fn routing_key(&self, event: &Event) -> Option<String> {
        match event {
            Event::SessionEnd { state } => Some(state.device_id.clone()),
            _ => None,
        }
    }

    fn handle(&self, event: Event) {
        if let Event::SessionEnd { state } = event {
            let SessionSnapshot {
                device_id,
                session_id,
            } = state;
            // Memory flush belongs to the provider behind the pool; the
            // core's job ends at ordered delivery.
            tracing::debug!(%device_id, %session_id, "session end processed");
        }
    }
}

struct ExitChatHandler {
    app: Weak<App>,
}

impl TopicHandler for ExitChatHandler {
    fn routing_key(&self, event: &Event) -> Option<String> {
        match event {
            Event::ExitChat { state, .. } => Some(state.device_id.clone()),
            _ => None,
        }
    }

    fn handle(&self, event: Event) {
        let Event::ExitChat { state, reason } = event else { return };
        let Some(app) = self.app.upgrade() else { return };
        match app.registry.get(&state.device_id) {
            Some(manager) => {
                tracing::debug!(device_id = %state.device_id, reason, "exit chat");
                manager.exit_chat();
            }
            None => {
                tracing::warn!(device_id = %state.device_id, "exit chat for unknown session");
            }
        }
    }
}

struct InjectHandler {
    app: Weak<App>,
}

impl TopicHandler for InjectHandler {
    fn routing_key(&self, event: &Event) -> Option<String> {
        match event {
            Event::InjectMessage { device_id, .. } => Some(device_id.clone()),
            _ => None,
        }
    }

    fn handle(&self, event: Event) {
        let Event::InjectMessage {
            device_id,
            message,
            skip_llm,
        } = event
        else {
            return;
        };
        let Some(app) = self.app.upgrade() else { return };
        match app.registry.get(&device_id) {
            Some(manager) => manager.inject_message(message, skip_llm),
            None => tracing::warn!(%device_id, "inject for unknown session"),
        }
    }
}
