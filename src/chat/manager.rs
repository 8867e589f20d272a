//! The per-device session driver.

use crate::chat::message::ClientMessage;
use crate::chat::pipeline::{self, ProviderSelection};
use crate::chat::state::{PhaseTracker, SessionPhase, TickOutcome};
use crate::codec::{opus, pcm};
use crate::core::config::SessionConfig;
use crate::event::{topic, Event, EventBus, SessionSnapshot};
use crate::pool::PoolManager;
use crate::transport::conn::{Connection, TransportKind};
use crate::transport::registry::ManagedSession;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const TICK_INTERVAL: Duration = Duration::from_secs(5);

/// Cap on buffered utterance samples (~20 s at 16 kHz); audio past the cap
/// is dropped so a stuck device cannot grow the buffer without bound.
const MAX_UTTERANCE_SAMPLES: usize = 16_000 * 20;

/// Owns one device session end to end: state machine, hello/goodbye,
/// utterance buffering and the provider pipeline.
pub struct ChatManager {
    device_id: String,
    session_id: String,
    conn: Arc<Connection>,
    phase: Mutex<PhaseTracker>,
    bus: Arc<EventBus>,
    pools: Arc<PoolManager>,
    selection: ProviderSelection,
    utterance: Mutex<Vec<f32>>,
    started: AtomicBool,
    closed: AtomicBool,
}

impl ChatManager {
    pub fn new(
        conn: Arc<Connection>,
        bus: Arc<EventBus>,
        pools: Arc<PoolManager>,
        session_cfg: &SessionConfig,
        selection: ProviderSelection,
    ) -> Arc<Self> {
        Arc::new(Self {
            device_id: conn.device_id().to_string(),
            session_id: uuid::Uuid::new_v4().to_string(),
            conn,
            phase: Mutex::new(PhaseTracker::new(
                Duration::from_secs(session_cfg.idle_seconds),
                Duration::from_secs(session_cfg.close_seconds),
            )),
            bus,
            pools,
            selection,
            utterance: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase.lock().phase()
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            device_id: self.device_id.clone(),
            session_id: self.session_id.clone(),
        }
    }

    /// Drive the session until goodbye, idle timeout or transport loss.
    pub async fn run(self: Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(mut cmd_rx) = self.conn.take_cmd_rx() else {
            tracing::error!(device_id = %self.device_id, "command receiver already taken");
            return;
        };
        let mut audio_rx = self.conn.take_audio_rx();
        self.phase.lock().on_transport_accepted();

        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                payload = cmd_rx.recv() => {
                    let Some(payload) = payload else { break };
                    if !self.handle_command(&payload).await {
                        break;
                    }
                }
                frame = recv_or_pending(&mut audio_rx) => {
                    match frame {
                        Some(frame) => self.handle_audio(frame).await,
                        None => audio_rx = None,
                    }
                }
                _ = ticker.tick() => {
                    if self.closed.load(Ordering::Acquire) || self.conn.is_destroyed() {
                        break;
                    }
                    match self.phase.lock().tick() {
                        TickOutcome::WentIdle => {
                            tracing::debug!(device_id = %self.device_id, "session idle");
                        }
                        TickOutcome::ShouldClose => {
                            tracing::info!(device_id = %self.device_id, "idle timeout, closing session");
                            break;
                        }
                        TickOutcome::Unchanged => {}
                    }
                }
            }
        }

        self.shutdown();
    }

    /// Returns false when the session should end.
    async fn handle_command(&self, payload: &[u8]) -> bool {
        let message = match ClientMessage::parse(payload) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(device_id = %self.device_id, "bad command payload: {err}");
                return true;
            }
        };
        self.phase.lock().on_command();

        match message.msg_type.as_str() {
            "hello" => {
                self.send_hello_ack().await;
            }
            "goodbye" => {
                tracing::info!(device_id = %self.device_id, "goodbye received");
                self.bus.publish(
                    topic::EXIT_CHAT,
                    &Event::ExitChat {
                        state: self.snapshot(),
                        reason: "goodbye".to_string(),
                    },
                );
                return false;
            }
            "chat" => {
                if let Some(text) = message.text.as_deref().filter(|t| !t.is_empty()) {
                    self.speak_reply(text, false).await;
                }
            }
            "listen" => {
                if message.state.as_deref() == Some("stop") {
                    self.finish_utterance().await;
                }
            }
            "abort" => {
                self.utterance.lock().clear();
            }
            other => {
                tracing::debug!(device_id = %self.device_id, msg_type = other, "unhandled command");
            }
        }
        true
    }

    async fn send_hello_ack(&self) {
        let mut reply = serde_json::Map::new();
        reply.insert("type".into(), "hello".into());
        reply.insert("session_id".into(), self.session_id.clone().into());
        self.conn.hello_extra(&mut reply);
        let payload = serde_json::Value::Object(reply).to_string();
        if let Err(err) = self.conn.send_cmd(payload.as_bytes()).await {
            tracing::error!(device_id = %self.device_id, "hello reply failed: {err}");
        }
    }

    async fn handle_audio(&self, frame: Vec<u8>) {
        self.conn.touch();
        self.phase.lock().on_audio();

        match self.conn.kind() {
            TransportKind::WebSocket => {
                // WS audio is raw s16le; convert and gate through VAD.
                let samples = pcm::s16le_to_f32(&frame);
                if pipeline::detect_speech(&self.pools, &self.selection, &samples).await {
                    let mut utterance = self.utterance.lock();
                    if utterance.len() + samples.len() <= MAX_UTTERANCE_SAMPLES {
                        utterance.extend_from_slice(&samples);
                    }
                }
            }
            TransportKind::MqttUdp => {
                // Opus frames stay opaque; only the TOC is inspected for
                // pacing and end-of-speech heuristics.
                if !opus::is_silence(&frame) {
                    let _ = opus::packet_duration_ms(&frame);
                }
            }
        }
    }

    async fn finish_utterance(&self) {
        let samples: Vec<f32> = std::mem::take(&mut *self.utterance.lock());
        let transcript = if samples.is_empty() {
            None
        } else {
            pipeline::transcribe(&self.pools, &self.selection, &samples).await
        };
        match transcript.filter(|t| !t.is_empty()) {
            Some(text) => self.speak_reply(&text, false).await,
            None => {
                tracing::debug!(device_id = %self.device_id, "empty utterance, nothing to answer");
            }
        }
    }

    async fn speak_reply(&self, text: &str, skip_llm: bool) {
        let frames = pipeline::respond(&self.pools, &self.selection, text, skip_llm).await;
        for frame in frames {
            self.conn.send_audio(frame);
        }
    }

    /// Inject a message from the control plane as if the user had said it.
    pub fn inject_message(self: &Arc<Self>, message: String, skip_llm: bool) {
        let manager = self.clone();
        tokio::spawn(async move {
            manager.speak_reply(&message, skip_llm).await;
        });
    }

    /// Speak the farewell and close; used by the exit-chat handler.
    pub fn exit_chat(self: &Arc<Self>) {
        let manager = self.clone();
        tokio::spawn(async move {
            manager.speak_reply("goodbye", true).await;
            manager.close();
        });
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.phase.lock().begin_close();
        self.bus.publish(
            topic::SESSION_END,
            &Event::SessionEnd {
                state: self.snapshot(),
            },
        );
        self.conn.destroy();
        self.phase.lock().finish_close();
        tracing::info!(device_id = %self.device_id, session_id = %self.session_id, "session closed");
    }
}

async fn recv_or_pending(
    audio_rx: &mut Option<tokio::sync::mpsc::Receiver<Vec<u8>>>,
) -> Option<Vec<u8>> {
    match audio_rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl ManagedSession for ChatManager {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Synchronous close: destroys the transport (firing close observers)
    /// and marks the session finished. The run loop, if still alive,
    /// observes the destroyed connection and exits.
    fn close(&self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{Config, PoolSettings};
    use crate::pool::register_builtin_types;
    use crate::transport::conn::test_support::NullTransport;

    fn harness() -> (Arc<ChatManager>, Arc<Connection>, Arc<EventBus>) {
        let conn = Connection::new("d1".into(), Box::<NullTransport>::default());
        let bus = Arc::new(EventBus::new());
        let pools = Arc::new(PoolManager::new(&PoolSettings::default()));
        register_builtin_types(&pools).unwrap();
        let manager = ChatManager::new(
            conn.clone(),
            bus.clone(),
            pools,
            &SessionConfig::default(),
            ProviderSelection::from_config(&Config::default()),
        );
        (manager, conn, bus)
    }

    #[tokio::test]
    async fn hello_then_goodbye_closes_session() {
        let (manager, conn, bus) = harness();
        let ended = Arc::new(AtomicBool::new(false));
        let flag = ended.clone();
        bus.subscribe(topic::SESSION_END, move |_| {
            flag.store(true, Ordering::SeqCst);
        });

        let run = tokio::spawn(manager.clone().run());
        conn.push_cmd(br#"{"type":"hello"}"#.to_vec()).unwrap();
        conn.push_cmd(br#"{"type":"goodbye"}"#.to_vec()).unwrap();
        run.await.unwrap();

        assert!(ended.load(Ordering::SeqCst));
        assert!(conn.is_destroyed());
        assert_eq!(manager.phase(), SessionPhase::Closed);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_synchronous() {
        let (manager, conn, _bus) = harness();
        manager.close();
        manager.close();
        assert!(conn.is_destroyed());
        assert_eq!(manager.phase(), SessionPhase::Closed);
    }
}
