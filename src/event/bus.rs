//! Typed publish/subscribe.
//!
//! `publish` runs every handler synchronously on the caller's task; a
//! subscriber that needs per-device ordering routes into the worker pool
//! from its handler instead of doing the work inline.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

pub mod topic {
    pub const SESSION_END: &str = "session.end";
    pub const EXIT_CHAT: &str = "chat.exit";
    pub const INJECT_MESSAGE: &str = "chat.inject";
    pub const SYSTEM_CONFIG: &str = "config.push";
    pub const DEVICE_OFFLINE: &str = "device.offline";
}

/// The slice of session state events carry; enough for routing and for the
/// handlers' bookkeeping without holding the session alive.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub device_id: String,
    pub session_id: String,
}

#[derive(Debug, Clone)]
pub enum Event {
    SessionEnd {
        state: SessionSnapshot,
    },
    ExitChat {
        state: SessionSnapshot,
        reason: String,
    },
    InjectMessage {
        device_id: String,
        message: String,
        skip_llm: bool,
    },
    SystemConfig {
        push: serde_json::Map<String, serde_json::Value>,
    },
    DeviceOffline {
        device_id: String,
    },
}

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<HashMap<&'static str, Vec<Handler>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, topic: &'static str, handler: impl Fn(&Event) + Send + Sync + 'static) {
        self.handlers
            .write()
            .entry(topic)
            .or_default()
            .push(Arc::new(handler));
    }

    /// Call every handler for `topic` on the caller's task, in subscription
    /// order.
    pub fn publish(&self, topic: &'static str, event: &Event) {
        let handlers: Vec<Handler> = {
            let map = self.handlers.read();
            match map.get(topic) {
                Some(list) => list.clone(),
                None => return,
            }
        };
        for handler in handlers {
            handler(event);
        }
    }

    pub fn handler_count(&self, topic: &str) -> usize {
        self.handlers.read().get(topic).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn publish_calls_every_handler_in_order() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));
        for expected in 0..3 {
            let calls = calls.clone();
            bus.subscribe(topic::SESSION_END, move |_| {
                let seen = calls.fetch_add(1, Ordering::SeqCst);
                assert_eq!(seen, expected);
            });
        }
        bus.publish(
            topic::SESSION_END,
            &Event::SessionEnd {
                state: SessionSnapshot {
                    device_id: "d1".into(),
                    session_id: "s1".into(),
                },
            },
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn publish_without_subscribers_is_noop() {
        let bus = EventBus::new();
        bus.publish(
            topic::DEVICE_OFFLINE,
            &Event::DeviceOffline {
                device_id: "d1".into(),
            },
        );
        assert_eq!(bus.handler_count(topic::DEVICE_OFFLINE), 0);
    }
}
