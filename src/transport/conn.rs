//! The per-device connection handle shared by all transports.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;

/// Bounded depth of the inbound command queue.
pub const CMD_QUEUE_DEPTH: usize = 64;

/// A connection with no traffic for this long fails `is_active` and is
/// reaped by the adapter's liveness sweep.
const ACTIVE_WINDOW: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum ConnError {
    #[error("command queue full")]
    QueueFull,
    #[error("connection destroyed")]
    Destroyed,
    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    MqttUdp,
    WebSocket,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MqttUdp => "udp",
            Self::WebSocket => "websocket",
        }
    }
}

/// Transport-specific half of a device connection.
#[async_trait]
pub trait ConnTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Send a control message back to the device.
    async fn send_cmd(&self, payload: &[u8]) -> Result<(), ConnError>;

    /// Enqueue an outbound audio frame; false means dropped on overflow.
    fn send_audio(&self, frame: Vec<u8>) -> bool;

    /// Hand over the inbound audio receiver. Yields once.
    fn take_audio_rx(&self) -> Option<mpsc::Receiver<Vec<u8>>>;

    /// Transport-specific fields for the hello reply (key material, media
    /// endpoint).
    fn hello_extra(&self, reply: &mut serde_json::Map<String, serde_json::Value>);

    fn close(&self);

    fn is_alive(&self) -> bool;
}

type CloseObserver = Box<dyn Fn(&str) + Send + Sync>;

/// Per-device transport handle consumed by the session layer.
///
/// The inbound command queue is fed by exactly one transport reader; the
/// outbound audio queue is drained by exactly one transport writer. Close
/// observers fire exactly once.
pub struct Connection {
    device_id: String,
    transport: Box<dyn ConnTransport>,
    cmd_tx: mpsc::Sender<Vec<u8>>,
    cmd_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    observers: Mutex<Vec<CloseObserver>>,
    destroyed: AtomicBool,
    last_active: Mutex<Instant>,
}

impl Connection {
    pub fn new(device_id: String, transport: Box<dyn ConnTransport>) -> Arc<Self> {
        let (cmd_tx, cmd_rx) = mpsc::channel(CMD_QUEUE_DEPTH);
        Arc::new(Self {
            device_id,
            transport,
            cmd_tx,
            cmd_rx: Mutex::new(Some(cmd_rx)),
            observers: Mutex::new(Vec::new()),
            destroyed: AtomicBool::new(false),
            last_active: Mutex::new(Instant::now()),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    pub fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    /// Enqueue an inbound command payload from the transport reader.
    pub fn push_cmd(&self, payload: Vec<u8>) -> Result<(), ConnError> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(ConnError::Destroyed);
        }
        self.touch();
        self.cmd_tx.try_send(payload).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => ConnError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => ConnError::Destroyed,
        })
    }

    /// Hand the command receiver to the session layer. Yields once.
    pub fn take_cmd_rx(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.cmd_rx.lock().take()
    }

    pub async fn send_cmd(&self, payload: &[u8]) -> Result<(), ConnError> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(ConnError::Destroyed);
        }
        self.transport.send_cmd(payload).await
    }

    /// Enqueue outbound audio; drops (with a debug line) on overflow.
    pub fn send_audio(&self, frame: Vec<u8>) {
        if self.destroyed.load(Ordering::Acquire) {
            return;
        }
        if !self.transport.send_audio(frame) {
            tracing::debug!(device_id = %self.device_id, "outbound audio queue full, frame dropped");
        }
    }

    pub fn take_audio_rx(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.transport.take_audio_rx()
    }

    pub fn hello_extra(&self, reply: &mut serde_json::Map<String, serde_json::Value>) {
        self.transport.hello_extra(reply);
    }

    /// Register a close observer. Observers registered after destruction
    /// fire immediately.
    pub fn on_close(&self, observer: impl Fn(&str) + Send + Sync + 'static) {
        if self.destroyed.load(Ordering::Acquire) {
            observer(&self.device_id);
            return;
        }
        self.observers.lock().push(Box::new(observer));
    }

    /// Idempotent teardown: closes the transport, drains the queues and
    /// fires every observer exactly once.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.transport.close();
        let observers: Vec<CloseObserver> = self.observers.lock().drain(..).collect();
        for observer in observers {
            observer(&self.device_id);
        }
        tracing::debug!(device_id = %self.device_id, "connection destroyed");
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub fn is_active(&self) -> bool {
        !self.destroyed.load(Ordering::Acquire)
            && self.transport.is_alive()
            && self.last_active.lock().elapsed() < ACTIVE_WINDOW
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("device_id", &self.device_id)
            .field("kind", &self.kind())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::NullTransport;
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn destroy_fires_observers_exactly_once() {
        let conn = Connection::new("d1".into(), Box::<NullTransport>::default());
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        conn.on_close(move |device_id| {
            assert_eq!(device_id, "d1");
            counter.fetch_add(1, Ordering::SeqCst);
        });
        conn.destroy();
        conn.destroy();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn observer_after_destroy_fires_immediately() {
        let conn = Connection::new("d1".into(), Box::<NullTransport>::default());
        conn.destroy();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        conn.on_close(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn push_cmd_after_destroy_fails() {
        let conn = Connection::new("d1".into(), Box::<NullTransport>::default());
        conn.destroy();
        assert!(matches!(
            conn.push_cmd(b"x".to_vec()),
            Err(ConnError::Destroyed)
        ));
    }

    #[test]
    fn cmd_queue_overflow_reports_full() {
        let conn = Connection::new("d1".into(), Box::<NullTransport>::default());
        for _ in 0..CMD_QUEUE_DEPTH {
            conn.push_cmd(vec![0]).unwrap();
        }
        assert!(matches!(
            conn.push_cmd(vec![0]),
            Err(ConnError::QueueFull)
        ));
    }

    #[test]
    fn dead_transport_is_inactive() {
        let conn = Connection::new("d1".into(), Box::<NullTransport>::default());
        assert!(conn.is_active());
        conn.destroy();
        assert!(!conn.is_active());
    }
}
