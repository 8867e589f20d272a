//! Per-device UDP media session.

use crate::codec::{open, seal, ConnId, CryptoError, NonceTemplate, KEY_LEN};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch};

/// Bounded depth of the inbound and outbound audio queues. Overflow drops
/// the incoming frame so a slow consumer never stalls the socket loop.
pub const AUDIO_QUEUE_DEPTH: usize = 100;

const STATUS_ACTIVE: u8 = 0;
const STATUS_CLOSED: u8 = 1;

/// One device's encrypted media lane.
///
/// Owned by exactly one device connection. The inbound queue is fed by the
/// plane's socket loop; the outbound queue is drained by the session's
/// dedicated sender task.
pub struct UdpSession {
    pub id: String,
    pub device_id: String,
    pub client_id: String,
    key: [u8; KEY_LEN],
    template: NonceTemplate,
    counter: AtomicU64,
    remote: Mutex<Option<SocketAddr>>,
    last_active: Mutex<Instant>,
    status: AtomicU8,
    recv_tx: mpsc::Sender<Vec<u8>>,
    recv_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    send_tx: mpsc::Sender<Vec<u8>>,
    closed_tx: watch::Sender<bool>,
}

impl UdpSession {
    pub(crate) fn new(
        device_id: String,
        client_id: String,
    ) -> (Self, mpsc::Receiver<Vec<u8>>, watch::Receiver<bool>) {
        let key: [u8; KEY_LEN] = rand::random();
        let session_id = hex::encode(rand::random::<[u8; 8]>());
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or_default();
        let template = NonceTemplate::new(ConnId::random(), now);
        let (recv_tx, recv_rx) = mpsc::channel(AUDIO_QUEUE_DEPTH);
        let (send_tx, send_rx) = mpsc::channel(AUDIO_QUEUE_DEPTH);
        let (closed_tx, closed_rx) = watch::channel(false);
        let session = Self {
            id: session_id,
            device_id,
            client_id,
            key,
            template,
            counter: AtomicU64::new(0),
            remote: Mutex::new(None),
            last_active: Mutex::new(Instant::now()),
            status: AtomicU8::new(STATUS_ACTIVE),
            recv_tx,
            recv_rx: Mutex::new(Some(recv_rx)),
            send_tx,
            closed_tx,
        };
        (session, send_rx, closed_rx)
    }

    pub fn conn_id(&self) -> ConnId {
        self.template.conn_id()
    }

    /// Key and counter-zero nonce, hex-encoded for the hello reply.
    pub fn key_material(&self) -> (String, String) {
        (hex::encode(self.key), self.template.full_nonce_hex())
    }

    pub fn remote(&self) -> Option<SocketAddr> {
        *self.remote.lock()
    }

    pub fn set_remote(&self, addr: SocketAddr) {
        *self.remote.lock() = Some(addr);
    }

    pub fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_active.lock().elapsed()
    }

    pub fn is_closed(&self) -> bool {
        self.status.load(Ordering::Acquire) == STATUS_CLOSED
    }

    /// Decrypt an inbound datagram with this session's key.
    pub fn open_datagram(&self, datagram: &[u8]) -> Result<Vec<u8>, CryptoError> {
        open(&self.key, datagram)
    }

    /// Encrypt an outbound frame, advancing the per-session counter.
    pub fn seal_next(&self, frame: &[u8]) -> Vec<u8> {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        seal(&self.key, &self.template.iv(counter), frame)
    }

    /// Enqueue a decrypted inbound frame. Returns false when the queue is
    /// full and the frame was dropped.
    pub fn push_audio(&self, frame: Vec<u8>) -> bool {
        self.recv_tx.try_send(frame).is_ok()
    }

    /// Enqueue an outbound frame for encryption and transmission. Returns
    /// false when the queue is full and the frame was dropped.
    pub fn send_audio(&self, frame: Vec<u8>) -> bool {
        if self.is_closed() {
            return false;
        }
        self.send_tx.try_send(frame).is_ok()
    }

    /// Hand the inbound audio receiver to the session's single consumer.
    /// Subsequent calls return `None`.
    pub fn take_audio_rx(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.recv_rx.lock().take()
    }

    pub(crate) fn close(&self) {
        if self.status.swap(STATUS_CLOSED, Ordering::AcqRel) == STATUS_CLOSED {
            return;
        }
        let _ = self.closed_tx.send(true);
    }
}

impl std::fmt::Debug for UdpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpSession")
            .field("id", &self.id)
            .field("device_id", &self.device_id)
            .field("conn_id", &self.conn_id().to_hex())
            .field("remote", &self.remote())
            .finish()
    }
}
