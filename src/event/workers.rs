//! Fan-in worker pool with per-key ordering.
//!
//! N single-consumer queues; an event is assigned to a worker by hashing
//! the routing key its topic handler extracts (device id). Events sharing a
//! key therefore land on the same worker and are processed in enqueue
//! order, without per-device locks and with bounded parallelism for the
//! downstream pipelines.

use crate::event::bus::Event;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

pub const DEFAULT_WORKERS: usize = 8;

const WORKER_QUEUE_DEPTH: usize = 100;

/// Per-topic processing plus routing-key extraction.
pub trait TopicHandler: Send + Sync {
    fn routing_key(&self, event: &Event) -> Option<String>;
    fn handle(&self, event: Event);
}

struct RoutedEvent {
    topic: &'static str,
    event: Event,
}

type HandlerMap = Arc<RwLock<HashMap<&'static str, Arc<dyn TopicHandler>>>>;

pub struct WorkerPool {
    workers: Vec<mpsc::Sender<RoutedEvent>>,
    handlers: HandlerMap,
    stop_tx: watch::Sender<bool>,
    joins: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(worker_count: usize) -> Self {
        let worker_count = worker_count.max(1);
        let handlers: HandlerMap = Arc::new(RwLock::new(HashMap::new()));
        let (stop_tx, _) = watch::channel(false);
        let mut workers = Vec::with_capacity(worker_count);
        let mut joins = Vec::with_capacity(worker_count);

        for index in 0..worker_count {
            let (tx, rx) = mpsc::channel(WORKER_QUEUE_DEPTH);
            workers.push(tx);
            joins.push(tokio::spawn(worker_loop(
                index,
                rx,
                handlers.clone(),
                stop_tx.subscribe(),
            )));
        }
        tracing::info!(worker_count, "worker pool started");
        Self {
            workers,
            handlers,
            stop_tx,
            joins: Mutex::new(joins),
        }
    }

    pub fn register(&self, topic: &'static str, handler: Arc<dyn TopicHandler>) {
        self.handlers.write().insert(topic, handler);
        tracing::info!(topic, "topic handler registered");
    }

    /// Route an event to the worker owning its key. Returns false when the
    /// topic has no handler, the key is missing, or the worker queue is
    /// full (the event is dropped with a log line; routing never blocks).
    pub fn route(&self, topic: &'static str, event: Event) -> bool {
        let handler = match self.handlers.read().get(topic) {
            Some(handler) => handler.clone(),
            None => {
                tracing::warn!(topic, "no handler registered, event not routed");
                return false;
            }
        };
        let Some(key) = handler.routing_key(&event) else {
            tracing::warn!(topic, "empty routing key, event not routed");
            return false;
        };
        let index = (fnv1a32(&key) as usize) % self.workers.len();
        match self.workers[index].try_send(RoutedEvent { topic, event }) {
            Ok(()) => true,
            Err(_) => {
                tracing::warn!(topic, worker = index, %key, "worker queue full, event dropped");
                false
            }
        }
    }

    /// Deterministic worker assignment, exposed for tests.
    pub fn worker_for_key(&self, key: &str) -> usize {
        (fnv1a32(key) as usize) % self.workers.len()
    }

    /// Stop all workers: signal, let each drain its queue, then join.
    pub async fn close(&self) {
        let _ = self.stop_tx.send(true);
        let joins: Vec<JoinHandle<()>> = self.joins.lock().drain(..).collect();
        for join in joins {
            let _ = join.await;
        }
        tracing::info!("worker pool closed");
    }
}

async fn worker_loop(
    index: usize,
    mut rx: mpsc::Receiver<RoutedEvent>,
    handlers: HandlerMap,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop_rx.changed() => {
                // Drain whatever is already queued before exiting.
                while let Ok(routed) = rx.try_recv() {
                    dispatch(&handlers, routed);
                }
                tracing::debug!(worker = index, "worker exited");
                return;
            }
            routed = rx.recv() => match routed {
                Some(routed) => dispatch(&handlers, routed),
                None => return,
            }
        }
    }
}

fn dispatch(handlers: &HandlerMap, routed: RoutedEvent) {
    let handler = handlers.read().get(routed.topic).cloned();
    match handler {
        Some(handler) => {
            // A panicking handler loses its event, never its worker.
            let topic = routed.topic;
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                handler.handle(routed.event);
            }));
            if outcome.is_err() {
                tracing::error!(topic, "handler panicked, event lost");
            }
        }
        None => tracing::warn!(topic = routed.topic, "handler disappeared, event skipped"),
    }
}

/// 32-bit FNV-1a over the routing key.
fn fnv1a32(key: &str) -> u32 {
    const OFFSET: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    let mut hash = OFFSET;
    for byte in key.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}
