//! Device registry semantics: one session per device id, replacement
//! closes the predecessor synchronously, stale owners cannot evict.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use voxedge::transport::{DeviceRegistry, ManagedSession};

struct FakeSession {
    device_id: String,
    closed: AtomicBool,
    close_seq: Arc<AtomicUsize>,
    closed_at: AtomicUsize,
}

impl FakeSession {
    fn new(device_id: &str, close_seq: Arc<AtomicUsize>) -> Arc<Self> {
        Arc::new(Self {
            device_id: device_id.to_string(),
            closed: AtomicBool::new(false),
            close_seq,
            closed_at: AtomicUsize::new(0),
        })
    }
}

impl ManagedSession for FakeSession {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let seq = self.close_seq.fetch_add(1, Ordering::SeqCst) + 1;
            self.closed_at.store(seq, Ordering::SeqCst);
        }
    }
}

#[test]
fn two_claims_for_one_device_keep_exactly_one_session() {
    let registry = DeviceRegistry::new();
    let seq = Arc::new(AtomicUsize::new(0));

    let first = FakeSession::new("d1", seq.clone());
    registry.insert_replacing(first.clone());
    assert_eq!(registry.len(), 1);

    // The first handle observes close before the second is registered.
    let second = FakeSession::new("d1", seq.clone());
    registry.insert_replacing(second.clone());

    assert!(first.closed.load(Ordering::SeqCst));
    assert_eq!(first.closed_at.load(Ordering::SeqCst), 1);
    assert!(!second.closed.load(Ordering::SeqCst));
    assert_eq!(registry.len(), 1);
    assert!(Arc::ptr_eq(&registry.get("d1").unwrap(), &second));
}

#[test]
fn lifecycle_removal_is_owner_gated() {
    let registry = DeviceRegistry::new();
    let seq = Arc::new(AtomicUsize::new(0));

    let first = FakeSession::new("d1", seq.clone());
    let second = FakeSession::new("d1", seq.clone());
    registry.insert_replacing(first.clone());
    registry.insert_replacing(second.clone());

    // The replaced session's terminating task must not remove the new one.
    assert!(!registry.remove_if_current(&first));
    assert_eq!(registry.len(), 1);

    assert!(registry.remove_if_current(&second));
    assert_eq!(registry.len(), 0);

    // Removing twice is harmless.
    assert!(!registry.remove_if_current(&second));
}

#[test]
fn distinct_devices_coexist() {
    let registry = DeviceRegistry::new();
    let seq = Arc::new(AtomicUsize::new(0));
    registry.insert_replacing(FakeSession::new("d1", seq.clone()));
    registry.insert_replacing(FakeSession::new("d2", seq.clone()));
    assert_eq!(registry.len(), 2);

    registry.close_all();
    assert_eq!(registry.len(), 0);
    assert_eq!(seq.load(Ordering::SeqCst), 2);
}
