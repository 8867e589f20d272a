//! Device registry: at most one live session per device id.

use dashmap::DashMap;
use std::sync::Arc;

/// What the registry needs from a session object.
pub trait ManagedSession: Send + Sync {
    fn device_id(&self) -> &str;
    /// Synchronous close; must be safe to call more than once.
    fn close(&self);
}

/// Concurrent map of device-id → session with replace-on-duplicate
/// semantics: registering a second session for a device closes the first
/// one synchronously before the new one becomes visible.
pub struct DeviceRegistry<S: ManagedSession> {
    sessions: DashMap<String, Arc<S>>,
}

impl<S: ManagedSession> Default for DeviceRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: ManagedSession> DeviceRegistry<S> {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Register a session, closing and evicting any prior holder of the id.
    pub fn insert_replacing(&self, session: Arc<S>) {
        let device_id = session.device_id().to_string();
        if let Some((_, previous)) = self.sessions.remove(&device_id) {
            tracing::info!(device_id, "device already registered, closing previous session");
            previous.close();
        }
        self.sessions.insert(device_id, session);
    }

    /// Remove the entry only if `session` is still its current owner.
    /// Returns true when the entry was removed by this call.
    pub fn remove_if_current(&self, session: &Arc<S>) -> bool {
        let device_id = session.device_id();
        self.sessions
            .remove_if(device_id, |_, current| Arc::ptr_eq(current, session))
            .is_some()
    }

    pub fn get(&self, device_id: &str) -> Option<Arc<S>> {
        self.sessions.get(device_id).map(|entry| entry.clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Close every session and clear the map.
    pub fn close_all(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, session)) = self.sessions.remove(&id) {
                session.close();
            }
        }
    }

    pub fn for_each(&self, mut f: impl FnMut(&Arc<S>)) {
        for entry in self.sessions.iter() {
            f(entry.value());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakeSession {
        id: String,
        closed: AtomicBool,
    }

    impl FakeSession {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                closed: AtomicBool::new(false),
            })
        }
    }

    impl ManagedSession for FakeSession {
        fn device_id(&self) -> &str {
            &self.id
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn duplicate_closes_prior_session_first() {
        let registry = DeviceRegistry::new();
        let first = FakeSession::new("d1");
        let second = FakeSession::new("d1");

        registry.insert_replacing(first.clone());
        assert_eq!(registry.len(), 1);

        registry.insert_replacing(second.clone());
        assert_eq!(registry.len(), 1);
        assert!(first.closed.load(Ordering::SeqCst));
        assert!(!second.closed.load(Ordering::SeqCst));
        assert!(Arc::ptr_eq(&registry.get("d1").unwrap(), &second));
    }

    #[test]
    fn stale_owner_cannot_remove_replacement() {
        let registry = DeviceRegistry::new();
        let first = FakeSession::new("d1");
        let second = FakeSession::new("d1");

        registry.insert_replacing(first.clone());
        registry.insert_replacing(second.clone());

        // The replaced session's lifecycle task races its own removal; it
        // must not evict the new owner.
        assert!(!registry.remove_if_current(&first));
        assert_eq!(registry.len(), 1);
        assert!(registry.remove_if_current(&second));
        assert!(registry.is_empty());
    }

    #[test]
    fn close_all_closes_everything() {
        let registry = DeviceRegistry::new();
        let a = FakeSession::new("a");
        let b = FakeSession::new("b");
        registry.insert_replacing(a.clone());
        registry.insert_replacing(b.clone());
        registry.close_all();
        assert!(registry.is_empty());
        assert!(a.closed.load(Ordering::SeqCst));
        assert!(b.closed.load(Ordering::SeqCst));
    }
}
