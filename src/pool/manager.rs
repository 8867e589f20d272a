//! Pool manager: one pool per (resource type, provider name).

use crate::core::config::PoolSettings;
use crate::pool::resource::{Callbacks, PoolConfig, PoolError, PoolHandle, PoolStats, ResourcePool};
use parking_lot::RwLock;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

struct TypedRegistration<T> {
    creator: Arc<dyn Fn(&str, &serde_json::Value) -> anyhow::Result<T> + Send + Sync>,
    validate: Arc<dyn Fn(&T) -> bool + Send + Sync>,
    close: Arc<dyn Fn(&mut T) + Send + Sync>,
    reset: Arc<dyn Fn(&mut T) -> anyhow::Result<()> + Send + Sync>,
}

struct PoolSlot {
    any: Arc<dyn Any + Send + Sync>,
    close: Arc<dyn Fn() + Send + Sync>,
    stats: Arc<dyn Fn() -> PoolStats + Send + Sync>,
}

pub struct PoolManager {
    base_cfg: PoolConfig,
    registrations: RwLock<HashMap<String, Box<dyn Any + Send + Sync>>>,
    pools: RwLock<HashMap<String, PoolSlot>>,
}

impl PoolManager {
    pub fn new(settings: &PoolSettings) -> Self {
        Self {
            base_cfg: PoolConfig::from_settings(settings),
            registrations: RwLock::new(HashMap::new()),
            pools: RwLock::new(HashMap::new()),
        }
    }

    /// Register a resource type with its creator and lifecycle callbacks.
    /// Fails if the type is already registered.
    pub fn register_type<T: Send + 'static>(
        &self,
        resource_type: &str,
        creator: impl Fn(&str, &serde_json::Value) -> anyhow::Result<T> + Send + Sync + 'static,
        validate: impl Fn(&T) -> bool + Send + Sync + 'static,
        close: impl Fn(&mut T) + Send + Sync + 'static,
        reset: impl Fn(&mut T) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> anyhow::Result<()> {
        let mut registrations = self.registrations.write();
        if registrations.contains_key(resource_type) {
            anyhow::bail!("resource type {resource_type} already registered");
        }
        registrations.insert(
            resource_type.to_string(),
            Box::new(TypedRegistration::<T> {
                creator: Arc::new(creator),
                validate: Arc::new(validate),
                close: Arc::new(close),
                reset: Arc::new(reset),
            }),
        );
        tracing::info!(resource_type, "resource type registered");
        Ok(())
    }

    /// Borrow a provider from the pool for `(resource_type, provider)`,
    /// creating the pool on first use.
    pub async fn acquire<T: Send + 'static>(
        &self,
        resource_type: &str,
        provider: &str,
        config: &serde_json::Value,
    ) -> Result<PoolHandle<T>, PoolError> {
        let key = pool_key(resource_type, provider);
        let pool = match self.lookup_pool::<T>(&key) {
            Some(pool) => pool,
            None => self.create_pool::<T>(&key, resource_type, provider, config)?,
        };
        pool.acquire().await
    }

    /// Return a provider to its pool. The handle carries the key it was
    /// minted with; an unknown pool (e.g. closed since) destroys the value.
    pub fn release<T: Send + 'static>(&self, handle: PoolHandle<T>) -> Result<(), PoolError> {
        let key = pool_key(handle.resource_type(), handle.provider());
        match self.lookup_pool::<T>(&key) {
            Some(pool) => pool.release(handle),
            None => {
                tracing::warn!(%key, "pool not found on release, destroying resource");
                drop(handle);
                Ok(())
            }
        }
    }

    fn lookup_pool<T: Send + 'static>(&self, key: &str) -> Option<Arc<ResourcePool<T>>> {
        let pools = self.pools.read();
        let slot = pools.get(key)?;
        slot.any.clone().downcast::<ResourcePool<T>>().ok()
    }

    fn create_pool<T: Send + 'static>(
        &self,
        key: &str,
        resource_type: &str,
        provider: &str,
        config: &serde_json::Value,
    ) -> Result<Arc<ResourcePool<T>>, PoolError> {
        let mut pools = self.pools.write();
        // Double-check: another task may have created it while we waited.
        if let Some(slot) = pools.get(key) {
            return slot
                .any
                .clone()
                .downcast::<ResourcePool<T>>()
                .map_err(|_| PoolError::Unregistered(resource_type.to_string()));
        }

        let registrations = self.registrations.read();
        let registration = registrations
            .get(resource_type)
            .and_then(|any| any.downcast_ref::<TypedRegistration<T>>())
            .ok_or_else(|| PoolError::Unregistered(resource_type.to_string()))?;

        let creator = registration.creator.clone();
        let provider_name = provider.to_string();
        let config = config.clone();
        let callbacks = Callbacks {
            create: Arc::new(move || creator(&provider_name, &config)),
            close: registration.close.clone(),
            validate: registration.validate.clone(),
            reset: registration.reset.clone(),
        };
        drop(registrations);

        let pool = ResourcePool::new(self.base_cfg.clone(), callbacks, resource_type, provider);
        let close_pool = pool.clone();
        let stats_pool = pool.clone();
        pools.insert(
            key.to_string(),
            PoolSlot {
                any: pool.clone(),
                close: Arc::new(move || close_pool.close()),
                stats: Arc::new(move || stats_pool.stats()),
            },
        );
        tracing::info!(resource_type, provider, "resource pool created");
        Ok(pool)
    }

    /// Stats for every live pool, keyed `type:provider`.
    pub fn stats(&self) -> serde_json::Value {
        let pools = self.pools.read();
        let map: serde_json::Map<String, serde_json::Value> = pools
            .iter()
            .map(|(key, slot)| {
                let stats = (slot.stats)();
                (key.clone(), serde_json::to_value(stats).unwrap_or_default())
            })
            .collect();
        serde_json::Value::Object(map)
    }

    pub fn pool_count(&self) -> usize {
        self.pools.read().len()
    }

    /// Close and forget every pool. A subsequent acquire for the same key
    /// creates a fresh pool.
    pub fn close_all(&self) {
        let slots: Vec<PoolSlot> = {
            let mut pools = self.pools.write();
            pools.drain().map(|(_, slot)| slot).collect()
        };
        for slot in &slots {
            (slot.close)();
        }
        tracing::info!(count = slots.len(), "all resource pools closed");
    }
}

fn pool_key(resource_type: &str, provider: &str) -> String {
    format!("{resource_type}:{provider}")
}

/// Stable fingerprint for a provider configuration, used to tell apart
/// pools for the same provider name with different settings.
pub fn config_fingerprint(provider: &str, config: &serde_json::Value) -> String {
    let serialized = serde_json::to_string(config).unwrap_or_default();
    let mut hash = fnv1a64(provider.as_bytes());
    hash ^= fnv1a64(serialized.as_bytes()).rotate_left(17);
    format!("{hash:016x}")
}

fn fnv1a64(data: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET;
    for byte in data {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// Log a pool stats snapshot every `interval` until the manager is dropped.
pub fn start_stats_monitor(manager: &Arc<PoolManager>, interval: Duration) {
    let weak = Arc::downgrade(manager);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let Some(manager) = weak.upgrade() else { return };
            let stats = manager.stats();
            if stats.as_object().is_some_and(|m| !m.is_empty()) {
                tracing::info!(stats = %stats, "resource pool stats");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> PoolManager {
        let manager = PoolManager::new(&PoolSettings::default());
        manager
            .register_type::<u64>(
                "counter",
                |_provider, config| {
                    Ok(config.get("start").and_then(|v| v.as_u64()).unwrap_or(0))
                },
                |_| true,
                |_| {},
                |_| Ok(()),
            )
            .unwrap();
        manager
    }

    #[tokio::test]
    async fn acquire_creates_pool_lazily() {
        let manager = manager();
        assert_eq!(manager.pool_count(), 0);
        let handle = manager
            .acquire::<u64>("counter", "p1", &serde_json::json!({ "start": 7 }))
            .await
            .unwrap();
        assert_eq!(*handle, 7);
        assert_eq!(manager.pool_count(), 1);
        manager.release(handle).unwrap();
    }

    #[tokio::test]
    async fn unregistered_type_fails() {
        let manager = manager();
        let err = manager
            .acquire::<u64>("nope", "p1", &serde_json::Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Unregistered(_)));
    }

    #[tokio::test]
    async fn close_all_then_acquire_builds_fresh_pool() {
        let manager = manager();
        let handle = manager
            .acquire::<u64>("counter", "p1", &serde_json::json!({}))
            .await
            .unwrap();
        manager.release(handle).unwrap();
        manager.close_all();
        assert_eq!(manager.pool_count(), 0);

        let handle = manager
            .acquire::<u64>("counter", "p1", &serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(manager.pool_count(), 1);
        manager.release(handle).unwrap();
    }

    #[test]
    fn fingerprint_distinguishes_configs() {
        let a = config_fingerprint("edge", &serde_json::json!({ "voice": "a" }));
        let b = config_fingerprint("edge", &serde_json::json!({ "voice": "b" }));
        let a2 = config_fingerprint("edge", &serde_json::json!({ "voice": "a" }));
        assert_ne!(a, b);
        assert_eq!(a, a2);
    }
}
