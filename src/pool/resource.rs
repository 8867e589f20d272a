//! Bounded pool of provider instances.
//!
//! Capacity is enforced with a semaphore so acquires queue up to the
//! configured timeout instead of over-allocating. A handle that is dropped
//! without being released destroys its resource rather than leaking a
//! permit.

use crate::core::config::PoolSettings;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

static POOL_TOKEN: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("pool is closed")]
    Closed,
    #[error("acquire timed out after {0:?}")]
    Timeout(Duration),
    #[error("resource belongs to a different pool")]
    Foreign,
    #[error("resource type {0} is not registered")]
    Unregistered(String),
    #[error("creator failed: {0}")]
    Create(String),
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_size: usize,
    pub min_size: usize,
    pub max_idle: usize,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub validate_on_borrow: bool,
    pub validate_on_return: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 8,
            min_size: 0,
            max_idle: 4,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(300),
            validate_on_borrow: false,
            validate_on_return: true,
        }
    }
}

impl PoolConfig {
    /// Shared defaults overridden by the `resource_pools` config section.
    pub fn from_settings(settings: &PoolSettings) -> Self {
        let mut cfg = Self::default();
        if let Some(v) = settings.max_size {
            cfg.max_size = v.max(1);
        }
        if let Some(v) = settings.min_size {
            cfg.min_size = v;
        }
        if let Some(v) = settings.max_idle {
            cfg.max_idle = v;
        }
        if let Some(v) = settings.acquire_timeout_seconds {
            cfg.acquire_timeout = Duration::from_secs(v.max(1));
        }
        if let Some(v) = settings.idle_timeout_seconds {
            cfg.idle_timeout = Duration::from_secs(v.max(1));
        }
        if let Some(v) = settings.validate_on_borrow {
            cfg.validate_on_borrow = v;
        }
        if let Some(v) = settings.validate_on_return {
            cfg.validate_on_return = v;
        }
        cfg
    }
}

/// Lifecycle callbacks registered per resource type.
pub struct Callbacks<T> {
    pub create: Arc<dyn Fn() -> anyhow::Result<T> + Send + Sync>,
    pub close: Arc<dyn Fn(&mut T) + Send + Sync>,
    pub validate: Arc<dyn Fn(&T) -> bool + Send + Sync>,
    pub reset: Arc<dyn Fn(&mut T) -> anyhow::Result<()> + Send + Sync>,
}

impl<T> Clone for Callbacks<T> {
    fn clone(&self) -> Self {
        Self {
            create: self.create.clone(),
            close: self.close.clone(),
            validate: self.validate.clone(),
            reset: self.reset.clone(),
        }
    }
}

struct IdleEntry<T> {
    value: T,
    last_used: Instant,
}

struct PoolState<T> {
    free: Vec<IdleEntry<T>>,
    closed: bool,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct PoolStats {
    pub free: usize,
    pub in_use: usize,
    pub capacity: usize,
}

/// A borrowed provider. Carries the type tag and pool key used on release;
/// the pool rejects handles minted by a different pool instance.
pub struct PoolHandle<T> {
    value: Option<T>,
    permit: Option<OwnedSemaphorePermit>,
    pool_token: u64,
    resource_type: String,
    provider: String,
    close: Arc<dyn Fn(&mut T) + Send + Sync>,
}

impl<T> PoolHandle<T> {
    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }
}

impl<T> std::fmt::Debug for PoolHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolHandle")
            .field("pool_token", &self.pool_token)
            .field("resource_type", &self.resource_type)
            .field("provider", &self.provider)
            .finish()
    }
}

impl<T> std::ops::Deref for PoolHandle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.value {
            Some(value) => value,
            None => unreachable!("pool handle used after release"),
        }
    }
}

impl<T> std::ops::DerefMut for PoolHandle<T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.value {
            Some(value) => value,
            None => unreachable!("pool handle used after release"),
        }
    }
}

impl<T> Drop for PoolHandle<T> {
    fn drop(&mut self) {
        if let Some(mut value) = self.value.take() {
            // Dropped without release: destroy rather than leak. The permit
            // returns with the drop of `self.permit`.
            tracing::warn!(
                resource_type = %self.resource_type,
                provider = %self.provider,
                "pool handle dropped without release, destroying resource"
            );
            (self.close)(&mut value);
        }
    }
}

pub struct ResourcePool<T> {
    token: u64,
    cfg: PoolConfig,
    callbacks: Callbacks<T>,
    resource_type: String,
    provider: String,
    state: Mutex<PoolState<T>>,
    semaphore: Arc<Semaphore>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> ResourcePool<T> {
    pub fn new(
        cfg: PoolConfig,
        callbacks: Callbacks<T>,
        resource_type: &str,
        provider: &str,
    ) -> Arc<Self> {
        let pool = Arc::new(Self {
            token: POOL_TOKEN.fetch_add(1, Ordering::Relaxed),
            semaphore: Arc::new(Semaphore::new(cfg.max_size)),
            cfg,
            callbacks,
            resource_type: resource_type.to_string(),
            provider: provider.to_string(),
            state: Mutex::new(PoolState {
                free: Vec::new(),
                closed: false,
            }),
            reaper: Mutex::new(None),
        });
        pool.spawn_reaper();
        pool
    }

    fn spawn_reaper(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let period = (self.cfg.idle_timeout / 2).max(Duration::from_secs(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(pool) = weak.upgrade() else { return };
                pool.reap_idle();
            }
        });
        *self.reaper.lock() = Some(handle);
    }

    /// Destroy idle entries older than the idle timeout, keeping `min_size`
    /// entries warm.
    fn reap_idle(&self) {
        let mut expired = Vec::new();
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            let mut kept = Vec::with_capacity(state.free.len());
            for entry in state.free.drain(..) {
                if entry.last_used.elapsed() > self.cfg.idle_timeout
                    && kept.len() + 1 > self.cfg.min_size
                {
                    expired.push(entry.value);
                } else {
                    kept.push(entry);
                }
            }
            state.free = kept;
        }
        for mut value in expired {
            tracing::debug!(
                resource_type = %self.resource_type,
                provider = %self.provider,
                "idle resource reaped"
            );
            (self.callbacks.close)(&mut value);
        }
    }

    pub async fn acquire(self: &Arc<Self>) -> Result<PoolHandle<T>, PoolError> {
        if self.state.lock().closed {
            return Err(PoolError::Closed);
        }
        let permit = tokio::time::timeout(
            self.cfg.acquire_timeout,
            self.semaphore.clone().acquire_owned(),
        )
        .await
        .map_err(|_| PoolError::Timeout(self.cfg.acquire_timeout))?
        .map_err(|_| PoolError::Closed)?;

        loop {
            let candidate = self.state.lock().free.pop();
            let Some(entry) = candidate else { break };
            let mut value = entry.value;
            if self.cfg.validate_on_borrow && !(self.callbacks.validate)(&value) {
                (self.callbacks.close)(&mut value);
                continue;
            }
            if let Err(err) = (self.callbacks.reset)(&mut value) {
                tracing::warn!(
                    resource_type = %self.resource_type,
                    "reset failed, destroying resource: {err}"
                );
                (self.callbacks.close)(&mut value);
                continue;
            }
            return Ok(self.wrap(value, permit));
        }

        // Factory call happens outside the state lock.
        match (self.callbacks.create)() {
            Ok(value) => Ok(self.wrap(value, permit)),
            Err(err) => Err(PoolError::Create(err.to_string())),
        }
    }

    fn wrap(&self, value: T, permit: OwnedSemaphorePermit) -> PoolHandle<T> {
        PoolHandle {
            value: Some(value),
            permit: Some(permit),
            pool_token: self.token,
            resource_type: self.resource_type.clone(),
            provider: self.provider.clone(),
            close: self.callbacks.close.clone(),
        }
    }

    /// Return a handle. Invalid resources are destroyed instead of pooled;
    /// a handle minted by another pool is rejected (and destroyed on drop).
    pub fn release(&self, mut handle: PoolHandle<T>) -> Result<(), PoolError> {
        if handle.pool_token != self.token {
            return Err(PoolError::Foreign);
        }
        let Some(mut value) = handle.value.take() else {
            return Ok(());
        };

        let closed = self.state.lock().closed;
        let valid = !self.cfg.validate_on_return || (self.callbacks.validate)(&value);
        if closed || !valid {
            (self.callbacks.close)(&mut value);
        } else {
            let mut state = self.state.lock();
            if state.free.len() >= self.cfg.max_idle {
                drop(state);
                (self.callbacks.close)(&mut value);
            } else {
                state.free.push(IdleEntry {
                    value,
                    last_used: Instant::now(),
                });
            }
        }
        // Permit returns with the handle.
        handle.permit.take();
        Ok(())
    }

    pub fn close(&self) {
        let drained: Vec<T> = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.free.drain(..).map(|entry| entry.value).collect()
        };
        self.semaphore.close();
        for mut value in drained {
            (self.callbacks.close)(&mut value);
        }
        if let Some(handle) = self.reaper.lock().take() {
            handle.abort();
        }
    }

    pub fn stats(&self) -> PoolStats {
        let free = self.state.lock().free.len();
        let available = self.semaphore.available_permits();
        PoolStats {
            free,
            in_use: self.cfg.max_size.saturating_sub(available),
            capacity: self.cfg.max_size,
        }
    }

    pub fn free_len(&self) -> usize {
        self.state.lock().free.len()
    }
}
