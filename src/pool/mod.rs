//! Provider resource pooling.
//!
//! Pipeline steps borrow provider instances keyed by (resource type,
//! provider name) and must release them on every exit path; the pool
//! validates, reaps idle entries and destroys anything that fails its
//! health check.

pub mod manager;
pub mod providers;
pub mod resource;

pub use manager::{config_fingerprint, start_stats_monitor, PoolManager};
pub use providers::{
    register_builtin_types, resource as resource_types, AsrProvider, BoxedAsr, BoxedLlm, BoxedTts,
    BoxedVad, LlmProvider, ProviderBase, TtsProvider, VadProvider, SILENCE_FRAME,
};
pub use resource::{Callbacks, PoolConfig, PoolError, PoolHandle, PoolStats, ResourcePool};
