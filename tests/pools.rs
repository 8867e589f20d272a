//! Resource-pool behavior through the manager: round trips, validation
//! eviction, and pool recreation after close.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use voxedge::config::PoolSettings;
use voxedge::pool::{register_builtin_types, resource_types, BoxedTts, PoolError, PoolManager};

struct Flaky {
    id: usize,
    valid: Arc<AtomicBool>,
}

fn flaky_manager() -> (Arc<PoolManager>, Arc<AtomicUsize>, Arc<AtomicBool>) {
    let manager = Arc::new(PoolManager::new(&PoolSettings::default()));
    let created = Arc::new(AtomicUsize::new(0));
    let valid = Arc::new(AtomicBool::new(true));
    let created_in = created.clone();
    let valid_in = valid.clone();
    manager
        .register_type::<Flaky>(
            "flaky",
            move |_provider, _config| {
                Ok(Flaky {
                    id: created_in.fetch_add(1, Ordering::SeqCst),
                    valid: valid_in.clone(),
                })
            },
            |probe| probe.valid.load(Ordering::SeqCst),
            |_probe| {},
            |_probe| Ok(()),
        )
        .unwrap();
    (manager, created, valid)
}

#[tokio::test]
async fn round_trip_reuses_the_instance() {
    let (manager, created, _valid) = flaky_manager();

    let handle = manager
        .acquire::<Flaky>("flaky", "p", &serde_json::json!({}))
        .await
        .unwrap();
    let first_id = handle.id;
    manager.release(handle).unwrap();

    let handle = manager
        .acquire::<Flaky>("flaky", "p", &serde_json::json!({}))
        .await
        .unwrap();
    assert_eq!(handle.id, first_id);
    assert_eq!(created.load(Ordering::SeqCst), 1);
    manager.release(handle).unwrap();
}

#[tokio::test]
async fn provider_marked_invalid_is_not_pooled_again() {
    let (manager, created, valid) = flaky_manager();

    let handle = manager
        .acquire::<Flaky>("flaky", "p", &serde_json::json!({}))
        .await
        .unwrap();
    // Externally invalidated while borrowed.
    valid.store(false, Ordering::SeqCst);
    manager.release(handle).unwrap();

    // Next acquire must build a fresh instance.
    valid.store(true, Ordering::SeqCst);
    let handle = manager
        .acquire::<Flaky>("flaky", "p", &serde_json::json!({}))
        .await
        .unwrap();
    assert_eq!(handle.id, 1);
    assert_eq!(created.load(Ordering::SeqCst), 2);
    manager.release(handle).unwrap();
}

#[tokio::test]
async fn close_all_then_acquire_creates_a_new_pool() {
    let (manager, _created, _valid) = flaky_manager();

    let handle = manager
        .acquire::<Flaky>("flaky", "p", &serde_json::json!({}))
        .await
        .unwrap();
    manager.release(handle).unwrap();
    assert_eq!(manager.pool_count(), 1);

    manager.close_all();
    assert_eq!(manager.pool_count(), 0);

    let handle = manager
        .acquire::<Flaky>("flaky", "p", &serde_json::json!({}))
        .await
        .unwrap();
    assert_eq!(manager.pool_count(), 1);
    manager.release(handle).unwrap();
}

#[tokio::test]
async fn distinct_providers_get_distinct_pools() {
    let (manager, _created, _valid) = flaky_manager();
    let a = manager
        .acquire::<Flaky>("flaky", "provider-a", &serde_json::json!({}))
        .await
        .unwrap();
    let b = manager
        .acquire::<Flaky>("flaky", "provider-b", &serde_json::json!({}))
        .await
        .unwrap();
    assert_eq!(manager.pool_count(), 2);

    // A handle released to the manager goes back to its own pool.
    manager.release(a).unwrap();
    manager.release(b).unwrap();
}

#[tokio::test]
async fn builtin_null_providers_are_acquirable() {
    let manager = Arc::new(PoolManager::new(&PoolSettings::default()));
    register_builtin_types(&manager).unwrap();

    let mut tts = manager
        .acquire::<BoxedTts>(resource_types::TTS, "null", &serde_json::json!({}))
        .await
        .unwrap();
    let frames = tts.synthesize("hello").await.unwrap();
    assert_eq!(frames.len(), 1);
    manager.release(tts).unwrap();

    let err = manager
        .acquire::<BoxedTts>(resource_types::TTS, "cloud-tts-x", &serde_json::json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::Create(_)));
}
