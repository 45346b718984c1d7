//! Layered Enhancer Tests
//!
//! A far-tier hit populates the near tier, so repeated reads never reach the
//! far tier again; writes reach the far tier exactly once; a failing near
//! tier never fails a write. Over a write queue, an invalidated entry is
//! never copied back into the near tier.

use std::sync::Arc;
use std::time::Duration;

use cairn_storage::{
    CachingBackend, CachingBackendBuilder, LayeredBackend, MemoryBackendOptions,
    NonBlockingBackend, NonBlockingOptions,
};
use cairn_test_utils::{
    fixtures, init_test_tracing, CacheEntry, CacheKey, DependencyKey, FailingBackend,
    ProbeBackend, StorageError,
};
use tokio_util::sync::CancellationToken;

async fn layered(near: Arc<dyn CachingBackend>, far: Arc<dyn CachingBackend>) -> LayeredBackend {
    init_test_tracing();
    let backend = LayeredBackend::new(near, far);
    backend
        .initialize(&CancellationToken::new())
        .await
        .unwrap();
    backend
}

#[tokio::test]
async fn test_repeated_reads_skip_far_tier() {
    let far = Arc::new(ProbeBackend::new(fixtures::memory_backend()));
    let backend = layered(fixtures::memory_backend(), far.clone()).await;
    let key = CacheKey::from("product:7");

    backend
        .set_entry(&key, CacheEntry::new("widget".to_string()))
        .await
        .unwrap();
    for _ in 0..5 {
        let entry = backend.get_entry(&key).await.unwrap().unwrap();
        assert_eq!(entry.value_as::<String>().map(String::as_str), Some("widget"));
    }

    let calls = far.calls();
    assert_eq!(calls.set, 1);
    assert_eq!(calls.get, 0);
}

#[tokio::test]
async fn test_far_hit_is_fetched_once() {
    let far = Arc::new(ProbeBackend::new(fixtures::memory_backend()));
    let backend = layered(fixtures::memory_backend(), far.clone()).await;
    let key = CacheKey::from("k");

    far.set_entry(&key, CacheEntry::new(1i64)).await.unwrap();
    for _ in 0..3 {
        assert!(backend.get_entry(&key).await.unwrap().is_some());
    }

    assert_eq!(far.calls().get, 1);
    let stats = backend.layered_stats();
    assert_eq!((stats.far_hits, stats.near_hits), (1, 2));
}

#[tokio::test]
async fn test_misses_consult_far_tier_every_time() {
    let far = Arc::new(ProbeBackend::new(fixtures::memory_backend()));
    let backend = layered(fixtures::memory_backend(), far.clone()).await;

    for _ in 0..3 {
        assert!(backend
            .get_entry(&CacheKey::from("absent"))
            .await
            .unwrap()
            .is_none());
    }
    assert_eq!(far.calls().get, 3);
    assert_eq!(backend.stats().await.unwrap().misses, 3);
}

#[tokio::test]
async fn test_failing_near_tier_does_not_fail_writes() {
    let near: Arc<dyn CachingBackend> = Arc::new(FailingBackend::new(
        StorageError::Transaction {
            reason: "near tier offline".to_string(),
        }
        .into(),
    ));
    let far = fixtures::memory_backend();
    let backend = layered(near, far.clone()).await;
    let key = CacheKey::from("k");

    backend
        .set_entry(&key, CacheEntry::new(3i64))
        .await
        .unwrap();

    assert!(far.contains_key(&key).await.unwrap());
    let entry = backend.get_entry(&key).await.unwrap().unwrap();
    assert_eq!(entry.value_as::<i64>(), Some(&3));
    // Both the write and the read-populate hit the failing near tier.
    assert_eq!(backend.layered_stats().near_write_failures, 2);
}

#[tokio::test]
async fn test_invalidation_reaches_far_then_near() {
    let near = Arc::new(ProbeBackend::new(fixtures::memory_backend()));
    let far = Arc::new(ProbeBackend::new(fixtures::memory_backend()));
    let backend = layered(near.clone(), far.clone()).await;
    let dependency = DependencyKey::from("catalog");

    for key in ["a", "b"] {
        backend
            .set_entry(
                &CacheKey::from(key),
                CacheEntry::new(1i64).with_dependency(dependency.clone()),
            )
            .await
            .unwrap();
    }
    backend.invalidate_dependency(&dependency).await.unwrap();

    assert_eq!(near.calls().invalidate, 1);
    assert_eq!(far.calls().invalidate, 1);
    assert!(!backend.contains_key(&CacheKey::from("a")).await.unwrap());
    assert!(!backend.contains_dependency(&dependency).await.unwrap());
}

#[tokio::test]
async fn test_invalidation_over_write_queue_is_not_refilled() {
    let store = Arc::new(
        ProbeBackend::new(fixtures::memory_backend()).with_write_delay(Duration::from_millis(30)),
    );
    let queue = Arc::new(NonBlockingBackend::new(store.clone(), NonBlockingOptions::new(16)));
    let backend = layered(fixtures::memory_backend(), queue.clone()).await;
    let key = CacheKey::from("k");
    let dependency = DependencyKey::from("d");

    backend
        .set_entry(&key, CacheEntry::new(1i64).with_dependency(dependency.clone()))
        .await
        .unwrap();
    queue.drain().await.unwrap();

    backend.invalidate_dependency(&dependency).await.unwrap();
    // The store has not applied the invalidation yet.
    assert!(store.contains_key(&key).await.unwrap());
    assert!(backend.get_entry(&key).await.unwrap().is_none());

    queue.drain().await.unwrap();
    assert!(backend.get_entry(&key).await.unwrap().is_none());
    assert!(!backend.contains_key(&key).await.unwrap());
}

#[tokio::test]
async fn test_evicted_near_copy_reads_queued_write() {
    let store = Arc::new(
        ProbeBackend::new(fixtures::memory_backend()).with_write_delay(Duration::from_millis(30)),
    );
    let near = fixtures::memory_backend();
    let queue = Arc::new(NonBlockingBackend::new(store.clone(), NonBlockingOptions::new(16)));
    let backend = layered(near.clone(), queue.clone()).await;
    let key = CacheKey::from("k");

    backend.set_entry(&key, CacheEntry::new(1i64)).await.unwrap();
    queue.drain().await.unwrap();
    backend.set_entry(&key, CacheEntry::new(2i64)).await.unwrap();
    near.remove_entry(&key).await.unwrap();

    let entry = backend.get_entry(&key).await.unwrap().unwrap();
    assert_eq!(entry.value_as::<i64>(), Some(&2));
    queue.drain().await.unwrap();
    let entry = backend.get_entry(&key).await.unwrap().unwrap();
    assert_eq!(entry.value_as::<i64>(), Some(&2));
}

#[tokio::test]
async fn test_builder_stack_invalidation_stays_evicted() {
    init_test_tracing();
    let dependency = DependencyKey::from("d");

    for round in 0..50 {
        let backend = CachingBackendBuilder::memory(
            MemoryBackendOptions::new().with_expiration_scan_interval(None),
        )
        .non_blocking(NonBlockingOptions::new(16))
        .local_layer(MemoryBackendOptions::new().with_expiration_scan_interval(None))
        .build(&CancellationToken::new())
        .await
        .unwrap();
        let key = CacheKey::new(format!("k{round}"));

        backend
            .set_entry(&key, CacheEntry::new(1i64).with_dependency(dependency.clone()))
            .await
            .unwrap();
        assert!(backend.get_entry(&key).await.unwrap().is_some());

        backend.invalidate_dependency(&dependency).await.unwrap();
        assert!(backend.get_entry(&key).await.unwrap().is_none());

        // Let the queue settle, then read again.
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert!(backend.get_entry(&key).await.unwrap().is_none());
        backend.dispose().await.unwrap();
    }
}
