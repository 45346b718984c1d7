//! Backend Contract Tests
//!
//! Behaviour every store shares: the null store never hits, the
//! uninitialized placeholder faults everything but dispose, operations
//! outside `Ready` are programming faults, and settings assemble a working
//! stack.

use std::sync::Arc;

use cairn_core::{BackendKind, CacheSettings};
use cairn_storage::{
    BackendStatus, CachingBackendBuilder, LayeredBackend, LmdbBackend, LmdbOptions,
    NonBlockingBackend, NonBlockingOptions, NullBackend, UninitializedBackend,
};
use cairn_test_utils::assertions::assert_programming_error;
use cairn_test_utils::generators::{cache_key_strategy, dependency_key_strategy, entry_strategy};
use cairn_test_utils::{
    fixtures, init_test_tracing, CacheEntry, CacheError, CacheKey, CachingBackend, DependencyKey,
    ProgrammingError,
};
use proptest::prelude::*;
use proptest::test_runner::{Config, TestRunner};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Run every data operation once and check each is a programming fault.
async fn assert_all_operations_fault(backend: &dyn CachingBackend) {
    let key = CacheKey::from("k");
    let dependency = DependencyKey::from("d");

    assert_programming_error(&backend.get_entry(&key).await);
    assert_programming_error(&backend.set_entry(&key, CacheEntry::new(1i64)).await);
    assert_programming_error(&backend.contains_key(&key).await);
    assert_programming_error(&backend.remove_entry(&key).await);
    assert_programming_error(&backend.contains_dependency(&dependency).await);
    assert_programming_error(&backend.invalidate_dependency(&dependency).await);
    assert_programming_error(&backend.clear().await);
}

#[test]
fn test_null_store_never_hits() {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let backend = NullBackend::new();
    runtime
        .block_on(backend.initialize(&CancellationToken::new()))
        .unwrap();

    let mut runner = TestRunner::new(Config::with_cases(64));
    runner
        .run(
            &(cache_key_strategy(), entry_strategy(), dependency_key_strategy()),
            |(key, entry, dependency)| {
                runtime.block_on(async {
                    backend.set_entry(&key, entry).await.unwrap();
                    prop_assert!(backend.get_entry(&key).await.unwrap().is_none());
                    prop_assert!(!backend.contains_key(&key).await.unwrap());
                    prop_assert!(!backend.remove_entry(&key).await.unwrap());
                    prop_assert!(!backend.contains_dependency(&dependency).await.unwrap());
                    backend.invalidate_dependency(&dependency).await.unwrap();
                    Ok(())
                })
            },
        )
        .unwrap();

    let stats = runtime.block_on(backend.stats()).unwrap();
    assert_eq!(stats.hits, 0);
    assert_eq!(stats.entry_count, 0);
}

#[tokio::test]
async fn test_uninitialized_backend_faults_everything_but_dispose() {
    let backend = UninitializedBackend::new();

    let err = backend
        .initialize(&CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        CacheError::Programming(ProgrammingError::UninitializedBackend)
    );
    assert!(err.is_fatal());
    assert_all_operations_fault(&backend).await;
    assert_programming_error(&backend.stats().await);

    backend.dispose().await.unwrap();
}

#[tokio::test]
async fn test_operations_before_initialize_fault() {
    init_test_tracing();
    let dir = TempDir::new().unwrap();
    let backends: Vec<Arc<dyn CachingBackend>> = vec![
        Arc::new(NullBackend::new()),
        fixtures::memory_backend(),
        Arc::new(LmdbBackend::new(LmdbOptions::new(
            dir.path(),
            fixtures::json_codec(),
        ))),
        Arc::new(LayeredBackend::new(
            fixtures::memory_backend(),
            fixtures::memory_backend(),
        )),
        Arc::new(NonBlockingBackend::new(
            fixtures::memory_backend(),
            NonBlockingOptions::new(4),
        )),
    ];

    for backend in backends {
        assert_eq!(backend.status(), BackendStatus::Uninitialized);
        assert_all_operations_fault(backend.as_ref()).await;
    }
}

#[tokio::test]
async fn test_operations_after_dispose_fault() {
    for backend in [
        fixtures::memory_backend(),
        Arc::new(NullBackend::new()) as Arc<dyn CachingBackend>,
    ] {
        let backend = fixtures::ready(backend).await;
        backend.dispose().await.unwrap();
        assert_eq!(backend.status(), BackendStatus::Disposed);

        let err = backend.get_entry(&CacheKey::from("k")).await.unwrap_err();
        assert!(matches!(
            err,
            CacheError::Programming(ProgrammingError::Disposed { .. })
        ));
        // A second dispose is a no-op.
        backend.dispose().await.unwrap();
    }
}

#[tokio::test]
async fn test_initialize_is_idempotent() {
    let backend = fixtures::ready(fixtures::memory_backend()).await;
    backend
        .set_entry(&CacheKey::from("k"), CacheEntry::new(1i64))
        .await
        .unwrap();

    backend
        .initialize(&CancellationToken::new())
        .await
        .unwrap();
    assert!(backend.contains_key(&CacheKey::from("k")).await.unwrap());
}

#[tokio::test]
async fn test_lmdb_stack_from_toml_settings() {
    init_test_tracing();
    let dir = TempDir::new().unwrap();
    let source = format!(
        r#"
backend = "lmdb"
key_prefix = "orders"
endpoint = "{}"
lmdb_map_size_mb = 16
non_blocking = true
queue_capacity = 8
queue_high_water = 6
local_layer = true
local_capacity = 100
"#,
        dir.path().display()
    );
    let settings = CacheSettings::from_toml_str(&source).unwrap();
    assert_eq!(settings.backend, BackendKind::Lmdb);

    let backend = CachingBackendBuilder::from_settings(&settings, None)
        .unwrap()
        .build(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(backend.descriptor().kind, "layered");
    assert_eq!(backend.descriptor().layer, 2);

    let key = CacheKey::from("order:9");
    backend
        .set_entry(&key, CacheEntry::new("shipped".to_string()).with_dependency("customer:3"))
        .await
        .unwrap();
    let entry = backend.get_entry(&key).await.unwrap().unwrap();
    assert_eq!(entry.value_as::<String>().map(String::as_str), Some("shipped"));

    backend
        .invalidate_dependency(&DependencyKey::from("customer:3"))
        .await
        .unwrap();
    backend.dispose().await.unwrap();

    // Queued writes were flushed to disk before dispose returned.
    let reopened = LmdbBackend::new(
        LmdbOptions::new(dir.path(), fixtures::json_codec()).with_key_prefix("orders"),
    );
    reopened
        .initialize(&CancellationToken::new())
        .await
        .unwrap();
    assert!(!reopened.contains_key(&key).await.unwrap());
    reopened.dispose().await.unwrap();
}

#[tokio::test]
async fn test_distributed_settings_without_transport_are_rejected() {
    let settings = CacheSettings::new()
        .with_backend(BackendKind::Memory)
        .with_distributed_invalidation(std::time::Duration::from_secs(1));
    assert!(CachingBackendBuilder::from_settings(&settings, None).is_err());
}
