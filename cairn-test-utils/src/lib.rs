//! Cairn Test Utilities
//!
//! Shared test infrastructure for the Cairn workspace:
//! - Proptest generators for keys and cache entries
//! - Probe and failing backends for enhancer tests
//! - Fixtures for codecs and ready-made backends
//! - Assertions on the error taxonomy

// Re-export core types for convenience
pub use cairn_core::{
    CacheEntry, CacheError, CacheItemPriority, CacheKey, CacheResult, ConnectionError,
    DependencyKey, EntryCodec, EntryKind, InvalidEntryError, ProgrammingError, StorageError,
    TimeoutError, Timestamp,
};
pub use cairn_storage::{
    BackendCapabilities, BackendDescriptor, BackendStatus, CacheStats, CachingBackend,
};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cairn_storage::cache::Lifecycle;
use tokio_util::sync::CancellationToken;

/// Install a test subscriber honouring `RUST_LOG`. Safe to call repeatedly.
pub fn init_test_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

// ============================================================================
// PROBE BACKEND
// ============================================================================

/// Per-operation call counts of a [`ProbeBackend`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub get: u64,
    pub set: u64,
    pub contains_key: u64,
    pub remove: u64,
    pub contains_dependency: u64,
    pub invalidate: u64,
    pub clear: u64,
}

#[derive(Debug, Default)]
struct CallCounters {
    get: AtomicU64,
    set: AtomicU64,
    contains_key: AtomicU64,
    remove: AtomicU64,
    contains_dependency: AtomicU64,
    invalidate: AtomicU64,
    clear: AtomicU64,
}

/// One write observed by a [`ProbeBackend`], in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum ObservedWrite {
    Set { key: CacheKey, entry: CacheEntry },
    Remove { key: CacheKey },
    Invalidate { dependency: DependencyKey },
    Clear,
}

/// Wraps a backend and records every call that reaches it.
#[derive(Debug)]
pub struct ProbeBackend {
    inner: Arc<dyn CachingBackend>,
    counters: CallCounters,
    writes: Mutex<Vec<ObservedWrite>>,
    write_delay: Option<Duration>,
}

impl ProbeBackend {
    pub fn new(inner: Arc<dyn CachingBackend>) -> Self {
        Self {
            inner,
            counters: CallCounters::default(),
            writes: Mutex::new(Vec::new()),
            write_delay: None,
        }
    }

    /// Sleep before forwarding each write.
    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = Some(delay);
        self
    }

    pub fn calls(&self) -> CallCounts {
        let c = &self.counters;
        CallCounts {
            get: c.get.load(Ordering::SeqCst),
            set: c.set.load(Ordering::SeqCst),
            contains_key: c.contains_key.load(Ordering::SeqCst),
            remove: c.remove.load(Ordering::SeqCst),
            contains_dependency: c.contains_dependency.load(Ordering::SeqCst),
            invalidate: c.invalidate.load(Ordering::SeqCst),
            clear: c.clear.load(Ordering::SeqCst),
        }
    }

    /// Writes in the order they reached this backend.
    pub fn writes(&self) -> Vec<ObservedWrite> {
        self.writes.lock().map(|w| w.clone()).unwrap_or_default()
    }

    async fn observe(&self, write: ObservedWrite) {
        if let Some(delay) = self.write_delay {
            tokio::time::sleep(delay).await;
        }
        if let Ok(mut writes) = self.writes.lock() {
            writes.push(write);
        }
    }
}

#[async_trait]
impl CachingBackend for ProbeBackend {
    fn descriptor(&self) -> BackendDescriptor {
        self.inner.descriptor()
    }

    fn capabilities(&self) -> BackendCapabilities {
        self.inner.capabilities()
    }

    fn status(&self) -> BackendStatus {
        self.inner.status()
    }

    async fn initialize(&self, cancellation: &CancellationToken) -> CacheResult<()> {
        self.inner.initialize(cancellation).await
    }

    async fn get_entry(&self, key: &CacheKey) -> CacheResult<Option<CacheEntry>> {
        self.counters.get.fetch_add(1, Ordering::SeqCst);
        self.inner.get_entry(key).await
    }

    async fn set_entry(&self, key: &CacheKey, entry: CacheEntry) -> CacheResult<()> {
        self.counters.set.fetch_add(1, Ordering::SeqCst);
        self.observe(ObservedWrite::Set {
            key: key.clone(),
            entry: entry.clone(),
        })
        .await;
        self.inner.set_entry(key, entry).await
    }

    async fn contains_key(&self, key: &CacheKey) -> CacheResult<bool> {
        self.counters.contains_key.fetch_add(1, Ordering::SeqCst);
        self.inner.contains_key(key).await
    }

    async fn remove_entry(&self, key: &CacheKey) -> CacheResult<bool> {
        self.counters.remove.fetch_add(1, Ordering::SeqCst);
        self.observe(ObservedWrite::Remove { key: key.clone() })
            .await;
        self.inner.remove_entry(key).await
    }

    async fn contains_dependency(&self, dependency: &DependencyKey) -> CacheResult<bool> {
        self.counters
            .contains_dependency
            .fetch_add(1, Ordering::SeqCst);
        self.inner.contains_dependency(dependency).await
    }

    async fn invalidate_dependency(&self, dependency: &DependencyKey) -> CacheResult<()> {
        self.counters.invalidate.fetch_add(1, Ordering::SeqCst);
        self.observe(ObservedWrite::Invalidate {
            dependency: dependency.clone(),
        })
        .await;
        self.inner.invalidate_dependency(dependency).await
    }

    async fn clear(&self) -> CacheResult<()> {
        self.counters.clear.fetch_add(1, Ordering::SeqCst);
        self.observe(ObservedWrite::Clear).await;
        self.inner.clear().await
    }

    async fn dispose(&self) -> CacheResult<()> {
        self.inner.dispose().await
    }

    async fn stats(&self) -> CacheResult<CacheStats> {
        self.inner.stats().await
    }
}

// ============================================================================
// FAILING BACKEND
// ============================================================================

/// Store whose writes all fail with a configured error. Reads miss.
#[derive(Debug)]
pub struct FailingBackend {
    error: CacheError,
    lifecycle: Lifecycle,
    capabilities: BackendCapabilities,
}

impl FailingBackend {
    pub fn new(error: CacheError) -> Self {
        Self {
            error,
            lifecycle: Lifecycle::new("failing"),
            capabilities: BackendCapabilities::local(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: BackendCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    fn fail<T>(&self) -> CacheResult<T> {
        self.lifecycle.ensure_ready()?;
        Err(self.error.clone())
    }
}

#[async_trait]
impl CachingBackend for FailingBackend {
    fn descriptor(&self) -> BackendDescriptor {
        BackendDescriptor::new("failing", 0)
    }

    fn capabilities(&self) -> BackendCapabilities {
        self.capabilities
    }

    fn status(&self) -> BackendStatus {
        self.lifecycle.status()
    }

    async fn initialize(&self, _cancellation: &CancellationToken) -> CacheResult<()> {
        self.lifecycle.run_initialize(|| async { Ok(()) }).await
    }

    async fn get_entry(&self, _key: &CacheKey) -> CacheResult<Option<CacheEntry>> {
        self.lifecycle.ensure_ready()?;
        Ok(None)
    }

    async fn set_entry(&self, _key: &CacheKey, _entry: CacheEntry) -> CacheResult<()> {
        self.fail()
    }

    async fn contains_key(&self, _key: &CacheKey) -> CacheResult<bool> {
        self.lifecycle.ensure_ready()?;
        Ok(false)
    }

    async fn remove_entry(&self, _key: &CacheKey) -> CacheResult<bool> {
        self.fail()
    }

    async fn contains_dependency(&self, _dependency: &DependencyKey) -> CacheResult<bool> {
        self.lifecycle.ensure_ready()?;
        Ok(false)
    }

    async fn invalidate_dependency(&self, _dependency: &DependencyKey) -> CacheResult<()> {
        self.fail()
    }

    async fn clear(&self) -> CacheResult<()> {
        self.fail()
    }

    async fn dispose(&self) -> CacheResult<()> {
        if self.lifecycle.begin_dispose() {
            self.lifecycle.complete_dispose();
        }
        Ok(())
    }

    async fn stats(&self) -> CacheResult<CacheStats> {
        Ok(CacheStats::default())
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for keys and cache entries.

    use super::*;
    use chrono::DateTime;
    use proptest::prelude::*;

    pub fn cache_key_strategy() -> impl Strategy<Value = CacheKey> {
        "[a-z]{1,8}(:[0-9]{1,4})?".prop_map(CacheKey::new)
    }

    pub fn dependency_key_strategy() -> impl Strategy<Value = DependencyKey> {
        "(entity|table|tenant):[a-z0-9]{1,6}".prop_map(DependencyKey::new)
    }

    pub fn priority_strategy() -> impl Strategy<Value = CacheItemPriority> {
        prop_oneof![
            Just(CacheItemPriority::Low),
            Just(CacheItemPriority::Normal),
            Just(CacheItemPriority::High),
            Just(CacheItemPriority::NotRemovable),
        ]
    }

    /// Future timestamps with sub-second precision.
    pub fn timestamp_strategy() -> impl Strategy<Value = Timestamp> {
        (1_900_000_000i64..4_000_000_000i64, 0u32..1_000_000_000u32)
            .prop_filter_map("timestamp out of range", |(secs, nanos)| {
                DateTime::from_timestamp(secs, nanos)
            })
    }

    /// Entries whose values are registered by `TypeRegistry::with_primitives`.
    pub fn entry_strategy() -> impl Strategy<Value = CacheEntry> {
        let value = prop_oneof![
            any::<i64>().prop_map(CacheEntry::new),
            "[ -~]{0,32}".prop_map(CacheEntry::new),
            any::<bool>().prop_map(CacheEntry::materialized),
            Just(CacheEntry::null()),
        ];
        (
            value,
            prop::collection::btree_set(dependency_key_strategy(), 0..4),
            proptest::option::of(timestamp_strategy()),
            proptest::option::of((1u64..86_400, 0u32..1_000_000_000)),
            priority_strategy(),
        )
            .prop_map(|(entry, dependencies, absolute, sliding, priority)| {
                let mut entry = entry.with_dependencies(dependencies).with_priority(priority);
                entry.absolute_expiration = absolute;
                entry.sliding_expiration =
                    sliding.map(|(secs, nanos)| Duration::new(secs, nanos));
                entry
            })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built codecs and backends.

    use super::*;
    use cairn_core::{BinaryValueSerializer, JsonValueSerializer, TypeRegistry};
    use cairn_storage::{MemoryBackend, MemoryBackendOptions};

    pub fn json_codec() -> EntryCodec {
        EntryCodec::new(Arc::new(JsonValueSerializer::new(Arc::new(
            TypeRegistry::with_primitives(),
        ))))
    }

    pub fn binary_codec() -> EntryCodec {
        EntryCodec::new(Arc::new(BinaryValueSerializer::new(Arc::new(
            TypeRegistry::with_primitives(),
        ))))
    }

    /// In-memory store without a background sweeper.
    pub fn memory_backend() -> Arc<dyn CachingBackend> {
        Arc::new(MemoryBackend::new(
            MemoryBackendOptions::new().with_expiration_scan_interval(None),
        ))
    }

    /// Initialize `backend`, panicking on failure.
    pub async fn ready(backend: Arc<dyn CachingBackend>) -> Arc<dyn CachingBackend> {
        backend
            .initialize(&CancellationToken::new())
            .await
            .expect("backend failed to initialize");
        backend
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions on [`CacheError`] classes.

    use super::*;

    pub fn assert_programming_error<T: std::fmt::Debug>(result: &CacheResult<T>) {
        assert!(
            matches!(result, Err(CacheError::Programming(_))),
            "Expected programming error, got {:?}",
            result
        );
    }

    pub fn assert_connection_error<T: std::fmt::Debug>(result: &CacheResult<T>) {
        assert!(
            matches!(result, Err(CacheError::Connection(_))),
            "Expected connection error, got {:?}",
            result
        );
    }

    pub fn assert_cancelled<T: std::fmt::Debug>(result: &CacheResult<T>) {
        assert!(
            matches!(result, Err(CacheError::Timeout(TimeoutError::Cancelled { .. }))),
            "Expected cancellation, got {:?}",
            result
        );
    }

    pub fn assert_invalid_entry<T: std::fmt::Debug>(result: &CacheResult<T>) {
        assert!(
            matches!(result, Err(CacheError::InvalidEntry(_))),
            "Expected invalid entry error, got {:?}",
            result
        );
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[tokio::test]
    async fn test_probe_counts_calls() {
        let probe = Arc::new(ProbeBackend::new(fixtures::memory_backend()));
        let backend = fixtures::ready(probe.clone()).await;

        let key = CacheKey::from("k");
        backend.set_entry(&key, CacheEntry::new(1i64)).await.unwrap();
        backend.get_entry(&key).await.unwrap();
        backend.get_entry(&key).await.unwrap();

        let calls = probe.calls();
        assert_eq!(calls.set, 1);
        assert_eq!(calls.get, 2);
        assert_eq!(probe.writes().len(), 1);
    }

    #[tokio::test]
    async fn test_failing_backend_fails_writes() {
        let backend = fixtures::ready(Arc::new(FailingBackend::new(
            StorageError::QueueClosed.into(),
        )))
        .await;

        let result = backend
            .set_entry(&CacheKey::from("k"), CacheEntry::new(1i64))
            .await;
        assert_eq!(result, Err(CacheError::Storage(StorageError::QueueClosed)));
        assert!(backend.get_entry(&CacheKey::from("k")).await.unwrap().is_none());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_generated_keys_are_non_empty(key in generators::cache_key_strategy()) {
            prop_assert!(!key.as_str().is_empty());
        }

        #[test]
        fn prop_generated_entries_encode(entry in generators::entry_strategy()) {
            prop_assert!(fixtures::json_codec().to_bytes(&entry).is_ok());
        }
    }
}
