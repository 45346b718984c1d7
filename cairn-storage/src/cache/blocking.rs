//! Blocking shape of the backend contract.

use std::sync::Arc;

use cairn_core::{CacheEntry, CacheKey, CacheResult, DependencyKey};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use super::lifecycle::BackendStatus;
use super::traits::{BackendCapabilities, BackendDescriptor, CacheStats, CachingBackend};

/// Drives an async backend to completion on a runtime handle.
///
/// For callers outside any async context. Calling these methods from a task
/// running on a Tokio runtime panics, as [`Handle::block_on`] does.
#[derive(Debug, Clone)]
pub struct BlockingBackend {
    inner: Arc<dyn CachingBackend>,
    handle: Handle,
}

impl BlockingBackend {
    pub fn new(inner: Arc<dyn CachingBackend>, handle: Handle) -> Self {
        Self { inner, handle }
    }

    /// Async view of the same backend.
    pub fn inner(&self) -> &Arc<dyn CachingBackend> {
        &self.inner
    }

    pub fn descriptor(&self) -> BackendDescriptor {
        self.inner.descriptor()
    }

    pub fn capabilities(&self) -> BackendCapabilities {
        self.inner.capabilities()
    }

    pub fn status(&self) -> BackendStatus {
        self.inner.status()
    }

    pub fn initialize(&self, cancellation: &CancellationToken) -> CacheResult<()> {
        self.handle.block_on(self.inner.initialize(cancellation))
    }

    pub fn get_entry(&self, key: &CacheKey) -> CacheResult<Option<CacheEntry>> {
        self.handle.block_on(self.inner.get_entry(key))
    }

    pub fn set_entry(&self, key: &CacheKey, entry: CacheEntry) -> CacheResult<()> {
        self.handle.block_on(self.inner.set_entry(key, entry))
    }

    pub fn contains_key(&self, key: &CacheKey) -> CacheResult<bool> {
        self.handle.block_on(self.inner.contains_key(key))
    }

    pub fn remove_entry(&self, key: &CacheKey) -> CacheResult<bool> {
        self.handle.block_on(self.inner.remove_entry(key))
    }

    pub fn contains_dependency(&self, dependency: &DependencyKey) -> CacheResult<bool> {
        self.handle
            .block_on(self.inner.contains_dependency(dependency))
    }

    pub fn invalidate_dependency(&self, dependency: &DependencyKey) -> CacheResult<()> {
        self.handle
            .block_on(self.inner.invalidate_dependency(dependency))
    }

    pub fn clear(&self) -> CacheResult<()> {
        self.handle.block_on(self.inner.clear())
    }

    pub fn dispose(&self) -> CacheResult<()> {
        self.handle.block_on(self.inner.dispose())
    }

    pub fn stats(&self) -> CacheResult<CacheStats> {
        self.handle.block_on(self.inner.stats())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{MemoryBackend, MemoryBackendOptions, NonBlockingBackend, NonBlockingOptions};

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap()
    }

    #[test]
    fn test_blocking_calls_round_trip() {
        let runtime = runtime();
        let backend = BlockingBackend::new(
            Arc::new(MemoryBackend::new(MemoryBackendOptions::new())),
            runtime.handle().clone(),
        );
        backend.initialize(&CancellationToken::new()).unwrap();

        let key = CacheKey::from("k");
        backend
            .set_entry(&key, CacheEntry::new(5i64).with_dependency("d"))
            .unwrap();
        assert_eq!(
            backend.get_entry(&key).unwrap().unwrap().value_as::<i64>(),
            Some(&5)
        );
        assert!(backend
            .contains_dependency(&DependencyKey::from("d"))
            .unwrap());

        backend
            .invalidate_dependency(&DependencyKey::from("d"))
            .unwrap();
        assert!(!backend.contains_key(&key).unwrap());

        backend.dispose().unwrap();
        assert_eq!(backend.status(), BackendStatus::Disposed);
    }

    #[test]
    fn test_blocking_over_background_worker() {
        let runtime = runtime();
        let non_blocking = Arc::new(NonBlockingBackend::new(
            Arc::new(MemoryBackend::new(MemoryBackendOptions::new())),
            NonBlockingOptions::new(4),
        ));
        let backend = BlockingBackend::new(non_blocking.clone(), runtime.handle().clone());
        backend.initialize(&CancellationToken::new()).unwrap();

        for i in 0..10i64 {
            backend.set_entry(&CacheKey::from("k"), CacheEntry::new(i)).unwrap();
        }
        runtime.block_on(non_blocking.drain()).unwrap();

        let entry = backend.get_entry(&CacheKey::from("k")).unwrap().unwrap();
        assert_eq!(entry.value_as::<i64>(), Some(&9));
        backend.dispose().unwrap();
    }
}
