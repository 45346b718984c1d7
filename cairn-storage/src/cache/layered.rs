//! Near/far tiering enhancer.
//!
//! Reads try the near tier first and fall through to the far tier,
//! populating the near tier on a far hit. Writes go to the far tier, which
//! is authoritative, and then to the near tier on a best-effort basis: a
//! near-tier write failure is logged and counted but never fails the call.
//!
//! When the far tier is distributed, the near tier is registered with the
//! invalidation broker so evictions made by other processes reach it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cairn_core::{CacheEntry, CacheKey, CacheResult, DependencyKey};
use tokio_util::sync::CancellationToken;

use super::lifecycle::{BackendStatus, Lifecycle};
use super::traits::{BackendCapabilities, BackendDescriptor, CacheStats, CachingBackend};
use crate::broker::{InvalidationBroker, ListenerId};

/// Per-tier counters of a [`LayeredBackend`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayeredStats {
    pub near_hits: u64,
    pub far_hits: u64,
    pub misses: u64,
    pub near_write_failures: u64,
}

#[derive(Debug, Default)]
struct LayerCounters {
    near_hits: AtomicU64,
    far_hits: AtomicU64,
    misses: AtomicU64,
    near_write_failures: AtomicU64,
}

#[derive(Debug)]
pub struct LayeredBackend {
    near: Arc<dyn CachingBackend>,
    far: Arc<dyn CachingBackend>,
    broker: Option<Arc<InvalidationBroker>>,
    registration: Mutex<Option<ListenerId>>,
    counters: LayerCounters,
    lifecycle: Lifecycle,
    layer: u32,
}

impl LayeredBackend {
    pub fn new(near: Arc<dyn CachingBackend>, far: Arc<dyn CachingBackend>) -> Self {
        Self {
            near,
            far,
            broker: None,
            registration: Mutex::new(None),
            counters: LayerCounters::default(),
            lifecycle: Lifecycle::new("layered"),
            layer: 1,
        }
    }

    pub fn with_layer(mut self, layer: u32) -> Self {
        self.layer = layer;
        self
    }

    /// Apply remote invalidations from `broker` to the near tier.
    pub fn with_broker(mut self, broker: Arc<InvalidationBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn near(&self) -> &Arc<dyn CachingBackend> {
        &self.near
    }

    pub fn far(&self) -> &Arc<dyn CachingBackend> {
        &self.far
    }

    pub fn layered_stats(&self) -> LayeredStats {
        LayeredStats {
            near_hits: self.counters.near_hits.load(Ordering::Relaxed),
            far_hits: self.counters.far_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            near_write_failures: self.counters.near_write_failures.load(Ordering::Relaxed),
        }
    }

    async fn write_near(&self, key: &CacheKey, entry: CacheEntry) {
        if let Err(e) = self.near.set_entry(key, entry).await {
            self.counters
                .near_write_failures
                .fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                key = %key,
                backend = %self.near.descriptor(),
                error = %e,
                "Near tier write failed"
            );
        }
    }

    fn register_with_broker(&self) -> CacheResult<()> {
        let Some(broker) = &self.broker else {
            return Ok(());
        };
        let mut registration = self.registration.lock()?;
        if registration.is_none() {
            *registration = Some(broker.register_listener(Arc::clone(&self.near))?);
        }
        Ok(())
    }

    fn unregister_from_broker(&self) -> CacheResult<()> {
        let registration = self.registration.lock()?.take();
        if let (Some(broker), Some(id)) = (&self.broker, registration) {
            broker.unregister_listener(id)?;
        }
        Ok(())
    }
}

#[async_trait]
impl CachingBackend for LayeredBackend {
    fn descriptor(&self) -> BackendDescriptor {
        BackendDescriptor::new("layered", self.layer)
    }

    fn capabilities(&self) -> BackendCapabilities {
        let near = self.near.capabilities();
        let far = self.far.capabilities();
        BackendCapabilities {
            supports_dependencies: near.supports_dependencies && far.supports_dependencies,
            is_async_supported: true,
            supports_clear: near.supports_clear && far.supports_clear,
            is_distributed: far.is_distributed,
        }
    }

    fn status(&self) -> BackendStatus {
        self.lifecycle.status()
    }

    async fn initialize(&self, cancellation: &CancellationToken) -> CacheResult<()> {
        self.lifecycle
            .run_initialize(|| async {
                self.near.initialize(cancellation).await?;
                self.far.initialize(cancellation).await?;
                self.register_with_broker()
            })
            .await
    }

    async fn get_entry(&self, key: &CacheKey) -> CacheResult<Option<CacheEntry>> {
        self.lifecycle.ensure_ready()?;

        if let Some(entry) = self.near.get_entry(key).await? {
            self.counters.near_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(entry));
        }

        match self.far.get_entry(key).await? {
            Some(entry) => {
                self.counters.far_hits.fetch_add(1, Ordering::Relaxed);
                self.write_near(key, entry.clone()).await;
                Ok(Some(entry))
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    async fn set_entry(&self, key: &CacheKey, entry: CacheEntry) -> CacheResult<()> {
        self.lifecycle.ensure_ready()?;
        self.far.set_entry(key, entry.clone()).await?;
        self.write_near(key, entry).await;
        Ok(())
    }

    async fn contains_key(&self, key: &CacheKey) -> CacheResult<bool> {
        self.lifecycle.ensure_ready()?;
        if self.near.contains_key(key).await? {
            return Ok(true);
        }
        self.far.contains_key(key).await
    }

    async fn remove_entry(&self, key: &CacheKey) -> CacheResult<bool> {
        self.lifecycle.ensure_ready()?;
        let far = self.far.remove_entry(key).await?;
        let near = self.near.remove_entry(key).await?;
        Ok(far || near)
    }

    async fn contains_dependency(&self, dependency: &DependencyKey) -> CacheResult<bool> {
        self.lifecycle.ensure_ready()?;
        self.far.contains_dependency(dependency).await
    }

    async fn invalidate_dependency(&self, dependency: &DependencyKey) -> CacheResult<()> {
        self.lifecycle.ensure_ready()?;
        // Far first: a read between the two steps must not refill the near
        // tier from a stale far tier.
        self.far.invalidate_dependency(dependency).await?;
        self.near.invalidate_dependency(dependency).await
    }

    async fn clear(&self) -> CacheResult<()> {
        self.lifecycle.ensure_ready()?;
        self.far.clear().await?;
        self.near.clear().await
    }

    async fn dispose(&self) -> CacheResult<()> {
        if !self.lifecycle.begin_dispose() {
            return Ok(());
        }
        let unregister = self.unregister_from_broker();
        let near = self.near.dispose().await;
        let far = self.far.dispose().await;
        self.lifecycle.complete_dispose();
        unregister.and(near).and(far)
    }

    async fn stats(&self) -> CacheResult<CacheStats> {
        let near = self.near.stats().await?;
        let far = self.far.stats().await?;
        let layered = self.layered_stats();
        Ok(CacheStats {
            hits: layered.near_hits + layered.far_hits,
            misses: layered.misses,
            entry_count: far.entry_count,
            evictions: near.evictions + far.evictions,
            expirations: near.expirations + far.expirations,
            invalidations: far.invalidations,
            writes: far.writes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{MemoryBackend, MemoryBackendOptions};

    fn memory(options: MemoryBackendOptions) -> Arc<dyn CachingBackend> {
        Arc::new(MemoryBackend::new(options.with_expiration_scan_interval(None)))
    }

    async fn layered(near: Arc<dyn CachingBackend>, far: Arc<dyn CachingBackend>) -> LayeredBackend {
        let backend = LayeredBackend::new(near, far);
        backend
            .initialize(&CancellationToken::new())
            .await
            .unwrap();
        backend
    }

    #[tokio::test]
    async fn test_set_then_get_is_served_by_near_tier() {
        let far = memory(MemoryBackendOptions::new());
        let backend = layered(memory(MemoryBackendOptions::new()), Arc::clone(&far)).await;
        let key = CacheKey::from("k");

        backend.set_entry(&key, CacheEntry::new(7i64)).await.unwrap();
        let entry = backend.get_entry(&key).await.unwrap().unwrap();
        assert_eq!(entry.value_as::<i64>(), Some(&7));

        let far_stats = far.stats().await.unwrap();
        assert_eq!((far_stats.hits, far_stats.misses), (0, 0));
        assert_eq!(backend.layered_stats().near_hits, 1);
    }

    #[tokio::test]
    async fn test_far_hit_populates_near_tier() {
        let near = memory(MemoryBackendOptions::new());
        let far = memory(MemoryBackendOptions::new());
        let backend = layered(Arc::clone(&near), Arc::clone(&far)).await;
        let key = CacheKey::from("k");

        far.set_entry(&key, CacheEntry::new(1i64)).await.unwrap();
        assert!(!near.contains_key(&key).await.unwrap());

        assert!(backend.get_entry(&key).await.unwrap().is_some());
        assert!(near.contains_key(&key).await.unwrap());
        assert_eq!(backend.layered_stats().far_hits, 1);

        backend.get_entry(&key).await.unwrap();
        assert_eq!(backend.layered_stats().near_hits, 1);
    }

    #[tokio::test]
    async fn test_near_write_failure_is_not_fatal() {
        let near = memory(MemoryBackendOptions::new().without_dependencies());
        let far = memory(MemoryBackendOptions::new());
        let backend = layered(near, Arc::clone(&far)).await;
        let key = CacheKey::from("k");

        backend
            .set_entry(&key, CacheEntry::new(1i64).with_dependency("d"))
            .await
            .unwrap();

        assert_eq!(backend.layered_stats().near_write_failures, 1);
        assert!(far.contains_key(&key).await.unwrap());
        assert!(!backend.capabilities().supports_dependencies);
    }

    #[tokio::test]
    async fn test_invalidate_reaches_both_tiers() {
        let near = memory(MemoryBackendOptions::new());
        let far = memory(MemoryBackendOptions::new());
        let backend = layered(Arc::clone(&near), Arc::clone(&far)).await;
        let key = CacheKey::from("k");

        backend
            .set_entry(&key, CacheEntry::new(1i64).with_dependency("d"))
            .await
            .unwrap();
        backend
            .invalidate_dependency(&DependencyKey::from("d"))
            .await
            .unwrap();

        assert!(!near.contains_key(&key).await.unwrap());
        assert!(!far.contains_key(&key).await.unwrap());
        assert!(backend.get_entry(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dispose_disposes_both_tiers() {
        let near = memory(MemoryBackendOptions::new());
        let far = memory(MemoryBackendOptions::new());
        let backend = layered(Arc::clone(&near), Arc::clone(&far)).await;

        backend.dispose().await.unwrap();
        assert_eq!(near.status(), BackendStatus::Disposed);
        assert_eq!(far.status(), BackendStatus::Disposed);
        assert_eq!(backend.status(), BackendStatus::Disposed);
    }
}
