//! Far-tier enhancer that announces writes through an invalidation broker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use cairn_core::{CacheEntry, CacheKey, CacheResult, DependencyKey};
use tokio_util::sync::CancellationToken;

use super::lifecycle::{BackendStatus, Lifecycle};
use super::traits::{BackendCapabilities, BackendDescriptor, CacheStats, CachingBackend};
use crate::broker::InvalidationBroker;

/// Wraps a shared store so peers learn about its writes.
///
/// After the inner write succeeds, `set_entry` and `remove_entry` publish an
/// item invalidation and `invalidate_dependency` publishes a dependency
/// invalidation. A publish failure is returned to the caller.
///
/// With `required = false`, a broker that cannot connect during
/// `initialize` is logged and skipped; invalidations then only reach this
/// process.
#[derive(Debug)]
pub struct DistributedBackend {
    inner: Arc<dyn CachingBackend>,
    broker: Arc<InvalidationBroker>,
    required: bool,
    degraded: AtomicBool,
    lifecycle: Lifecycle,
    layer: u32,
}

impl DistributedBackend {
    pub fn new(inner: Arc<dyn CachingBackend>, broker: Arc<InvalidationBroker>) -> Self {
        Self {
            inner,
            broker,
            required: true,
            degraded: AtomicBool::new(false),
            lifecycle: Lifecycle::new("distributed"),
            layer: 1,
        }
    }

    pub fn with_layer(mut self, layer: u32) -> Self {
        self.layer = layer;
        self
    }

    /// Whether a broker connection failure fails `initialize`.
    pub fn with_required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    pub fn broker(&self) -> &Arc<InvalidationBroker> {
        &self.broker
    }

    /// True when running without a broker connection.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    fn announces(&self) -> bool {
        !self.is_degraded()
    }
}

#[async_trait]
impl CachingBackend for DistributedBackend {
    fn descriptor(&self) -> BackendDescriptor {
        BackendDescriptor::new("distributed", self.layer)
    }

    fn capabilities(&self) -> BackendCapabilities {
        self.inner
            .capabilities()
            .with_distributed(self.announces())
    }

    fn status(&self) -> BackendStatus {
        self.lifecycle.status()
    }

    async fn initialize(&self, cancellation: &CancellationToken) -> CacheResult<()> {
        self.lifecycle
            .run_initialize(|| async {
                self.inner.initialize(cancellation).await?;
                match self.broker.connect(cancellation).await {
                    Ok(()) => {
                        self.degraded.store(false, Ordering::Release);
                        Ok(())
                    }
                    Err(e) if !self.required && !e.is_fatal() && !cancellation.is_cancelled() => {
                        tracing::warn!(
                            channel = %self.broker.channel(),
                            error = %e,
                            "Broker unavailable, invalidations stay local to this process"
                        );
                        self.degraded.store(true, Ordering::Release);
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            })
            .await
    }

    async fn get_entry(&self, key: &CacheKey) -> CacheResult<Option<CacheEntry>> {
        self.lifecycle.ensure_ready()?;
        self.inner.get_entry(key).await
    }

    async fn set_entry(&self, key: &CacheKey, entry: CacheEntry) -> CacheResult<()> {
        self.lifecycle.ensure_ready()?;
        self.inner.set_entry(key, entry).await?;
        if self.announces() {
            self.broker.publish_item(key).await?;
        }
        Ok(())
    }

    async fn contains_key(&self, key: &CacheKey) -> CacheResult<bool> {
        self.lifecycle.ensure_ready()?;
        self.inner.contains_key(key).await
    }

    async fn remove_entry(&self, key: &CacheKey) -> CacheResult<bool> {
        self.lifecycle.ensure_ready()?;
        let removed = self.inner.remove_entry(key).await?;
        if self.announces() {
            self.broker.publish_item(key).await?;
        }
        Ok(removed)
    }

    async fn contains_dependency(&self, dependency: &DependencyKey) -> CacheResult<bool> {
        self.lifecycle.ensure_ready()?;
        self.inner.contains_dependency(dependency).await
    }

    async fn invalidate_dependency(&self, dependency: &DependencyKey) -> CacheResult<()> {
        self.lifecycle.ensure_ready()?;
        self.inner.invalidate_dependency(dependency).await?;
        if self.announces() {
            self.broker.publish_dependency(dependency).await?;
        }
        Ok(())
    }

    async fn clear(&self) -> CacheResult<()> {
        self.lifecycle.ensure_ready()?;
        self.inner.clear().await
    }

    async fn dispose(&self) -> CacheResult<()> {
        if !self.lifecycle.begin_dispose() {
            return Ok(());
        }
        let broker = self.broker.shutdown().await;
        let inner = self.inner.dispose().await;
        self.lifecycle.complete_dispose();
        broker.and(inner)
    }

    async fn stats(&self) -> CacheResult<CacheStats> {
        self.inner.stats().await
    }
}
