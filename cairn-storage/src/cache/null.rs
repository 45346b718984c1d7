//! Backend that stores nothing.

use async_trait::async_trait;
use cairn_core::{CacheEntry, CacheKey, CacheResult, DependencyKey};
use tokio_util::sync::CancellationToken;

use super::lifecycle::{BackendStatus, Lifecycle};
use super::traits::{
    BackendCapabilities, BackendDescriptor, CacheStats, CachingBackend, StatCounters,
};

/// Accepts every write and misses on every read.
#[derive(Debug)]
pub struct NullBackend {
    lifecycle: Lifecycle,
    counters: StatCounters,
    layer: u32,
}

impl NullBackend {
    pub fn new() -> Self {
        Self {
            lifecycle: Lifecycle::new("null"),
            counters: StatCounters::default(),
            layer: 0,
        }
    }

    pub fn with_layer(mut self, layer: u32) -> Self {
        self.layer = layer;
        self
    }
}

impl Default for NullBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CachingBackend for NullBackend {
    fn descriptor(&self) -> BackendDescriptor {
        BackendDescriptor::new("null", self.layer)
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities::local()
    }

    fn status(&self) -> BackendStatus {
        self.lifecycle.status()
    }

    async fn initialize(&self, _cancellation: &CancellationToken) -> CacheResult<()> {
        self.lifecycle.run_initialize(|| async { Ok(()) }).await
    }

    async fn get_entry(&self, _key: &CacheKey) -> CacheResult<Option<CacheEntry>> {
        self.lifecycle.ensure_ready()?;
        self.counters.record_miss();
        Ok(None)
    }

    async fn set_entry(&self, _key: &CacheKey, _entry: CacheEntry) -> CacheResult<()> {
        self.lifecycle.ensure_ready()?;
        self.counters.record_write();
        Ok(())
    }

    async fn contains_key(&self, _key: &CacheKey) -> CacheResult<bool> {
        self.lifecycle.ensure_ready()?;
        Ok(false)
    }

    async fn remove_entry(&self, _key: &CacheKey) -> CacheResult<bool> {
        self.lifecycle.ensure_ready()?;
        Ok(false)
    }

    async fn contains_dependency(&self, _dependency: &DependencyKey) -> CacheResult<bool> {
        self.lifecycle.ensure_ready()?;
        Ok(false)
    }

    async fn invalidate_dependency(&self, _dependency: &DependencyKey) -> CacheResult<()> {
        self.lifecycle.ensure_ready()
    }

    async fn clear(&self) -> CacheResult<()> {
        self.lifecycle.ensure_ready()
    }

    async fn dispose(&self) -> CacheResult<()> {
        if self.lifecycle.begin_dispose() {
            self.lifecycle.complete_dispose();
        }
        Ok(())
    }

    async fn stats(&self) -> CacheResult<CacheStats> {
        Ok(self.counters.snapshot(0))
    }
}
