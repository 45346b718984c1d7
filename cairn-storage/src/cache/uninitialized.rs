//! Placeholder backend used when no backend was configured.

use async_trait::async_trait;
use cairn_core::{CacheEntry, CacheError, CacheKey, CacheResult, DependencyKey, ProgrammingError};
use tokio_util::sync::CancellationToken;

use super::lifecycle::BackendStatus;
use super::traits::{BackendCapabilities, BackendDescriptor, CacheStats, CachingBackend};

/// Faults every operation with [`ProgrammingError::UninitializedBackend`].
///
/// Only `dispose` succeeds, so shutdown paths stay clean.
#[derive(Debug, Default, Clone, Copy)]
pub struct UninitializedBackend;

impl UninitializedBackend {
    pub fn new() -> Self {
        Self
    }
}

fn fault<T>() -> CacheResult<T> {
    Err(CacheError::Programming(ProgrammingError::UninitializedBackend))
}

#[async_trait]
impl CachingBackend for UninitializedBackend {
    fn descriptor(&self) -> BackendDescriptor {
        BackendDescriptor::new("uninitialized", 0)
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities::local().with_dependencies(false)
    }

    fn status(&self) -> BackendStatus {
        BackendStatus::Uninitialized
    }

    async fn initialize(&self, _cancellation: &CancellationToken) -> CacheResult<()> {
        fault()
    }

    async fn get_entry(&self, _key: &CacheKey) -> CacheResult<Option<CacheEntry>> {
        fault()
    }

    async fn set_entry(&self, _key: &CacheKey, _entry: CacheEntry) -> CacheResult<()> {
        fault()
    }

    async fn contains_key(&self, _key: &CacheKey) -> CacheResult<bool> {
        fault()
    }

    async fn remove_entry(&self, _key: &CacheKey) -> CacheResult<bool> {
        fault()
    }

    async fn contains_dependency(&self, _dependency: &DependencyKey) -> CacheResult<bool> {
        fault()
    }

    async fn invalidate_dependency(&self, _dependency: &DependencyKey) -> CacheResult<()> {
        fault()
    }

    async fn clear(&self) -> CacheResult<()> {
        fault()
    }

    async fn dispose(&self) -> CacheResult<()> {
        Ok(())
    }

    async fn stats(&self) -> CacheResult<CacheStats> {
        fault()
    }
}
