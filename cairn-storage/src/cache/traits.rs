//! Caching backend contract.
//!
//! Every store and every enhancer implements [`CachingBackend`]. Enhancers
//! hold an inner `Arc<dyn CachingBackend>` and delegate, so a stack of them
//! is itself a backend.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use cairn_core::{CacheEntry, CacheKey, CacheResult, CapabilityError, DependencyKey};
use tokio_util::sync::CancellationToken;

use super::lifecycle::BackendStatus;

/// Pluggable cache store.
///
/// Implementations must be safe for unsynchronized concurrent use. All
/// operations other than [`initialize`](Self::initialize) and
/// [`dispose`](Self::dispose) fault with a
/// [`ProgrammingError`](cairn_core::ProgrammingError) unless the backend is
/// [`BackendStatus::Ready`].
///
/// Async is the native shape; see
/// [`BlockingBackend`](super::blocking::BlockingBackend) for the blocking one.
/// Dropping an operation's future cancels it.
#[async_trait]
pub trait CachingBackend: Send + Sync {
    /// Kind and stack position, for diagnostics.
    fn descriptor(&self) -> BackendDescriptor;

    /// Static capability flags.
    fn capabilities(&self) -> BackendCapabilities;

    fn status(&self) -> BackendStatus;

    /// Establish underlying connections.
    ///
    /// Unreachable stores fault with a
    /// [`ConnectionError`](cairn_core::ConnectionError); cancellation faults
    /// with [`TimeoutError::Cancelled`](cairn_core::TimeoutError::Cancelled)
    /// and leaves the backend retryable. Initializing a ready backend is a
    /// no-op.
    async fn initialize(&self, cancellation: &CancellationToken) -> CacheResult<()>;

    /// Look up an entry. A miss is `Ok(None)`.
    async fn get_entry(&self, key: &CacheKey) -> CacheResult<Option<CacheEntry>>;

    /// Insert or atomically replace the entry stored under `key`.
    async fn set_entry(&self, key: &CacheKey, entry: CacheEntry) -> CacheResult<()>;

    async fn contains_key(&self, key: &CacheKey) -> CacheResult<bool>;

    /// Remove one entry. Returns whether it was present.
    async fn remove_entry(&self, key: &CacheKey) -> CacheResult<bool>;

    /// Whether any stored entry declares `dependency`.
    async fn contains_dependency(&self, dependency: &DependencyKey) -> CacheResult<bool>;

    /// Evict every entry that declared `dependency`.
    async fn invalidate_dependency(&self, dependency: &DependencyKey) -> CacheResult<()>;

    /// Remove every entry.
    async fn clear(&self) -> CacheResult<()>;

    /// Release resources. Idempotent.
    async fn dispose(&self) -> CacheResult<()>;

    async fn stats(&self) -> CacheResult<CacheStats>;
}

impl fmt::Debug for dyn CachingBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CachingBackend({})", self.descriptor())
    }
}

/// Capability flags queried by callers that pick a call shape per backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendCapabilities {
    /// Dependency keys are stored and `invalidate_dependency` evicts.
    pub supports_dependencies: bool,
    /// Operations are natively async.
    pub is_async_supported: bool,
    pub supports_clear: bool,
    /// Writes are announced to other processes.
    pub is_distributed: bool,
}

impl BackendCapabilities {
    /// Capabilities of a process-local store.
    pub const fn local() -> Self {
        Self {
            supports_dependencies: true,
            is_async_supported: true,
            supports_clear: true,
            is_distributed: false,
        }
    }

    pub const fn with_dependencies(mut self, supported: bool) -> Self {
        self.supports_dependencies = supported;
        self
    }

    pub const fn with_distributed(mut self, distributed: bool) -> Self {
        self.is_distributed = distributed;
        self
    }

    /// Fail with [`CapabilityError::DependenciesUnsupported`] unless
    /// dependencies are supported.
    pub fn require_dependencies(&self, descriptor: BackendDescriptor) -> CacheResult<()> {
        if self.supports_dependencies {
            Ok(())
        } else {
            Err(CapabilityError::DependenciesUnsupported {
                backend: descriptor.to_string(),
            }
            .into())
        }
    }
}

/// Backend kind and its position in an enhancer stack.
///
/// The storage backend is layer 0; each enhancer wrapped around it takes the
/// next number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackendDescriptor {
    pub kind: &'static str,
    pub layer: u32,
}

impl BackendDescriptor {
    pub const fn new(kind: &'static str, layer: u32) -> Self {
        Self { kind, layer }
    }
}

impl fmt::Display for BackendDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.kind, self.layer)
    }
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of entries currently in cache.
    pub entry_count: u64,
    /// Number of entries dropped by the capacity policy.
    pub evictions: u64,
    /// Number of entries dropped because they expired.
    pub expirations: u64,
    /// Number of entries dropped by dependency invalidation.
    pub invalidations: u64,
    pub writes: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Lock-free counters behind [`CacheStats`].
#[derive(Debug, Default)]
pub struct StatCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    invalidations: AtomicU64,
    writes: AtomicU64,
}

impl StatCounters {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, count: u64) {
        self.evictions.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_expirations(&self, count: u64) {
        self.expirations.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_invalidations(&self, count: u64) {
        self.invalidations.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self, entry_count: u64) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count,
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_core::CacheError;

    #[test]
    fn test_cache_stats_hit_rate() {
        let stats = CacheStats {
            hits: 80,
            misses: 20,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.8).abs() < 0.001);

        let empty_stats = CacheStats::default();
        assert!((empty_stats.hit_rate() - 0.0).abs() < 0.001);
    }

    #[test]
    fn test_counters_snapshot() {
        let counters = StatCounters::default();
        counters.record_hit();
        counters.record_miss();
        counters.record_miss();
        counters.record_evictions(3);

        let stats = counters.snapshot(7);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.evictions, 3);
        assert_eq!(stats.entry_count, 7);
    }

    #[test]
    fn test_require_dependencies() {
        let descriptor = BackendDescriptor::new("memory", 0);
        assert!(BackendCapabilities::local()
            .require_dependencies(descriptor)
            .is_ok());

        let err = BackendCapabilities::local()
            .with_dependencies(false)
            .require_dependencies(descriptor)
            .unwrap_err();
        assert_eq!(
            err,
            CacheError::Capability(CapabilityError::DependenciesUnsupported {
                backend: "memory@0".to_string()
            })
        );
    }
}
