//! Read-through front over a caching backend.
//!
//! On a miss, the named lock for the key is taken so concurrent callers
//! compute the value once: the first caller computes and stores, the others
//! wait on the lock and then find the stored entry.

use std::any::Any;
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use cairn_core::{
    CacheEntry, CacheItemPriority, CacheKey, CacheResult, DependencyKey, InvalidEntryError,
    LockFactory, Timestamp, TimeoutError,
};
use tokio_util::sync::CancellationToken;

use super::lifecycle::check_cancelled;
use super::traits::CachingBackend;

/// What to do when the per-key lock cannot be taken in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockTimeoutBehavior {
    /// Compute without the lock; concurrent callers may compute twice.
    #[default]
    ComputeAnyway,
    /// Fail with [`TimeoutError::Elapsed`].
    Fault,
}

/// Configuration for the read-through cache.
#[derive(Debug, Clone)]
pub struct ReadThroughConfig {
    /// How long a caller waits for another caller's computation.
    pub lock_timeout: Duration,
    pub on_lock_timeout: LockTimeoutBehavior,
    /// Store `None` results so the computation is not repeated.
    pub cache_nulls: bool,
}

impl Default for ReadThroughConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(5),
            on_lock_timeout: LockTimeoutBehavior::default(),
            cache_nulls: true,
        }
    }
}

impl ReadThroughConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_lock_timeout_behavior(mut self, behavior: LockTimeoutBehavior) -> Self {
        self.on_lock_timeout = behavior;
        self
    }

    pub fn with_cache_nulls(mut self, enabled: bool) -> Self {
        self.cache_nulls = enabled;
        self
    }
}

/// Dependencies and expiration applied to computed entries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemOptions {
    pub dependencies: BTreeSet<DependencyKey>,
    pub absolute_expiration: Option<Timestamp>,
    pub sliding_expiration: Option<Duration>,
    pub priority: CacheItemPriority,
}

impl ItemOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dependency(mut self, dependency: impl Into<DependencyKey>) -> Self {
        self.dependencies.insert(dependency.into());
        self
    }

    pub fn with_absolute_expiration(mut self, at: Timestamp) -> Self {
        self.absolute_expiration = Some(at);
        self
    }

    pub fn with_sliding_expiration(mut self, window: Duration) -> Self {
        self.sliding_expiration = Some(window);
        self
    }

    pub fn with_priority(mut self, priority: CacheItemPriority) -> Self {
        self.priority = priority;
        self
    }

    fn apply(&self, mut entry: CacheEntry) -> CacheEntry {
        entry.dependencies.extend(self.dependencies.iter().cloned());
        entry.absolute_expiration = self.absolute_expiration;
        entry.sliding_expiration = self.sliding_expiration;
        entry.priority = self.priority;
        entry
    }
}

/// Read-through cache.
///
/// # Example
///
/// ```ignore
/// let cache = ReadThroughCache::new(backend, Arc::new(LocalLockFactory::new()), ReadThroughConfig::new());
///
/// let product = cache
///     .get_or_compute(
///         &CacheKey::from("product:7"),
///         &ItemOptions::new().with_dependency("catalog"),
///         &CancellationToken::new(),
///         || async { repository.load_product(7).await },
///     )
///     .await?;
/// ```
pub struct ReadThroughCache {
    backend: Arc<dyn CachingBackend>,
    locks: Arc<dyn LockFactory>,
    config: ReadThroughConfig,
}

impl fmt::Debug for ReadThroughCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadThroughCache")
            .field("backend", &self.backend)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ReadThroughCache {
    pub fn new(
        backend: Arc<dyn CachingBackend>,
        locks: Arc<dyn LockFactory>,
        config: ReadThroughConfig,
    ) -> Self {
        Self {
            backend,
            locks,
            config,
        }
    }

    pub fn backend(&self) -> &Arc<dyn CachingBackend> {
        &self.backend
    }

    pub fn config(&self) -> &ReadThroughConfig {
        &self.config
    }

    /// Return the cached value for `key`, computing and storing it on a miss.
    ///
    /// A cached null is returned as `Ok(None)` without recomputing.
    /// Cancellation while waiting for the lock fails with
    /// [`TimeoutError::Cancelled`]; a lock timeout follows
    /// [`ReadThroughConfig::on_lock_timeout`].
    pub async fn get_or_compute<T, F, Fut>(
        &self,
        key: &CacheKey,
        options: &ItemOptions,
        cancellation: &CancellationToken,
        compute: F,
    ) -> CacheResult<Option<T>>
    where
        T: Any + Send + Sync + fmt::Debug + PartialEq + Clone,
        F: FnOnce() -> Fut,
        Fut: Future<Output = CacheResult<Option<T>>>,
    {
        if let Some(entry) = self.backend.get_entry(key).await? {
            return extract(key, &entry);
        }

        let mut lock = self.locks.get_lock(key.as_str());
        let acquired = lock.acquire(self.config.lock_timeout, cancellation).await?;
        if !acquired {
            check_cancelled(cancellation, "read-through lock")?;
            match self.config.on_lock_timeout {
                LockTimeoutBehavior::Fault => {
                    return Err(TimeoutError::Elapsed {
                        operation: format!("lock {key}"),
                        after: self.config.lock_timeout,
                    }
                    .into());
                }
                LockTimeoutBehavior::ComputeAnyway => {
                    tracing::warn!(
                        key = %key,
                        timeout_ms = self.config.lock_timeout.as_millis() as u64,
                        "Lock not acquired, computing without it"
                    );
                }
            }
        }

        let result = self
            .fill(key, options, cancellation, compute, acquired)
            .await;
        lock.release();
        lock.dispose()?;
        result
    }

    async fn fill<T, F, Fut>(
        &self,
        key: &CacheKey,
        options: &ItemOptions,
        cancellation: &CancellationToken,
        compute: F,
        recheck: bool,
    ) -> CacheResult<Option<T>>
    where
        T: Any + Send + Sync + fmt::Debug + PartialEq + Clone,
        F: FnOnce() -> Fut,
        Fut: Future<Output = CacheResult<Option<T>>>,
    {
        if recheck {
            if let Some(entry) = self.backend.get_entry(key).await? {
                return extract(key, &entry);
            }
        }

        check_cancelled(cancellation, "read-through compute")?;
        let value = compute().await?;

        let entry = match &value {
            Some(value) => CacheEntry::new(value.clone()),
            None if self.config.cache_nulls => CacheEntry::null(),
            None => return Ok(None),
        };
        self.backend.set_entry(key, options.apply(entry)).await?;
        Ok(value)
    }

    pub async fn remove(&self, key: &CacheKey) -> CacheResult<bool> {
        self.backend.remove_entry(key).await
    }

    pub async fn invalidate(&self, dependency: &DependencyKey) -> CacheResult<()> {
        self.backend.invalidate_dependency(dependency).await
    }
}

fn extract<T>(key: &CacheKey, entry: &CacheEntry) -> CacheResult<Option<T>>
where
    T: Any + Clone,
{
    if entry.is_null() {
        return Ok(None);
    }
    entry.value_as::<T>().cloned().map(Some).ok_or_else(|| {
        InvalidEntryError::Malformed {
            reason: format!(
                "entry {key} does not hold a {}",
                std::any::type_name::<T>()
            ),
        }
        .into()
    })
}
