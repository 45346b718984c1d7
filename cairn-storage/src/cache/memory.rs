//! Process-local in-memory backend.
//!
//! # Policies
//!
//! - Optional item capacity with least-recently-used eviction. Items with
//!   [`CacheItemPriority::NotRemovable`](cairn_core::CacheItemPriority) are
//!   never evicted by capacity; the store may exceed its capacity when only
//!   such items remain.
//! - Absolute and sliding expiration, checked on read and by a periodic
//!   background sweep.
//! - A reverse index from dependency key to cache keys, so invalidation does
//!   not scan.
//!
//! All state sits behind one `RwLock`; `set_entry` and
//! `invalidate_dependency` are serialized by it, so an entry is either fully
//! indexed under its dependencies or absent.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use cairn_core::{CacheEntry, CacheKey, CacheResult, DependencyKey, Timestamp};
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::lifecycle::{BackendStatus, Lifecycle};
use super::traits::{
    BackendCapabilities, BackendDescriptor, CacheStats, CachingBackend, StatCounters,
};

/// Options for [`MemoryBackend`].
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryBackendOptions {
    /// Maximum number of items. `None` = unbounded.
    pub capacity: Option<usize>,
    /// Period of the background expiration sweep. `None` disables it.
    pub expiration_scan_interval: Option<Duration>,
    /// Keep the dependency index. Without it dependencies are rejected.
    pub track_dependencies: bool,
}

impl Default for MemoryBackendOptions {
    fn default() -> Self {
        Self {
            capacity: None,
            expiration_scan_interval: Some(Duration::from_secs(1)),
            track_dependencies: true,
        }
    }
}

impl MemoryBackendOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(mut self, capacity: Option<usize>) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_expiration_scan_interval(mut self, interval: Option<Duration>) -> Self {
        self.expiration_scan_interval = interval;
        self
    }

    pub fn without_dependencies(mut self) -> Self {
        self.track_dependencies = false;
        self
    }
}

#[derive(Debug)]
struct StoredItem {
    entry: CacheEntry,
    last_access: Timestamp,
    recency: u64,
}

#[derive(Debug, Default)]
struct MemoryState {
    items: HashMap<CacheKey, StoredItem>,
    /// Access tick -> key, oldest first.
    recency: BTreeMap<u64, CacheKey>,
    dependents: HashMap<DependencyKey, HashSet<CacheKey>>,
    clock: u64,
}

impl MemoryState {
    fn next_tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn touch(&mut self, key: &CacheKey, now: Timestamp) -> Option<CacheEntry> {
        let tick = self.next_tick();
        let item = self.items.get_mut(key)?;
        self.recency.remove(&item.recency);
        item.recency = tick;
        item.last_access = now;
        self.recency.insert(tick, key.clone());
        Some(item.entry.clone())
    }

    fn insert(&mut self, key: CacheKey, entry: CacheEntry, now: Timestamp) {
        self.remove(&key);
        let tick = self.next_tick();
        for dependency in &entry.dependencies {
            self.dependents
                .entry(dependency.clone())
                .or_default()
                .insert(key.clone());
        }
        self.recency.insert(tick, key.clone());
        self.items.insert(
            key,
            StoredItem {
                entry,
                last_access: now,
                recency: tick,
            },
        );
    }

    fn remove(&mut self, key: &CacheKey) -> Option<StoredItem> {
        let item = self.items.remove(key)?;
        self.recency.remove(&item.recency);
        for dependency in &item.entry.dependencies {
            if let Some(keys) = self.dependents.get_mut(dependency) {
                keys.remove(key);
                if keys.is_empty() {
                    self.dependents.remove(dependency);
                }
            }
        }
        Some(item)
    }

    fn evict_to(&mut self, capacity: usize) -> u64 {
        let excess = self.items.len().saturating_sub(capacity);
        if excess == 0 {
            return 0;
        }
        let victims: Vec<CacheKey> = self
            .recency
            .values()
            .filter(|key| {
                self.items
                    .get(*key)
                    .map(|item| item.entry.is_removable())
                    .unwrap_or(false)
            })
            .take(excess)
            .cloned()
            .collect();
        for key in &victims {
            self.remove(key);
        }
        victims.len() as u64
    }

    fn invalidate(&mut self, dependency: &DependencyKey) -> u64 {
        let Some(keys) = self.dependents.remove(dependency) else {
            return 0;
        };
        let mut removed = 0;
        for key in &keys {
            if self.remove(key).is_some() {
                removed += 1;
            }
        }
        removed
    }

    fn purge_expired(&mut self, now: Timestamp) -> u64 {
        let expired: Vec<CacheKey> = self
            .items
            .iter()
            .filter(|(_, item)| item.entry.is_expired_at(now, item.last_access))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired.len() as u64
    }
}

#[derive(Debug)]
struct MemoryInner {
    state: RwLock<MemoryState>,
    counters: StatCounters,
    capacity: Option<usize>,
}

impl MemoryInner {
    fn get(&self, key: &CacheKey) -> CacheResult<Option<CacheEntry>> {
        let now = Utc::now();
        let mut state = self.state.write()?;

        let expired = match state.items.get(key) {
            Some(item) => item.entry.is_expired_at(now, item.last_access),
            None => {
                self.counters.record_miss();
                return Ok(None);
            }
        };
        if expired {
            state.remove(key);
            self.counters.record_expirations(1);
            self.counters.record_miss();
            return Ok(None);
        }

        let entry = state.touch(key, now);
        self.counters.record_hit();
        Ok(entry)
    }

    fn set(&self, key: &CacheKey, entry: CacheEntry) -> CacheResult<()> {
        let mut state = self.state.write()?;
        state.insert(key.clone(), entry, Utc::now());
        self.counters.record_write();

        if let Some(capacity) = self.capacity {
            let evicted = state.evict_to(capacity);
            if evicted > 0 {
                self.counters.record_evictions(evicted);
                tracing::debug!(evicted, capacity, "Evicted least recently used entries");
            }
        }
        Ok(())
    }

    fn contains(&self, key: &CacheKey) -> CacheResult<bool> {
        let now = Utc::now();
        let state = self.state.read()?;
        Ok(state
            .items
            .get(key)
            .map(|item| !item.entry.is_expired_at(now, item.last_access))
            .unwrap_or(false))
    }

    fn purge_expired(&self, now: Timestamp) -> CacheResult<u64> {
        let purged = self.state.write()?.purge_expired(now);
        self.counters.record_expirations(purged);
        Ok(purged)
    }
}

/// In-memory caching backend.
#[derive(Debug)]
pub struct MemoryBackend {
    inner: Arc<MemoryInner>,
    options: MemoryBackendOptions,
    lifecycle: Lifecycle,
    shutdown: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    layer: u32,
}

impl MemoryBackend {
    pub fn new(options: MemoryBackendOptions) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                state: RwLock::new(MemoryState::default()),
                counters: StatCounters::default(),
                capacity: options.capacity,
            }),
            options,
            lifecycle: Lifecycle::new("memory"),
            shutdown: CancellationToken::new(),
            sweeper: Mutex::new(None),
            layer: 0,
        }
    }

    pub fn with_layer(mut self, layer: u32) -> Self {
        self.layer = layer;
        self
    }

    pub fn options(&self) -> &MemoryBackendOptions {
        &self.options
    }

    /// Drop every expired entry now. Returns how many were dropped.
    pub fn purge_expired(&self) -> CacheResult<u64> {
        self.inner.purge_expired(Utc::now())
    }

    fn require_dependencies(&self) -> CacheResult<()> {
        self.capabilities()
            .require_dependencies(self.descriptor())
    }

    fn start_sweeper(&self, interval: Duration) -> CacheResult<()> {
        let inner = Arc::downgrade(&self.inner);
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(run_sweeper(inner, interval, shutdown));
        *self.sweeper.lock()? = Some(handle);
        Ok(())
    }
}

async fn run_sweeper(inner: Weak<MemoryInner>, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                match inner.purge_expired(Utc::now()) {
                    Ok(0) => {}
                    Ok(purged) => tracing::debug!(purged, "Expiration sweep removed entries"),
                    Err(e) => tracing::warn!(error = %e, "Expiration sweep failed"),
                }
            }
        }
    }
    tracing::debug!("Expiration sweeper stopped");
}

#[async_trait]
impl CachingBackend for MemoryBackend {
    fn descriptor(&self) -> BackendDescriptor {
        BackendDescriptor::new("memory", self.layer)
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities::local().with_dependencies(self.options.track_dependencies)
    }

    fn status(&self) -> BackendStatus {
        self.lifecycle.status()
    }

    async fn initialize(&self, _cancellation: &CancellationToken) -> CacheResult<()> {
        self.lifecycle
            .run_initialize(|| async {
                match self.options.expiration_scan_interval {
                    Some(interval) if !interval.is_zero() => self.start_sweeper(interval),
                    _ => Ok(()),
                }
            })
            .await
    }

    async fn get_entry(&self, key: &CacheKey) -> CacheResult<Option<CacheEntry>> {
        self.lifecycle.ensure_ready()?;
        self.inner.get(key)
    }

    async fn set_entry(&self, key: &CacheKey, entry: CacheEntry) -> CacheResult<()> {
        self.lifecycle.ensure_ready()?;
        if entry.has_dependencies() {
            self.require_dependencies()?;
        }
        self.inner.set(key, entry)
    }

    async fn contains_key(&self, key: &CacheKey) -> CacheResult<bool> {
        self.lifecycle.ensure_ready()?;
        self.inner.contains(key)
    }

    async fn remove_entry(&self, key: &CacheKey) -> CacheResult<bool> {
        self.lifecycle.ensure_ready()?;
        Ok(self.inner.state.write()?.remove(key).is_some())
    }

    async fn contains_dependency(&self, dependency: &DependencyKey) -> CacheResult<bool> {
        self.lifecycle.ensure_ready()?;
        self.require_dependencies()?;
        Ok(self.inner.state.read()?.dependents.contains_key(dependency))
    }

    async fn invalidate_dependency(&self, dependency: &DependencyKey) -> CacheResult<()> {
        self.lifecycle.ensure_ready()?;
        self.require_dependencies()?;
        let removed = self.inner.state.write()?.invalidate(dependency);
        self.inner.counters.record_invalidations(removed);
        tracing::debug!(dependency = %dependency, removed, "Invalidated dependency");
        Ok(())
    }

    async fn clear(&self) -> CacheResult<()> {
        self.lifecycle.ensure_ready()?;
        let mut state = self.inner.state.write()?;
        let cleared = state.items.len();
        *state = MemoryState::default();
        tracing::debug!(cleared, "Cleared memory backend");
        Ok(())
    }

    async fn dispose(&self) -> CacheResult<()> {
        if !self.lifecycle.begin_dispose() {
            return Ok(());
        }
        self.shutdown.cancel();
        let sweeper = self.sweeper.lock()?.take();
        if let Some(handle) = sweeper {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Expiration sweeper ended abnormally");
            }
        }
        self.inner.state.write()?.items.clear();
        self.lifecycle.complete_dispose();
        Ok(())
    }

    async fn stats(&self) -> CacheResult<CacheStats> {
        let entry_count = self.inner.state.read()?.items.len() as u64;
        Ok(self.inner.counters.snapshot(entry_count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_core::{CacheError, CacheItemPriority, CapabilityError};

    async fn backend_with(options: MemoryBackendOptions) -> MemoryBackend {
        let backend = MemoryBackend::new(options);
        backend
            .initialize(&CancellationToken::new())
            .await
            .unwrap();
        backend
    }

    async fn backend() -> MemoryBackend {
        backend_with(MemoryBackendOptions::new().with_expiration_scan_interval(None)).await
    }

    fn key(name: &str) -> CacheKey {
        CacheKey::from(name)
    }

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let backend = backend().await;
        backend
            .set_entry(&key("a"), CacheEntry::new("alpha".to_string()))
            .await
            .unwrap();

        let entry = backend.get_entry(&key("a")).await.unwrap().unwrap();
        assert_eq!(entry.value_as::<String>().map(String::as_str), Some("alpha"));
        assert!(backend.contains_key(&key("a")).await.unwrap());
        assert!(backend.get_entry(&key("b")).await.unwrap().is_none());

        let stats = backend.stats().await.unwrap();
        assert_eq!((stats.hits, stats.misses, stats.entry_count), (1, 1, 1));
    }

    #[tokio::test]
    async fn test_invalidate_evicts_all_dependents() {
        let backend = backend().await;
        let order = DependencyKey::from("order:1");
        backend
            .set_entry(&key("a"), CacheEntry::new(1i64).with_dependency("order:1"))
            .await
            .unwrap();
        backend
            .set_entry(
                &key("b"),
                CacheEntry::new(2i64).with_dependencies(["order:1", "customer:3"]),
            )
            .await
            .unwrap();
        backend
            .set_entry(&key("c"), CacheEntry::new(3i64).with_dependency("customer:3"))
            .await
            .unwrap();

        assert!(backend.contains_dependency(&order).await.unwrap());
        backend.invalidate_dependency(&order).await.unwrap();

        assert!(!backend.contains_key(&key("a")).await.unwrap());
        assert!(!backend.contains_key(&key("b")).await.unwrap());
        assert!(backend.contains_key(&key("c")).await.unwrap());
        assert!(!backend.contains_dependency(&order).await.unwrap());
        assert!(backend
            .contains_dependency(&DependencyKey::from("customer:3"))
            .await
            .unwrap());
        assert_eq!(backend.stats().await.unwrap().invalidations, 2);
    }

    #[tokio::test]
    async fn test_overwrite_replaces_dependencies() {
        let backend = backend().await;
        backend
            .set_entry(&key("a"), CacheEntry::new(1i64).with_dependency("old"))
            .await
            .unwrap();
        backend
            .set_entry(&key("a"), CacheEntry::new(2i64).with_dependency("new"))
            .await
            .unwrap();

        backend
            .invalidate_dependency(&DependencyKey::from("old"))
            .await
            .unwrap();
        let entry = backend.get_entry(&key("a")).await.unwrap().unwrap();
        assert_eq!(entry.value_as::<i64>(), Some(&2));
    }

    #[tokio::test]
    async fn test_capacity_evicts_least_recently_used() {
        let backend =
            backend_with(MemoryBackendOptions::new().with_capacity(Some(2)).with_expiration_scan_interval(None))
                .await;
        backend.set_entry(&key("a"), CacheEntry::new(1i64)).await.unwrap();
        backend.set_entry(&key("b"), CacheEntry::new(2i64)).await.unwrap();
        // Touch "a" so "b" becomes the oldest.
        backend.get_entry(&key("a")).await.unwrap();
        backend.set_entry(&key("c"), CacheEntry::new(3i64)).await.unwrap();

        assert!(backend.contains_key(&key("a")).await.unwrap());
        assert!(!backend.contains_key(&key("b")).await.unwrap());
        assert!(backend.contains_key(&key("c")).await.unwrap());
        assert_eq!(backend.stats().await.unwrap().evictions, 1);
    }

    #[tokio::test]
    async fn test_not_removable_survives_capacity_pressure() {
        let backend =
            backend_with(MemoryBackendOptions::new().with_capacity(Some(1)).with_expiration_scan_interval(None))
                .await;
        backend
            .set_entry(
                &key("pinned"),
                CacheEntry::new(1i64).with_priority(CacheItemPriority::NotRemovable),
            )
            .await
            .unwrap();
        backend.set_entry(&key("b"), CacheEntry::new(2i64)).await.unwrap();
        backend.set_entry(&key("c"), CacheEntry::new(3i64)).await.unwrap();

        assert!(backend.contains_key(&key("pinned")).await.unwrap());
        assert!(!backend.contains_key(&key("b")).await.unwrap());
        assert!(!backend.contains_key(&key("c")).await.unwrap());
    }

    #[tokio::test]
    async fn test_not_removable_still_invalidated_explicitly() {
        let backend = backend().await;
        backend
            .set_entry(
                &key("pinned"),
                CacheEntry::new(1i64)
                    .with_priority(CacheItemPriority::NotRemovable)
                    .with_dependency("d"),
            )
            .await
            .unwrap();
        backend
            .invalidate_dependency(&DependencyKey::from("d"))
            .await
            .unwrap();
        assert!(!backend.contains_key(&key("pinned")).await.unwrap());
    }

    #[tokio::test]
    async fn test_absolute_expiration_misses() {
        let backend = backend().await;
        backend
            .set_entry(
                &key("a"),
                CacheEntry::new(1i64)
                    .with_absolute_expiration(Utc::now() - chrono::Duration::seconds(1)),
            )
            .await
            .unwrap();

        assert!(!backend.contains_key(&key("a")).await.unwrap());
        assert!(backend.get_entry(&key("a")).await.unwrap().is_none());
        assert_eq!(backend.stats().await.unwrap().expirations, 1);
    }

    #[tokio::test]
    async fn test_sliding_expiration_refreshes_on_access() {
        let backend = backend().await;
        backend
            .set_entry(
                &key("a"),
                CacheEntry::new(1i64).with_sliding_expiration(Duration::from_millis(200)),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(backend.get_entry(&key("a")).await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(backend.get_entry(&key("a")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let backend = backend().await;
        let past = Utc::now() - chrono::Duration::seconds(5);
        backend
            .set_entry(&key("old"), CacheEntry::new(1i64).with_absolute_expiration(past))
            .await
            .unwrap();
        backend.set_entry(&key("live"), CacheEntry::new(2i64)).await.unwrap();

        assert_eq!(backend.purge_expired().unwrap(), 1);
        assert_eq!(backend.stats().await.unwrap().entry_count, 1);
    }

    #[tokio::test]
    async fn test_background_sweep_removes_expired() {
        let backend = backend_with(
            MemoryBackendOptions::new()
                .with_expiration_scan_interval(Some(Duration::from_millis(20))),
        )
        .await;
        backend
            .set_entry(
                &key("a"),
                CacheEntry::new(1i64)
                    .with_absolute_expiration(Utc::now() + chrono::Duration::milliseconds(30)),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        let stats = backend.stats().await.unwrap();
        assert_eq!(stats.entry_count, 0);
        assert_eq!(stats.expirations, 1);

        backend.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_dependencies_rejected_without_index() {
        let backend = backend_with(
            MemoryBackendOptions::new()
                .without_dependencies()
                .with_expiration_scan_interval(None),
        )
        .await;
        assert!(!backend.capabilities().supports_dependencies);

        let err = backend
            .set_entry(&key("a"), CacheEntry::new(1i64).with_dependency("d"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CacheError::Capability(CapabilityError::DependenciesUnsupported { .. })
        ));

        let err = backend
            .invalidate_dependency(&DependencyKey::from("d"))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Capability(_)));

        backend.set_entry(&key("a"), CacheEntry::new(1i64)).await.unwrap();
    }

    #[tokio::test]
    async fn test_clear_and_remove() {
        let backend = backend().await;
        backend.set_entry(&key("a"), CacheEntry::new(1i64)).await.unwrap();
        backend.set_entry(&key("b"), CacheEntry::new(2i64)).await.unwrap();

        assert!(backend.remove_entry(&key("a")).await.unwrap());
        assert!(!backend.remove_entry(&key("a")).await.unwrap());

        backend.clear().await.unwrap();
        assert!(!backend.contains_key(&key("b")).await.unwrap());
    }
}
