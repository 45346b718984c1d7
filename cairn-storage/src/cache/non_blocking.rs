//! Write-behind enhancer.
//!
//! `set_entry` and `invalidate_dependency` are pushed onto a bounded queue
//! and return as soon as the queue accepts them; one background worker
//! applies them to the inner backend in submission order.
//!
//! Reads see queued writes. Until the worker has applied them, a queued set
//! or remove answers reads of its key, and an entry tied to a dependency
//! with a queued invalidation reads as a miss. A layered stack over this
//! enhancer therefore cannot copy an invalidated entry back into its near
//! tier. Call [`NonBlockingBackend::drain`] to wait for the inner backend.
//!
//! A full queue applies backpressure: the submitting call waits for room.
//! Nothing is ever dropped. Crossing the high-water mark logs a warning.
//!
//! Disposal closes the queue, waits for the worker to apply everything
//! still queued, and only then disposes the inner backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use cairn_core::{CacheEntry, CacheKey, CacheResult, DependencyKey, StorageError, Timestamp};
use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::lifecycle::{BackendStatus, Lifecycle};
use super::traits::{BackendCapabilities, BackendDescriptor, CacheStats, CachingBackend};

/// Default number of queued writes before submitters wait.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonBlockingOptions {
    pub queue_capacity: usize,
    /// Queue depth at which a warning is logged.
    pub high_water: usize,
}

impl NonBlockingOptions {
    /// Options for a queue of `queue_capacity` writes, warning at 75% full.
    pub fn new(queue_capacity: usize) -> Self {
        let queue_capacity = queue_capacity.max(1);
        Self {
            queue_capacity,
            high_water: queue_capacity - queue_capacity / 4,
        }
    }

    /// Clamped to `1..=queue_capacity`; a mark of zero could never be hit.
    pub fn with_high_water(mut self, high_water: usize) -> Self {
        self.high_water = high_water.min(self.queue_capacity).max(1);
        self
    }
}

impl Default for NonBlockingOptions {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

/// Snapshot of the write queue counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub enqueued: u64,
    pub applied: u64,
    pub failed: u64,
    pub depth: u64,
    pub high_water_crossings: u64,
}

#[derive(Debug, Default)]
struct QueueCounters {
    enqueued: AtomicU64,
    applied: AtomicU64,
    failed: AtomicU64,
    depth: AtomicU64,
    high_water_crossings: AtomicU64,
}

#[derive(Debug)]
enum WriteOp {
    Set { key: CacheKey, entry: CacheEntry },
    Remove { key: CacheKey },
    Invalidate { dependency: DependencyKey },
    Clear,
    /// Completes once every earlier write has been applied.
    Barrier,
}

impl WriteOp {
    fn name(&self) -> &'static str {
        match self {
            WriteOp::Set { .. } => "set",
            WriteOp::Remove { .. } => "remove",
            WriteOp::Invalidate { .. } => "invalidate",
            WriteOp::Clear => "clear",
            WriteOp::Barrier => "barrier",
        }
    }
}

/// Outcome of a queued write: `Ok(true)` unless a remove found nothing.
type Completion = oneshot::Sender<CacheResult<bool>>;

#[derive(Debug)]
struct QueuedWrite {
    seq: u64,
    op: WriteOp,
    completion: Option<Completion>,
}

/// How a queued write leaves one key.
#[derive(Debug, Clone)]
enum PendingValue {
    Set(CacheEntry),
    Removed,
}

/// Answer to a read, given the writes still queued.
#[derive(Debug)]
enum Lookup {
    /// A queued write decides the result.
    Queued(Option<CacheEntry>),
    /// Nothing queued for the key. `epoch` is checked again once the inner
    /// read returns.
    Inner { epoch: u64, invalidating: bool },
}

/// Writes accepted by the queue but not yet applied, tagged with their
/// queue sequence number.
#[derive(Debug, Default)]
struct PendingState {
    next_seq: u64,
    keys: HashMap<CacheKey, (u64, PendingValue)>,
    dependencies: HashMap<DependencyKey, u64>,
    cleared: Option<u64>,
    /// Bumped whenever an invalidation or clear has been applied.
    epoch: u64,
}

impl PendingState {
    fn record(&mut self, op: &WriteOp) -> u64 {
        self.next_seq += 1;
        let seq = self.next_seq;
        match op {
            WriteOp::Set { key, entry } => {
                self.keys
                    .insert(key.clone(), (seq, PendingValue::Set(entry.clone())));
            }
            WriteOp::Remove { key } => {
                self.keys.insert(key.clone(), (seq, PendingValue::Removed));
            }
            WriteOp::Invalidate { dependency } => {
                self.dependencies.insert(dependency.clone(), seq);
                for (pending_seq, value) in self.keys.values_mut() {
                    let tied = matches!(
                        value,
                        PendingValue::Set(entry) if entry.dependencies.contains(dependency)
                    );
                    if tied {
                        *pending_seq = seq;
                        *value = PendingValue::Removed;
                    }
                }
            }
            WriteOp::Clear => {
                self.keys.clear();
                self.dependencies.clear();
                self.cleared = Some(seq);
            }
            WriteOp::Barrier => {}
        }
        seq
    }

    fn lookup(&self, key: &CacheKey, now: Timestamp) -> Lookup {
        match self.keys.get(key) {
            Some((_, PendingValue::Set(entry))) => {
                Lookup::Queued(Some(entry.clone()).filter(|entry| !entry.is_expired_at(now, now)))
            }
            Some((_, PendingValue::Removed)) => Lookup::Queued(None),
            None if self.cleared.is_some() => Lookup::Queued(None),
            None => Lookup::Inner {
                epoch: self.epoch,
                invalidating: !self.dependencies.is_empty(),
            },
        }
    }

    /// Whether an entry read from the inner backend is still current.
    fn admits(&self, entry: &CacheEntry, epoch: u64) -> bool {
        self.epoch == epoch
            && self.cleared.is_none()
            && !entry
                .dependencies
                .iter()
                .any(|dependency| self.dependencies.contains_key(dependency))
    }

    fn dependency_state(&self, dependency: &DependencyKey) -> Option<bool> {
        let queued = self.keys.values().any(|(_, value)| {
            matches!(value, PendingValue::Set(entry) if entry.dependencies.contains(dependency))
        });
        if queued {
            Some(true)
        } else if self.cleared.is_some() || self.dependencies.contains_key(dependency) {
            Some(false)
        } else {
            None
        }
    }

    fn settle_key(&mut self, key: &CacheKey, seq: u64) {
        if self.keys.get(key).is_some_and(|(pending, _)| *pending == seq) {
            self.keys.remove(key);
        }
    }

    fn settle_invalidation(&mut self, dependency: &DependencyKey, seq: u64) {
        if self.dependencies.get(dependency) == Some(&seq) {
            self.dependencies.remove(dependency);
        }
        self.keys.retain(|_, (pending, _)| *pending != seq);
        self.epoch += 1;
    }

    fn settle_clear(&mut self, seq: u64) {
        if self.cleared == Some(seq) {
            self.cleared = None;
        }
        self.epoch += 1;
    }
}

/// Shared between the enhancer and its worker.
#[derive(Debug, Default)]
struct PendingWrites {
    state: Mutex<PendingState>,
}

impl PendingWrites {
    /// The state stays consistent across a panic elsewhere, so a poisoned
    /// lock is still usable.
    fn lock(&self) -> MutexGuard<'_, PendingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Completion handle for one queued write.
#[derive(Debug)]
pub struct WriteHandle {
    receiver: oneshot::Receiver<CacheResult<bool>>,
}

impl WriteHandle {
    /// Wait until the worker has applied the write and return its outcome.
    pub async fn wait(self) -> CacheResult<()> {
        await_completion(self.receiver).await.map(|_| ())
    }
}

async fn await_completion(receiver: oneshot::Receiver<CacheResult<bool>>) -> CacheResult<bool> {
    receiver.await.map_err(|_| StorageError::WorkerFailed {
        reason: "write queue worker stopped before completing the write".to_string(),
    })?
}

#[derive(Debug)]
pub struct NonBlockingBackend {
    inner: Arc<dyn CachingBackend>,
    options: NonBlockingOptions,
    sender: Mutex<Option<mpsc::Sender<QueuedWrite>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<QueueCounters>,
    pending: Arc<PendingWrites>,
    lifecycle: Lifecycle,
    layer: u32,
}

impl NonBlockingBackend {
    pub fn new(inner: Arc<dyn CachingBackend>, options: NonBlockingOptions) -> Self {
        Self {
            inner,
            options,
            sender: Mutex::new(None),
            worker: Mutex::new(None),
            counters: Arc::new(QueueCounters::default()),
            pending: Arc::new(PendingWrites::default()),
            lifecycle: Lifecycle::new("non_blocking"),
            layer: 1,
        }
    }

    pub fn with_layer(mut self, layer: u32) -> Self {
        self.layer = layer;
        self
    }

    pub fn options(&self) -> &NonBlockingOptions {
        &self.options
    }

    pub fn queue_stats(&self) -> QueueStats {
        QueueStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            applied: self.counters.applied.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            depth: self.counters.depth.load(Ordering::Relaxed),
            high_water_crossings: self.counters.high_water_crossings.load(Ordering::Relaxed),
        }
    }

    /// Queue a set and return a handle for its outcome.
    pub async fn submit_set(&self, key: &CacheKey, entry: CacheEntry) -> CacheResult<WriteHandle> {
        self.check_dependencies(&entry)?;
        self.enqueue_tracked(WriteOp::Set {
            key: key.clone(),
            entry,
        })
        .await
    }

    pub async fn submit_remove(&self, key: &CacheKey) -> CacheResult<WriteHandle> {
        self.enqueue_tracked(WriteOp::Remove { key: key.clone() })
            .await
    }

    pub async fn submit_invalidate(&self, dependency: &DependencyKey) -> CacheResult<WriteHandle> {
        self.inner
            .capabilities()
            .require_dependencies(self.descriptor())?;
        self.enqueue_tracked(WriteOp::Invalidate {
            dependency: dependency.clone(),
        })
        .await
    }

    /// Wait until every write queued before this call has been applied.
    pub async fn drain(&self) -> CacheResult<()> {
        self.enqueue_tracked(WriteOp::Barrier).await?.wait().await
    }

    fn check_dependencies(&self, entry: &CacheEntry) -> CacheResult<()> {
        if entry.has_dependencies() {
            self.inner
                .capabilities()
                .require_dependencies(self.descriptor())?;
        }
        Ok(())
    }

    async fn enqueue_tracked(&self, op: WriteOp) -> CacheResult<WriteHandle> {
        let (completion, receiver) = oneshot::channel();
        self.enqueue(op, Some(completion)).await?;
        Ok(WriteHandle { receiver })
    }

    async fn enqueue(&self, op: WriteOp, completion: Option<Completion>) -> CacheResult<()> {
        self.lifecycle.ensure_ready()?;
        // A write the inner backend would refuse is refused here, not logged
        // by the worker later.
        if !matches!(op, WriteOp::Barrier) {
            self.inner.status().require_ready(self.inner.descriptor())?;
        }
        let sender = self
            .sender
            .lock()?
            .clone()
            .ok_or(StorageError::QueueClosed)?;

        let depth = self.counters.depth.fetch_add(1, Ordering::AcqRel) + 1;
        if depth == self.options.high_water as u64 {
            self.counters
                .high_water_crossings
                .fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                backend = %self.descriptor(),
                depth,
                capacity = self.options.queue_capacity,
                "Write queue reached high-water mark"
            );
        }

        let Ok(permit) = sender.reserve().await else {
            self.counters.depth.fetch_sub(1, Ordering::AcqRel);
            return Err(StorageError::QueueClosed.into());
        };
        {
            // Sequence numbers follow queue order.
            let mut pending = self.pending.lock();
            let seq = pending.record(&op);
            permit.send(QueuedWrite {
                seq,
                op,
                completion,
            });
        }
        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn start_worker(&self) -> CacheResult<()> {
        let (sender, receiver) = mpsc::channel(self.options.queue_capacity.max(1));
        let worker = tokio::spawn(run_worker(
            Arc::clone(&self.inner),
            receiver,
            Arc::clone(&self.counters),
            Arc::clone(&self.pending),
        ));
        *self.sender.lock()? = Some(sender);
        *self.worker.lock()? = Some(worker);
        Ok(())
    }

    async fn stop_worker(&self) -> CacheResult<()> {
        // Dropping the last sender lets the worker drain and exit.
        self.sender.lock()?.take();
        let worker = self.worker.lock()?.take();
        if let Some(worker) = worker {
            worker.await.map_err(|e| StorageError::WorkerFailed {
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }
}

async fn run_worker(
    inner: Arc<dyn CachingBackend>,
    mut receiver: mpsc::Receiver<QueuedWrite>,
    counters: Arc<QueueCounters>,
    pending: Arc<PendingWrites>,
) {
    while let Some(QueuedWrite {
        seq,
        op,
        completion,
    }) = receiver.recv().await
    {
        counters.depth.fetch_sub(1, Ordering::AcqRel);
        let name = op.name();
        let is_barrier = matches!(op, WriteOp::Barrier);

        // Settled whether or not the write succeeded; reads then go to the
        // inner backend, which holds whatever the write left behind.
        let result = match op {
            WriteOp::Set { key, entry } => {
                let result = inner.set_entry(&key, entry).await.map(|()| true);
                pending.lock().settle_key(&key, seq);
                result
            }
            WriteOp::Remove { key } => {
                let result = inner.remove_entry(&key).await;
                pending.lock().settle_key(&key, seq);
                result
            }
            WriteOp::Invalidate { dependency } => {
                let result = inner
                    .invalidate_dependency(&dependency)
                    .await
                    .map(|()| true);
                pending.lock().settle_invalidation(&dependency, seq);
                result
            }
            WriteOp::Clear => {
                let result = inner.clear().await.map(|()| true);
                pending.lock().settle_clear(seq);
                result
            }
            WriteOp::Barrier => Ok(true),
        };

        match &result {
            Ok(_) if is_barrier => {}
            Ok(_) => {
                counters.applied.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                if completion.is_none() {
                    tracing::warn!(
                        backend = %inner.descriptor(),
                        operation = name,
                        error = %e,
                        "Queued write failed"
                    );
                }
            }
        }

        if let Some(completion) = completion {
            // The submitter may have stopped waiting.
            let _ = completion.send(result);
        }
    }
    tracing::debug!(backend = %inner.descriptor(), "Write queue worker stopped");
}

#[async_trait]
impl CachingBackend for NonBlockingBackend {
    fn descriptor(&self) -> BackendDescriptor {
        BackendDescriptor::new("non_blocking", self.layer)
    }

    fn capabilities(&self) -> BackendCapabilities {
        self.inner.capabilities()
    }

    fn status(&self) -> BackendStatus {
        self.lifecycle.status()
    }

    async fn initialize(&self, cancellation: &CancellationToken) -> CacheResult<()> {
        self.lifecycle
            .run_initialize(|| async {
                self.inner.initialize(cancellation).await?;
                self.start_worker()
            })
            .await
    }

    async fn get_entry(&self, key: &CacheKey) -> CacheResult<Option<CacheEntry>> {
        self.lifecycle.ensure_ready()?;
        let lookup = self.pending.lock().lookup(key, Utc::now());
        let epoch = match lookup {
            Lookup::Queued(entry) => return Ok(entry),
            Lookup::Inner { epoch, .. } => epoch,
        };
        let entry = self.inner.get_entry(key).await?;
        Ok(entry.filter(|entry| self.pending.lock().admits(entry, epoch)))
    }

    async fn set_entry(&self, key: &CacheKey, entry: CacheEntry) -> CacheResult<()> {
        self.check_dependencies(&entry)?;
        self.enqueue(
            WriteOp::Set {
                key: key.clone(),
                entry,
            },
            None,
        )
        .await
    }

    async fn contains_key(&self, key: &CacheKey) -> CacheResult<bool> {
        self.lifecycle.ensure_ready()?;
        let lookup = self.pending.lock().lookup(key, Utc::now());
        match lookup {
            Lookup::Queued(entry) => Ok(entry.is_some()),
            Lookup::Inner {
                epoch,
                invalidating: true,
            } => Ok(self
                .inner
                .get_entry(key)
                .await?
                .is_some_and(|entry| self.pending.lock().admits(&entry, epoch))),
            Lookup::Inner { .. } => self.inner.contains_key(key).await,
        }
    }

    /// Queued behind earlier writes; waits for the outcome so the returned
    /// flag is accurate.
    async fn remove_entry(&self, key: &CacheKey) -> CacheResult<bool> {
        let (completion, receiver) = oneshot::channel();
        self.enqueue(WriteOp::Remove { key: key.clone() }, Some(completion))
            .await?;
        await_completion(receiver).await
    }

    async fn contains_dependency(&self, dependency: &DependencyKey) -> CacheResult<bool> {
        self.lifecycle.ensure_ready()?;
        let queued = self.pending.lock().dependency_state(dependency);
        match queued {
            Some(present) => Ok(present),
            None => self.inner.contains_dependency(dependency).await,
        }
    }

    async fn invalidate_dependency(&self, dependency: &DependencyKey) -> CacheResult<()> {
        self.lifecycle.ensure_ready()?;
        self.inner
            .capabilities()
            .require_dependencies(self.descriptor())?;
        self.enqueue(
            WriteOp::Invalidate {
                dependency: dependency.clone(),
            },
            None,
        )
        .await
    }

    async fn clear(&self) -> CacheResult<()> {
        self.enqueue_tracked(WriteOp::Clear).await?.wait().await
    }

    async fn dispose(&self) -> CacheResult<()> {
        if !self.lifecycle.begin_dispose() {
            return Ok(());
        }
        let worker = self.stop_worker().await;
        let inner = self.inner.dispose().await;
        self.lifecycle.complete_dispose();
        worker.and(inner)
    }

    async fn stats(&self) -> CacheResult<CacheStats> {
        self.inner.stats().await
    }
}
