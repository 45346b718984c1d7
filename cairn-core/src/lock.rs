//! Named lock factory.
//!
//! Process-local mutual exclusion per string key. Locks are reference
//! counted: a [`NamedLock`] lives in the registry only while at least one
//! [`LockHandle`] references it.
//!
//! # Handle Lifecycle
//!
//! ```text
//! get_lock() ──→ Idle ─── acquire() ──→ Acquired ─── release() ──→ Idle
//!                 │                        │
//!             dispose() / drop         acquire() again = ProgrammingError
//!                 │                    dispose()       = ProgrammingError
//!                 ↓
//!          reference released
//! ```
//!
//! `get_lock` never blocks; only [`LockHandle::acquire`] waits, bounded by its
//! timeout and cancellation token. A cancelled or timed-out acquire returns
//! `Ok(false)`, never an error.

use crate::{CacheResult, ProgrammingError};
use dashmap::DashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// Source of named lock handles.
pub trait LockFactory: Send + Sync {
    /// Return a handle for `key` without blocking.
    fn get_lock(&self, key: &str) -> LockHandle;
}

// ============================================================================
// REGISTRY
// ============================================================================

#[derive(Debug, Default)]
struct NamedLockState {
    reference_count: usize,
    /// Set by the handle that observed the count reaching zero. A retired
    /// lock has been (or is being) removed and must not be resurrected.
    retired: bool,
}

#[derive(Debug)]
struct NamedLock {
    key: String,
    state: Mutex<NamedLockState>,
    semaphore: Arc<Semaphore>,
}

impl NamedLock {
    fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            state: Mutex::new(NamedLockState::default()),
            semaphore: Arc::new(Semaphore::new(1)),
        }
    }

    // The guarded state is two plain fields, so a poisoned guard is still
    // consistent.
    fn state(&self) -> MutexGuard<'_, NamedLockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Default)]
struct LockRegistry {
    locks: DashMap<String, Arc<NamedLock>>,
}

impl LockRegistry {
    fn add_reference(&self, key: &str) -> Arc<NamedLock> {
        loop {
            // The shard guard is released at the end of this statement, before
            // the per-lock guard is taken.
            let lock = Arc::clone(
                self.locks
                    .entry(key.to_string())
                    .or_insert_with(|| Arc::new(NamedLock::new(key)))
                    .value(),
            );

            let mut state = lock.state();
            if state.retired {
                // Lost the race against the last handle's removal; the entry is
                // gone or about to be, so insert a fresh one.
                drop(state);
                continue;
            }
            state.reference_count += 1;
            drop(state);
            return lock;
        }
    }

    fn remove_reference(&self, lock: &Arc<NamedLock>) {
        let mut state = lock.state();
        state.reference_count = state.reference_count.saturating_sub(1);
        if state.reference_count == 0 {
            state.retired = true;
            self.locks
                .remove_if(&lock.key, |_, current| Arc::ptr_eq(current, lock));
        }
    }
}

// ============================================================================
// FACTORIES
// ============================================================================

/// Per-process lock factory backed by a reference-counted registry.
#[derive(Debug, Clone, Default)]
pub struct LocalLockFactory {
    registry: Arc<LockRegistry>,
}

impl LocalLockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the registry currently holds a lock for `key`.
    pub fn is_registered(&self, key: &str) -> bool {
        self.registry.locks.contains_key(key)
    }

    /// Number of live named locks.
    pub fn registered_count(&self) -> usize {
        self.registry.locks.len()
    }

    /// Outstanding handles for `key`, if registered.
    pub fn reference_count(&self, key: &str) -> Option<usize> {
        let lock = self
            .registry
            .locks
            .get(key)
            .map(|entry| Arc::clone(entry.value()))?;
        let count = lock.state().reference_count;
        Some(count)
    }
}

impl LockFactory for LocalLockFactory {
    fn get_lock(&self, key: &str) -> LockHandle {
        let lock = self.registry.add_reference(key);
        LockHandle {
            key: key.to_string(),
            kind: HandleKind::Local {
                registry: Arc::clone(&self.registry),
                lock,
            },
            permit: None,
            acquired: false,
        }
    }
}

/// Factory whose handles always acquire immediately.
///
/// Suitable when a single caller owns the cache or when stampede protection
/// is not wanted. Handles still enforce the acquire/release contract.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLockFactory;

impl LockFactory for NoopLockFactory {
    fn get_lock(&self, key: &str) -> LockHandle {
        LockHandle {
            key: key.to_string(),
            kind: HandleKind::Noop,
            permit: None,
            acquired: false,
        }
    }
}

// ============================================================================
// HANDLE
// ============================================================================

enum HandleKind {
    Noop,
    Local {
        registry: Arc<LockRegistry>,
        lock: Arc<NamedLock>,
    },
}

/// A reference to a named lock.
///
/// Dropping the handle releases both the lock (if held) and the reference.
/// Prefer [`dispose`](Self::dispose), which reports disposal of a still
/// acquired handle as a [`ProgrammingError`].
pub struct LockHandle {
    key: String,
    kind: HandleKind,
    permit: Option<OwnedSemaphorePermit>,
    acquired: bool,
}

impl LockHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_acquired(&self) -> bool {
        self.acquired
    }

    /// Wait up to `timeout` for the lock.
    ///
    /// Returns `Ok(false)` on timeout or cancellation. Calling it again
    /// without an intervening [`release`](Self::release) is a
    /// [`ProgrammingError::ReentrantAcquire`].
    pub async fn acquire(
        &mut self,
        timeout: Duration,
        cancellation: &CancellationToken,
    ) -> CacheResult<bool> {
        if self.acquired {
            return Err(ProgrammingError::ReentrantAcquire {
                key: self.key.clone(),
            }
            .into());
        }

        let semaphore = match &self.kind {
            HandleKind::Noop => {
                self.acquired = true;
                return Ok(true);
            }
            HandleKind::Local { lock, .. } => Arc::clone(&lock.semaphore),
        };

        let permit = tokio::select! {
            biased;
            _ = cancellation.cancelled() => None,
            result = tokio::time::timeout(timeout, semaphore.acquire_owned()) => {
                // The semaphore is never closed, so the inner error is unreachable.
                result.ok().and_then(Result::ok)
            }
        };

        match permit {
            Some(permit) => {
                self.permit = Some(permit);
                self.acquired = true;
                Ok(true)
            }
            None => {
                tracing::debug!(
                    key = %self.key,
                    timeout_ms = timeout.as_millis() as u64,
                    cancelled = cancellation.is_cancelled(),
                    "Named lock not acquired"
                );
                Ok(false)
            }
        }
    }

    /// Release the lock. A no-op when not acquired.
    pub fn release(&mut self) {
        self.permit = None;
        self.acquired = false;
    }

    /// Give up this handle's reference.
    ///
    /// Fails with [`ProgrammingError::DisposedWhileAcquired`] if the lock is
    /// still held; the lock and reference are released regardless.
    pub fn dispose(self) -> CacheResult<()> {
        if self.acquired {
            let key = self.key.clone();
            let mut handle = self;
            handle.release();
            return Err(ProgrammingError::DisposedWhileAcquired { key }.into());
        }
        Ok(())
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if self.acquired {
            tracing::warn!(key = %self.key, "Lock handle dropped while acquired");
            self.release();
        }
        if let HandleKind::Local { registry, lock } = &self.kind {
            registry.remove_reference(lock);
        }
    }
}

impl fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            HandleKind::Noop => "noop",
            HandleKind::Local { .. } => "local",
        };
        f.debug_struct("LockHandle")
            .field("key", &self.key)
            .field("kind", &kind)
            .field("acquired", &self.acquired)
            .finish()
    }
}
