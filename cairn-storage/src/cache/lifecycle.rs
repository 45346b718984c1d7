//! Backend lifecycle state machine.
//!
//! `Uninitialized -> Initializing -> Ready -> Disposing -> Disposed`, with a
//! failed or cancelled initialization falling back to `Uninitialized` so it
//! can be retried.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};

use cairn_core::{CacheError, CacheResult, ProgrammingError};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendStatus {
    Uninitialized,
    Initializing,
    Ready,
    Disposing,
    Disposed,
}

impl BackendStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendStatus::Uninitialized => "uninitialized",
            BackendStatus::Initializing => "initializing",
            BackendStatus::Ready => "ready",
            BackendStatus::Disposing => "disposing",
            BackendStatus::Disposed => "disposed",
        }
    }

    /// Fault unless `Ready`, naming `backend` in the error.
    pub fn require_ready(self, backend: impl fmt::Display) -> CacheResult<()> {
        match self {
            BackendStatus::Ready => Ok(()),
            BackendStatus::Disposing | BackendStatus::Disposed => Err(ProgrammingError::Disposed {
                backend: backend.to_string(),
            }
            .into()),
            status => Err(ProgrammingError::NotReady {
                backend: backend.to_string(),
                status: status.to_string(),
            }
            .into()),
        }
    }

    fn as_u8(self) -> u8 {
        self as u8
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => BackendStatus::Uninitialized,
            1 => BackendStatus::Initializing,
            2 => BackendStatus::Ready,
            3 => BackendStatus::Disposing,
            _ => BackendStatus::Disposed,
        }
    }
}

impl fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Atomic lifecycle shared by every backend implementation.
#[derive(Debug)]
pub struct Lifecycle {
    kind: &'static str,
    state: AtomicU8,
}

impl Lifecycle {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            state: AtomicU8::new(BackendStatus::Uninitialized.as_u8()),
        }
    }

    pub fn status(&self) -> BackendStatus {
        BackendStatus::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Claim the `Uninitialized -> Initializing` transition.
    ///
    /// `Ok(false)` means the backend is already ready.
    pub fn begin_initialize(&self) -> CacheResult<bool> {
        match self.state.compare_exchange(
            BackendStatus::Uninitialized.as_u8(),
            BackendStatus::Initializing.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(true),
            Err(actual) => match BackendStatus::from_u8(actual) {
                BackendStatus::Ready => Ok(false),
                status => status.require_ready(self.kind).map(|()| false),
            },
        }
    }

    /// Settle an initialization claimed by [`begin_initialize`](Self::begin_initialize).
    pub fn complete_initialize(&self, result: &CacheResult<()>) {
        let next = if result.is_ok() {
            BackendStatus::Ready
        } else {
            BackendStatus::Uninitialized
        };
        // A concurrent dispose wins over a late initialization.
        let _ = self.state.compare_exchange(
            BackendStatus::Initializing.as_u8(),
            next.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        match result {
            Ok(()) => tracing::debug!(backend = self.kind, "Backend ready"),
            Err(e) => tracing::debug!(backend = self.kind, error = %e, "Backend initialization failed"),
        }
    }

    /// Run `init` once, moving through `Initializing` to `Ready`.
    pub async fn run_initialize<F, Fut>(&self, init: F) -> CacheResult<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CacheResult<()>>,
    {
        if !self.begin_initialize()? {
            return Ok(());
        }
        let result = init().await;
        self.complete_initialize(&result);
        result
    }

    pub fn ensure_ready(&self) -> CacheResult<()> {
        self.status().require_ready(self.kind)
    }

    /// Claim the transition to `Disposing`. `false` if already disposing.
    pub fn begin_dispose(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            match BackendStatus::from_u8(current) {
                BackendStatus::Disposing | BackendStatus::Disposed => return false,
                _ => {}
            }
            match self.state.compare_exchange_weak(
                current,
                BackendStatus::Disposing.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn complete_dispose(&self) {
        self.state
            .store(BackendStatus::Disposed.as_u8(), Ordering::Release);
        tracing::debug!(backend = self.kind, "Backend disposed");
    }
}

/// Fail with [`TimeoutError::Cancelled`](cairn_core::TimeoutError::Cancelled)
/// if `cancellation` has fired.
pub fn check_cancelled(cancellation: &CancellationToken, operation: &str) -> CacheResult<()> {
    if cancellation.is_cancelled() {
        Err(CacheError::cancelled(operation))
    } else {
        Ok(())
    }
}
