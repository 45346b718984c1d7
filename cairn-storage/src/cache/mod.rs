//! Caching backends and enhancers.
//!
//! Every store and every enhancer implements [`CachingBackend`], so stacks
//! compose freely:
//!
//! ```text
//! LayeredBackend ── near: MemoryBackend
//!        └──────── far:  NonBlockingBackend ─→ DistributedBackend ─→ LmdbBackend
//! ```
//!
//! Stores: [`NullBackend`] (always misses), [`UninitializedBackend`] (always
//! faults), [`MemoryBackend`] and [`LmdbBackend`]. Enhancers:
//! [`LayeredBackend`], [`NonBlockingBackend`] and [`DistributedBackend`].
//! [`CachingBackendBuilder`] assembles and initializes a stack.
//!
//! # Example
//!
//! ```ignore
//! let backend = CachingBackendBuilder::from_settings(&settings, Some(transport))?
//!     .build(&CancellationToken::new())
//!     .await?;
//!
//! backend
//!     .set_entry(&"product:7".into(), CacheEntry::new(product).with_dependency("catalog"))
//!     .await?;
//! backend.invalidate_dependency(&"catalog".into()).await?;
//! ```

pub mod blocking;
pub mod builder;
pub mod distributed;
pub mod layered;
pub mod lifecycle;
pub mod lmdb_backend;
pub mod memory;
pub mod non_blocking;
pub mod null;
pub mod read_through;
pub mod traits;
pub mod uninitialized;

pub use blocking::BlockingBackend;
pub use builder::CachingBackendBuilder;
pub use distributed::DistributedBackend;
pub use layered::{LayeredBackend, LayeredStats};
pub use lifecycle::{check_cancelled, BackendStatus, Lifecycle};
pub use lmdb_backend::{LmdbBackend, LmdbOptions};
pub use memory::{MemoryBackend, MemoryBackendOptions};
pub use non_blocking::{NonBlockingBackend, NonBlockingOptions, QueueStats, WriteHandle};
pub use null::NullBackend;
pub use read_through::{ItemOptions, LockTimeoutBehavior, ReadThroughCache, ReadThroughConfig};
pub use traits::{BackendCapabilities, BackendDescriptor, CacheStats, CachingBackend, StatCounters};
pub use uninitialized::UninitializedBackend;
