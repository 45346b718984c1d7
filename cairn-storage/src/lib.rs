//! Cairn Storage - Caching Backends, Enhancers and Invalidation
//!
//! Implements the [`CachingBackend`] contract over the entry model in
//! `cairn-core`: null, uninitialized, in-memory and LMDB stores, the layered
//! and non-blocking enhancers, the distributed invalidation broker, and the
//! builder that assembles them.

pub mod broker;
pub mod cache;

pub use broker::{
    BrokerOptions, BrokerStats, InMemoryTransport, InvalidationBroker, InvalidationKind,
    InvalidationMessage, ListenerId, PubSubTransport, Subscription, SubscriptionEvent,
};

pub use cache::{
    BackendCapabilities, BackendDescriptor, BackendStatus, BlockingBackend, CacheStats,
    CachingBackend, CachingBackendBuilder, DistributedBackend, ItemOptions, LayeredBackend,
    LayeredStats, LmdbBackend, LmdbOptions, LockTimeoutBehavior, MemoryBackend,
    MemoryBackendOptions, NonBlockingBackend, NonBlockingOptions, NullBackend, QueueStats,
    ReadThroughCache, ReadThroughConfig, UninitializedBackend, WriteHandle,
};
