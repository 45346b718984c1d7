//! Fluent construction of an enhancer stack.
//!
//! ```text
//! storage (layer 0) ─→ distributed? ─→ non-blocking? ─→ local layer?
//! ```
//!
//! Each stage wraps the previous one and takes the next layer number.
//! [`CachingBackendBuilder::build`] initializes the whole stack before
//! handing it out.

use std::path::PathBuf;
use std::sync::Arc;

use cairn_core::{
    BackendKind, CacheResult, CacheSettings, ConfigError, EntryCodec, JsonValueSerializer,
    TypeRegistry,
};
use tokio_util::sync::CancellationToken;

use super::distributed::DistributedBackend;
use super::layered::LayeredBackend;
use super::lmdb_backend::{LmdbBackend, LmdbOptions};
use super::memory::{MemoryBackend, MemoryBackendOptions};
use super::non_blocking::{NonBlockingBackend, NonBlockingOptions};
use super::null::NullBackend;
use super::traits::CachingBackend;
use super::uninitialized::UninitializedBackend;
use crate::broker::{BrokerOptions, InvalidationBroker, PubSubTransport};

enum StorageStage {
    Uninitialized,
    Null,
    Memory(MemoryBackendOptions),
    Lmdb(LmdbOptions),
    Custom(Arc<dyn CachingBackend>),
}

struct DistributedStage {
    transport: Arc<dyn PubSubTransport>,
    options: BrokerOptions,
    required: bool,
}

/// Builder for a [`CachingBackend`] stack.
///
/// # Example
///
/// ```ignore
/// let backend = CachingBackendBuilder::memory(MemoryBackendOptions::new())
///     .non_blocking(NonBlockingOptions::default())
///     .local_layer(MemoryBackendOptions::new().with_capacity(Some(1_000)))
///     .build(&CancellationToken::new())
///     .await?;
/// ```
pub struct CachingBackendBuilder {
    storage: StorageStage,
    distributed: Option<DistributedStage>,
    non_blocking: Option<NonBlockingOptions>,
    local_layer: Option<MemoryBackendOptions>,
}

impl CachingBackendBuilder {
    fn with_storage(storage: StorageStage) -> Self {
        Self {
            storage,
            distributed: None,
            non_blocking: None,
            local_layer: None,
        }
    }

    /// Store that faults on every operation.
    pub fn uninitialized() -> Self {
        Self::with_storage(StorageStage::Uninitialized)
    }

    pub fn null() -> Self {
        Self::with_storage(StorageStage::Null)
    }

    pub fn memory(options: MemoryBackendOptions) -> Self {
        Self::with_storage(StorageStage::Memory(options))
    }

    pub fn lmdb(options: LmdbOptions) -> Self {
        Self::with_storage(StorageStage::Lmdb(options))
    }

    /// Use an existing backend as the storage layer.
    pub fn storage(backend: Arc<dyn CachingBackend>) -> Self {
        Self::with_storage(StorageStage::Custom(backend))
    }

    /// Map settings onto the builder chain.
    ///
    /// `transport` is required when distributed invalidation is enabled.
    pub fn from_settings(
        settings: &CacheSettings,
        transport: Option<Arc<dyn PubSubTransport>>,
    ) -> Result<Self, ConfigError> {
        settings.validate()?;

        let memory_options = |capacity: Option<usize>| {
            MemoryBackendOptions::new()
                .with_capacity(capacity)
                .with_expiration_scan_interval(Some(settings.expiration_scan_interval))
        };

        let mut builder = match settings.backend {
            BackendKind::None => Self::uninitialized(),
            BackendKind::Null => Self::null(),
            BackendKind::Memory => Self::memory(memory_options(settings.capacity)),
            BackendKind::Lmdb => {
                let path = settings
                    .endpoint
                    .as_deref()
                    .ok_or_else(|| ConfigError::MissingRequired {
                        field: "endpoint".to_string(),
                    })?;
                Self::lmdb(
                    LmdbOptions::new(PathBuf::from(path), default_codec())
                        .with_map_size_mb(settings.lmdb_map_size_mb)
                        .with_key_prefix(settings.key_prefix.clone()),
                )
            }
        };

        if settings.distributed_invalidation {
            let transport = transport.ok_or_else(|| ConfigError::MissingRequired {
                field: "transport".to_string(),
            })?;
            builder = builder.distributed(
                transport,
                BrokerOptions::for_prefix(&settings.key_prefix)
                    .with_connect_timeout(settings.broker_connect_timeout),
                settings.broker_required,
            );
        }

        if settings.non_blocking {
            builder = builder.non_blocking(
                NonBlockingOptions::new(settings.queue_capacity)
                    .with_high_water(settings.queue_high_water),
            );
        }

        if settings.local_layer {
            builder = builder.local_layer(memory_options(settings.local_capacity));
        }

        Ok(builder)
    }

    /// Replace the entry codec of an LMDB storage layer.
    pub fn with_codec(mut self, codec: EntryCodec) -> Self {
        if let StorageStage::Lmdb(options) = &mut self.storage {
            options.codec = codec;
        }
        self
    }

    /// Announce writes to peers through a broker on `transport`.
    ///
    /// With `required`, an unreachable broker fails `build`; otherwise the
    /// stack starts with invalidations local to this process.
    pub fn distributed(
        mut self,
        transport: Arc<dyn PubSubTransport>,
        options: BrokerOptions,
        required: bool,
    ) -> Self {
        self.distributed = Some(DistributedStage {
            transport,
            options,
            required,
        });
        self
    }

    /// Queue writes to the far tier on a background worker.
    pub fn non_blocking(mut self, options: NonBlockingOptions) -> Self {
        self.non_blocking = Some(options);
        self
    }

    /// Put an in-memory near tier in front of the stack.
    pub fn local_layer(mut self, options: MemoryBackendOptions) -> Self {
        self.local_layer = Some(options);
        self
    }

    /// Assemble the stack without initializing it.
    pub fn assemble(self) -> Arc<dyn CachingBackend> {
        let mut layer = 0;
        let mut backend: Arc<dyn CachingBackend> = match self.storage {
            StorageStage::Uninitialized => Arc::new(UninitializedBackend::new()),
            StorageStage::Null => Arc::new(NullBackend::new()),
            StorageStage::Memory(options) => Arc::new(MemoryBackend::new(options)),
            StorageStage::Lmdb(options) => Arc::new(LmdbBackend::new(options)),
            StorageStage::Custom(backend) => backend,
        };

        let mut broker = None;
        if let Some(stage) = self.distributed {
            layer += 1;
            let shared = Arc::new(InvalidationBroker::new(stage.transport, stage.options));
            backend = Arc::new(
                DistributedBackend::new(backend, Arc::clone(&shared))
                    .with_required(stage.required)
                    .with_layer(layer),
            );
            broker = Some(shared);
        }

        if let Some(options) = self.non_blocking {
            layer += 1;
            backend = Arc::new(NonBlockingBackend::new(backend, options).with_layer(layer));
        }

        if let Some(options) = self.local_layer {
            layer += 1;
            let near: Arc<dyn CachingBackend> =
                Arc::new(MemoryBackend::new(options).with_layer(layer));
            let mut layered = LayeredBackend::new(near, backend).with_layer(layer);
            if let Some(broker) = broker {
                layered = layered.with_broker(broker);
            }
            backend = Arc::new(layered);
        }

        backend
    }

    /// Assemble and initialize the stack.
    pub async fn build(
        self,
        cancellation: &CancellationToken,
    ) -> CacheResult<Arc<dyn CachingBackend>> {
        let backend = self.assemble();
        if let Err(e) = backend.initialize(cancellation).await {
            if let Err(dispose) = backend.dispose().await {
                tracing::warn!(
                    backend = %backend.descriptor(),
                    error = %dispose,
                    "Dispose after failed initialization also failed"
                );
            }
            return Err(e);
        }
        tracing::info!(backend = %backend.descriptor(), "Cache backend ready");
        Ok(backend)
    }
}

/// JSON values over the primitive type registry.
fn default_codec() -> EntryCodec {
    EntryCodec::new(Arc::new(JsonValueSerializer::new(Arc::new(
        TypeRegistry::with_primitives(),
    ))))
}
