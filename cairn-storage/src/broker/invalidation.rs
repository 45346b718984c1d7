//! Distributed invalidation broker.
//!
//! A broker publishes [`InvalidationMessage`]s on the channel
//! `"{prefix}:invalidation"` and listens on the same channel. Messages from
//! other processes evict matching entries from the near tiers registered
//! with the broker; messages carrying this broker's own origin id are
//! skipped, since the writer already evicted locally.
//!
//! If the subscription lags, messages were lost, so every registered near
//! tier is flushed. If the transport closes, the broker reports itself
//! disconnected and publishing faults with a
//! [`ConnectionError`](cairn_core::ConnectionError).

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use cairn_core::{
    CacheError, CacheKey, CacheResult, ConnectionError, DependencyKey, ProgrammingError,
    StorageError,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::transport::{PubSubTransport, Subscription, SubscriptionEvent};
use crate::cache::CachingBackend;

// ============================================================================
// WIRE MESSAGE
// ============================================================================

/// What an invalidation message targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvalidationKind {
    /// Every entry declaring a dependency key.
    #[default]
    Dependency,
    /// One cache key.
    Item,
}

/// Message published on the invalidation channel, encoded as JSON.
///
/// For [`InvalidationKind::Item`] messages `dependency_key` carries the cache
/// key. Messages without a `kind` field are dependency invalidations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationMessage {
    pub dependency_key: String,
    pub origin_id: String,
    /// Unix milliseconds at publication.
    pub timestamp: i64,
    #[serde(default)]
    pub kind: InvalidationKind,
}

impl InvalidationMessage {
    pub fn dependency(dependency: &DependencyKey, origin_id: impl Into<String>) -> Self {
        Self {
            dependency_key: dependency.as_str().to_string(),
            origin_id: origin_id.into(),
            timestamp: Utc::now().timestamp_millis(),
            kind: InvalidationKind::Dependency,
        }
    }

    pub fn item(key: &CacheKey, origin_id: impl Into<String>) -> Self {
        Self {
            dependency_key: key.as_str().to_string(),
            origin_id: origin_id.into(),
            timestamp: Utc::now().timestamp_millis(),
            kind: InvalidationKind::Item,
        }
    }

    pub fn to_bytes(&self) -> CacheResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| {
            StorageError::Serialization {
                reason: e.to_string(),
            }
            .into()
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> CacheResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| {
            StorageError::Serialization {
                reason: e.to_string(),
            }
            .into()
        })
    }
}

// ============================================================================
// BROKER
// ============================================================================

/// Options for [`InvalidationBroker`].
#[derive(Debug, Clone)]
pub struct BrokerOptions {
    pub channel: String,
    /// Window for confirming connectivity during [`InvalidationBroker::connect`].
    pub connect_timeout: Duration,
}

impl BrokerOptions {
    /// Options for the invalidation channel of `key_prefix`.
    pub fn for_prefix(key_prefix: &str) -> Self {
        Self {
            channel: format!("{key_prefix}:invalidation"),
            connect_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// Handle returned by [`InvalidationBroker::register_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Message counters for one broker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub published: u64,
    pub received: u64,
    pub ignored_own: u64,
    pub malformed: u64,
    pub lag_flushes: u64,
}

#[derive(Default)]
struct BrokerCounters {
    published: AtomicU64,
    received: AtomicU64,
    ignored_own: AtomicU64,
    malformed: AtomicU64,
    lag_flushes: AtomicU64,
}

struct BrokerShared {
    channel: String,
    origin_id: String,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn CachingBackend>)>>,
    next_listener: AtomicU64,
    connected: AtomicBool,
    counters: BrokerCounters,
}

impl BrokerShared {
    fn listeners(&self) -> Vec<Arc<dyn CachingBackend>> {
        match self.listeners.read() {
            Ok(listeners) => listeners.iter().map(|(_, l)| Arc::clone(l)).collect(),
            Err(_) => {
                tracing::error!(channel = %self.channel, "Listener registry poisoned");
                Vec::new()
            }
        }
    }

    /// Apply one subscription event. Returns `false` once the subscription is closed.
    async fn handle_event(&self, event: SubscriptionEvent) -> bool {
        match event {
            SubscriptionEvent::Message(payload) => {
                self.handle_payload(&payload).await;
                true
            }
            SubscriptionEvent::Lagged(skipped) => {
                tracing::warn!(
                    channel = %self.channel,
                    skipped,
                    "Invalidation subscription lagged, flushing near tiers"
                );
                self.counters.lag_flushes.fetch_add(1, Ordering::Relaxed);
                for listener in self.listeners() {
                    if let Err(e) = listener.clear().await {
                        tracing::warn!(
                            backend = %listener.descriptor(),
                            error = %e,
                            "Failed to flush near tier"
                        );
                    }
                }
                true
            }
            SubscriptionEvent::Closed => {
                self.connected.store(false, Ordering::Release);
                tracing::error!(channel = %self.channel, "Invalidation transport closed");
                false
            }
        }
    }

    async fn handle_payload(&self, payload: &[u8]) {
        let message = match InvalidationMessage::from_bytes(payload) {
            Ok(message) => message,
            Err(e) => {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(channel = %self.channel, error = %e, "Dropping malformed invalidation message");
                return;
            }
        };

        if message.origin_id == self.origin_id {
            self.counters.ignored_own.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.counters.received.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(
            channel = %self.channel,
            key = %message.dependency_key,
            kind = ?message.kind,
            origin = %message.origin_id,
            "Applying remote invalidation"
        );

        for listener in self.listeners() {
            let result = match message.kind {
                InvalidationKind::Item => listener
                    .remove_entry(&CacheKey::from(message.dependency_key.as_str()))
                    .await
                    .map(|_| ()),
                InvalidationKind::Dependency if listener.capabilities().supports_dependencies => {
                    listener
                        .invalidate_dependency(&DependencyKey::from(message.dependency_key.as_str()))
                        .await
                }
                // A tier that cannot resolve dependents can only be flushed.
                InvalidationKind::Dependency => listener.clear().await,
            };
            if let Err(e) = result {
                tracing::warn!(
                    backend = %listener.descriptor(),
                    key = %message.dependency_key,
                    error = %e,
                    "Near tier eviction failed"
                );
            }
        }
    }
}

/// Publishes local invalidations and applies remote ones to near tiers.
pub struct InvalidationBroker {
    transport: Arc<dyn PubSubTransport>,
    connect_timeout: Duration,
    shared: Arc<BrokerShared>,
    shutdown: CancellationToken,
    listener_task: Mutex<Option<JoinHandle<()>>>,
}

impl InvalidationBroker {
    pub fn new(transport: Arc<dyn PubSubTransport>, options: BrokerOptions) -> Self {
        Self {
            transport,
            connect_timeout: options.connect_timeout,
            shared: Arc::new(BrokerShared {
                channel: options.channel,
                origin_id: Uuid::now_v7().to_string(),
                listeners: RwLock::new(Vec::new()),
                next_listener: AtomicU64::new(1),
                connected: AtomicBool::new(false),
                counters: BrokerCounters::default(),
            }),
            shutdown: CancellationToken::new(),
            listener_task: Mutex::new(None),
        }
    }

    pub fn channel(&self) -> &str {
        &self.shared.channel
    }

    /// Unique id stamped on every message this broker publishes.
    pub fn origin_id(&self) -> &str {
        &self.shared.origin_id
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Connect to the transport, subscribe, and start the listener task.
    ///
    /// Faults with a [`ConnectionError`] if connectivity is not confirmed
    /// within the connect timeout, and with
    /// [`TimeoutError::Cancelled`](cairn_core::TimeoutError::Cancelled) when
    /// `cancellation` fires first. Either way the call may be retried.
    pub async fn connect(&self, cancellation: &CancellationToken) -> CacheResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(ProgrammingError::Disposed {
                backend: format!("broker {}", self.shared.channel),
            }
            .into());
        }
        if self.is_connected() {
            return Ok(());
        }

        let attempt = async {
            self.transport.connect().await?;
            self.transport.subscribe(&self.shared.channel).await
        };

        let subscription = tokio::select! {
            biased;
            _ = cancellation.cancelled() => {
                return Err(CacheError::cancelled("broker connect"));
            }
            result = tokio::time::timeout(self.connect_timeout, attempt) => match result {
                Ok(subscription) => subscription?,
                Err(_) => {
                    return Err(ConnectionError::Unreachable {
                        endpoint: self.transport.endpoint(),
                        reason: format!(
                            "connectivity not confirmed within {:?}",
                            self.connect_timeout
                        ),
                    }
                    .into());
                }
            },
        };

        self.shared.connected.store(true, Ordering::Release);
        let task = tokio::spawn(run_listener(
            Arc::clone(&self.shared),
            subscription,
            self.shutdown.clone(),
        ));
        let previous = self.listener_task.lock()?.replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }

        tracing::info!(
            channel = %self.shared.channel,
            origin = %self.shared.origin_id,
            endpoint = %self.transport.endpoint(),
            "Invalidation broker connected"
        );
        Ok(())
    }

    /// Evict from `near_tier` whenever a peer invalidates.
    pub fn register_listener(&self, near_tier: Arc<dyn CachingBackend>) -> CacheResult<ListenerId> {
        let id = ListenerId(self.shared.next_listener.fetch_add(1, Ordering::Relaxed));
        self.shared.listeners.write()?.push((id, near_tier));
        Ok(id)
    }

    pub fn unregister_listener(&self, id: ListenerId) -> CacheResult<()> {
        self.shared
            .listeners
            .write()?
            .retain(|(listener, _)| *listener != id);
        Ok(())
    }

    pub fn listener_count(&self) -> usize {
        self.shared
            .listeners
            .read()
            .map(|listeners| listeners.len())
            .unwrap_or(0)
    }

    pub async fn publish(&self, message: &InvalidationMessage) -> CacheResult<()> {
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected {
                channel: self.shared.channel.clone(),
            }
            .into());
        }
        let payload = message.to_bytes()?;
        self.transport.publish(&self.shared.channel, payload).await?;
        self.shared
            .counters
            .published
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub async fn publish_dependency(&self, dependency: &DependencyKey) -> CacheResult<()> {
        self.publish(&InvalidationMessage::dependency(
            dependency,
            self.shared.origin_id.as_str(),
        ))
        .await
    }

    pub async fn publish_item(&self, key: &CacheKey) -> CacheResult<()> {
        self.publish(&InvalidationMessage::item(key, self.shared.origin_id.as_str()))
            .await
    }

    /// Stop the listener task and wait for it.
    pub async fn shutdown(&self) -> CacheResult<()> {
        self.shutdown.cancel();
        let task = self.listener_task.lock()?.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Invalidation listener ended abnormally");
            }
        }
        self.shared.connected.store(false, Ordering::Release);
        Ok(())
    }

    pub fn stats(&self) -> BrokerStats {
        let counters = &self.shared.counters;
        BrokerStats {
            published: counters.published.load(Ordering::Relaxed),
            received: counters.received.load(Ordering::Relaxed),
            ignored_own: counters.ignored_own.load(Ordering::Relaxed),
            malformed: counters.malformed.load(Ordering::Relaxed),
            lag_flushes: counters.lag_flushes.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for InvalidationBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvalidationBroker")
            .field("channel", &self.shared.channel)
            .field("origin_id", &self.shared.origin_id)
            .field("connected", &self.is_connected())
            .field("listeners", &self.listener_count())
            .finish()
    }
}

async fn run_listener(
    shared: Arc<BrokerShared>,
    mut subscription: Box<dyn Subscription>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = subscription.next_event() => event,
        };
        if !shared.handle_event(event).await {
            break;
        }
    }
    tracing::debug!(channel = %subscription.channel(), "Invalidation listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryTransport;
    use crate::cache::{MemoryBackend, MemoryBackendOptions};
    use cairn_core::{CacheEntry, TimeoutError};

    async fn near_tier() -> Arc<dyn CachingBackend> {
        let backend = MemoryBackend::new(MemoryBackendOptions::new().with_expiration_scan_interval(None));
        backend
            .initialize(&CancellationToken::new())
            .await
            .unwrap();
        Arc::new(backend)
    }

    async fn connected_broker(transport: &InMemoryTransport) -> InvalidationBroker {
        let broker = InvalidationBroker::new(
            Arc::new(transport.clone()),
            BrokerOptions::for_prefix("test").with_connect_timeout(Duration::from_secs(1)),
        );
        broker.connect(&CancellationToken::new()).await.unwrap();
        broker
    }

    async fn wait_for(check: impl Fn() -> bool) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    async fn wait_until_evicted(backend: &dyn CachingBackend, key: &CacheKey) -> bool {
        for _ in 0..100 {
            if !backend.contains_key(key).await.unwrap() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[test]
    fn test_message_wire_format() {
        let message = InvalidationMessage {
            dependency_key: "order:1".to_string(),
            origin_id: "node-a".to_string(),
            timestamp: 1_700_000_000_000,
            kind: InvalidationKind::Dependency,
        };
        let json: serde_json::Value = serde_json::from_slice(&message.to_bytes().unwrap()).unwrap();
        assert_eq!(json["dependencyKey"], "order:1");
        assert_eq!(json["originId"], "node-a");
        assert_eq!(json["timestamp"], 1_700_000_000_000i64);
        assert_eq!(json["kind"], "dependency");
    }

    #[test]
    fn test_message_without_kind_is_dependency() {
        let message = InvalidationMessage::from_bytes(
            br#"{"dependencyKey":"d","originId":"o","timestamp":5}"#,
        )
        .unwrap();
        assert_eq!(message.kind, InvalidationKind::Dependency);
        assert_eq!(message.timestamp, 5);
    }

    #[tokio::test]
    async fn test_remote_invalidation_evicts_near_tier() {
        let transport = InMemoryTransport::new(64);
        let publisher = connected_broker(&transport).await;
        let subscriber = connected_broker(&transport).await;

        let publisher_near = near_tier().await;
        let subscriber_near = near_tier().await;
        publisher.register_listener(Arc::clone(&publisher_near)).unwrap();
        subscriber.register_listener(Arc::clone(&subscriber_near)).unwrap();

        let key = CacheKey::from("k");
        let entry = CacheEntry::new(1i64).with_dependency("order:1");
        publisher_near.set_entry(&key, entry.clone()).await.unwrap();
        subscriber_near.set_entry(&key, entry).await.unwrap();

        publisher
            .publish_dependency(&DependencyKey::from("order:1"))
            .await
            .unwrap();

        assert!(wait_until_evicted(&*subscriber_near, &key).await);
        assert!(wait_for(|| publisher.stats().ignored_own == 1).await);
        // The publisher's own near tier is left to the writer.
        assert!(publisher_near.contains_key(&key).await.unwrap());
        assert_eq!(subscriber.stats().received, 1);
    }

    #[tokio::test]
    async fn test_item_message_removes_key() {
        let transport = InMemoryTransport::new(64);
        let publisher = connected_broker(&transport).await;
        let subscriber = connected_broker(&transport).await;
        let near = near_tier().await;
        subscriber.register_listener(Arc::clone(&near)).unwrap();

        let key = CacheKey::from("product:9");
        near.set_entry(&key, CacheEntry::new(9i64)).await.unwrap();
        publisher.publish_item(&key).await.unwrap();

        assert!(wait_until_evicted(&*near, &key).await);
    }

    #[tokio::test]
    async fn test_connect_timeout_is_connection_fault() {
        let transport = InMemoryTransport::new(8).with_connect_delay(Duration::from_millis(500));
        let broker = InvalidationBroker::new(
            Arc::new(transport),
            BrokerOptions::for_prefix("test").with_connect_timeout(Duration::from_millis(20)),
        );
        let err = broker.connect(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(
            err,
            CacheError::Connection(ConnectionError::Unreachable { .. })
        ));
        assert!(!broker.is_connected());
    }

    #[tokio::test]
    async fn test_cancelled_connect_is_retryable() {
        let transport = InMemoryTransport::new(8);
        let broker = InvalidationBroker::new(
            Arc::new(transport),
            BrokerOptions::for_prefix("test"),
        );
        let token = CancellationToken::new();
        token.cancel();
        let err = broker.connect(&token).await.unwrap_err();
        assert!(matches!(err, CacheError::Timeout(TimeoutError::Cancelled { .. })));

        broker.connect(&CancellationToken::new()).await.unwrap();
        assert!(broker.is_connected());
        broker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_transport_loss_surfaces_as_connection_fault() {
        let transport = InMemoryTransport::new(8);
        let broker = connected_broker(&transport).await;

        transport.disconnect();
        assert!(wait_for(|| !broker.is_connected()).await);

        let err = broker
            .publish_dependency(&DependencyKey::from("d"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CacheError::Connection(ConnectionError::NotConnected { .. })
        ));
    }

    #[tokio::test]
    async fn test_lag_flushes_near_tiers() {
        let transport = InMemoryTransport::new(8);
        let broker = InvalidationBroker::new(Arc::new(transport), BrokerOptions::for_prefix("test"));
        let near = near_tier().await;
        broker.register_listener(Arc::clone(&near)).unwrap();
        near.set_entry(&CacheKey::from("k"), CacheEntry::new(1i64))
            .await
            .unwrap();

        assert!(broker.shared.handle_event(SubscriptionEvent::Lagged(4)).await);
        assert!(!near.contains_key(&CacheKey::from("k")).await.unwrap());
        assert_eq!(broker.stats().lag_flushes, 1);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_counted() {
        let transport = InMemoryTransport::new(8);
        let broker = InvalidationBroker::new(Arc::new(transport), BrokerOptions::for_prefix("test"));
        assert!(
            broker
                .shared
                .handle_event(SubscriptionEvent::Message(b"not json".to_vec()))
                .await
        );
        assert_eq!(broker.stats().malformed, 1);
    }

    #[tokio::test]
    async fn test_unregister_listener() {
        let transport = InMemoryTransport::new(8);
        let broker = InvalidationBroker::new(Arc::new(transport), BrokerOptions::for_prefix("test"));
        let id = broker.register_listener(near_tier().await).unwrap();
        assert_eq!(broker.listener_count(), 1);
        broker.unregister_listener(id).unwrap();
        assert_eq!(broker.listener_count(), 0);
    }
}
