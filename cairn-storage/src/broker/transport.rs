//! Pub/sub transport used by the invalidation broker.
//!
//! [`PubSubTransport`] is the seam for a network broker. [`InMemoryTransport`]
//! is a tokio broadcast hub shared by every clone, which stands in for one
//! broker server shared by several processes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cairn_core::{CacheResult, ConnectionError};
use tokio::sync::broadcast;

/// What a subscription yields next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionEvent {
    Message(Vec<u8>),
    /// The subscriber fell behind and this many messages were lost.
    Lagged(u64),
    /// The transport closed the subscription.
    Closed,
}

/// Stream of messages on one channel.
#[async_trait]
pub trait Subscription: Send {
    fn channel(&self) -> &str;

    async fn next_event(&mut self) -> SubscriptionEvent;
}

/// Publish/subscribe transport.
#[async_trait]
pub trait PubSubTransport: Send + Sync {
    /// Human-readable location, for errors and logs.
    fn endpoint(&self) -> String;

    /// Confirm the transport is reachable.
    async fn connect(&self) -> CacheResult<()>;

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> CacheResult<()>;

    async fn subscribe(&self, channel: &str) -> CacheResult<Box<dyn Subscription>>;
}

#[derive(Debug)]
struct Hub {
    channels: Mutex<HashMap<String, broadcast::Sender<Arc<[u8]>>>>,
    connected: AtomicBool,
    capacity: usize,
}

/// In-process broadcast hub.
///
/// Clones share one hub. [`disconnect`](Self::disconnect) simulates losing
/// the broker: existing subscriptions close and publishing faults until
/// [`reconnect`](Self::reconnect).
#[derive(Debug, Clone)]
pub struct InMemoryTransport {
    hub: Arc<Hub>,
    connect_delay: Duration,
}

impl InMemoryTransport {
    /// Create a hub whose channels buffer `capacity` messages per subscriber.
    pub fn new(capacity: usize) -> Self {
        Self {
            hub: Arc::new(Hub {
                channels: Mutex::new(HashMap::new()),
                connected: AtomicBool::new(true),
                capacity: capacity.max(1),
            }),
            connect_delay: Duration::ZERO,
        }
    }

    /// Delay `connect` by `delay` on this handle.
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    pub fn is_connected(&self) -> bool {
        self.hub.connected.load(Ordering::Acquire)
    }

    /// Drop every channel and refuse traffic.
    pub fn disconnect(&self) {
        self.hub.connected.store(false, Ordering::Release);
        if let Ok(mut channels) = self.hub.channels.lock() {
            channels.clear();
        }
        tracing::info!("In-memory transport disconnected");
    }

    pub fn reconnect(&self) {
        self.hub.connected.store(true, Ordering::Release);
        tracing::info!("In-memory transport reconnected");
    }

    /// Number of live subscriptions on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.hub
            .channels
            .lock()
            .ok()
            .and_then(|channels| channels.get(channel).map(|tx| tx.receiver_count()))
            .unwrap_or(0)
    }

    fn ensure_connected(&self, channel: &str) -> CacheResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(ConnectionError::NotConnected {
                channel: channel.to_string(),
            }
            .into())
        }
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl PubSubTransport for InMemoryTransport {
    fn endpoint(&self) -> String {
        "memory://hub".to_string()
    }

    async fn connect(&self) -> CacheResult<()> {
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        if self.is_connected() {
            Ok(())
        } else {
            Err(ConnectionError::Unreachable {
                endpoint: self.endpoint(),
                reason: "hub is disconnected".to_string(),
            }
            .into())
        }
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> CacheResult<()> {
        self.ensure_connected(channel)?;
        let sender = self.hub.channels.lock()?.get(channel).cloned();
        match sender.map(|tx| tx.send(Arc::from(payload))) {
            Some(Ok(receivers)) => {
                tracing::debug!(channel, receivers, "Published message");
            }
            // No subscribers is not an error for pub/sub.
            Some(Err(_)) | None => {
                tracing::debug!(channel, "No subscribers for message");
            }
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> CacheResult<Box<dyn Subscription>> {
        self.ensure_connected(channel)?;
        let receiver = self
            .hub
            .channels
            .lock()?
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.hub.capacity).0)
            .subscribe();
        Ok(Box::new(BroadcastSubscription {
            channel: channel.to_string(),
            receiver,
        }))
    }
}

struct BroadcastSubscription {
    channel: String,
    receiver: broadcast::Receiver<Arc<[u8]>>,
}

#[async_trait]
impl Subscription for BroadcastSubscription {
    fn channel(&self) -> &str {
        &self.channel
    }

    async fn next_event(&mut self) -> SubscriptionEvent {
        match self.receiver.recv().await {
            Ok(payload) => SubscriptionEvent::Message(payload.to_vec()),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                SubscriptionEvent::Lagged(skipped)
            }
            Err(broadcast::error::RecvError::Closed) => SubscriptionEvent::Closed,
        }
    }
}
