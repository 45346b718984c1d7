//! Cross-process invalidation over publish/subscribe.

pub mod invalidation;
pub mod transport;

pub use invalidation::{
    BrokerOptions, BrokerStats, InvalidationBroker, InvalidationKind, InvalidationMessage,
    ListenerId,
};
pub use transport::{InMemoryTransport, PubSubTransport, Subscription, SubscriptionEvent};
