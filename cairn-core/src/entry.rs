//! Cache entry envelope.
//!
//! A [`CacheEntry`] is created by the caller at `set` time and is read-only
//! afterwards. Stores never mutate an entry in place: a new `set` replaces the
//! previous entry for the key as a whole.

use crate::{DependencyKey, Timestamp};
use std::any::{Any, TypeId};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// TYPE-ERASED VALUE
// ============================================================================

/// Object-safe view of a cached value.
trait ErasedValue: Any + Send + Sync + fmt::Debug {
    fn as_any(&self) -> &dyn Any;
    fn eq_value(&self, other: &dyn ErasedValue) -> bool;
}

impl<T> ErasedValue for T
where
    T: Any + Send + Sync + fmt::Debug + PartialEq,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn eq_value(&self, other: &dyn ErasedValue) -> bool {
        other
            .as_any()
            .downcast_ref::<T>()
            .is_some_and(|other| other == self)
    }
}

/// An opaque cached value.
///
/// Values are shared behind an `Arc`, so cloning an entry never clones the
/// payload. Stores that keep values in memory hold them as-is; stores that
/// persist bytes go through a [`ValueSerializer`](crate::ValueSerializer).
#[derive(Clone)]
pub struct CacheValue {
    inner: Arc<dyn ErasedValue>,
    type_id: TypeId,
    rust_type_name: &'static str,
}

impl CacheValue {
    /// Wrap a value.
    pub fn new<T>(value: T) -> Self
    where
        T: Any + Send + Sync + fmt::Debug + PartialEq,
    {
        Self {
            inner: Arc::new(value),
            type_id: TypeId::of::<T>(),
            rust_type_name: std::any::type_name::<T>(),
        }
    }

    /// Borrow the value as `T` if that is its concrete type.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.as_any().downcast_ref::<T>()
    }

    /// Check the concrete type.
    pub fn is<T: Any>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }

    /// `TypeId` of the concrete value.
    pub fn value_type_id(&self) -> TypeId {
        self.type_id
    }

    /// Compiler-provided name of the concrete type (diagnostics only).
    pub fn rust_type_name(&self) -> &'static str {
        self.rust_type_name
    }
}

impl fmt::Debug for CacheValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.inner, f)
    }
}

impl PartialEq for CacheValue {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id && self.inner.eq_value(&*other.inner)
    }
}

// ============================================================================
// ENTRY METADATA
// ============================================================================

/// Wire shape of an entry.
///
/// A `Materialized` entry carries a value that was already evaluated, so a
/// reader must not treat it as a deferred computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EntryKind {
    #[default]
    Default,
    Materialized,
}

impl EntryKind {
    /// Leading discriminator byte on the wire.
    pub fn discriminator(&self) -> u8 {
        match self {
            EntryKind::Default => 0,
            EntryKind::Materialized => 1,
        }
    }

    /// Parse a discriminator byte.
    pub fn from_discriminator(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(EntryKind::Default),
            1 => Some(EntryKind::Materialized),
            _ => None,
        }
    }
}

/// Eviction priority hint passed to the underlying store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum CacheItemPriority {
    Low,
    #[default]
    Normal,
    High,
    /// Never evicted by a store-level policy; only explicit removal or
    /// invalidation deletes it.
    NotRemovable,
}

impl CacheItemPriority {
    pub fn as_u8(&self) -> u8 {
        match self {
            CacheItemPriority::Low => 0,
            CacheItemPriority::Normal => 1,
            CacheItemPriority::High => 2,
            CacheItemPriority::NotRemovable => 3,
        }
    }

    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(CacheItemPriority::Low),
            1 => Some(CacheItemPriority::Normal),
            2 => Some(CacheItemPriority::High),
            3 => Some(CacheItemPriority::NotRemovable),
            _ => None,
        }
    }
}

// ============================================================================
// CACHE ENTRY
// ============================================================================

/// Value envelope with dependencies and expiration policy.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub kind: EntryKind,
    /// `None` caches a null result.
    pub value: Option<CacheValue>,
    pub dependencies: BTreeSet<DependencyKey>,
    pub absolute_expiration: Option<Timestamp>,
    pub sliding_expiration: Option<Duration>,
    pub priority: CacheItemPriority,
}

impl CacheEntry {
    /// Create a default entry holding `value`.
    pub fn new<T>(value: T) -> Self
    where
        T: Any + Send + Sync + fmt::Debug + PartialEq,
    {
        Self::from_value(Some(CacheValue::new(value)))
    }

    /// Create a materialized entry holding `value`.
    pub fn materialized<T>(value: T) -> Self
    where
        T: Any + Send + Sync + fmt::Debug + PartialEq,
    {
        Self {
            kind: EntryKind::Materialized,
            ..Self::new(value)
        }
    }

    /// Create an entry caching a null result.
    pub fn null() -> Self {
        Self::from_value(None)
    }

    /// Create a default entry from an already wrapped value.
    pub fn from_value(value: Option<CacheValue>) -> Self {
        Self {
            kind: EntryKind::Default,
            value,
            dependencies: BTreeSet::new(),
            absolute_expiration: None,
            sliding_expiration: None,
            priority: CacheItemPriority::Normal,
        }
    }

    pub fn with_kind(mut self, kind: EntryKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_dependency(mut self, dependency: impl Into<DependencyKey>) -> Self {
        self.dependencies.insert(dependency.into());
        self
    }

    pub fn with_dependencies<I, D>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = D>,
        D: Into<DependencyKey>,
    {
        self.dependencies
            .extend(dependencies.into_iter().map(Into::into));
        self
    }

    pub fn with_absolute_expiration(mut self, at: Timestamp) -> Self {
        self.absolute_expiration = Some(at);
        self
    }

    pub fn with_sliding_expiration(mut self, window: Duration) -> Self {
        self.sliding_expiration = Some(window);
        self
    }

    pub fn with_priority(mut self, priority: CacheItemPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Borrow the value as `T`. `None` for a null entry or a type mismatch.
    pub fn value_as<T: Any>(&self) -> Option<&T> {
        self.value.as_ref().and_then(|v| v.downcast_ref::<T>())
    }

    pub fn is_null(&self) -> bool {
        self.value.is_none()
    }

    pub fn has_dependencies(&self) -> bool {
        !self.dependencies.is_empty()
    }

    /// Whether a store-level policy (capacity, sweep) may drop this entry.
    pub fn is_removable(&self) -> bool {
        self.priority != CacheItemPriority::NotRemovable
    }

    /// Check expiration given the current time and the last access time.
    pub fn is_expired_at(&self, now: Timestamp, last_access: Timestamp) -> bool {
        if let Some(at) = self.absolute_expiration {
            if now >= at {
                return true;
            }
        }
        if let Some(window) = self.sliding_expiration {
            let idle = now
                .signed_duration_since(last_access)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if idle >= window {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[derive(Debug, Clone, PartialEq)]
    struct Product {
        id: u32,
        name: String,
    }

    #[test]
    fn test_value_downcast() {
        let entry = CacheEntry::new(Product {
            id: 7,
            name: "lamp".to_string(),
        });
        let product = entry.value_as::<Product>().expect("should downcast");
        assert_eq!(product.id, 7);
        assert!(entry.value_as::<String>().is_none());
    }

    #[test]
    fn test_value_equality_is_typed() {
        assert_eq!(CacheValue::new(5u32), CacheValue::new(5u32));
        assert_ne!(CacheValue::new(5u32), CacheValue::new(6u32));
        assert_ne!(CacheValue::new(5u32), CacheValue::new(5u64));
    }

    #[test]
    fn test_dependencies_are_an_ordered_set() {
        let entry = CacheEntry::new(1u8)
            .with_dependency("b")
            .with_dependencies(["a", "b", "c"]);
        let deps: Vec<&str> = entry.dependencies.iter().map(|d| d.as_str()).collect();
        assert_eq!(deps, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_discriminator_roundtrip() {
        for kind in [EntryKind::Default, EntryKind::Materialized] {
            assert_eq!(EntryKind::from_discriminator(kind.discriminator()), Some(kind));
        }
        assert_eq!(EntryKind::from_discriminator(2), None);
    }

    #[test]
    fn test_absolute_expiration() {
        let now = Utc::now();
        let entry = CacheEntry::new(1u8).with_absolute_expiration(now);
        assert!(entry.is_expired_at(now, now));
        assert!(!entry.is_expired_at(now - chrono::Duration::seconds(1), now));
    }

    #[test]
    fn test_sliding_expiration() {
        let now = Utc::now();
        let entry = CacheEntry::new(1u8).with_sliding_expiration(Duration::from_secs(30));
        assert!(!entry.is_expired_at(now, now - chrono::Duration::seconds(10)));
        assert!(entry.is_expired_at(now, now - chrono::Duration::seconds(31)));
    }

    #[test]
    fn test_not_removable() {
        let entry = CacheEntry::null().with_priority(CacheItemPriority::NotRemovable);
        assert!(!entry.is_removable());
        assert!(entry.is_null());
        assert!(CacheEntry::null().is_removable());
    }
}
