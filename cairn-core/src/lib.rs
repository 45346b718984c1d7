//! Cairn Core - Cache Entry Model and Protocol Types
//!
//! Data types shared by every Cairn backend: keys, the cache entry envelope,
//! the error taxonomy, the entry wire codec and value serializers, the named
//! lock factory, and backend settings. Storage engines and enhancers live in
//! `cairn-storage`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

pub mod codec;
pub mod config;
pub mod entry;
pub mod error;
pub mod lock;
pub mod serialization;
mod wire;

pub use codec::EntryCodec;
pub use config::{BackendKind, CacheSettings};
pub use entry::{CacheEntry, CacheItemPriority, CacheValue, EntryKind};
pub use error::{
    CacheError, CacheResult, CapabilityError, ConfigError, ConnectionError, ErrorClass,
    InvalidEntryError, ProgrammingError, StorageError, TimeoutError,
};
pub use lock::{LocalLockFactory, LockFactory, LockHandle, NoopLockFactory};
pub use serialization::{
    BinaryValueSerializer, JsonValueSerializer, TypeRegistry, ValueSerializer,
};

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

macro_rules! string_key {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(key: impl Into<String>) -> Self {
                Self(key.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_string(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(key: &str) -> Self {
                Self(key.to_string())
            }
        }

        impl From<String> for $name {
            fn from(key: String) -> Self {
                Self(key)
            }
        }

        impl From<&$name> for $name {
            fn from(key: &$name) -> Self {
                key.clone()
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

string_key!(
    /// Caller-supplied identifier of one cached result.
    CacheKey
);

string_key!(
    /// Logical invalidation tag shared by zero or more cache entries.
    DependencyKey
);
