//! Error types for Cairn cache operations

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Transport or store could not be reached, or the connection was lost.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Endpoint {endpoint} unreachable: {reason}")]
    Unreachable { endpoint: String, reason: String },

    #[error("Transport closed on channel {channel}")]
    TransportClosed { channel: String },

    #[error("Not connected to channel {channel}")]
    NotConnected { channel: String },
}

/// Operation exceeded its deadline or was cancelled by the caller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TimeoutError {
    #[error("Operation {operation} timed out after {after:?}")]
    Elapsed { operation: String, after: Duration },

    #[error("Operation {operation} was cancelled")]
    Cancelled { operation: String },
}

/// Serialized cache entry cannot be decoded. Never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InvalidEntryError {
    #[error("Unknown cache entry discriminator: {byte}")]
    UnknownDiscriminator { byte: u8 },

    #[error("Unresolved value type name: {type_name}")]
    UnresolvedType { type_name: String },

    #[error("Truncated cache entry while reading {context}")]
    Truncated { context: String },

    #[error("Malformed cache entry: {reason}")]
    Malformed { reason: String },
}

/// Contract violation by the caller. Always a defect.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProgrammingError {
    #[error("Lock {key} acquired twice without release")]
    ReentrantAcquire { key: String },

    #[error("Lock {key} disposed while still acquired")]
    DisposedWhileAcquired { key: String },

    #[error("Backend {backend} is not ready (status: {status})")]
    NotReady { backend: String, status: String },

    #[error("Backend {backend} has been disposed")]
    Disposed { backend: String },

    #[error("No caching backend has been configured")]
    UninitializedBackend,
}

/// Operation requires a capability the backend does not advertise.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CapabilityError {
    #[error("Backend {backend} does not support dependencies")]
    DependenciesUnsupported { backend: String },
}

/// Failures inside a store that are not transport related.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Storage lock poisoned")]
    LockPoisoned,

    #[error("Transaction failed: {reason}")]
    Transaction { reason: String },

    #[error("Serialization failed: {reason}")]
    Serialization { reason: String },

    #[error("Value type {type_name} is not registered")]
    UnregisteredType { type_name: String },

    #[error("Write queue closed")]
    QueueClosed,

    #[error("Background worker failed: {reason}")]
    WorkerFailed { reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Coarse fault class used by callers to pick a recovery strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    Connection,
    Timeout,
    InvalidEntry,
    Programming,
    Capability,
    Storage,
    Config,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorClass::Connection => "connection",
            ErrorClass::Timeout => "timeout",
            ErrorClass::InvalidEntry => "invalid-entry",
            ErrorClass::Programming => "programming",
            ErrorClass::Capability => "capability",
            ErrorClass::Storage => "storage",
            ErrorClass::Config => "config",
        };
        f.write_str(name)
    }
}

/// Master error type for all Cairn errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Timeout error: {0}")]
    Timeout(#[from] TimeoutError),

    #[error("Invalid cache entry: {0}")]
    InvalidEntry(#[from] InvalidEntryError),

    #[error("Programming error: {0}")]
    Programming(#[from] ProgrammingError),

    #[error("Capability error: {0}")]
    Capability(#[from] CapabilityError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl CacheError {
    /// Fault class of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            CacheError::Connection(_) => ErrorClass::Connection,
            CacheError::Timeout(_) => ErrorClass::Timeout,
            CacheError::InvalidEntry(_) => ErrorClass::InvalidEntry,
            CacheError::Programming(_) => ErrorClass::Programming,
            CacheError::Capability(_) => ErrorClass::Capability,
            CacheError::Storage(_) => ErrorClass::Storage,
            CacheError::Config(_) => ErrorClass::Config,
        }
    }

    /// Only timeouts may be retried; a cancelled operation is not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CacheError::Timeout(TimeoutError::Elapsed { .. }))
    }

    /// Invalid entries and programming faults are never recovered.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CacheError::InvalidEntry(_) | CacheError::Programming(_)
        )
    }

    /// Shorthand for a cancellation fault on `operation`.
    pub fn cancelled(operation: impl Into<String>) -> Self {
        TimeoutError::Cancelled {
            operation: operation.into(),
        }
        .into()
    }
}

/// Result type alias for Cairn operations.
pub type CacheResult<T> = Result<T, CacheError>;

impl<T> From<std::sync::PoisonError<T>> for CacheError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        CacheError::Storage(StorageError::LockPoisoned)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_entry_display_discriminator() {
        let err = InvalidEntryError::UnknownDiscriminator { byte: 7 };
        let msg = format!("{}", err);
        assert!(msg.contains("discriminator"));
        assert!(msg.contains('7'));
    }

    #[test]
    fn test_connection_error_display_unreachable() {
        let err = ConnectionError::Unreachable {
            endpoint: "/var/cache/cairn".to_string(),
            reason: "permission denied".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("/var/cache/cairn"));
        assert!(msg.contains("permission denied"));
    }

    #[test]
    fn test_error_classes() {
        let conn: CacheError = ConnectionError::TransportClosed {
            channel: "cairn:invalidation".to_string(),
        }
        .into();
        assert_eq!(conn.class(), ErrorClass::Connection);
        assert!(!conn.is_retryable());
        assert!(!conn.is_fatal());

        let elapsed: CacheError = TimeoutError::Elapsed {
            operation: "initialize".to_string(),
            after: Duration::from_secs(5),
        }
        .into();
        assert_eq!(elapsed.class(), ErrorClass::Timeout);
        assert!(elapsed.is_retryable());

        let cancelled = CacheError::cancelled("initialize");
        assert_eq!(cancelled.class(), ErrorClass::Timeout);
        assert!(!cancelled.is_retryable());

        let invalid: CacheError = InvalidEntryError::UnknownDiscriminator { byte: 2 }.into();
        assert!(invalid.is_fatal());

        let reentrant: CacheError = ProgrammingError::ReentrantAcquire {
            key: "a".to_string(),
        }
        .into();
        assert!(reentrant.is_fatal());
        assert_eq!(reentrant.class(), ErrorClass::Programming);
    }

    #[test]
    fn test_poison_maps_to_storage_error() {
        let lock = std::sync::Mutex::new(0u8);
        let _ = std::panic::catch_unwind(|| {
            let _guard = lock.lock().unwrap();
            panic!("poison");
        });
        let err: CacheError = lock.lock().unwrap_err().into();
        assert_eq!(err, CacheError::Storage(StorageError::LockPoisoned));
    }

    #[test]
    fn test_error_class_display() {
        assert_eq!(ErrorClass::InvalidEntry.to_string(), "invalid-entry");
        assert_eq!(ErrorClass::Connection.to_string(), "connection");
    }
}
