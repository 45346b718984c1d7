//! Backend settings
//!
//! Settings select the storage kind and the enhancers stacked on top of it.
//! They can be built in code with the `with_*` setters, loaded from
//! environment variables, or parsed from TOML.

use crate::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Storage kind at the bottom of the backend stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Nothing selected; every operation faults.
    #[default]
    None,
    /// Accepts writes, always misses.
    Null,
    /// Process-local in-memory store.
    Memory,
    /// LMDB store shared by processes on one host.
    Lmdb,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::None => "none",
            BackendKind::Null => "null",
            BackendKind::Memory => "memory",
            BackendKind::Lmdb => "lmdb",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "none" | "" => Ok(BackendKind::None),
            "null" => Ok(BackendKind::Null),
            "memory" => Ok(BackendKind::Memory),
            "lmdb" => Ok(BackendKind::Lmdb),
            other => Err(ConfigError::InvalidValue {
                field: "backend".to_string(),
                value: other.to_string(),
                reason: "expected one of none, null, memory, lmdb".to_string(),
            }),
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Settings for building a caching backend stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    // ========================================================================
    // Storage
    // ========================================================================
    pub backend: BackendKind,

    /// Namespace for stored keys and the invalidation channel.
    pub key_prefix: String,

    /// Maximum items in the in-memory store. `None` = unbounded.
    pub capacity: Option<usize>,

    /// Period of the background expiration sweep.
    #[serde(rename = "expiration_scan_interval_ms", with = "duration_ms")]
    pub expiration_scan_interval: Duration,

    /// Store location (LMDB directory).
    pub endpoint: Option<String>,

    pub lmdb_map_size_mb: usize,

    // ========================================================================
    // Non-blocking enhancer
    // ========================================================================
    pub non_blocking: bool,

    /// Bounded queue length; producers wait when full.
    pub queue_capacity: usize,

    /// Queue depth above which a warning is logged.
    pub queue_high_water: usize,

    // ========================================================================
    // Local layer
    // ========================================================================
    pub local_layer: bool,

    pub local_capacity: Option<usize>,

    // ========================================================================
    // Distributed invalidation
    // ========================================================================
    pub distributed_invalidation: bool,

    #[serde(rename = "broker_connect_timeout_ms", with = "duration_ms")]
    pub broker_connect_timeout: Duration,

    /// Fail startup when the broker cannot connect, instead of degrading to
    /// writer-local invalidation.
    pub broker_required: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            backend: BackendKind::None,
            key_prefix: "cairn".to_string(),
            capacity: None,
            expiration_scan_interval: Duration::from_secs(1),
            endpoint: None,
            lmdb_map_size_mb: 64,
            non_blocking: false,
            queue_capacity: 1024,
            queue_high_water: 768,
            local_layer: false,
            local_capacity: None,
            distributed_invalidation: false,
            broker_connect_timeout: Duration::from_secs(5),
            broker_required: true,
        }
    }
}

impl CacheSettings {
    /// Create settings with default values.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn with_expiration_scan_interval(mut self, interval: Duration) -> Self {
        self.expiration_scan_interval = interval;
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_non_blocking(mut self, queue_capacity: usize) -> Self {
        self.non_blocking = true;
        self.queue_capacity = queue_capacity;
        self.queue_high_water = queue_capacity - queue_capacity / 4;
        self
    }

    pub fn with_local_layer(mut self, capacity: Option<usize>) -> Self {
        self.local_layer = true;
        self.local_capacity = capacity;
        self
    }

    pub fn with_distributed_invalidation(mut self, connect_timeout: Duration) -> Self {
        self.distributed_invalidation = true;
        self.broker_connect_timeout = connect_timeout;
        self
    }

    /// Pub/sub channel carrying invalidation messages for this prefix.
    pub fn invalidation_channel(&self) -> String {
        format!("{}:invalidation", self.key_prefix)
    }

    /// Parse settings from a TOML document. Missing fields take defaults.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let settings: Self = toml::from_str(source).map_err(|e| ConfigError::InvalidValue {
            field: "toml".to_string(),
            value: String::new(),
            reason: e.to_string(),
        })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Create settings from environment variables.
    ///
    /// Environment variables:
    /// - `CAIRN_BACKEND`: none, null, memory or lmdb (default: none)
    /// - `CAIRN_KEY_PREFIX`: key namespace (default: cairn)
    /// - `CAIRN_CAPACITY`: in-memory item cap (default: unbounded)
    /// - `CAIRN_EXPIRATION_SCAN_INTERVAL_MS`: sweep period (default: 1000)
    /// - `CAIRN_ENDPOINT`: LMDB directory
    /// - `CAIRN_LMDB_MAP_SIZE_MB`: LMDB map size (default: 64)
    /// - `CAIRN_NON_BLOCKING`: "true" or "false" (default: false)
    /// - `CAIRN_QUEUE_CAPACITY`: write queue bound (default: 1024)
    /// - `CAIRN_QUEUE_HIGH_WATER`: queue warning threshold (default: 768)
    /// - `CAIRN_LOCAL_LAYER`: "true" or "false" (default: false)
    /// - `CAIRN_LOCAL_CAPACITY`: local layer item cap (default: unbounded)
    /// - `CAIRN_DISTRIBUTED_INVALIDATION`: "true" or "false" (default: false)
    /// - `CAIRN_BROKER_CONNECT_TIMEOUT_MS`: broker startup window (default: 5000)
    /// - `CAIRN_BROKER_REQUIRED`: "true" or "false" (default: true)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let parse = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let settings = Self {
            backend: match parse("CAIRN_BACKEND") {
                Some(value) => value.parse()?,
                None => defaults.backend,
            },
            key_prefix: parse("CAIRN_KEY_PREFIX").unwrap_or(defaults.key_prefix),
            capacity: parse_optional(&parse, "CAIRN_CAPACITY")?.or(defaults.capacity),
            expiration_scan_interval: parse_optional(&parse, "CAIRN_EXPIRATION_SCAN_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.expiration_scan_interval),
            endpoint: parse("CAIRN_ENDPOINT").or(defaults.endpoint),
            lmdb_map_size_mb: parse_optional(&parse, "CAIRN_LMDB_MAP_SIZE_MB")?
                .unwrap_or(defaults.lmdb_map_size_mb),
            non_blocking: parse_flag(&parse, "CAIRN_NON_BLOCKING")?
                .unwrap_or(defaults.non_blocking),
            queue_capacity: parse_optional(&parse, "CAIRN_QUEUE_CAPACITY")?
                .unwrap_or(defaults.queue_capacity),
            queue_high_water: parse_optional(&parse, "CAIRN_QUEUE_HIGH_WATER")?
                .unwrap_or(defaults.queue_high_water),
            local_layer: parse_flag(&parse, "CAIRN_LOCAL_LAYER")?.unwrap_or(defaults.local_layer),
            local_capacity: parse_optional(&parse, "CAIRN_LOCAL_CAPACITY")?
                .or(defaults.local_capacity),
            distributed_invalidation: parse_flag(&parse, "CAIRN_DISTRIBUTED_INVALIDATION")?
                .unwrap_or(defaults.distributed_invalidation),
            broker_connect_timeout: parse_optional(&parse, "CAIRN_BROKER_CONNECT_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.broker_connect_timeout),
            broker_required: parse_flag(&parse, "CAIRN_BROKER_REQUIRED")?
                .unwrap_or(defaults.broker_required),
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.key_prefix.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "key_prefix".to_string(),
            });
        }
        if self.backend == BackendKind::Lmdb && self.endpoint.is_none() {
            return Err(ConfigError::MissingRequired {
                field: "endpoint".to_string(),
            });
        }
        if self.expiration_scan_interval.is_zero() {
            return Err(invalid(
                "expiration_scan_interval",
                "0",
                "must be greater than zero",
            ));
        }
        if self.non_blocking && self.queue_capacity == 0 {
            return Err(invalid("queue_capacity", "0", "must be greater than zero"));
        }
        if self.queue_high_water > self.queue_capacity {
            return Err(invalid(
                "queue_high_water",
                &self.queue_high_water.to_string(),
                "must not exceed queue_capacity",
            ));
        }
        if matches!(self.capacity, Some(0)) || matches!(self.local_capacity, Some(0)) {
            return Err(invalid("capacity", "0", "must be greater than zero"));
        }
        Ok(())
    }
}

fn invalid(field: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_optional<T, F>(parse: &F, name: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    parse(name)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|_| invalid(name, &raw, "not a valid number"))
        })
        .transpose()
}

fn parse_flag<F>(parse: &F, name: &str) -> Result<Option<bool>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    parse(name)
        .map(|raw| match raw.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(invalid(name, &raw, "expected true or false")),
        })
        .transpose()
}
