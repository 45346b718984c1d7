//! Pluggable value serializers.
//!
//! A [`ValueSerializer`] turns a [`CacheValue`] into bytes and back. Because
//! values are type-erased, both built-in serializers frame the payload with
//! the registered type name so the reader can pick the concrete decoding type
//! without outside hints:
//!
//! ```text
//! [1 byte: 0 = null, 1 = object]
//! [u32 len][type name, UTF-8]      (object only)
//! [u32 len][codec payload]         (object only)
//! ```
//!
//! A type name that is not in the reader's [`TypeRegistry`] is fatal: there
//! is no fallback decoding strategy.

use crate::wire::{put_len_prefixed, WireReader};
use crate::{CacheResult, CacheValue, InvalidEntryError, StorageError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

const NULL_MARKER: u8 = 0;
const OBJECT_MARKER: u8 = 1;

/// Codec turning values into bytes.
pub trait ValueSerializer: Send + Sync {
    /// Short codec name for diagnostics.
    fn name(&self) -> &'static str;

    /// Serialize a value, or a null when `value` is `None`.
    fn serialize(&self, value: Option<&CacheValue>) -> CacheResult<Vec<u8>>;

    /// Deserialize bytes produced by [`serialize`](Self::serialize).
    fn deserialize(&self, bytes: &[u8]) -> CacheResult<Option<CacheValue>>;
}

// ============================================================================
// TYPE REGISTRY
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Json,
    Binary,
}

type EncodeFn = fn(&CacheValue, Format) -> CacheResult<Vec<u8>>;
type DecodeFn = fn(&[u8], Format) -> CacheResult<CacheValue>;

#[derive(Clone, Copy)]
struct TypeCodec {
    encode: EncodeFn,
    decode: DecodeFn,
}

fn encode_as<T>(value: &CacheValue, format: Format) -> CacheResult<Vec<u8>>
where
    T: Serialize + Any,
{
    let typed = value
        .downcast_ref::<T>()
        .ok_or_else(|| StorageError::Serialization {
            reason: format!(
                "value of type {} does not match registered type {}",
                value.rust_type_name(),
                std::any::type_name::<T>()
            ),
        })?;
    let bytes = match format {
        Format::Json => serde_json::to_vec(typed).map_err(|e| e.to_string()),
        Format::Binary => bincode::serialize(typed).map_err(|e| e.to_string()),
    };
    bytes.map_err(|reason| StorageError::Serialization { reason }.into())
}

fn decode_as<T>(bytes: &[u8], format: Format) -> CacheResult<CacheValue>
where
    T: DeserializeOwned + Any + Send + Sync + fmt::Debug + PartialEq,
{
    let typed: Result<T, String> = match format {
        Format::Json => serde_json::from_slice(bytes).map_err(|e| e.to_string()),
        Format::Binary => bincode::deserialize(bytes).map_err(|e| e.to_string()),
    };
    typed
        .map(CacheValue::new)
        .map_err(|reason| InvalidEntryError::Malformed { reason }.into())
}

/// Maps stable type names to concrete Rust types.
///
/// Every process that reads a shared store must register the same names.
#[derive(Clone, Default)]
pub struct TypeRegistry {
    by_name: HashMap<String, (TypeId, TypeCodec)>,
    by_type: HashMap<TypeId, String>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with common scalar and string types.
    pub fn with_primitives() -> Self {
        Self::new()
            .with::<String>("string")
            .with::<bool>("bool")
            .with::<i32>("i32")
            .with::<i64>("i64")
            .with::<u32>("u32")
            .with::<u64>("u64")
            .with::<f64>("f64")
            .with::<Vec<u8>>("bytes")
            .with::<Vec<String>>("string-list")
    }

    /// Register `T` under `name`. Re-registering a name replaces it.
    pub fn register<T>(&mut self, name: impl Into<String>) -> &mut Self
    where
        T: Serialize + DeserializeOwned + Any + Send + Sync + fmt::Debug + PartialEq,
    {
        let name = name.into();
        let type_id = TypeId::of::<T>();
        let codec = TypeCodec {
            encode: encode_as::<T>,
            decode: decode_as::<T>,
        };
        if let Some((previous, _)) = self.by_name.insert(name.clone(), (type_id, codec)) {
            self.by_type.remove(&previous);
        }
        self.by_type.insert(type_id, name);
        self
    }

    /// Builder form of [`register`](Self::register).
    pub fn with<T>(mut self, name: impl Into<String>) -> Self
    where
        T: Serialize + DeserializeOwned + Any + Send + Sync + fmt::Debug + PartialEq,
    {
        self.register::<T>(name);
        self
    }

    /// Registered name of a value's concrete type.
    pub fn name_of(&self, value: &CacheValue) -> Option<&str> {
        self.by_type.get(&value.value_type_id()).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    fn encode(&self, value: &CacheValue, format: Format) -> CacheResult<(&str, Vec<u8>)> {
        let name = self
            .name_of(value)
            .ok_or_else(|| StorageError::UnregisteredType {
                type_name: value.rust_type_name().to_string(),
            })?;
        let (_, codec) = self
            .by_name
            .get(name)
            .ok_or_else(|| StorageError::UnregisteredType {
                type_name: name.to_string(),
            })?;
        Ok((name, (codec.encode)(value, format)?))
    }

    fn decode(&self, name: &str, payload: &[u8], format: Format) -> CacheResult<CacheValue> {
        let (_, codec) = self
            .by_name
            .get(name)
            .ok_or_else(|| InvalidEntryError::UnresolvedType {
                type_name: name.to_string(),
            })?;
        (codec.decode)(payload, format)
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.by_name.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("TypeRegistry").field("types", &names).finish()
    }
}

// ============================================================================
// FRAMED SERIALIZERS
// ============================================================================

fn write_framed(
    registry: &TypeRegistry,
    value: Option<&CacheValue>,
    format: Format,
) -> CacheResult<Vec<u8>> {
    let Some(value) = value else {
        return Ok(vec![NULL_MARKER]);
    };
    let (name, payload) = registry.encode(value, format)?;
    let mut buf = Vec::with_capacity(1 + 8 + name.len() + payload.len());
    buf.push(OBJECT_MARKER);
    put_len_prefixed(&mut buf, name.as_bytes())?;
    put_len_prefixed(&mut buf, &payload)?;
    Ok(buf)
}

fn read_framed(
    registry: &TypeRegistry,
    bytes: &[u8],
    format: Format,
) -> CacheResult<Option<CacheValue>> {
    let mut reader = WireReader::new(bytes);
    match reader.read_u8("value marker")? {
        NULL_MARKER => {
            reader.finish("null value")?;
            Ok(None)
        }
        OBJECT_MARKER => {
            let name = reader.read_string("type name")?;
            let payload = reader.read_len_prefixed("value payload")?;
            reader.finish("value payload")?;
            registry.decode(name, payload, format).map(Some)
        }
        other => Err(InvalidEntryError::Malformed {
            reason: format!("unknown value marker {other}"),
        }
        .into()),
    }
}

/// JSON payload codec.
#[derive(Debug, Clone)]
pub struct JsonValueSerializer {
    registry: Arc<TypeRegistry>,
}

impl JsonValueSerializer {
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }
}

impl ValueSerializer for JsonValueSerializer {
    fn name(&self) -> &'static str {
        "json"
    }

    fn serialize(&self, value: Option<&CacheValue>) -> CacheResult<Vec<u8>> {
        write_framed(&self.registry, value, Format::Json)
    }

    fn deserialize(&self, bytes: &[u8]) -> CacheResult<Option<CacheValue>> {
        read_framed(&self.registry, bytes, Format::Json)
    }
}

/// Compact binary payload codec (bincode).
#[derive(Debug, Clone)]
pub struct BinaryValueSerializer {
    registry: Arc<TypeRegistry>,
}

impl BinaryValueSerializer {
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }
}

impl ValueSerializer for BinaryValueSerializer {
    fn name(&self) -> &'static str {
        "binary"
    }

    fn serialize(&self, value: Option<&CacheValue>) -> CacheResult<Vec<u8>> {
        write_framed(&self.registry, value, Format::Binary)
    }

    fn deserialize(&self, bytes: &[u8]) -> CacheResult<Option<CacheValue>> {
        read_framed(&self.registry, bytes, Format::Binary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CacheError;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Invoice {
        number: u64,
        lines: Vec<String>,
    }

    fn registry() -> Arc<TypeRegistry> {
        Arc::new(TypeRegistry::with_primitives().with::<Invoice>("billing.Invoice"))
    }

    #[test]
    fn test_json_frame_layout() {
        let serializer = JsonValueSerializer::new(registry());
        let bytes = serializer
            .serialize(Some(&CacheValue::new(42u32)))
            .unwrap();

        assert_eq!(bytes[0], OBJECT_MARKER);
        assert_eq!(&bytes[1..5], &3u32.to_le_bytes());
        assert_eq!(&bytes[5..8], b"u32");
        assert_eq!(&bytes[8..12], &2u32.to_le_bytes());
        assert_eq!(&bytes[12..], b"42");
    }

    #[test]
    fn test_null_roundtrip() {
        for serializer in [
            Box::new(JsonValueSerializer::new(registry())) as Box<dyn ValueSerializer>,
            Box::new(BinaryValueSerializer::new(registry())),
        ] {
            let bytes = serializer.serialize(None).unwrap();
            assert_eq!(bytes, vec![NULL_MARKER]);
            assert!(serializer.deserialize(&bytes).unwrap().is_none());
        }
    }

    #[test]
    fn test_struct_roundtrip() {
        let invoice = Invoice {
            number: 1001,
            lines: vec!["desk".to_string(), "chair".to_string()],
        };
        for serializer in [
            Box::new(JsonValueSerializer::new(registry())) as Box<dyn ValueSerializer>,
            Box::new(BinaryValueSerializer::new(registry())),
        ] {
            let bytes = serializer
                .serialize(Some(&CacheValue::new(invoice.clone())))
                .unwrap();
            let value = serializer.deserialize(&bytes).unwrap().unwrap();
            assert_eq!(value.downcast_ref::<Invoice>(), Some(&invoice));
        }
    }

    #[test]
    fn test_unregistered_type_on_write() {
        #[derive(Debug, PartialEq)]
        struct Unknown;

        let serializer = JsonValueSerializer::new(registry());
        let err = serializer
            .serialize(Some(&CacheValue::new(Unknown)))
            .unwrap_err();
        assert!(matches!(
            err,
            CacheError::Storage(StorageError::UnregisteredType { .. })
        ));
    }

    #[test]
    fn test_unresolved_type_on_read_is_fatal() {
        let writer = JsonValueSerializer::new(registry());
        let bytes = writer
            .serialize(Some(&CacheValue::new(Invoice {
                number: 1,
                lines: vec![],
            })))
            .unwrap();

        let reader = JsonValueSerializer::new(Arc::new(TypeRegistry::with_primitives()));
        let err = reader.deserialize(&bytes).unwrap_err();
        assert_eq!(
            err,
            CacheError::InvalidEntry(InvalidEntryError::UnresolvedType {
                type_name: "billing.Invoice".to_string()
            })
        );
        assert!(err.is_fatal());
    }

    #[test]
    fn test_reregistering_name_replaces_type() {
        let mut registry = TypeRegistry::new();
        registry.register::<u32>("counter");
        registry.register::<u64>("counter");
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.name_of(&CacheValue::new(1u64)), Some("counter"));
        assert_eq!(registry.name_of(&CacheValue::new(1u32)), None);
    }
}
