//! Binary codec for cache entries.
//!
//! # Wire Format
//!
//! ```text
//! [u8 discriminator]        0 = default entry, 1 = materialized entry
//! [u8 priority]
//! [u8 flags]                bit 0: absolute expiration, bit 1: sliding expiration
//! [i64 secs][u32 nanos]     absolute expiration (if flagged)
//! [u64 secs][u32 nanos]     sliding expiration (if flagged)
//! [u32 len][value payload]  produced by the configured ValueSerializer
//! ```
//!
//! Dependencies are not part of the payload: stores keep them in their own
//! dependency index and hand them back to [`EntryCodec::deserialize`].
//! An unknown discriminator is a forward-compatibility guard and always
//! faults with [`InvalidEntryError::UnknownDiscriminator`].

use crate::wire::{put_len_prefixed, put_u32, WireReader};
use crate::{
    CacheEntry, CacheItemPriority, CacheResult, DependencyKey, EntryKind, InvalidEntryError,
    StorageError, ValueSerializer,
};
use chrono::DateTime;
use std::fmt;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

const FLAG_ABSOLUTE: u8 = 0b01;
const FLAG_SLIDING: u8 = 0b10;

/// Serializes cache entries around a pluggable value serializer.
#[derive(Clone)]
pub struct EntryCodec {
    values: Arc<dyn ValueSerializer>,
}

impl fmt::Debug for EntryCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryCodec")
            .field("values", &self.values.name())
            .finish()
    }
}

impl EntryCodec {
    pub fn new(values: Arc<dyn ValueSerializer>) -> Self {
        Self { values }
    }

    pub fn value_serializer(&self) -> &dyn ValueSerializer {
        &*self.values
    }

    /// Write `entry` to `writer`.
    pub fn serialize<W: Write>(&self, entry: &CacheEntry, writer: &mut W) -> CacheResult<()> {
        let bytes = self.to_bytes(entry)?;
        writer
            .write_all(&bytes)
            .map_err(|e| StorageError::Serialization {
                reason: e.to_string(),
            })?;
        Ok(())
    }

    /// Read one entry from `reader`, attaching `dependencies`.
    pub fn deserialize<R: Read>(
        &self,
        reader: &mut R,
        dependencies: impl IntoIterator<Item = DependencyKey>,
    ) -> CacheResult<CacheEntry> {
        let mut bytes = Vec::new();
        reader
            .read_to_end(&mut bytes)
            .map_err(|e| InvalidEntryError::Malformed {
                reason: e.to_string(),
            })?;
        self.from_bytes(&bytes, dependencies)
    }

    /// Encode `entry` into a fresh buffer.
    pub fn to_bytes(&self, entry: &CacheEntry) -> CacheResult<Vec<u8>> {
        let payload = self.values.serialize(entry.value.as_ref())?;

        let mut buf = Vec::with_capacity(32 + payload.len());
        buf.push(entry.kind.discriminator());
        buf.push(entry.priority.as_u8());

        let mut flags = 0u8;
        if entry.absolute_expiration.is_some() {
            flags |= FLAG_ABSOLUTE;
        }
        if entry.sliding_expiration.is_some() {
            flags |= FLAG_SLIDING;
        }
        buf.push(flags);

        if let Some(at) = entry.absolute_expiration {
            buf.extend_from_slice(&at.timestamp().to_le_bytes());
            put_u32(&mut buf, at.timestamp_subsec_nanos());
        }
        if let Some(window) = entry.sliding_expiration {
            buf.extend_from_slice(&window.as_secs().to_le_bytes());
            put_u32(&mut buf, window.subsec_nanos());
        }

        put_len_prefixed(&mut buf, &payload)?;
        Ok(buf)
    }

    /// Decode an entry from `bytes`, attaching `dependencies`.
    pub fn from_bytes(
        &self,
        bytes: &[u8],
        dependencies: impl IntoIterator<Item = DependencyKey>,
    ) -> CacheResult<CacheEntry> {
        let mut reader = WireReader::new(bytes);

        let discriminator = reader.read_u8("discriminator")?;
        let kind = EntryKind::from_discriminator(discriminator).ok_or(
            InvalidEntryError::UnknownDiscriminator {
                byte: discriminator,
            },
        )?;

        let priority_byte = reader.read_u8("priority")?;
        let priority = CacheItemPriority::from_u8(priority_byte).ok_or_else(|| {
            InvalidEntryError::Malformed {
                reason: format!("unknown priority {priority_byte}"),
            }
        })?;

        let flags = reader.read_u8("expiration flags")?;
        if flags & !(FLAG_ABSOLUTE | FLAG_SLIDING) != 0 {
            return Err(InvalidEntryError::Malformed {
                reason: format!("unknown expiration flags {flags:#04b}"),
            }
            .into());
        }

        let absolute_expiration = if flags & FLAG_ABSOLUTE != 0 {
            let secs = reader.read_i64("absolute expiration")?;
            let nanos = reader.read_u32("absolute expiration")?;
            let at = DateTime::from_timestamp(secs, nanos).ok_or_else(|| {
                InvalidEntryError::Malformed {
                    reason: format!("absolute expiration {secs}.{nanos} out of range"),
                }
            })?;
            Some(at)
        } else {
            None
        };

        let sliding_expiration = if flags & FLAG_SLIDING != 0 {
            let secs = reader.read_u64("sliding expiration")?;
            let nanos = reader.read_u32("sliding expiration")?;
            if nanos >= 1_000_000_000 {
                return Err(InvalidEntryError::Malformed {
                    reason: format!("sliding expiration nanos {nanos} out of range"),
                }
                .into());
            }
            Some(Duration::new(secs, nanos))
        } else {
            None
        };

        let payload = reader.read_len_prefixed("value payload")?;
        reader.finish("cache entry")?;
        let value = self.values.deserialize(payload)?;

        Ok(CacheEntry {
            kind,
            value,
            dependencies: dependencies.into_iter().collect(),
            absolute_expiration,
            sliding_expiration,
            priority,
        })
    }
}
