//! Little-endian framing helpers shared by the entry codec and value serializers.

use crate::{CacheResult, InvalidEntryError, StorageError};

pub(crate) fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub(crate) fn put_len_prefixed(buf: &mut Vec<u8>, bytes: &[u8]) -> CacheResult<()> {
    let len = u32::try_from(bytes.len()).map_err(|_| StorageError::Serialization {
        reason: format!("field of {} bytes exceeds u32 length prefix", bytes.len()),
    })?;
    put_u32(buf, len);
    buf.extend_from_slice(bytes);
    Ok(())
}

/// Cursor over a borrowed buffer. Running out of bytes is an invalid entry.
pub(crate) struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn take(&mut self, len: usize, context: &str) -> CacheResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| InvalidEntryError::Truncated {
                context: context.to_string(),
            })?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub(crate) fn read_u8(&mut self, context: &str) -> CacheResult<u8> {
        Ok(self.take(1, context)?[0])
    }

    pub(crate) fn read_u32(&mut self, context: &str) -> CacheResult<u32> {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(self.take(4, context)?);
        Ok(u32::from_le_bytes(bytes))
    }

    pub(crate) fn read_u64(&mut self, context: &str) -> CacheResult<u64> {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(self.take(8, context)?);
        Ok(u64::from_le_bytes(bytes))
    }

    pub(crate) fn read_i64(&mut self, context: &str) -> CacheResult<i64> {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(self.take(8, context)?);
        Ok(i64::from_le_bytes(bytes))
    }

    pub(crate) fn read_len_prefixed(&mut self, context: &str) -> CacheResult<&'a [u8]> {
        let len = self.read_u32(context)? as usize;
        self.take(len, context)
    }

    pub(crate) fn read_string(&mut self, context: &str) -> CacheResult<&'a str> {
        let bytes = self.read_len_prefixed(context)?;
        std::str::from_utf8(bytes).map_err(|e| {
            InvalidEntryError::Malformed {
                reason: format!("{context} is not valid UTF-8: {e}"),
            }
            .into()
        })
    }

    pub(crate) fn finish(&self, context: &str) -> CacheResult<()> {
        if self.pos == self.buf.len() {
            Ok(())
        } else {
            Err(InvalidEntryError::Malformed {
                reason: format!(
                    "{} trailing bytes after {context}",
                    self.buf.len() - self.pos
                ),
            }
            .into())
        }
    }
}
