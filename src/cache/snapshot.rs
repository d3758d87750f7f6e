/// Serialized form of cache contents.
///
/// Wire format (little-endian):
///
/// ```text
/// version: u8 | record_count: u32 | record*
/// record  = raw_hash: [u8; 16] | value_len: u32 | value | last_use_timestamp_ms: i64
/// ```
use bytes::Bytes;

use crate::error::SnapshotError;
use crate::key::{RawHash, HASH_SIZE};

/// Bump when the record layout changes incompatibly.
pub const SNAPSHOT_VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedMemCacheDumpEntry {
    pub raw_key: RawHash,
    pub value: Bytes,
    pub last_use_timestamp_ms: i64,
}

/// Entries in the order they were collected (oldest first per sector).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SharedMemCacheDump {
    pub entries: Vec<SharedMemCacheDumpEntry>,
}

impl SharedMemCacheDump {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn marshal(&self) -> Vec<u8> {
        let payload: usize = self
            .entries
            .iter()
            .map(|e| HASH_SIZE + 4 + e.value.len() + 8)
            .sum();
        let mut buf = Vec::with_capacity(1 + 4 + payload);
        buf.push(SNAPSHOT_VERSION);
        buf.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        for entry in &self.entries {
            buf.extend_from_slice(&entry.raw_key);
            buf.extend_from_slice(&(entry.value.len() as u32).to_le_bytes());
            buf.extend_from_slice(&entry.value);
            buf.extend_from_slice(&entry.last_use_timestamp_ms.to_le_bytes());
        }
        buf
    }

    pub fn try_demarshal(data: &[u8]) -> Result<Self, SnapshotError> {
        let mut reader = Reader { data, pos: 0 };
        let version = *data.first().ok_or(SnapshotError::Empty)?;
        reader.pos = 1;
        if version != SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion(version));
        }

        let count = u32::from_le_bytes(reader.array()?) as usize;
        // Every record is at least 28 bytes; don't trust `count` blindly.
        let mut entries = Vec::with_capacity(count.min(data.len() / (HASH_SIZE + 12)));
        for _ in 0..count {
            let raw_key: RawHash = reader.array()?;
            let len = u32::from_le_bytes(reader.array()?) as usize;
            let value = Bytes::copy_from_slice(reader.take(len)?);
            let last_use_timestamp_ms = i64::from_le_bytes(reader.array()?);
            entries.push(SharedMemCacheDumpEntry {
                raw_key,
                value,
                last_use_timestamp_ms,
            });
        }

        let rest = data.len() - reader.pos;
        if rest != 0 {
            return Err(SnapshotError::TrailingBytes(rest));
        }
        Ok(SharedMemCacheDump { entries })
    }

    /// Like [`Self::try_demarshal`], but logs failures and yields an empty
    /// dump instead.
    pub fn demarshal(data: &[u8]) -> Self {
        match Self::try_demarshal(data) {
            Ok(dump) => dump,
            Err(err) => {
                tracing::error!(%err, len = data.len(), "failed to decode cache snapshot");
                Self::default()
            }
        }
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], SnapshotError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.data.len())
            .ok_or(SnapshotError::Truncated { offset: self.pos })?;
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], SnapshotError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }
}
