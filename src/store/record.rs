use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::value::{Key, Value};

/// Fixed-size prefix of every log record, followed by key and value bytes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct RecordHeader {
    pub tombstone: bool,
    pub key_len: u32,
    pub value_len: u32,
}

impl RecordHeader {
    /// Encoded size: one flag byte and two u32 lengths
    pub const SIZE: usize = 9;

    pub fn record_len(&self) -> usize {
        Self::SIZE + self.key_len as usize + self.value_len as usize
    }

    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        Ok(bincode::deserialize(&bytes[..Self::SIZE.min(bytes.len())])?)
    }
}

/// A record as laid out in the log.
#[derive(Debug, Clone)]
pub(crate) struct Record<K, V> {
    pub tombstone: bool,
    pub key: K,
    /// None for tombstones appended for keys without a live value
    pub value: Option<V>,
}

pub(crate) fn encode_record<K: Key, V: Value>(
    key: &K,
    value: Option<&V>,
    tombstone: bool,
) -> Result<Vec<u8>, StoreError> {
    let key_bytes = key.to_bytes();
    let value_bytes = value.map(Value::to_bytes).unwrap_or_default();
    let header = RecordHeader {
        tombstone,
        key_len: key_bytes.len() as u32,
        value_len: value_bytes.len() as u32,
    };
    let mut bytes = header.encode()?;
    bytes.reserve(key_bytes.len() + value_bytes.len());
    bytes.extend_from_slice(&key_bytes);
    bytes.extend_from_slice(&value_bytes);
    Ok(bytes)
}

/// Decode a full record. `bytes` must start with the header and cover the
/// whole record.
pub(crate) fn decode_record<K: Key, V: Value>(bytes: &[u8]) -> Result<Record<K, V>, StoreError> {
    let header = RecordHeader::decode(bytes)?;
    let key_end = RecordHeader::SIZE + header.key_len as usize;
    let value_end = key_end + header.value_len as usize;
    let key = K::from_bytes(&bytes[RecordHeader::SIZE..key_end]);
    let value = (header.value_len > 0).then(|| V::from_bytes(&bytes[key_end..value_end]));
    Ok(Record {
        tombstone: header.tombstone,
        key,
        value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{FixedValue, LargeValue};

    #[test]
    fn test_header_size() {
        let header = RecordHeader {
            tombstone: true,
            key_len: 8,
            value_len: 1 << 20,
        };
        let bytes = header.encode().unwrap();
        assert_eq!(bytes.len(), RecordHeader::SIZE);
        assert_eq!(RecordHeader::decode(&bytes).unwrap(), header);
        assert_eq!(header.record_len(), RecordHeader::SIZE + 8 + (1 << 20));
    }

    #[test]
    fn test_record_layout() {
        let value = LargeValue::with_content(13212, 64);
        let bytes = encode_record(&-1231i64, Some(&value), false).unwrap();
        assert_eq!(bytes.len(), RecordHeader::SIZE + 8 + 4 + 64);

        let record: Record<i64, LargeValue> = decode_record(&bytes).unwrap();
        assert!(!record.tombstone);
        assert_eq!(record.key, -1231);
        assert_eq!(record.value, Some(value));
    }

    #[test]
    fn test_tombstone_without_value() {
        let bytes = encode_record::<u64, FixedValue>(&7, None, true).unwrap();
        let record: Record<u64, FixedValue> = decode_record(&bytes).unwrap();
        assert!(record.tombstone);
        assert_eq!(record.key, 7);
        assert_eq!(record.value, None);
    }
}
