use std::fmt::Debug;
use std::hash::Hash;

use serde::{Deserialize, Serialize};

const WORD: usize = size_of::<i64>();

/// Byte codec for keys stored in the log.
pub trait Key: Hash + Eq + Clone + Debug + Send + Sync + 'static {
    fn to_bytes(&self) -> Vec<u8>;

    fn from_bytes(bytes: &[u8]) -> Self;

    /// Store key for a key of the benchmark universe, None if the key type
    /// cannot represent it
    fn from_u64(key: u64) -> Option<Self>;
}

/// Byte codec for values stored in the log.
pub trait Value: Clone + Debug + Send + Sync + 'static {
    fn to_bytes(&self) -> Vec<u8>;

    fn from_bytes(bytes: &[u8]) -> Self;
}

/// Values and outputs that carry a decodable identifying integer.
pub trait Tagged {
    /// The encoded tag, or None if the content is empty or inconsistent
    fn tag(&self) -> Option<i64>;
}

/// Read/RMW inputs the harness derives from the expected value of a key.
pub trait FromValue<V> {
    fn from_value(value: &V) -> Self;
}

/// Little-endian read that zero-pads short input.
fn read_le<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut buf = [0u8; N];
    let len = bytes.len().min(N);
    buf[..len].copy_from_slice(&bytes[..len]);
    buf
}

macro_rules! int_key {
    ($($t:ty),*) => {
        $(
            impl Key for $t {
                fn to_bytes(&self) -> Vec<u8> {
                    self.to_le_bytes().to_vec()
                }

                fn from_bytes(bytes: &[u8]) -> Self {
                    <$t>::from_le_bytes(read_le(bytes))
                }

                fn from_u64(key: u64) -> Option<Self> {
                    <$t>::try_from(key).ok()
                }
            }
        )*
    };
}

int_key!(u32, i32, u64, i64);

/// Small fixed-size record.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedValue(pub u64);

impl Value for FixedValue {
    fn to_bytes(&self) -> Vec<u8> {
        self.0.to_le_bytes().to_vec()
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        FixedValue(u64::from_le_bytes(read_le(bytes)))
    }
}

impl FromValue<FixedValue> for u64 {
    fn from_value(value: &FixedValue) -> Self {
        value.0
    }
}

impl Tagged for FixedValue {
    fn tag(&self) -> Option<i64> {
        Some(self.0 as i64)
    }
}

/// Variable-length value. Built with [`LargeValue::with_content`] every
/// 8-byte little-endian word of the payload holds the same integer.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LargeValue {
    bytes: Vec<u8>,
}

impl LargeValue {
    /// `size` bytes where byte `i` is `(size + i) as u8`
    pub fn patterned(size: usize) -> Self {
        let bytes = (0..size).map(|i| (size + i) as u8).collect();
        Self { bytes }
    }

    /// `size` bytes repeating the little-endian encoding of `content`.
    /// A trailing partial word is truncated.
    pub fn with_content(content: i64, size: usize) -> Self {
        let bytes = content
            .to_le_bytes()
            .into_iter()
            .cycle()
            .take(size)
            .collect();
        Self { bytes }
    }

    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Decode every complete 8-byte word
    pub fn words(&self) -> impl Iterator<Item = i64> + '_ {
        self.bytes
            .chunks_exact(WORD)
            .map(|chunk| i64::from_le_bytes(read_le(chunk)))
    }

    /// True if the payload matches [`LargeValue::patterned`] for its length
    pub fn is_patterned(&self) -> bool {
        let size = self.bytes.len();
        self.bytes
            .iter()
            .enumerate()
            .all(|(i, &b)| b == (size + i) as u8)
    }
}

impl Tagged for LargeValue {
    fn tag(&self) -> Option<i64> {
        let mut words = self.words();
        let first = words.next()?;
        words.all(|word| word == first).then_some(first)
    }
}

impl Value for LargeValue {
    /// Length-prefixed payload
    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(size_of::<u32>() + self.bytes.len());
        bytes.extend_from_slice(&(self.bytes.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&self.bytes);
        bytes
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        let len = u32::from_le_bytes(read_le(bytes)) as usize;
        let body = bytes.get(size_of::<u32>()..).unwrap_or_default();
        let len = len.min(body.len());
        Self {
            bytes: body[..len].to_vec(),
        }
    }
}

/// Read output for [`LargeValue`] stores.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LargeOutput(pub Option<LargeValue>);

impl Tagged for LargeOutput {
    fn tag(&self) -> Option<i64> {
        self.0.as_ref().and_then(Tagged::tag)
    }
}
