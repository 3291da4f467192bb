use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use parking_lot::RwLock;

const MAX_SHARDS: usize = 64;

/// Key to log address map, split into independently locked shards.
///
/// Lock a shard before the log, never the other way round.
#[derive(Debug)]
pub(crate) struct HashIndex<K> {
    shards: Vec<RwLock<HashMap<K, u64>>>,
    size: u64,
}

impl<K: Hash + Eq> HashIndex<K> {
    pub fn new(capacity: usize) -> Self {
        let size = capacity.max(1).next_power_of_two();
        let shard_count = size.min(MAX_SHARDS);
        let per_shard = size / shard_count;
        let shards = (0..shard_count)
            .map(|_| RwLock::new(HashMap::with_capacity(per_shard)))
            .collect();
        Self {
            shards,
            size: size as u64,
        }
    }

    /// Configured number of hash buckets
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn shard(&self, key: &K) -> &RwLock<HashMap<K, u64>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = hasher.finish() as usize % self.shards.len();
        &self.shards[idx]
    }

    pub fn shards(&self) -> &[RwLock<HashMap<K, u64>>] {
        &self.shards
    }

    pub fn len(&self) -> u64 {
        self.shards.iter().map(|shard| shard.read().len() as u64).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 1)]
    #[case(1000, 1024)]
    #[case(1 << 20, 1 << 20)]
    fn test_index_size(#[case] capacity: usize, #[case] expected: u64) {
        let index = HashIndex::<u64>::new(capacity);
        assert_eq!(index.size(), expected);
        assert!(index.shards().len() <= MAX_SHARDS);
    }

    #[test]
    fn test_shard_is_stable() {
        let index = HashIndex::<u64>::new(4096);
        for key in 0..1000u64 {
            index.shard(&key).write().insert(key, key * 64);
        }
        assert_eq!(index.len(), 1000);
        for key in 0..1000u64 {
            assert_eq!(index.shard(&key).read().get(&key), Some(&(key * 64)));
        }
    }
}
