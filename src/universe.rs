//! Deterministic partitioning of the benchmark key space.
//!
//! The universe holds `rounds` buckets of `per_round_keys` keys. Global index
//! `i` lives at bucket `i / per_round_keys`, position `i % per_round_keys`.
//! Worker `t` of `n` owns buckets `t, t + n, t + 2n, ...`.

use std::iter::StepBy;
use std::ops::Range;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::error::{HarnessError, Result};

/// How keys are derived from their global index.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyPolicy {
    /// Key is the global index. Every generation rewrites the same keys.
    #[default]
    UpdateOnly,
    /// Key is `generation * max_key + index`. Every generation inserts new keys.
    Fresh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniverseShape {
    pub per_round_keys: usize,
    pub rounds: usize,
}

impl UniverseShape {
    pub fn new(per_round_keys: usize, rounds: usize) -> Self {
        Self {
            per_round_keys,
            rounds,
        }
    }

    pub fn max_key(&self) -> u64 {
        self.per_round_keys as u64 * self.rounds as u64
    }

    pub fn checked_max_key(&self) -> Option<u64> {
        (self.per_round_keys as u64).checked_mul(self.rounds as u64)
    }

    /// `(round, index)` of global index `i`
    pub fn locate(&self, i: u64) -> (usize, usize) {
        let per_round = self.per_round_keys as u64;
        ((i / per_round) as usize, (i % per_round) as usize)
    }

    pub fn global_index(&self, round: usize, index: usize) -> u64 {
        round as u64 * self.per_round_keys as u64 + index as u64
    }

    pub fn checked_fresh_key(&self, generation: u64, index: u64) -> Option<u64> {
        generation
            .checked_mul(self.checked_max_key()?)?
            .checked_add(index)
    }

    /// Round buckets owned by `thread_id` out of `threads` workers
    pub fn worker_rounds(&self, thread_id: usize, threads: usize) -> StepBy<Range<usize>> {
        debug_assert!(threads > 0 && thread_id < threads);
        (thread_id..self.rounds).step_by(threads)
    }

    /// Number of keys processed by `thread_id` in one phase
    pub fn worker_key_count(&self, thread_id: usize, threads: usize) -> u64 {
        self.worker_rounds(thread_id, threads).len() as u64 * self.per_round_keys as u64
    }
}

/// Generated keys and values, indexed `[round][index]`.
#[derive(Debug, Clone)]
pub struct KeyUniverse<V> {
    shape: UniverseShape,
    policy: KeyPolicy,
    generation: u64,
    keys: Vec<Vec<u64>>,
    values: Vec<Vec<V>>,
}

impl<V> KeyUniverse<V> {
    /// Build the universe for `generation`.
    ///
    /// `value_for` receives the value tag `generation * max_key + i` of each
    /// global index `i`, independently of the key policy.
    pub fn generate<F>(
        shape: UniverseShape,
        policy: KeyPolicy,
        generation: u64,
        mut value_for: F,
    ) -> Result<Self>
    where
        F: FnMut(u64) -> V,
    {
        let max_key = shape.checked_max_key().ok_or_else(|| {
            HarnessError::InvalidConfig(format!("key universe {shape:?} overflows"))
        })?;
        if max_key == 0 {
            return Err(HarnessError::InvalidConfig(format!(
                "key universe {shape:?} is empty"
            )));
        }
        let base = shape
            .checked_fresh_key(generation, max_key - 1)
            .map(|last| last - (max_key - 1))
            .ok_or_else(|| {
                HarnessError::InvalidConfig(format!(
                    "generation {generation} overflows key universe {shape:?}"
                ))
            })?;

        let mut keys = Vec::with_capacity(shape.rounds);
        let mut values = Vec::with_capacity(shape.rounds);
        for round in 0..shape.rounds {
            let mut round_keys = Vec::with_capacity(shape.per_round_keys);
            let mut round_values = Vec::with_capacity(shape.per_round_keys);
            for index in 0..shape.per_round_keys {
                let i = shape.global_index(round, index);
                let key = match policy {
                    KeyPolicy::UpdateOnly => i,
                    KeyPolicy::Fresh => base + i,
                };
                round_keys.push(key);
                round_values.push(value_for(base + i));
            }
            keys.push(round_keys);
            values.push(round_values);
        }

        Ok(Self {
            shape,
            policy,
            generation,
            keys,
            values,
        })
    }

    pub fn shape(&self) -> UniverseShape {
        self.shape
    }

    pub fn policy(&self) -> KeyPolicy {
        self.policy
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> u64 {
        self.shape.max_key()
    }

    /// Smallest and largest key of the universe
    pub fn key_bounds(&self) -> (u64, u64) {
        let first = match self.policy {
            KeyPolicy::UpdateOnly => 0,
            // in range: `generate` checked the last fresh key
            KeyPolicy::Fresh => self.generation * self.shape.max_key(),
        };
        (first, first + self.shape.max_key() - 1)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn round(&self, round: usize) -> (&[u64], &[V]) {
        (&self.keys[round], &self.values[round])
    }

    pub fn get(&self, round: usize, index: usize) -> (u64, &V) {
        (self.keys[round][index], &self.values[round][index])
    }

    /// Keys and values of one worker, bucket by bucket
    pub fn worker_slice(
        &self,
        thread_id: usize,
        threads: usize,
    ) -> impl Iterator<Item = (u64, &V)> + '_ {
        self.shape
            .worker_rounds(thread_id, threads)
            .flat_map(move |round| {
                self.keys[round]
                    .iter()
                    .copied()
                    .zip(self.values[round].iter())
            })
    }

    /// Permute every bucket in place. Keys stay paired with their values
    /// and the bucket contents stay the same.
    pub fn shuffle_within_rounds(&mut self, seed: u64) {
        let mut rng = StdRng::seed_from_u64(seed);
        for (keys, values) in self.keys.iter_mut().zip(self.values.iter_mut()) {
            let mut order: Vec<usize> = (0..keys.len()).collect();
            order.shuffle(&mut rng);
            let shuffled_keys = order.iter().map(|&i| keys[i]).collect();
            let mut slots: Vec<Option<V>> = values.drain(..).map(Some).collect();
            let shuffled_values = order.iter().filter_map(|&i| slots[i].take()).collect();
            *keys = shuffled_keys;
            *values = shuffled_values;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    fn universe(per_round_keys: usize, rounds: usize, policy: KeyPolicy, generation: u64) -> KeyUniverse<u64> {
        KeyUniverse::generate(
            UniverseShape::new(per_round_keys, rounds),
            policy,
            generation,
            |tag| tag,
        )
        .unwrap()
    }

    #[test]
    fn test_update_only_keys_are_global_index() {
        let universe = universe(4, 3, KeyPolicy::UpdateOnly, 5);
        for i in 0..12 {
            let (round, index) = universe.shape().locate(i);
            let (key, &tag) = universe.get(round, index);
            assert_eq!(key, i);
            assert_eq!(tag, 5 * 12 + i);
        }
    }

    #[test]
    fn test_fresh_keys_are_offset_by_generation() {
        let first = universe(4, 3, KeyPolicy::Fresh, 0);
        let second = universe(4, 3, KeyPolicy::Fresh, 1);
        assert_eq!(first.get(0, 0).0, 0);
        assert_eq!(second.get(0, 0).0, 12);
        assert_eq!(second.get(2, 3).0, 23);

        let first_keys: HashSet<u64> = first.worker_slice(0, 1).map(|(k, _)| k).collect();
        assert!(second.worker_slice(0, 1).all(|(k, _)| !first_keys.contains(&k)));

        assert_eq!(first.key_bounds(), (0, 11));
        assert_eq!(second.key_bounds(), (12, 23));
        assert_eq!(universe(4, 3, KeyPolicy::UpdateOnly, 5).key_bounds(), (0, 11));
    }

    #[test]
    fn test_generation_is_deterministic() {
        let a = universe(8, 5, KeyPolicy::Fresh, 3);
        let b = universe(8, 5, KeyPolicy::Fresh, 3);
        assert!(a.worker_slice(0, 1).eq(b.worker_slice(0, 1)));
    }

    #[rstest]
    #[case(1, 1)]
    #[case(4, 8)]
    #[case(3, 8)]
    #[case(8, 3)]
    fn test_worker_rounds_are_striped(#[case] threads: usize, #[case] rounds: usize) {
        let shape = UniverseShape::new(2, rounds);
        let mut seen = vec![0; rounds];
        for thread_id in 0..threads {
            let mut previous = None;
            for round in shape.worker_rounds(thread_id, threads) {
                assert_eq!(round % threads, thread_id);
                if let Some(previous) = previous {
                    assert_eq!(round - previous, threads);
                }
                previous = Some(round);
                seen[round] += 1;
            }
        }
        assert!(seen.iter().all(|&count| count == 1));
    }

    #[test]
    fn test_empty_universe_is_rejected() {
        let result = KeyUniverse::generate(UniverseShape::new(0, 4), KeyPolicy::UpdateOnly, 0, |t| t);
        assert!(matches!(result, Err(HarnessError::InvalidConfig(_))));
    }

    #[test]
    fn test_overflowing_generation_is_rejected() {
        let result = KeyUniverse::generate(
            UniverseShape::new(1 << 20, 1 << 8),
            KeyPolicy::Fresh,
            u64::MAX / 4,
            |t| t,
        );
        assert!(matches!(result, Err(HarnessError::InvalidConfig(_))));
    }

    #[test]
    fn test_shuffle_keeps_pairs_and_buckets() {
        let original = universe(16, 4, KeyPolicy::Fresh, 2);
        let mut shuffled = original.clone();
        shuffled.shuffle_within_rounds(7);

        let mut moved = false;
        for round in 0..4 {
            let (keys, values) = shuffled.round(round);
            let (original_keys, _) = original.round(round);
            // the value tag still matches the key
            for (key, tag) in keys.iter().zip(values) {
                assert_eq!(key, tag);
            }
            let lhs: HashSet<_> = keys.iter().collect();
            let rhs: HashSet<_> = original_keys.iter().collect();
            assert_eq!(lhs, rhs);
            moved |= keys != original_keys;
        }
        assert!(moved);

        let mut again = original.clone();
        again.shuffle_within_rounds(7);
        assert!(again.worker_slice(0, 1).eq(shuffled.worker_slice(0, 1)));
    }

    proptest! {
        #[test]
        fn prop_locate_is_a_bijection(per_round_keys in 1usize..64, rounds in 1usize..16) {
            let shape = UniverseShape::new(per_round_keys, rounds);
            let mut seen = HashSet::new();
            for i in 0..shape.max_key() {
                let (round, index) = shape.locate(i);
                prop_assert!(round < rounds && index < per_round_keys);
                prop_assert_eq!(shape.global_index(round, index), i);
                prop_assert!(seen.insert((round, index)));
            }
            prop_assert_eq!(seen.len() as u64, shape.max_key());
        }

        #[test]
        fn prop_worker_slices_partition_universe(
            per_round_keys in 1usize..32,
            rounds in 1usize..16,
            threads in 1usize..8,
            policy in prop_oneof![Just(KeyPolicy::UpdateOnly), Just(KeyPolicy::Fresh)],
            generation in 0u64..4,
        ) {
            let universe = universe(per_round_keys, rounds, policy, generation);
            let mut union = HashSet::new();
            let mut total = 0u64;
            for thread_id in 0..threads {
                let slice: Vec<u64> = universe.worker_slice(thread_id, threads).map(|(k, _)| k).collect();
                prop_assert_eq!(slice.len() as u64, universe.shape().worker_key_count(thread_id, threads));
                total += slice.len() as u64;
                for key in slice {
                    prop_assert!(union.insert(key), "key {} assigned twice", key);
                }
            }
            prop_assert_eq!(total, universe.len());
            let expected: HashSet<u64> = universe.worker_slice(0, 1).map(|(k, _)| k).collect();
            prop_assert_eq!(union, expected);
        }
    }
}
