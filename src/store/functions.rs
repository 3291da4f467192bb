use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::store::{CheckpointToken, Status};
use crate::value::{FixedValue, FromValue, LargeOutput, LargeValue, Tagged};

/// User callbacks the reference store invokes to read, update and complete
/// operations.
///
/// Inputs and contexts of pending operations may outlive their session, so
/// both must be `Send`.
pub trait Functions<K, V>: Send + Sync + 'static {
    type Input: Clone + Send;
    type Output: Default;
    type Context: Send;

    fn single_reader(&self, key: &K, input: &Self::Input, value: &V, dst: &mut Self::Output);

    /// Value for an RMW on a missing key
    fn initial_updater(&self, key: &K, input: &Self::Input) -> V;

    /// Value for an RMW on a record that cannot be changed in place
    fn copy_updater(&self, key: &K, input: &Self::Input, old: &V) -> V;

    /// Update a mutable record. Returning false falls back to [`Functions::copy_updater`].
    fn in_place_updater(&self, _key: &K, _input: &Self::Input, _value: &mut V) -> bool {
        false
    }

    fn read_completion_callback(
        &self,
        _key: &K,
        _input: &Self::Input,
        _output: &Self::Output,
        _context: Self::Context,
        _status: Status,
    ) {
    }

    fn rmw_completion_callback(
        &self,
        _key: &K,
        _input: &Self::Input,
        _context: Self::Context,
        _status: Status,
    ) {
    }

    fn checkpoint_completion_callback(&self, _token: &CheckpointToken) {}
}

/// Callbacks for [`FixedValue`] stores. RMW adds the input to the value.
#[derive(Debug, Default)]
pub struct FixedFunctions {
    completed_reads: AtomicU64,
    completed_rmws: AtomicU64,
    last_checkpoint: AtomicU64,
}

impl FixedFunctions {
    /// Reads finished through the completion callback
    pub fn completed_reads(&self) -> u64 {
        self.completed_reads.load(Ordering::Relaxed)
    }

    pub fn completed_rmws(&self) -> u64 {
        self.completed_rmws.load(Ordering::Relaxed)
    }

    /// Version of the last completed checkpoint, 0 if none
    pub fn last_checkpoint(&self) -> u64 {
        self.last_checkpoint.load(Ordering::Relaxed)
    }
}

impl<K> Functions<K, FixedValue> for FixedFunctions {
    type Input = u64;
    type Output = FixedValue;
    type Context = ();

    fn single_reader(&self, _key: &K, _input: &u64, value: &FixedValue, dst: &mut FixedValue) {
        *dst = *value;
    }

    fn initial_updater(&self, _key: &K, input: &u64) -> FixedValue {
        FixedValue(*input)
    }

    fn copy_updater(&self, _key: &K, input: &u64, old: &FixedValue) -> FixedValue {
        FixedValue(old.0.wrapping_add(*input))
    }

    fn in_place_updater(&self, _key: &K, input: &u64, value: &mut FixedValue) -> bool {
        value.0 = value.0.wrapping_add(*input);
        true
    }

    fn read_completion_callback(
        &self,
        _key: &K,
        _input: &u64,
        _output: &FixedValue,
        _context: (),
        _status: Status,
    ) {
        self.completed_reads.fetch_add(1, Ordering::Relaxed);
    }

    fn rmw_completion_callback(&self, _key: &K, _input: &u64, _context: (), _status: Status) {
        self.completed_rmws.fetch_add(1, Ordering::Relaxed);
    }

    fn checkpoint_completion_callback(&self, token: &CheckpointToken) {
        self.last_checkpoint.fetch_max(token.version, Ordering::Relaxed);
    }
}

/// RMW input for [`LargeValue`] stores: rewrite the value with `content`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LargeInput {
    pub content: i64,
    pub size: usize,
}

impl FromValue<LargeValue> for LargeInput {
    fn from_value(value: &LargeValue) -> Self {
        Self {
            content: value.tag().unwrap_or_default(),
            size: value.len(),
        }
    }
}

/// Callbacks for [`LargeValue`] stores.
///
/// With `verify` enabled every read finished through the completion callback
/// is checked to carry a consistent payload.
#[derive(Debug, Default)]
pub struct LargeFunctions {
    verify: bool,
    completed_reads: AtomicU64,
    mismatches: AtomicU64,
}

impl LargeFunctions {
    pub fn verifying() -> Self {
        Self {
            verify: true,
            ..Default::default()
        }
    }

    pub fn completed_reads(&self) -> u64 {
        self.completed_reads.load(Ordering::Relaxed)
    }

    /// Completed reads whose payload was neither uniform nor patterned
    pub fn mismatches(&self) -> u64 {
        self.mismatches.load(Ordering::Relaxed)
    }
}

impl<K> Functions<K, LargeValue> for LargeFunctions {
    type Input = LargeInput;
    type Output = LargeOutput;
    type Context = ();

    fn single_reader(&self, _key: &K, _input: &LargeInput, value: &LargeValue, dst: &mut LargeOutput) {
        dst.0 = Some(value.clone());
    }

    fn initial_updater(&self, _key: &K, input: &LargeInput) -> LargeValue {
        LargeValue::with_content(input.content, input.size)
    }

    fn copy_updater(&self, _key: &K, input: &LargeInput, _old: &LargeValue) -> LargeValue {
        LargeValue::with_content(input.content, input.size)
    }

    fn in_place_updater(&self, _key: &K, input: &LargeInput, value: &mut LargeValue) -> bool {
        if value.len() != input.size {
            return false;
        }
        *value = LargeValue::with_content(input.content, input.size);
        true
    }

    fn read_completion_callback(
        &self,
        _key: &K,
        _input: &LargeInput,
        output: &LargeOutput,
        _context: (),
        status: Status,
    ) {
        self.completed_reads.fetch_add(1, Ordering::Relaxed);
        if !self.verify || status != Status::Ok {
            return;
        }
        let consistent = output
            .0
            .as_ref()
            .is_some_and(|value| value.tag().is_some() || value.is_patterned());
        if !consistent {
            log::warn!("completed read returned an inconsistent payload: {output:?}");
            self.mismatches.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_rmw() {
        let functions = FixedFunctions::default();
        let initial = Functions::<u64, _>::initial_updater(&functions, &1, &5);
        assert_eq!(initial, FixedValue(5));
        let copied = Functions::<u64, _>::copy_updater(&functions, &1, &3, &initial);
        assert_eq!(copied, FixedValue(8));
        let mut value = copied;
        assert!(Functions::<u64, _>::in_place_updater(&functions, &1, &2, &mut value));
        assert_eq!(value, FixedValue(10));
    }

    #[test]
    fn test_large_in_place_requires_same_size() {
        let functions = LargeFunctions::default();
        let input = LargeInput { content: 9, size: 16 };
        let mut same = LargeValue::with_content(1, 16);
        assert!(Functions::<u64, _>::in_place_updater(&functions, &0, &input, &mut same));
        assert_eq!(same.tag(), Some(9));

        let mut other = LargeValue::with_content(1, 32);
        assert!(!Functions::<u64, _>::in_place_updater(&functions, &0, &input, &mut other));
        assert_eq!(other.tag(), Some(1));
    }

    #[test]
    fn test_large_verification_counts_mismatches() {
        let functions = LargeFunctions::verifying();
        let good = LargeOutput(Some(LargeValue::with_content(4, 16)));
        let patterned = LargeOutput(Some(LargeValue::patterned(16)));
        let mut bytes = LargeValue::with_content(4, 16).as_bytes().to_vec();
        bytes[0] = 0xff;
        let bad = LargeOutput(Some(LargeValue::from_vec(bytes)));

        for output in [&good, &patterned, &bad] {
            Functions::<u64, LargeValue>::read_completion_callback(
                &functions,
                &0,
                &LargeInput::default(),
                output,
                (),
                Status::Ok,
            );
        }
        assert_eq!(functions.completed_reads(), 3);
        assert_eq!(functions.mismatches(), 1);
    }
}
