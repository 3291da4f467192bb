use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::controller::Drained;
use crate::error::{HarnessError, Result};
use crate::store::{KvStore, LogWatermarks};

/// Address a maintenance compaction truncates the log up to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompactionTarget {
    /// Nothing is dropped
    Begin,
    /// Everything already evicted from memory
    Head,
    /// Everything no session can still update in place
    SafeReadOnly,
}

impl CompactionTarget {
    pub fn address(self, watermarks: &LogWatermarks) -> u64 {
        match self {
            CompactionTarget::Begin => watermarks.begin,
            CompactionTarget::Head => watermarks.head,
            CompactionTarget::SafeReadOnly => watermarks.safe_read_only,
        }
    }
}

/// Fails if the watermarks are not in ascending order.
pub fn check_ordering(watermarks: &LogWatermarks) -> Result<()> {
    let ordered = watermarks
        .as_array()
        .into_iter()
        .tuple_windows()
        .all(|(lower, upper)| lower <= upper);
    if ordered {
        Ok(())
    } else {
        Err(HarnessError::WatermarkInvariantViolation {
            watermarks: *watermarks,
        })
    }
}

/// Reads log watermarks once all completions are drained.
pub struct LogWatermarkInspector;

impl LogWatermarkInspector {
    /// Observe the store's watermarks. Taking [`Drained`] guarantees no
    /// worker is running and queued work has been completed.
    pub fn inspect<S: KvStore>(store: &S, _drained: &Drained<S>) -> Result<LogWatermarks> {
        let watermarks = store.log();
        log::info!("log watermarks: {watermarks}");
        check_ordering(&watermarks)?;
        Ok(watermarks)
    }

    /// Resolve `target` and check that truncating up to it is safe.
    pub fn compaction_bound(watermarks: &LogWatermarks, target: CompactionTarget) -> Result<u64> {
        let until = target.address(watermarks);
        if watermarks.is_safe_to_truncate(until) {
            Ok(until)
        } else {
            Err(HarnessError::UnsafeTruncation {
                until,
                watermarks: *watermarks,
            })
        }
    }
}
