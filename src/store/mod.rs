//! The session contract the harness requires from a store, and a reference
//! hybrid-log store implementing it.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::value::{FromValue, Key, Tagged, Value};

mod device;
pub mod functions;
mod hybrid_log;
mod index;
mod page;
mod paged_log;
mod record;

pub use functions::{FixedFunctions, Functions, LargeFunctions};
pub use hybrid_log::{HybridLogSession, HybridLogStore};

/// First valid log address. Address 0 means "no record".
pub const FIRST_VALID_ADDRESS: u64 = 64;

/// Per-call result of a session operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Ok,
    NotFound,
    /// Queued by the store; finished by [`KvSession::complete_pending`]
    Pending,
    Error,
}

/// Snapshot of the five log address boundaries.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogWatermarks {
    pub begin: u64,
    pub head: u64,
    pub safe_read_only: u64,
    pub read_only: u64,
    pub tail: u64,
}

impl LogWatermarks {
    /// Addresses in their required ascending order
    pub fn as_array(&self) -> [u64; 5] {
        [
            self.begin,
            self.head,
            self.safe_read_only,
            self.read_only,
            self.tail,
        ]
    }

    /// True if a compaction or checkpoint covering `[begin, until)` may run
    pub fn is_safe_to_truncate(&self, until: u64) -> bool {
        self.begin <= until && until <= self.safe_read_only
    }
}

impl fmt::Display for LogWatermarks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "begin={} head={} safe_read_only={} read_only={} tail={}",
            self.begin, self.head, self.safe_read_only, self.read_only, self.tail
        )
    }
}

/// Identifies a checkpoint taken with [`KvStore::take_full_checkpoint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointToken {
    pub version: u64,
    /// Everything below this address is covered by the checkpoint
    pub until: u64,
}

/// A thread-confined handle for issuing operations against a store.
///
/// Sessions are consumed by [`KvSession::dispose`]. Implementations are
/// expected to be `!Send`.
pub trait KvSession {
    type Key: Key;
    type Value: Value + Tagged;
    type Input: FromValue<Self::Value>;
    type Output: Default + Tagged;
    type Context: Default;

    fn upsert(
        &mut self,
        key: &Self::Key,
        value: &Self::Value,
        context: Self::Context,
        serial_no: u64,
    ) -> Status;

    /// `output` is only filled when the call returns [`Status::Ok`]. Pending
    /// reads deliver their output through the store's completion callback.
    fn read(
        &mut self,
        key: &Self::Key,
        input: &Self::Input,
        output: &mut Self::Output,
        context: Self::Context,
        serial_no: u64,
    ) -> Status;

    fn delete(&mut self, key: &Self::Key, context: Self::Context, serial_no: u64) -> Status;

    fn rmw(
        &mut self,
        key: &Self::Key,
        input: &Self::Input,
        context: Self::Context,
        serial_no: u64,
    ) -> Status;

    /// Advance this session's view of the store's epoch
    fn refresh(&mut self);

    /// Finish queued operations. With `wait` the call blocks until the queue
    /// is empty. Returns true if nothing is left pending.
    fn complete_pending(&mut self, wait: bool) -> bool;

    /// Release the session. It cannot be used afterwards.
    fn dispose(self);
}

/// A store shared by all workers.
pub trait KvStore: Sync {
    type Session: KvSession;

    fn new_session(&self) -> Self::Session;

    /// Number of index entries. Only meaningful while no phase is mutating.
    fn entry_count(&self) -> u64;

    fn index_size(&self) -> u64;

    fn log(&self) -> LogWatermarks;

    /// Drop the log below `until`, relocating live records to the tail.
    /// Returns the new begin address.
    fn compact(&self, until: u64) -> Result<u64, StoreError>;

    fn take_full_checkpoint(&self) -> Result<CheckpointToken, StoreError>;

    /// Returns the completed checkpoint, or None if it is still running and
    /// `wait` was false.
    fn complete_checkpoint(&self, wait: bool) -> Result<Option<CheckpointToken>, StoreError>;
}

/// Key type of a store's sessions
pub type KeyOf<S> = <<S as KvStore>::Session as KvSession>::Key;
/// Value type of a store's sessions
pub type ValueOf<S> = <<S as KvStore>::Session as KvSession>::Value;
