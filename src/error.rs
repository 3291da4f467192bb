use std::io;

use crate::driver::Operation;
use crate::store::{LogWatermarks, Status};

pub type Result<T, E = HarnessError> = std::result::Result<T, E>;

/// Errors raised by the reference store outside of per-call [`Status`] codes.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("record of {size} bytes does not fit in a log page of {page_size} bytes")]
    RecordTooLarge { size: usize, page_size: usize },
    #[error("cannot compact until {until}: only [{begin}, {safe_read_only}] may be truncated")]
    UnsafeCompaction {
        until: u64,
        begin: u64,
        safe_read_only: u64,
    },
    #[error("checkpoint {version} is still in progress")]
    CheckpointInProgress { version: u64 },
    #[error("no checkpoint in progress")]
    NoCheckpoint,
    #[error("record at address {address} belongs to another key")]
    KeyMismatch { address: u64 },
    #[error("record codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("log device error: {0}")]
    Device(#[from] io::Error),
    #[error("checkpoint metadata error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that abort a harness run.
#[derive(thiserror::Error, Debug)]
pub enum HarnessError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("{operation:?} on key {key} returned {status:?}")]
    OperationFailed {
        operation: Operation,
        key: u64,
        status: Status,
    },
    #[error("read of key {key} returned tag {actual:?}, expected {expected:?}")]
    ReadMismatch {
        key: u64,
        expected: Option<i64>,
        actual: Option<i64>,
    },
    #[error("watermark ordering violated: {watermarks}")]
    WatermarkInvariantViolation { watermarks: LogWatermarks },
    #[error("truncating until {until} is unsafe with {watermarks}")]
    UnsafeTruncation {
        until: u64,
        watermarks: LogWatermarks,
    },
    #[error("failed to spawn worker thread: {0}")]
    WorkerSpawn(#[source] io::Error),
    #[error("worker thread {thread_id} panicked")]
    WorkerPanicked { thread_id: usize },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
