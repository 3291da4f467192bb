pub mod config;
pub mod controller;
pub mod driver;
pub mod error;
pub mod fixtures;
pub mod inspector;
pub mod report;
pub mod store;
pub mod universe;
mod utils;
pub mod value;

pub use config::{BenchConfig, BenchOptions, LogConfig, LogOptions};
pub use controller::{Drained, RoundController, RoundState};
pub use driver::{run_phase, FailurePolicy, Joined, Operation, PhaseCounters, PhaseSpec};
pub use error::{HarnessError, Result, StoreError};
pub use inspector::{CompactionTarget, LogWatermarkInspector};
pub use store::{HybridLogStore, KvSession, KvStore, LogWatermarks, Status};
pub use universe::{KeyPolicy, KeyUniverse, UniverseShape};
