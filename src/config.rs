use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::driver::FailurePolicy;
use crate::error::{HarnessError, Result};
use crate::inspector::CompactionTarget;
use crate::universe::{KeyPolicy, UniverseShape};

pub const DEFAULT_PER_ROUND_KEYS: usize = 1 << 20;
pub const DEFAULT_ROUNDS: usize = 1 << 8;
pub const DEFAULT_THREADS: usize = 4;

/// 32MB pages
pub const DEFAULT_PAGE_SIZE_BITS: u32 = 25;
/// 4GB of in-memory log
pub const DEFAULT_MEMORY_SIZE_BITS: u32 = 32;
pub const DEFAULT_MUTABLE_FRACTION: f64 = 0.9;

/// Benchmark knobs as they appear in a config file. Every field is optional.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BenchOptions {
    /// Number of keys in one round bucket
    ///
    /// Default is 2^20
    pub per_round_keys: Option<usize>,

    /// Number of round buckets in the key universe
    ///
    /// Default is 2^8
    pub rounds: Option<usize>,

    /// Worker threads per phase
    ///
    /// Default is 4
    pub threads: Option<usize>,

    /// How many times the universe is regenerated and the phases rerun
    ///
    /// Default is 1
    pub iterations: Option<usize>,

    /// Default is update-only
    pub key_policy: Option<KeyPolicy>,

    /// Run a read phase after the upsert phase. Default is true
    pub read: Option<bool>,

    /// Run a delete phase. Default is false
    pub delete: Option<bool>,

    /// Block in the drain until the store has no queued operations. Default is true
    pub drain_wait: Option<bool>,

    /// Compare read outputs with the generated values. Default is false
    pub verify_reads: Option<bool>,

    /// Default is to tolerate failed operations
    pub failure_policy: Option<FailurePolicy>,

    /// Shuffle every round bucket with this seed before the phases run
    pub shuffle_seed: Option<u64>,

    /// Compact the log after the drain. Off by default
    pub compact: Option<CompactionTarget>,

    /// Take a full checkpoint after the drain. Off by default
    pub checkpoint: Option<bool>,
}

impl BenchOptions {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Environment variable naming a [`BenchFile`] for the bench binaries.
pub const BENCH_CONFIG_ENV: &str = "HLOG_BENCH_CONFIG";

/// Harness and store options read by the bench binaries.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BenchFile {
    pub bench: BenchOptions,
    pub log: LogOptions,
    /// Write the JSON bench report here
    pub report: Option<PathBuf>,
}

impl BenchFile {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// The file named by `HLOG_BENCH_CONFIG`, None if the variable is unset
    pub fn from_env() -> Result<Option<Self>> {
        match std::env::var_os(BENCH_CONFIG_ENV) {
            Some(path) => Self::from_json_file(Path::new(&path)).map(Some),
            None => Ok(None),
        }
    }
}

/// Which worker phases run after the upsert phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhasePlan {
    pub read: bool,
    pub delete: bool,
}

/// Maintenance run on the administrative session after the drain.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    pub compact: Option<CompactionTarget>,
    pub checkpoint: bool,
}

impl MaintenanceConfig {
    pub fn is_enabled(&self) -> bool {
        self.compact.is_some() || self.checkpoint
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchConfig {
    pub per_round_keys: usize,
    pub rounds: usize,
    pub threads: usize,
    pub iterations: usize,
    pub key_policy: KeyPolicy,
    pub phases: PhasePlan,
    pub drain_wait: bool,
    pub verify_reads: bool,
    pub failure_policy: FailurePolicy,
    pub shuffle_seed: Option<u64>,
    pub maintenance: MaintenanceConfig,
}

impl BenchConfig {
    pub fn shape(&self) -> UniverseShape {
        UniverseShape::new(self.per_round_keys, self.rounds)
    }

    pub fn max_key(&self) -> u64 {
        self.shape().max_key()
    }
}

impl Default for BenchConfig {
    fn default() -> Self {
        // defaults are always valid
        Self::resolve(BenchOptions::default())
    }
}

impl BenchConfig {
    fn resolve(options: BenchOptions) -> Self {
        Self {
            per_round_keys: options.per_round_keys.unwrap_or(DEFAULT_PER_ROUND_KEYS),
            rounds: options.rounds.unwrap_or(DEFAULT_ROUNDS),
            threads: options.threads.unwrap_or(DEFAULT_THREADS),
            iterations: options.iterations.unwrap_or(1),
            key_policy: options.key_policy.unwrap_or_default(),
            phases: PhasePlan {
                read: options.read.unwrap_or(true),
                delete: options.delete.unwrap_or(false),
            },
            drain_wait: options.drain_wait.unwrap_or(true),
            verify_reads: options.verify_reads.unwrap_or(false),
            failure_policy: options.failure_policy.unwrap_or_default(),
            shuffle_seed: options.shuffle_seed,
            maintenance: MaintenanceConfig {
                compact: options.compact,
                checkpoint: options.checkpoint.unwrap_or(false),
            },
        }
    }
}

impl TryFrom<BenchOptions> for BenchConfig {
    type Error = HarnessError;

    fn try_from(options: BenchOptions) -> Result<Self> {
        let config = Self::resolve(options);
        if config.per_round_keys == 0 || config.rounds == 0 {
            return Err(HarnessError::InvalidConfig(format!(
                "empty key universe: {} keys x {} rounds",
                config.per_round_keys, config.rounds
            )));
        }
        if config.threads == 0 {
            return Err(HarnessError::InvalidConfig(
                "at least one worker thread is required".to_string(),
            ));
        }
        if config.iterations == 0 {
            return Err(HarnessError::InvalidConfig(
                "at least one iteration is required".to_string(),
            ));
        }
        // fresh keys of the last iteration must still be representable
        let shape = config.shape();
        shape
            .checked_max_key()
            .and_then(|max_key| shape.checked_fresh_key(config.iterations as u64 - 1, max_key - 1))
            .ok_or_else(|| {
                HarnessError::InvalidConfig(format!(
                    "fresh keys overflow for {} iterations over {} keys x {} rounds",
                    config.iterations, config.per_round_keys, config.rounds
                ))
            })?;
        Ok(config)
    }
}

/// Where pages evicted below the head address go.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceConfig {
    /// Evicted pages are discarded
    #[default]
    Null,
    /// Evicted pages are kept in mmap segment files inside `dir`, which must exist
    Mmap { dir: PathBuf },
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogOptions {
    /// Log page size as a power of two
    ///
    /// Default is 25 (32MB)
    pub page_size_bits: Option<u32>,

    /// In-memory log budget as a power of two. Must cover at least two pages
    ///
    /// Default is 32 (4GB)
    pub memory_size_bits: Option<u32>,

    /// Fraction of the in-memory pages that stays mutable
    ///
    /// Default is 0.9
    pub mutable_fraction: Option<f64>,

    pub device: Option<DeviceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub page_size_bits: u32,
    pub memory_size_bits: u32,
    pub mutable_fraction: f64,
    pub device: DeviceConfig,
}

impl LogConfig {
    pub fn page_size(&self) -> usize {
        1 << self.page_size_bits
    }

    /// Number of pages the in-memory portion of the log may hold
    pub fn memory_pages(&self) -> usize {
        1 << (self.memory_size_bits - self.page_size_bits)
    }

    /// Number of trailing pages that accept in-place updates.
    ///
    /// Always at least one and always leaves one page that can be evicted.
    pub fn mutable_pages(&self) -> usize {
        let pages = self.memory_pages();
        ((pages as f64 * self.mutable_fraction) as usize).clamp(1, pages - 1)
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            page_size_bits: DEFAULT_PAGE_SIZE_BITS,
            memory_size_bits: DEFAULT_MEMORY_SIZE_BITS,
            mutable_fraction: DEFAULT_MUTABLE_FRACTION,
            device: DeviceConfig::Null,
        }
    }
}

impl TryFrom<LogOptions> for LogConfig {
    type Error = HarnessError;

    fn try_from(options: LogOptions) -> Result<Self> {
        let page_size_bits = options.page_size_bits.unwrap_or(DEFAULT_PAGE_SIZE_BITS);
        let memory_size_bits = options.memory_size_bits.unwrap_or(DEFAULT_MEMORY_SIZE_BITS);
        let mutable_fraction = options.mutable_fraction.unwrap_or(DEFAULT_MUTABLE_FRACTION);

        if !(9..=30).contains(&page_size_bits) {
            return Err(HarnessError::InvalidConfig(format!(
                "page_size_bits must be within 9..=30, got {page_size_bits}"
            )));
        }
        if memory_size_bits <= page_size_bits || memory_size_bits > 40 {
            return Err(HarnessError::InvalidConfig(format!(
                "memory_size_bits {memory_size_bits} must exceed page_size_bits {page_size_bits} and be at most 40"
            )));
        }
        if !(mutable_fraction > 0.0 && mutable_fraction <= 1.0) {
            return Err(HarnessError::InvalidConfig(format!(
                "mutable_fraction must be within (0, 1], got {mutable_fraction}"
            )));
        }
        Ok(Self {
            page_size_bits,
            memory_size_bits,
            mutable_fraction,
            device: options.device.unwrap_or_default(),
        })
    }
}

/// Checkpoint settings of the reference store.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Directory receiving checkpoint metadata. Nothing is written when unset
    pub dir: Option<PathBuf>,
}
