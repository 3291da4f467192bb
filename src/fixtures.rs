use crate::config::{DeviceConfig, LogConfig, LogOptions};
use crate::store::{FixedFunctions, HybridLogStore, LargeFunctions};
use crate::universe::{KeyPolicy, KeyUniverse, UniverseShape};
use crate::value::{FixedValue, LargeValue};
use tempfile::{Builder, TempDir};

pub type FixedStore = HybridLogStore<u64, FixedValue, FixedFunctions>;
pub type LargeStore = HybridLogStore<i64, LargeValue, LargeFunctions>;

/// 512 byte pages, four of them in memory, half of those mutable.
/// Small enough for a few hundred records to reach the device.
pub fn tiny_log_config(device: DeviceConfig) -> LogConfig {
    LogConfig::try_from(LogOptions {
        page_size_bits: Some(9),
        memory_size_bits: Some(11),
        mutable_fraction: Some(0.5),
        device: Some(device),
    })
    .unwrap()
}

fn mmap_device() -> (TempDir, DeviceConfig) {
    let dir = Builder::new().prefix("test-hlog").tempdir().unwrap();
    let device = DeviceConfig::Mmap {
        dir: dir.path().to_path_buf(),
    };
    (dir, device)
}

/// Fixed-value store evicting to mmap segments inside the returned directory
pub fn tiny_fixed_store() -> (TempDir, FixedStore) {
    let (dir, device) = mmap_device();
    let store =
        HybridLogStore::new(1024, FixedFunctions::default(), tiny_log_config(device), None).unwrap();
    (dir, store)
}

/// Fixed-value store whose evicted pages are lost
pub fn tiny_null_fixed_store() -> FixedStore {
    HybridLogStore::new(
        1024,
        FixedFunctions::default(),
        tiny_log_config(DeviceConfig::Null),
        None,
    )
    .unwrap()
}

/// Large-value store verifying every completed read
pub fn tiny_large_store() -> (TempDir, LargeStore) {
    let (dir, device) = mmap_device();
    let store = HybridLogStore::new(
        1024,
        LargeFunctions::verifying(),
        tiny_log_config(device),
        None,
    )
    .unwrap();
    (dir, store)
}

pub fn fixed_universe(
    shape: UniverseShape,
    policy: KeyPolicy,
    generation: u64,
) -> KeyUniverse<FixedValue> {
    KeyUniverse::generate(shape, policy, generation, FixedValue).unwrap()
}

/// Universe of `size` byte values, each word holding the value tag
pub fn large_universe(
    shape: UniverseShape,
    policy: KeyPolicy,
    generation: u64,
    size: usize,
) -> KeyUniverse<LargeValue> {
    KeyUniverse::generate(shape, policy, generation, |tag| {
        LargeValue::with_content(tag as i64, size)
    })
    .unwrap()
}
