//! Implementation of the Bustle API on top of the reference store.

use bustle::{Collection, CollectionHandle, Mix, Workload};
use hlog_bench::fixtures::FixedStore;
use hlog_bench::store::{FixedFunctions, HybridLogSession};
use hlog_bench::value::FixedValue;
use hlog_bench::{KvSession, KvStore, LogConfig, LogOptions, Status};

type FixedSession = HybridLogSession<u64, FixedValue, FixedFunctions>;

/// Shared store, pinned once per bustle worker thread.
struct BustleStore {
    store: FixedStore,
}

impl Collection for BustleStore {
    type Handle = BustleSession;

    fn with_capacity(capacity: usize) -> Self {
        // 1MB pages and 256MB of memory: the workload never leaves the
        // mutable region, so no call comes back pending
        let log_config = LogConfig::try_from(LogOptions {
            page_size_bits: Some(20),
            memory_size_bits: Some(28),
            ..Default::default()
        })
        .unwrap();
        let store =
            FixedStore::new(capacity, FixedFunctions::default(), log_config, None).unwrap();
        Self { store }
    }

    fn pin(&self) -> Self::Handle {
        BustleSession {
            session: self.store.new_session(),
            serial: 0,
        }
    }
}

struct BustleSession {
    session: FixedSession,
    serial: u64,
}

impl BustleSession {
    fn next_serial(&mut self) -> u64 {
        self.serial += 1;
        self.serial
    }
}

impl CollectionHandle for BustleSession {
    type Key = u64;

    fn get(&mut self, key: &Self::Key) -> bool {
        let serial = self.next_serial();
        let mut output = FixedValue::default();
        matches!(
            self.session.read(key, &0, &mut output, (), serial),
            Status::Ok | Status::Pending
        )
    }

    /// An RMW on a missing key runs the initial updater and reports NotFound
    fn insert(&mut self, key: &Self::Key) -> bool {
        let serial = self.next_serial();
        self.session.rmw(key, key, (), serial) == Status::NotFound
    }

    fn remove(&mut self, key: &Self::Key) -> bool {
        if !self.get(key) {
            return false;
        }
        let serial = self.next_serial();
        self.session.delete(key, (), serial) == Status::Ok
    }

    fn update(&mut self, key: &Self::Key) -> bool {
        if !self.get(key) {
            return false;
        }
        let serial = self.next_serial();
        self.session.upsert(key, &FixedValue(*key), (), serial) == Status::Ok
    }
}

fn main() {
    env_logger::init();
    for n in 1..=4 {
        Workload::new(n, Mix::read_heavy())
            .initial_capacity_log2(18)
            .run::<BustleStore>();
    }
}
