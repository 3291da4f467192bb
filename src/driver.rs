//! Per-phase worker threads.
//!
//! Every phase spawns one scoped thread per worker. A worker opens one
//! session, walks its striped slice of the universe issuing the phase
//! operation, disposes the session and adds its tally to the shared
//! counters once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::BenchConfig;
use crate::error::{HarnessError, Result};
use crate::store::{KeyOf, KvSession, KvStore, Status, ValueOf};
use crate::universe::KeyUniverse;
use crate::value::{FromValue, Key, Tagged};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Upsert,
    Read,
    Delete,
    Rmw,
}

impl Operation {
    pub fn name(self) -> &'static str {
        match self {
            Operation::Upsert => "upsert",
            Operation::Read => "read",
            Operation::Delete => "delete",
            Operation::Rmw => "rmw",
        }
    }

    /// Statuses counted as completed. A missing key is a normal outcome for
    /// RMW only, where it means the initial value was created.
    pub fn accepts(self, status: Status) -> bool {
        match status {
            Status::Ok | Status::Pending => true,
            Status::NotFound => self == Operation::Rmw,
            Status::Error => false,
        }
    }
}

/// What a worker does with a status its operation does not accept.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailurePolicy {
    /// Count the failure and keep going. Benchmarks use this.
    #[default]
    Tolerate,
    /// Stop the worker with [`HarnessError::OperationFailed`]
    FailFast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseSpec {
    pub operation: Operation,
    pub threads: usize,
    pub failure_policy: FailurePolicy,
    /// Compare the tag of every synchronous read with the expected value
    pub verify_reads: bool,
}

impl PhaseSpec {
    pub fn new(operation: Operation, threads: usize) -> Self {
        Self {
            operation,
            threads,
            failure_policy: FailurePolicy::default(),
            verify_reads: false,
        }
    }

    pub fn from_config(operation: Operation, config: &BenchConfig) -> Self {
        Self {
            operation,
            threads: config.threads,
            failure_policy: config.failure_policy,
            verify_reads: config.verify_reads,
        }
    }

    pub fn fail_fast(mut self) -> Self {
        self.failure_policy = FailurePolicy::FailFast;
        self
    }

    pub fn verify_reads(mut self) -> Self {
        self.verify_reads = true;
        self
    }
}

/// Totals of one phase or one worker.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseTotals {
    /// Operations with an accepted status, pending ones included
    pub completed: u64,
    pub failed: u64,
    /// Operations the store queued for later completion
    pub pending: u64,
}

impl PhaseTotals {
    /// Operations issued
    pub fn issued(&self) -> u64 {
        self.completed + self.failed
    }
}

/// Shared phase counters, owned by whoever runs the phases.
#[derive(Debug, Default)]
pub struct PhaseCounters {
    completed: AtomicU64,
    failed: AtomicU64,
    pending: AtomicU64,
}

impl PhaseCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&self) {
        self.completed.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        self.pending.store(0, Ordering::Relaxed);
    }

    fn add(&self, tally: &PhaseTotals) {
        self.completed.fetch_add(tally.completed, Ordering::Relaxed);
        self.failed.fetch_add(tally.failed, Ordering::Relaxed);
        self.pending.fetch_add(tally.pending, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PhaseTotals {
        PhaseTotals {
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            pending: self.pending.load(Ordering::Relaxed),
        }
    }
}

/// Proof that every worker of a phase was joined. Only [`run_phase`]
/// creates one.
#[derive(Debug)]
#[must_use]
pub struct Joined {
    operation: Operation,
    totals: PhaseTotals,
    elapsed: Duration,
}

impl Joined {
    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn totals(&self) -> PhaseTotals {
        self.totals
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }
}

/// Run `spec.operation` over the whole universe with `spec.threads` workers
/// and wait for all of them.
///
/// `counters` are reset first. Once every worker has been joined, the first
/// worker error is returned, if any.
pub fn run_phase<S: KvStore>(
    store: &S,
    universe: &KeyUniverse<ValueOf<S>>,
    spec: &PhaseSpec,
    counters: &PhaseCounters,
) -> Result<Joined> {
    if spec.threads == 0 {
        return Err(HarnessError::InvalidConfig(
            "a phase needs at least one worker".to_string(),
        ));
    }
    let (_, last_key) = universe.key_bounds();
    if KeyOf::<S>::from_u64(last_key).is_none() {
        return Err(unrepresentable_key(last_key));
    }
    counters.reset();
    let spec = *spec;
    let start = Instant::now();

    let outcomes = thread::scope(|scope| -> Result<Vec<Result<()>>> {
        let mut handles = Vec::with_capacity(spec.threads);
        for thread_id in 0..spec.threads {
            let handle = thread::Builder::new()
                .name(format!("{}-worker-{thread_id}", spec.operation.name()))
                .spawn_scoped(scope, move || {
                    run_worker(store, universe, &spec, counters, thread_id)
                })
                .map_err(HarnessError::WorkerSpawn)?;
            handles.push((thread_id, handle));
        }
        Ok(handles
            .into_iter()
            .map(|(thread_id, handle)| {
                handle
                    .join()
                    .map_err(|_| HarnessError::WorkerPanicked { thread_id })
                    .and_then(|outcome| outcome)
            })
            .collect())
    })?;
    let elapsed = start.elapsed();
    outcomes.into_iter().collect::<Result<Vec<()>>>()?;

    let totals = counters.snapshot();
    log::debug!(
        "{} phase joined {} workers: {totals:?} in {elapsed:?}",
        spec.operation.name(),
        spec.threads
    );
    Ok(Joined {
        operation: spec.operation,
        totals,
        elapsed,
    })
}

fn unrepresentable_key(key: u64) -> HarnessError {
    HarnessError::InvalidConfig(format!(
        "universe key {key} does not fit the store key type"
    ))
}

fn run_worker<S: KvStore>(
    store: &S,
    universe: &KeyUniverse<ValueOf<S>>,
    spec: &PhaseSpec,
    counters: &PhaseCounters,
    thread_id: usize,
) -> Result<()> {
    let mut session = store.new_session();
    let mut tally = PhaseTotals::default();
    let outcome = drive_slice(&mut session, universe, spec, thread_id, &mut tally);
    session.dispose();
    counters.add(&tally);
    log::debug!(
        "worker {thread_id} finished {}: {tally:?}",
        spec.operation.name()
    );
    outcome
}

fn drive_slice<T: KvSession>(
    session: &mut T,
    universe: &KeyUniverse<T::Value>,
    spec: &PhaseSpec,
    thread_id: usize,
    tally: &mut PhaseTotals,
) -> Result<()> {
    let slice = universe.worker_slice(thread_id, spec.threads);
    for (serial_no, (key, value)) in (1u64..).zip(slice) {
        let store_key = T::Key::from_u64(key).ok_or_else(|| unrepresentable_key(key))?;
        let mut mismatch = None;
        let status = match spec.operation {
            Operation::Upsert => session.upsert(&store_key, value, T::Context::default(), serial_no),
            Operation::Read => {
                let input = T::Input::from_value(value);
                let mut output = T::Output::default();
                let status = session.read(
                    &store_key,
                    &input,
                    &mut output,
                    T::Context::default(),
                    serial_no,
                );
                if spec.verify_reads && status == Status::Ok && output.tag() != value.tag() {
                    mismatch = Some(HarnessError::ReadMismatch {
                        key,
                        expected: value.tag(),
                        actual: output.tag(),
                    });
                }
                status
            }
            Operation::Delete => session.delete(&store_key, T::Context::default(), serial_no),
            Operation::Rmw => {
                let input = T::Input::from_value(value);
                session.rmw(&store_key, &input, T::Context::default(), serial_no)
            }
        };

        let failure = match mismatch {
            Some(err) => Some(err),
            None if spec.operation.accepts(status) => None,
            None => Some(HarnessError::OperationFailed {
                operation: spec.operation,
                key,
                status,
            }),
        };
        match failure {
            None => {
                tally.completed += 1;
                if status == Status::Pending {
                    tally.pending += 1;
                }
            }
            Some(err) => {
                tally.failed += 1;
                match spec.failure_policy {
                    FailurePolicy::Tolerate => log::debug!("worker {thread_id}: {err}"),
                    FailurePolicy::FailFast => return Err(err),
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{fixed_universe, tiny_fixed_store};
    use crate::universe::{KeyPolicy, UniverseShape};
    use rstest::rstest;

    #[rstest]
    #[case(Operation::Upsert, Status::Ok, true)]
    #[case(Operation::Upsert, Status::Pending, true)]
    #[case(Operation::Upsert, Status::NotFound, false)]
    #[case(Operation::Read, Status::NotFound, false)]
    #[case(Operation::Delete, Status::Error, false)]
    #[case(Operation::Rmw, Status::NotFound, true)]
    fn test_accepted_statuses(
        #[case] operation: Operation,
        #[case] status: Status,
        #[case] accepted: bool,
    ) {
        assert_eq!(operation.accepts(status), accepted);
    }

    #[test]
    fn test_counters_reset() {
        let counters = PhaseCounters::new();
        counters.add(&PhaseTotals {
            completed: 3,
            failed: 1,
            pending: 2,
        });
        assert_eq!(counters.snapshot().issued(), 4);
        counters.reset();
        assert_eq!(counters.snapshot(), PhaseTotals::default());
    }

    #[rstest]
    #[case(1)]
    #[case(3)]
    #[case(8)]
    fn test_every_key_is_counted_once(#[case] threads: usize) {
        let (_dir, store) = tiny_fixed_store();
        let universe = fixed_universe(UniverseShape::new(16, 5), KeyPolicy::UpdateOnly, 0);
        let counters = PhaseCounters::new();
        let spec = PhaseSpec::new(Operation::Upsert, threads).fail_fast();

        let joined = run_phase(&store, &universe, &spec, &counters).unwrap();
        assert_eq!(joined.operation(), Operation::Upsert);
        assert_eq!(joined.totals().completed, 80);
        assert_eq!(joined.totals().failed, 0);
        assert_eq!(store.entry_count(), 80);
        assert_eq!(store.active_sessions(), 0);
    }

    #[test]
    fn test_tolerated_failures_are_counted() {
        let (_dir, store) = tiny_fixed_store();
        let universe = fixed_universe(UniverseShape::new(10, 4), KeyPolicy::UpdateOnly, 0);
        let counters = PhaseCounters::new();

        // nothing was written yet, every read misses
        let spec = PhaseSpec::new(Operation::Read, 2);
        let joined = run_phase(&store, &universe, &spec, &counters).unwrap();
        assert_eq!(joined.totals().failed, 40);
        assert_eq!(joined.totals().completed, 0);
    }

    #[test]
    fn test_fail_fast_stops_the_phase() {
        let (_dir, store) = tiny_fixed_store();
        let universe = fixed_universe(UniverseShape::new(10, 4), KeyPolicy::UpdateOnly, 0);
        let counters = PhaseCounters::new();
        let spec = PhaseSpec::new(Operation::Read, 2).fail_fast();

        let err = run_phase(&store, &universe, &spec, &counters).unwrap_err();
        assert!(matches!(
            err,
            HarnessError::OperationFailed {
                operation: Operation::Read,
                status: Status::NotFound,
                ..
            }
        ));
        assert_eq!(counters.snapshot().failed, 2);
        assert_eq!(store.active_sessions(), 0);
    }

    #[test]
    fn test_verified_reads_detect_stale_values() {
        let (_dir, store) = tiny_fixed_store();
        let shape = UniverseShape::new(8, 2);
        let counters = PhaseCounters::new();
        let first = fixed_universe(shape, KeyPolicy::UpdateOnly, 0);
        run_phase(&store, &first, &PhaseSpec::new(Operation::Upsert, 2), &counters).unwrap();

        let spec = PhaseSpec::new(Operation::Read, 2).verify_reads();
        let joined = run_phase(&store, &first, &spec, &counters).unwrap();
        assert_eq!(joined.totals().failed, 0);

        // same keys, next generation tags
        let second = fixed_universe(shape, KeyPolicy::UpdateOnly, 1);
        let err = run_phase(&store, &second, &spec.fail_fast(), &counters).unwrap_err();
        assert!(matches!(err, HarnessError::ReadMismatch { .. }));
    }

    #[test]
    fn test_keys_wider_than_the_store_key_are_rejected() {
        use crate::config::DeviceConfig;
        use crate::fixtures::tiny_log_config;
        use crate::store::{FixedFunctions, HybridLogStore};
        use crate::value::FixedValue;

        let store: HybridLogStore<i32, FixedValue, FixedFunctions> = HybridLogStore::new(
            64,
            FixedFunctions::default(),
            tiny_log_config(DeviceConfig::Null),
            None,
        )
        .unwrap();
        let shape = UniverseShape::new(4, 2);
        let counters = PhaseCounters::new();
        let spec = PhaseSpec::new(Operation::Upsert, 2).fail_fast();

        // last key is exactly i32::MAX
        let fits = fixed_universe(shape, KeyPolicy::Fresh, (1 << 28) - 1);
        let joined = run_phase(&store, &fits, &spec, &counters).unwrap();
        assert_eq!(joined.totals().completed, 8);

        let wraps = fixed_universe(shape, KeyPolicy::Fresh, 1 << 28);
        assert!(matches!(
            run_phase(&store, &wraps, &spec, &counters),
            Err(HarnessError::InvalidConfig(_))
        ));
        assert_eq!(store.entry_count(), 8);
        assert_eq!(store.active_sessions(), 0);
    }

    #[test]
    fn test_zero_threads_is_rejected() {
        let (_dir, store) = tiny_fixed_store();
        let universe = fixed_universe(UniverseShape::new(1, 1), KeyPolicy::UpdateOnly, 0);
        let spec = PhaseSpec::new(Operation::Upsert, 0);
        assert!(matches!(
            run_phase(&store, &universe, &spec, &PhaseCounters::new()),
            Err(HarnessError::InvalidConfig(_))
        ));
    }
}
