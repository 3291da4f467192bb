//! Round orchestration.
//!
//! A round moves through
//! `Generate -> Upsert -> (Read) -> (Delete) -> Drain -> Inspect -> (Compact) -> (Checkpoint) -> Done`.
//! Worker phases hand a [`Joined`] to the next state, the drain turns the
//! last one into a [`Drained`], and only a [`Drained`] gives access to the
//! log watermarks and the maintenance hooks.

use std::time::{Duration, Instant};

use crate::config::BenchConfig;
use crate::driver::{run_phase, Joined, Operation, PhaseCounters, PhaseSpec, PhaseTotals};
use crate::error::Result;
use crate::inspector::LogWatermarkInspector;
use crate::report::{BenchReport, Phase, PhaseReport, RoundReport};
use crate::store::{KvSession, KvStore, LogWatermarks, ValueOf};
use crate::universe::KeyUniverse;

/// Proof that all workers were joined and queued completions were drained.
///
/// Holds the administrative session until [`Drained::finish`].
#[must_use]
pub struct Drained<S: KvStore> {
    session: S::Session,
    last_phase: Operation,
    elapsed: Duration,
    completed: bool,
}

impl<S: KvStore> Drained<S> {
    fn drain(store: &S, joined: Joined, wait: bool) -> Self {
        let start = Instant::now();
        let mut session = store.new_session();
        session.refresh();
        let completed = session.complete_pending(wait);
        let elapsed = start.elapsed();
        if !completed {
            log::debug!(
                "drain after {} left operations pending",
                joined.operation().name()
            );
        }
        Self {
            session,
            last_phase: joined.operation(),
            elapsed,
            completed,
        }
    }

    /// Operation of the worker phase this drain followed
    pub fn last_phase(&self) -> Operation {
        self.last_phase
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// True if nothing was left pending
    pub fn completed(&self) -> bool {
        self.completed
    }

    /// Give the store one last chance to complete queued work, then release
    /// the administrative session.
    pub fn finish(mut self) {
        self.session.complete_pending(false);
        self.session.dispose();
    }
}

/// Where a round is, and what it carries into the next state.
pub enum RoundState<S: KvStore> {
    Generate,
    Upsert(KeyUniverse<ValueOf<S>>),
    Read(KeyUniverse<ValueOf<S>>, Joined),
    Delete(KeyUniverse<ValueOf<S>>, Joined),
    Drain(Joined),
    Inspect(Drained<S>),
    Compact(Drained<S>, LogWatermarks),
    Checkpoint(Drained<S>),
    Done,
}

impl<S: KvStore> RoundState<S> {
    pub fn name(&self) -> &'static str {
        match self {
            RoundState::Generate => "generate",
            RoundState::Upsert(..) => "upsert",
            RoundState::Read(..) => "read",
            RoundState::Delete(..) => "delete",
            RoundState::Drain(..) => "drain",
            RoundState::Inspect(..) => "inspect",
            RoundState::Compact(..) => "compact",
            RoundState::Checkpoint(..) => "checkpoint",
            RoundState::Done => "done",
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, RoundState::Done)
    }
}

/// Runs rounds of worker phases against one store.
pub struct RoundController<'a, S: KvStore> {
    store: &'a S,
    config: BenchConfig,
    counters: PhaseCounters,
}

impl<'a, S: KvStore> RoundController<'a, S> {
    pub fn new(store: &'a S, config: BenchConfig) -> Self {
        Self {
            store,
            config,
            counters: PhaseCounters::new(),
        }
    }

    pub fn config(&self) -> &BenchConfig {
        &self.config
    }

    /// Counters of the most recent worker phase
    pub fn counters(&self) -> &PhaseCounters {
        &self.counters
    }

    /// Run `config.iterations` rounds. Iteration `r` generates its universe
    /// with generation `r`.
    pub fn run<F>(&self, mut value_for: F) -> Result<BenchReport>
    where
        F: FnMut(u64) -> ValueOf<S>,
    {
        let mut iterations = Vec::with_capacity(self.config.iterations);
        for iteration in 0..self.config.iterations {
            let round = self.run_round(iteration, &mut value_for)?;
            log::info!("iteration {iteration} done, log {}", round.watermarks);
            iterations.push(round);
        }
        Ok(BenchReport {
            threads: self.config.threads,
            per_round_keys: self.config.per_round_keys,
            rounds: self.config.rounds,
            iterations,
        })
    }

    pub fn run_round<F>(&self, iteration: usize, value_for: &mut F) -> Result<RoundReport>
    where
        F: FnMut(u64) -> ValueOf<S>,
    {
        let mut report = RoundReport::new(iteration);
        let mut state = RoundState::Generate;
        while !state.is_done() {
            log::trace!("iteration {iteration} entering {}", state.name());
            state = self.step(state, iteration, value_for, &mut report)?;
        }
        Ok(report)
    }

    /// Execute `state` and return the state that follows it.
    pub fn step<F>(
        &self,
        state: RoundState<S>,
        iteration: usize,
        value_for: &mut F,
        report: &mut RoundReport,
    ) -> Result<RoundState<S>>
    where
        F: FnMut(u64) -> ValueOf<S>,
    {
        let phases = self.config.phases;
        let maintenance = self.config.maintenance;
        let next = match state {
            RoundState::Generate => {
                let start = Instant::now();
                let mut universe = KeyUniverse::generate(
                    self.config.shape(),
                    self.config.key_policy,
                    iteration as u64,
                    value_for,
                )?;
                if let Some(seed) = self.config.shuffle_seed {
                    universe.shuffle_within_rounds(seed.wrapping_add(iteration as u64));
                }
                report.phases.push(self.phase_report(Phase::Generate, start.elapsed(), None));
                RoundState::Upsert(universe)
            }
            RoundState::Upsert(universe) => {
                let joined = self.worker_phase(Operation::Upsert, &universe, report)?;
                if phases.read {
                    RoundState::Read(universe, joined)
                } else if phases.delete {
                    RoundState::Delete(universe, joined)
                } else {
                    RoundState::Drain(joined)
                }
            }
            RoundState::Read(universe, _) => {
                let joined = self.worker_phase(Operation::Read, &universe, report)?;
                if phases.delete {
                    RoundState::Delete(universe, joined)
                } else {
                    RoundState::Drain(joined)
                }
            }
            RoundState::Delete(universe, _) => {
                RoundState::Drain(self.worker_phase(Operation::Delete, &universe, report)?)
            }
            RoundState::Drain(joined) => {
                let drained = Drained::drain(self.store, joined, self.config.drain_wait);
                report.drained = drained.completed();
                report
                    .phases
                    .push(self.phase_report(Phase::Drain, drained.elapsed(), None));
                RoundState::Inspect(drained)
            }
            RoundState::Inspect(drained) => {
                let watermarks = LogWatermarkInspector::inspect(self.store, &drained)?;
                report.watermarks = watermarks;
                match (maintenance.compact, maintenance.checkpoint) {
                    (Some(_), _) => RoundState::Compact(drained, watermarks),
                    (None, true) => RoundState::Checkpoint(drained),
                    (None, false) => {
                        drained.finish();
                        RoundState::Done
                    }
                }
            }
            RoundState::Compact(drained, watermarks) => {
                if let Some(target) = maintenance.compact {
                    let until = LogWatermarkInspector::compaction_bound(&watermarks, target)?;
                    let start = Instant::now();
                    let begin = self.store.compact(until)?;
                    report
                        .phases
                        .push(self.phase_report(Phase::Compact, start.elapsed(), None));
                    report.compacted_until = Some(begin);
                    report.watermarks = LogWatermarkInspector::inspect(self.store, &drained)?;
                }
                if maintenance.checkpoint {
                    RoundState::Checkpoint(drained)
                } else {
                    drained.finish();
                    RoundState::Done
                }
            }
            RoundState::Checkpoint(drained) => {
                let start = Instant::now();
                let token = self.store.take_full_checkpoint()?;
                report.checkpoint = self.store.complete_checkpoint(true)?;
                log::info!("checkpoint {} covers the log until {}", token.version, token.until);
                report
                    .phases
                    .push(self.phase_report(Phase::Checkpoint, start.elapsed(), None));
                drained.finish();
                RoundState::Done
            }
            RoundState::Done => RoundState::Done,
        };
        Ok(next)
    }

    fn worker_phase(
        &self,
        operation: Operation,
        universe: &KeyUniverse<ValueOf<S>>,
        report: &mut RoundReport,
    ) -> Result<Joined> {
        let spec = PhaseSpec::from_config(operation, &self.config);
        let joined = run_phase(self.store, universe, &spec, &self.counters)?;
        let phase = self.phase_report(operation.into(), joined.elapsed(), Some(joined.totals()));
        log::info!("iteration {} {phase}", report.iteration);
        report.phases.push(phase);
        Ok(joined)
    }

    fn phase_report(
        &self,
        phase: Phase,
        elapsed: Duration,
        totals: Option<PhaseTotals>,
    ) -> PhaseReport {
        PhaseReport {
            phase,
            elapsed,
            totals: totals.unwrap_or_default(),
            entry_count: self.store.entry_count(),
            index_size: self.store.index_size(),
        }
    }
}
