use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::driver::{Operation, PhaseTotals};
use crate::error::Result;
use crate::store::{CheckpointToken, LogWatermarks};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Generate,
    Upsert,
    Read,
    Delete,
    Rmw,
    Drain,
    Compact,
    Checkpoint,
}

impl From<Operation> for Phase {
    fn from(operation: Operation) -> Self {
        match operation {
            Operation::Upsert => Phase::Upsert,
            Operation::Read => Phase::Read,
            Operation::Delete => Phase::Delete,
            Operation::Rmw => Phase::Rmw,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Generate => "generate",
            Phase::Upsert => "upsert",
            Phase::Read => "read",
            Phase::Delete => "delete",
            Phase::Rmw => "rmw",
            Phase::Drain => "drain",
            Phase::Compact => "compact",
            Phase::Checkpoint => "checkpoint",
        };
        f.write_str(name)
    }
}

/// Measurements of one phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseReport {
    pub phase: Phase,
    pub elapsed: Duration,
    /// Zero for phases without workers
    pub totals: PhaseTotals,
    /// Store entry count sampled when the phase ended
    pub entry_count: u64,
    pub index_size: u64,
}

impl PhaseReport {
    /// Completed operations per second, in millions
    pub fn throughput_mops(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.totals.completed as f64 / secs / 1_000_000.0
    }
}

impl fmt::Display for PhaseReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} duration {:.3}s total {} failed {} pending {} mops {:.2} entries {} index {}",
            self.phase,
            self.elapsed.as_secs_f64(),
            self.totals.completed,
            self.totals.failed,
            self.totals.pending,
            self.throughput_mops(),
            self.entry_count,
            self.index_size,
        )
    }
}

/// Everything measured and observed in one iteration of the round sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundReport {
    pub iteration: usize,
    pub phases: Vec<PhaseReport>,
    /// Watermarks observed after the drain, or after compaction if it ran
    pub watermarks: LogWatermarks,
    /// False if the drain returned with operations still queued
    pub drained: bool,
    pub compacted_until: Option<u64>,
    pub checkpoint: Option<CheckpointToken>,
}

impl RoundReport {
    pub fn new(iteration: usize) -> Self {
        Self {
            iteration,
            phases: Vec::new(),
            watermarks: LogWatermarks::default(),
            drained: false,
            compacted_until: None,
            checkpoint: None,
        }
    }

    pub fn phase(&self, phase: Phase) -> Option<&PhaseReport> {
        self.phases.iter().find(|report| report.phase == phase)
    }
}

impl fmt::Display for RoundReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for phase in &self.phases {
            writeln!(f, "{} {phase}", self.iteration)?;
        }
        write!(f, "{} log {}", self.iteration, self.watermarks)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchReport {
    pub threads: usize,
    pub per_round_keys: usize,
    pub rounds: usize,
    pub iterations: Vec<RoundReport>,
}

impl BenchReport {
    /// Sum of `phase` durations over all iterations
    pub fn total_elapsed(&self, phase: Phase) -> Duration {
        self.iterations
            .iter()
            .flat_map(|round| &round.phases)
            .filter(|report| report.phase == phase)
            .map(|report| report.elapsed)
            .sum()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

impl fmt::Display for BenchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "threads {} keys per round {} rounds {}",
            self.threads, self.per_round_keys, self.rounds
        )?;
        for round in &self.iterations {
            writeln!(f, "{round}")?;
        }
        Ok(())
    }
}
