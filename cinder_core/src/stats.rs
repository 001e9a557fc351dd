use crate::protocol::WorkSummary;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Progress events published by the orchestrator.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Stat {
    SpinUp {
        worker_count: usize,
    },
    WorkersReady,
    WorkerExecuted {
        worker: usize,
        summary: WorkSummary,
    },
    CoverageUpdate {
        worker: usize,
        hash: String,
        branches: u64,
        corpus_size: usize,
    },
    CrasherFound {
        worker: usize,
        hash: String,
        error: String,
    },
    WorkerTimeout {
        worker: usize,
    },
    WorkerErrored {
        worker: usize,
        error: String,
    },
    WorkerRespawned {
        worker: usize,
    },
    ProgramLogLine {
        worker: usize,
        line: String,
    },
    ShutdownStart {
        reason: String,
    },
    ShutdownComplete,
    FatalError {
        error: String,
    },
}

pub const RATE_WINDOW: Duration = Duration::from_secs(30);

/// Running totals folded from a stream of [`Stat`] events.
#[derive(Debug)]
pub struct Stats {
    started: Instant,
    /// Executions per whole second since `started`, oldest first.
    recent: VecDeque<(u64, u64)>,
    pub execs: u64,
    pub corpus_size: usize,
    pub max_branches: u64,
    pub crashers: u64,
    pub timeouts: u64,
    pub respawns: u64,
    pub worker_errors: u64,
}

impl Stats {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    pub fn starting_at(started: Instant) -> Self {
        Self {
            started,
            recent: VecDeque::new(),
            execs: 0,
            corpus_size: 0,
            max_branches: 0,
            crashers: 0,
            timeouts: 0,
            respawns: 0,
            worker_errors: 0,
        }
    }

    pub fn record(&mut self, stat: &Stat) {
        self.record_at(stat, Instant::now());
    }

    pub fn record_at(&mut self, stat: &Stat, now: Instant) {
        match stat {
            Stat::WorkerExecuted { .. } => {
                self.execs += 1;
                let second = now.saturating_duration_since(self.started).as_secs();
                match self.recent.back_mut() {
                    Some((last, count)) if *last == second => *count += 1,
                    _ => self.recent.push_back((second, 1)),
                }
                self.expire(second);
            }
            Stat::CoverageUpdate {
                branches,
                corpus_size,
                ..
            } => {
                self.corpus_size = *corpus_size;
                self.max_branches = self.max_branches.max(*branches);
            }
            Stat::CrasherFound { .. } => self.crashers += 1,
            Stat::WorkerTimeout { .. } => self.timeouts += 1,
            Stat::WorkerRespawned { .. } => self.respawns += 1,
            Stat::WorkerErrored { .. } => self.worker_errors += 1,
            _ => {}
        }
    }

    fn expire(&mut self, second: u64) {
        let window = RATE_WINDOW.as_secs();
        while let Some(&(oldest, _)) = self.recent.front() {
            if oldest + window > second {
                break;
            }
            self.recent.pop_front();
        }
    }

    /// Executions per second over the trailing [`RATE_WINDOW`], or since the
    /// start when the run is younger than that.
    pub fn execs_per_sec(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.started);
        let current = elapsed.as_secs();
        let window = RATE_WINDOW.as_secs();
        let counted: u64 = self
            .recent
            .iter()
            .filter(|(second, _)| second + window > current)
            .map(|(_, count)| count)
            .sum();
        let span = elapsed.min(RATE_WINDOW).as_secs_f64();
        if span <= 0.0 { 0.0 } else { counted as f64 / span }
    }

    pub fn summary_line(&self) -> String {
        self.summary_line_at(Instant::now())
    }

    pub fn summary_line_at(&self, now: Instant) -> String {
        format!(
            "execs: {}, {:.1}/s, corpus: {}, max branches: {}, crashers: {}, timeouts: {}, respawns: {}",
            self.execs,
            self.execs_per_sec(now),
            self.corpus_size,
            self.max_branches,
            self.crashers,
            self.timeouts,
            self.respawns,
        )
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}
