//! The orchestrator: keeps a pool of workers busy with mutated inputs and
//! feeds what they report back into the corpus.
//!
//! A single supervisor loop owns the corpus, the random generator and every
//! slot. Workers report through one channel; each slot carries a generation
//! number so that events from a worker that has since been replaced are
//! dropped on arrival.

use crate::corpus::Corpus;
use crate::coverage::coverage_hash;
use crate::input::Input;
use crate::protocol::{Message, WorkSummary};
use crate::stats::Stat;
use crate::storage::Storage;
use crate::worker::{Envelope, EventSink, Spawner, WorkerError, WorkerEvent, WorkerProcess};
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct ClusterOptions {
    pub workers: usize,
    /// How long a worker may take to answer `DoWork` or `RequestCoverage`.
    pub timeout: Duration,
    /// How long a terminated worker gets to exit before it is killed.
    pub kill_grace: Duration,
    /// How long a fresh worker gets to announce readiness.
    pub ready_timeout: Duration,
    /// Delay before retrying a slot whose worker failed to spawn.
    pub respawn_backoff: Duration,
    pub seed: u64,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            workers: 1,
            timeout: Duration::from_millis(2000),
            kill_grace: Duration::from_millis(2000),
            ready_timeout: Duration::from_secs(10),
            respawn_backoff: Duration::from_secs(1),
            seed: 0,
        }
    }
}

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("cannot run with zero workers")]
    NoWorkers,

    #[error("failed to start worker {slot}: {source}")]
    Spawn {
        slot: usize,
        #[source]
        source: WorkerError,
    },

    #[error("worker {slot} failed during startup: {reason}")]
    Startup { slot: usize, reason: String },

    #[error("only {ready} of {expected} workers were ready within {timeout:?}")]
    ReadyTimeout {
        ready: usize,
        expected: usize,
        timeout: Duration,
    },
}

/// Requests an orderly shutdown of a running [`Cluster`] from any thread.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Sender<Envelope>,
}

impl ShutdownHandle {
    pub fn request(&self, reason: impl Into<String>) {
        let _ = self.tx.send(Envelope::Shutdown {
            reason: reason.into(),
        });
    }
}

enum SlotState {
    /// Spawned, waiting for `Ready`.
    Starting,
    /// Ready with nothing in flight.
    Idle,
    Working {
        parent_depth: u32,
        payload: Vec<u8>,
    },
    AwaitingCoverage {
        candidate: Input,
    },
    /// No worker; a respawn is due at the slot's deadline.
    Down,
}

impl SlotState {
    fn name(&self) -> &'static str {
        match self {
            SlotState::Starting => "starting",
            SlotState::Idle => "idle",
            SlotState::Working { .. } => "working",
            SlotState::AwaitingCoverage { .. } => "awaiting coverage",
            SlotState::Down => "down",
        }
    }
}

struct Slot {
    generation: u64,
    worker: Option<Box<dyn WorkerProcess>>,
    state: SlotState,
    deadline: Option<Instant>,
}

enum Startup {
    Ready,
    Interrupted(String),
}

pub struct Cluster<S: Storage> {
    options: ClusterOptions,
    spawner: Box<dyn Spawner>,
    storage: S,
    stats: Sender<Stat>,
    tx: Sender<Envelope>,
    rx: Receiver<Envelope>,
    rng: ChaCha8Rng,
    corpus: Corpus,
    slots: Vec<Slot>,
    literals: Vec<String>,
    active: bool,
    reapers: Vec<JoinHandle<()>>,
}

impl<S: Storage> Cluster<S> {
    pub fn new(
        options: ClusterOptions,
        spawner: Box<dyn Spawner>,
        storage: S,
        stats: Sender<Stat>,
    ) -> Self {
        let (tx, rx) = mpsc::channel();
        let rng = ChaCha8Rng::seed_from_u64(options.seed);
        Self {
            options,
            spawner,
            storage,
            stats,
            tx,
            rx,
            rng,
            corpus: Corpus::new(),
            slots: Vec::new(),
            literals: Vec::new(),
            active: true,
            reapers: Vec::new(),
        }
    }

    /// Literals to hand the mutator before the first worker reports its own.
    pub fn with_literals(mut self, literals: Vec<String>) -> Self {
        self.literals = literals;
        self
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.tx.clone(),
        }
    }

    /// Fuzzes until a shutdown is requested. Returns an error only when the
    /// worker pool could not be started.
    pub fn run(mut self) -> Result<(), ClusterError> {
        if self.options.workers == 0 {
            return Err(ClusterError::NoWorkers);
        }

        self.corpus = match self.storage.load_corpus() {
            Ok(corpus) => corpus,
            Err(e) => {
                log::warn!("starting with an empty corpus, failed to load the stored one: {e}");
                Corpus::new()
            }
        };
        let literals = std::mem::take(&mut self.literals);
        let added = self.corpus.found_literals(literals);
        log::info!(
            "loaded {} corpus entries and {added} literals, seed {}",
            self.corpus.len(),
            self.options.seed
        );

        self.emit(Stat::SpinUp {
            worker_count: self.options.workers,
        });
        match self.start_workers() {
            Ok(Startup::Ready) => {}
            Ok(Startup::Interrupted(reason)) => {
                self.shutdown(reason);
                return Ok(());
            }
            Err(e) => {
                log::error!("{e}");
                self.emit(Stat::FatalError {
                    error: e.to_string(),
                });
                self.active = false;
                self.stop_workers();
                return Err(e);
            }
        }

        log::info!("{} workers ready", self.slots.len());
        self.emit(Stat::WorkersReady);
        for slot in 0..self.slots.len() {
            self.dispatch(slot);
        }

        let reason = self.supervise();
        self.shutdown(reason);
        Ok(())
    }

    fn emit(&self, stat: Stat) {
        let _ = self.stats.send(stat);
    }

    fn start_workers(&mut self) -> Result<Startup, ClusterError> {
        let expected = self.options.workers;
        for slot in 0..expected {
            let sink = EventSink::new(slot, 0, self.tx.clone());
            // Keep what was spawned so far in the slots so a failure can stop it.
            let spawned = self.spawner.spawn(sink);
            let (worker, result) = match spawned {
                Ok(worker) => (Some(worker), Ok(())),
                Err(source) => (None, Err(ClusterError::Spawn { slot, source })),
            };
            self.slots.push(Slot {
                generation: 0,
                worker,
                state: SlotState::Starting,
                deadline: None,
            });
            result?;
        }

        let deadline = Instant::now() + self.options.ready_timeout;
        let mut ready = 0;
        while ready < expected {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let envelope = match self.rx.recv_timeout(remaining) {
                Ok(envelope) => envelope,
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => {
                    return Err(ClusterError::ReadyTimeout {
                        ready,
                        expected,
                        timeout: self.options.ready_timeout,
                    });
                }
            };
            let (slot, event) = match envelope {
                Envelope::Shutdown { reason } => return Ok(Startup::Interrupted(reason)),
                Envelope::Worker { slot, event, .. } => (slot, event),
            };
            match event {
                WorkerEvent::Message(Message::Ready) => {
                    if matches!(self.slots[slot].state, SlotState::Starting) {
                        self.slots[slot].state = SlotState::Idle;
                        ready += 1;
                        log::debug!("worker {slot} ready ({ready}/{expected})");
                    }
                }
                WorkerEvent::Message(Message::FoundLiterals(literals)) => {
                    let added = self.corpus.found_literals(literals);
                    log::debug!("worker {slot} reported {added} new literals");
                }
                WorkerEvent::Message(other) => {
                    log::debug!("worker {slot} sent {:?} during startup", other.kind());
                }
                WorkerEvent::Log(line) => self.emit(Stat::ProgramLogLine { worker: slot, line }),
                WorkerEvent::Error(reason) => return Err(ClusterError::Startup { slot, reason }),
                WorkerEvent::Closed => {
                    return Err(ClusterError::Startup {
                        slot,
                        reason: "exited before it was ready".to_string(),
                    });
                }
            }
        }
        Ok(Startup::Ready)
    }

    /// Runs until a shutdown request arrives and returns its reason.
    fn supervise(&mut self) -> String {
        loop {
            let next_deadline = self.slots.iter().filter_map(|slot| slot.deadline).min();
            let received = match next_deadline {
                Some(deadline) => self
                    .rx
                    .recv_timeout(deadline.saturating_duration_since(Instant::now())),
                None => self.rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            match received {
                Ok(Envelope::Shutdown { reason }) => return reason,
                Ok(Envelope::Worker {
                    slot,
                    generation,
                    event,
                }) => self.on_event(slot, generation, event),
                Err(RecvTimeoutError::Timeout) => {}
                // The loop holds a sender itself, so this never happens.
                Err(RecvTimeoutError::Disconnected) => return "event channel closed".to_string(),
            }
            self.expire_deadlines();
        }
    }

    fn expire_deadlines(&mut self) {
        let now = Instant::now();
        for slot in 0..self.slots.len() {
            if self.slots[slot].deadline.is_some_and(|deadline| deadline <= now) {
                self.slots[slot].deadline = None;
                self.on_deadline(slot);
            }
        }
    }

    fn on_event(&mut self, slot: usize, generation: u64, event: WorkerEvent) {
        if self.slots.get(slot).is_none_or(|s| s.generation != generation) {
            log::trace!("dropping event from replaced worker {slot}.{generation}");
            return;
        }
        match event {
            WorkerEvent::Log(line) => self.emit(Stat::ProgramLogLine { worker: slot, line }),
            WorkerEvent::Error(error) => self.on_worker_failure(slot, error),
            WorkerEvent::Closed => self.on_worker_failure(slot, "worker exited".to_string()),
            WorkerEvent::Message(message) => self.on_message(slot, message),
        }
    }

    fn on_message(&mut self, slot: usize, message: Message) {
        if let Message::FoundLiterals(literals) = message {
            let added = self.corpus.found_literals(literals);
            log::debug!("worker {slot} reported {added} new literals");
            return;
        }

        let state = std::mem::replace(&mut self.slots[slot].state, SlotState::Down);
        match (state, message) {
            (SlotState::Starting, Message::Ready) => {
                self.slots[slot].state = SlotState::Idle;
                self.slots[slot].deadline = None;
                log::debug!("worker {slot} ready");
                self.dispatch(slot);
            }
            (
                SlotState::Working {
                    parent_depth,
                    payload,
                },
                Message::WorkSummary(summary),
            ) => self.on_summary(slot, parent_depth, payload, summary),
            (SlotState::AwaitingCoverage { candidate }, Message::WorkCoverage(coverage)) => {
                self.on_coverage(slot, candidate, coverage)
            }
            (state, message) => {
                let error = format!("unexpected {:?} while {}", message.kind(), state.name());
                self.on_worker_failure(slot, error);
            }
        }
    }

    fn on_summary(&mut self, slot: usize, parent_depth: u32, payload: Vec<u8>, summary: WorkSummary) {
        self.slots[slot].deadline = None;
        self.emit(Stat::WorkerExecuted {
            worker: slot,
            summary: summary.clone(),
        });

        let candidate = Input::new(payload, parent_depth + 1, summary);
        if !self.corpus.is_interested_in(&candidate) {
            self.dispatch(slot);
            return;
        }
        if !self.active {
            self.slots[slot].state = SlotState::Idle;
            return;
        }

        let sent = match self.slots[slot].worker.as_mut() {
            Some(worker) => worker.send(&Message::RequestCoverage),
            None => Err(WorkerError::Closed),
        };
        match sent {
            Ok(()) => {
                self.slots[slot].state = SlotState::AwaitingCoverage { candidate };
                self.slots[slot].deadline = Some(Instant::now() + self.options.timeout);
            }
            Err(e) => self.on_worker_failure(slot, e.to_string()),
        }
    }

    fn on_coverage(&mut self, slot: usize, mut candidate: Input, coverage: Vec<u8>) {
        self.slots[slot].deadline = None;
        let actual = coverage_hash(&coverage);
        if actual != candidate.hash() {
            log::warn!(
                "worker {slot} sent coverage {actual} that does not match its summary hash {:?}",
                candidate.hash()
            );
            candidate.summary.hash = actual;
        }
        // Another slot may have stored this hash since the summary arrived.
        if !self.corpus.is_interested_in(&candidate) {
            log::debug!("worker {slot} lost the race for {}", candidate.hash());
            self.dispatch(slot);
            return;
        }

        let hash = candidate.hash().to_string();
        let branches = candidate.summary.coverage_size;
        if candidate.summary.is_error() {
            let error = candidate
                .summary
                .error
                .clone()
                .unwrap_or_else(|| "target reported an error".to_string());
            log::warn!("worker {slot} found a crasher {hash}: {error}");
            if let Err(e) = self.storage.store_crasher(&candidate) {
                log::warn!("failed to store crasher {hash}: {e}");
            }
            self.emit(Stat::CrasherFound {
                worker: slot,
                hash: hash.clone(),
                error,
            });
        }

        self.corpus.put(candidate);
        log::debug!("worker {slot} found new coverage {hash} ({branches} branches)");
        self.emit(Stat::CoverageUpdate {
            worker: slot,
            hash,
            branches,
            corpus_size: self.corpus.len(),
        });
        self.dispatch(slot);
    }

    /// Sends the slot its next mutated input.
    fn dispatch(&mut self, slot: usize) {
        if !self.active {
            self.slots[slot].state = SlotState::Idle;
            return;
        }
        let parent = self.corpus.pick_weighted(&mut self.rng);
        let parent_depth = parent.depth;
        let payload = self.corpus.mutate(&parent.payload, &mut self.rng);

        let sent = match self.slots[slot].worker.as_mut() {
            Some(worker) => worker.send(&Message::DoWork(payload.clone())),
            None => Err(WorkerError::Closed),
        };
        match sent {
            Ok(()) => {
                self.slots[slot].state = SlotState::Working {
                    parent_depth,
                    payload,
                };
                self.slots[slot].deadline = Some(Instant::now() + self.options.timeout);
            }
            Err(e) => self.on_worker_failure(slot, e.to_string()),
        }
    }

    fn on_deadline(&mut self, slot: usize) {
        let state = std::mem::replace(&mut self.slots[slot].state, SlotState::Down);
        match state {
            SlotState::Working { payload, .. } => {
                log::warn!("worker {slot} timed out on a {} byte input", payload.len());
                if let Err(e) = self.storage.store_timeout(&payload) {
                    log::warn!("failed to store timeout: {e}");
                }
                self.emit(Stat::WorkerTimeout { worker: slot });
                self.respawn(slot);
            }
            SlotState::AwaitingCoverage { candidate } => {
                log::warn!("worker {slot} timed out sending coverage for {}", candidate.hash());
                self.emit(Stat::WorkerTimeout { worker: slot });
                self.respawn(slot);
            }
            SlotState::Starting => {
                self.on_worker_failure(slot, "not ready in time".to_string());
            }
            SlotState::Down => self.respawn(slot),
            SlotState::Idle => self.slots[slot].state = SlotState::Idle,
        }
    }

    fn on_worker_failure(&mut self, slot: usize, error: String) {
        log::warn!("worker {slot} failed: {error}");
        self.emit(Stat::WorkerErrored {
            worker: slot,
            error,
        });
        self.respawn(slot);
    }

    /// Replaces the slot's worker. Events from the old one are ignored from
    /// here on.
    fn respawn(&mut self, slot: usize) {
        if !self.active {
            return;
        }
        self.retire(slot);

        let entry = &mut self.slots[slot];
        entry.generation += 1;
        let sink = EventSink::new(slot, entry.generation, self.tx.clone());
        match self.spawner.spawn(sink) {
            Ok(worker) => {
                let entry = &mut self.slots[slot];
                entry.worker = Some(worker);
                entry.state = SlotState::Starting;
                entry.deadline = Some(Instant::now() + self.options.ready_timeout);
                log::info!("worker {slot} respawned");
                self.emit(Stat::WorkerRespawned { worker: slot });
            }
            Err(e) => {
                log::warn!(
                    "failed to respawn worker {slot}, retrying in {:?}: {e}",
                    self.options.respawn_backoff
                );
                let entry = &mut self.slots[slot];
                entry.state = SlotState::Down;
                entry.deadline = Some(Instant::now() + self.options.respawn_backoff);
                self.emit(Stat::WorkerErrored {
                    worker: slot,
                    error: e.to_string(),
                });
            }
        }
    }

    /// Terminates the slot's worker and reaps it in the background.
    fn retire(&mut self, slot: usize) {
        if let Some(mut worker) = self.slots[slot].worker.take() {
            worker.terminate();
            let grace = self.options.kill_grace;
            self.reapers.retain(|reaper| !reaper.is_finished());
            self.reapers.push(thread::spawn(move || worker.reap(grace)));
        }
    }

    fn shutdown(&mut self, reason: String) {
        log::info!("shutting down: {reason}");
        self.active = false;
        self.emit(Stat::ShutdownStart { reason });

        let grace = self.options.kill_grace;
        let workers: Vec<Box<dyn WorkerProcess>> = self
            .slots
            .iter_mut()
            .filter_map(|slot| slot.worker.take())
            .collect();
        let storage = &self.storage;
        let corpus = &self.corpus;
        thread::scope(|scope| {
            for mut worker in workers {
                scope.spawn(move || {
                    worker.terminate();
                    worker.reap(grace);
                });
            }
            scope.spawn(move || match storage.store_corpus(corpus) {
                Ok(()) => log::info!("stored {} corpus entries", corpus.len()),
                Err(e) => log::warn!("failed to store the corpus: {e}"),
            });
        });
        self.join_reapers();

        log::info!("shutdown complete");
        self.emit(Stat::ShutdownComplete);
    }

    /// Stops every worker without touching storage.
    fn stop_workers(&mut self) {
        let grace = self.options.kill_grace;
        let workers: Vec<Box<dyn WorkerProcess>> = self
            .slots
            .iter_mut()
            .filter_map(|slot| slot.worker.take())
            .collect();
        thread::scope(|scope| {
            for mut worker in workers {
                scope.spawn(move || {
                    worker.terminate();
                    worker.reap(grace);
                });
            }
        });
        self.join_reapers();
    }

    fn join_reapers(&mut self) {
        for reaper in self.reapers.drain(..) {
            if reaper.join().is_err() {
                log::warn!("a worker reaper panicked");
            }
        }
    }
}
