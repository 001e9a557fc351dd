//! Worker processes as seen from the orchestrator.
//!
//! Each spawned worker gets reader threads that decode its output and forward
//! everything, tagged with the worker's slot and generation, into the single
//! channel the supervisor loop consumes. Bumping a slot's generation on
//! respawn is what makes late events from a replaced worker harmless.

use crate::protocol::{self, Decoder, Message, ProtocolError};
use std::io::{BufRead, BufReader, ErrorKind, Read};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::Sender;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

const READ_CHUNK: usize = 64 * 1024;
const REAP_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("worker command is empty")]
    EmptyCommand,

    #[error("failed to spawn worker {command:?}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode worker arguments: {0}")]
    Arguments(#[from] serde_json::Error),

    #[error("worker input is closed")]
    Closed,

    #[error("failed to send to worker: {0}")]
    Send(#[from] ProtocolError),
}

/// Something that happened on one worker's connection.
#[derive(Debug)]
pub enum WorkerEvent {
    Message(Message),
    /// One line of the worker's diagnostic output.
    Log(String),
    /// The connection is unusable, e.g. the output stream was corrupt.
    Error(String),
    /// The worker's output stream ended.
    Closed,
}

/// Everything the supervisor loop receives.
#[derive(Debug)]
pub enum Envelope {
    Worker {
        slot: usize,
        generation: u64,
        event: WorkerEvent,
    },
    Shutdown {
        reason: String,
    },
}

/// Sending half handed to a worker's reader threads.
#[derive(Debug, Clone)]
pub struct EventSink {
    slot: usize,
    generation: u64,
    tx: Sender<Envelope>,
}

impl EventSink {
    pub fn new(slot: usize, generation: u64, tx: Sender<Envelope>) -> Self {
        Self {
            slot,
            generation,
            tx,
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns `false` once the supervisor has gone away.
    pub fn emit(&self, event: WorkerEvent) -> bool {
        self.tx
            .send(Envelope::Worker {
                slot: self.slot,
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

/// A live worker owned by one orchestrator slot.
pub trait WorkerProcess: Send {
    fn send(&mut self, message: &Message) -> Result<(), WorkerError>;

    /// Asks the worker to exit. Must not block.
    fn terminate(&mut self);

    /// Waits up to `grace` for the worker to exit, then kills it.
    fn reap(self: Box<Self>, grace: Duration);
}

/// Creates workers. Events from the new worker go to `sink`.
pub trait Spawner: Send + Sync {
    fn spawn(&self, sink: EventSink) -> Result<Box<dyn WorkerProcess>, WorkerError>;
}

/// Spawns local worker processes that speak the protocol on stdin/stdout.
///
/// The worker is started as `command... <exclude patterns as a JSON array>`.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    command: Vec<String>,
    exclude: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl ProcessSpawner {
    pub fn new(command: Vec<String>, exclude: Vec<String>, working_dir: Option<PathBuf>) -> Self {
        Self {
            command,
            exclude,
            working_dir,
        }
    }

    fn command(&self) -> Result<Command, WorkerError> {
        let (program, args) = self.command.split_first().ok_or(WorkerError::EmptyCommand)?;
        let mut command = Command::new(program);
        command
            .args(args)
            .arg(serde_json::to_string(&self.exclude)?)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        // Keep terminal signals such as Ctrl-C away from the workers; the
        // orchestrator stops them itself.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        Ok(command)
    }
}

impl Spawner for ProcessSpawner {
    fn spawn(&self, sink: EventSink) -> Result<Box<dyn WorkerProcess>, WorkerError> {
        let mut child = self.command()?.spawn().map_err(|source| WorkerError::Spawn {
            command: self.command.join(" "),
            source,
        })?;
        log::debug!("worker {} spawned as pid {}", sink.slot(), child.id());

        let stdin = child.stdin.take();
        if let Some(stdout) = child.stdout.take() {
            let sink = sink.clone();
            thread::spawn(move || pump_messages(stdout, sink));
        }
        if let Some(stderr) = child.stderr.take() {
            let sink = sink.clone();
            thread::spawn(move || pump_log_lines(stderr, sink));
        }

        Ok(Box::new(ProcessWorker {
            slot: sink.slot(),
            child,
            stdin,
        }))
    }
}

/// Decodes protocol frames from a worker's stdout until EOF or corruption.
fn pump_messages<R: Read>(mut stdout: R, sink: EventSink) {
    let mut decoder = Decoder::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let n = match stdout.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                sink.emit(WorkerEvent::Error(format!("failed to read worker output: {e}")));
                return;
            }
        };
        decoder.feed(&chunk[..n]);
        loop {
            match decoder.next_message() {
                Ok(Some(message)) => {
                    if !sink.emit(WorkerEvent::Message(message)) {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    sink.emit(WorkerEvent::Error(format!("protocol error: {e}")));
                    return;
                }
            }
        }
    }
    sink.emit(WorkerEvent::Closed);
}

/// Forwards a worker's stderr line by line.
fn pump_log_lines<R: Read>(stderr: R, sink: EventSink) {
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line) {
            Ok(0) => return,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                let text = text.trim_end_matches(['\r', '\n']);
                if !text.is_empty() && !sink.emit(WorkerEvent::Log(text.to_string())) {
                    return;
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(_) => return,
        }
    }
}

struct ProcessWorker {
    slot: usize,
    child: Child,
    stdin: Option<ChildStdin>,
}

impl WorkerProcess for ProcessWorker {
    fn send(&mut self, message: &Message) -> Result<(), WorkerError> {
        let stdin = self.stdin.as_mut().ok_or(WorkerError::Closed)?;
        protocol::write_message(stdin, message)?;
        Ok(())
    }

    fn terminate(&mut self) {
        // Closing stdin ends the worker's read loop; the signal covers workers
        // stuck inside the target.
        self.stdin.take();
        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;
            if let Err(e) = kill(Pid::from_raw(self.child.id() as i32), Signal::SIGTERM) {
                log::trace!("worker {}: SIGTERM failed: {e}", self.slot);
            }
        }
    }

    fn reap(mut self: Box<Self>, grace: Duration) {
        let started = Instant::now();
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    log::debug!("worker {} exited with {status}", self.slot);
                    return;
                }
                Ok(None) if started.elapsed() < grace => thread::sleep(REAP_POLL_INTERVAL),
                Ok(None) => break,
                Err(e) => {
                    log::warn!("worker {}: failed to poll for exit: {e}", self.slot);
                    break;
                }
            }
        }
        log::debug!("worker {} outlived its {grace:?} grace period, killing", self.slot);
        if let Err(e) = self.child.kill() {
            log::warn!("worker {}: failed to kill: {e}", self.slot);
        }
        let _ = self.child.wait();
    }
}

impl Drop for ProcessWorker {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}
