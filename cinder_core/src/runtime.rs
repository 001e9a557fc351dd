//! The worker side of the protocol: runs a [`Target`] for every payload the
//! orchestrator sends and reports what happened.

use crate::coverage::{CoverageMap, FlattenedCoverage};
use crate::protocol::{self, Decoder, Message, ProtocolError, WorkResult, WorkSummary};
use regex::Regex;
use std::io::{self, ErrorKind, Read, Write};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::process::ExitCode;
use std::time::Instant;

const READ_CHUNK: usize = 64 * 1024;

/// Code under test.
///
/// `run` records the edges it takes in `coverage`. Returning `Err` or
/// panicking marks the input as a crasher.
pub trait Target {
    fn run(&mut self, input: &[u8], coverage: &mut CoverageMap) -> Result<WorkResult, String>;

    /// Interesting constants to seed the mutator with.
    fn literals(&self) -> Vec<String> {
        Vec::new()
    }
}

impl<F> Target for F
where
    F: FnMut(&[u8], &mut CoverageMap) -> Result<WorkResult, String>,
{
    fn run(&mut self, input: &[u8], coverage: &mut CoverageMap) -> Result<WorkResult, String> {
        self(input, coverage)
    }
}

pub struct WorkerRuntime<T, R, W> {
    target: T,
    input: R,
    output: W,
    coverage: CoverageMap,
    last: Option<FlattenedCoverage>,
}

impl<T: Target, R: Read, W: Write> WorkerRuntime<T, R, W> {
    pub fn new(target: T, input: R, output: W) -> Self {
        Self::with_coverage(target, input, output, CoverageMap::default())
    }

    pub fn with_coverage(target: T, input: R, output: W, coverage: CoverageMap) -> Self {
        Self {
            target,
            input,
            output,
            coverage,
            last: None,
        }
    }

    /// Runs the protocol until the orchestrator closes our input.
    pub fn serve(mut self) -> Result<(), ProtocolError> {
        let smoke = self.execute(&[]);
        if let Some(error) = &smoke.error {
            log::warn!("target reported an error on the empty input: {error}");
        }

        protocol::write_message(&mut self.output, &Message::Ready)?;
        let literals = self.target.literals();
        if !literals.is_empty() {
            protocol::write_message(&mut self.output, &Message::FoundLiterals(literals))?;
        }

        let mut decoder = Decoder::new();
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            let n = match self.input.read(&mut chunk) {
                Ok(0) => return Ok(()),
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            decoder.feed(&chunk[..n]);
            while let Some(message) = decoder.next_message()? {
                self.handle(message)?;
            }
        }
    }

    fn handle(&mut self, message: Message) -> Result<(), ProtocolError> {
        match message {
            Message::DoWork(payload) => {
                let summary = self.execute(&payload);
                protocol::write_message(&mut self.output, &Message::WorkSummary(summary))
            }
            Message::RequestCoverage => {
                let buckets = self
                    .last
                    .as_ref()
                    .map(|coverage| coverage.buckets.clone())
                    .unwrap_or_default();
                protocol::write_message(&mut self.output, &Message::WorkCoverage(buckets))
            }
            other => {
                log::warn!("ignoring unexpected {:?} message", other.kind());
                Ok(())
            }
        }
    }

    /// Runs the target once on `payload` and keeps its coverage for a
    /// following `RequestCoverage`.
    pub fn execute(&mut self, payload: &[u8]) -> WorkSummary {
        self.coverage.reset();
        let started = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.target.run(payload, &mut self.coverage)
        }));
        let runtime_us = started.elapsed().as_secs_f64() * 1e6;

        let (result, error) = match outcome {
            Ok(Ok(result)) => (result, None),
            Ok(Err(message)) => (WorkResult::Error, Some(message)),
            Err(panic_payload) => {
                let message = if let Some(s) = panic_payload.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic type".to_string()
                };
                (WorkResult::Error, Some(message))
            }
        };

        let flattened = self.coverage.summarize();
        let summary = WorkSummary {
            result,
            coverage_size: flattened.size,
            input_length: payload.len() as u64,
            hash: flattened.hash.clone(),
            runtime_us,
            error,
        };
        self.last = Some(flattened);
        summary
    }
}

/// How the orchestrator started this worker.
#[derive(Debug, Clone, Default)]
pub struct WorkerOptions {
    /// Regular expressions for code the target should leave uninstrumented.
    pub exclude: Vec<String>,
    /// Arguments before the exclusion list.
    pub args: Vec<String>,
    patterns: Vec<Regex>,
}

impl WorkerOptions {
    /// Splits the process arguments; the last one is the JSON exclusion list.
    pub fn from_args<I: IntoIterator<Item = String>>(args: I) -> Self {
        let mut args: Vec<String> = args.into_iter().collect();
        let exclude = match args.last().map(|last| serde_json::from_str::<Vec<String>>(last)) {
            Some(Ok(exclude)) => {
                args.pop();
                exclude
            }
            Some(Err(e)) => {
                log::debug!("last argument is not an exclusion list: {e}");
                Vec::new()
            }
            None => Vec::new(),
        };
        let patterns = exclude
            .iter()
            .filter_map(|pattern| match Regex::new(pattern) {
                Ok(regex) => Some(regex),
                Err(e) => {
                    log::warn!("ignoring exclusion {pattern:?}: {e}");
                    None
                }
            })
            .collect();
        Self {
            exclude,
            args,
            patterns,
        }
    }

    /// Whether any exclusion pattern matches somewhere in `path`.
    pub fn is_excluded(&self, path: &str) -> bool {
        self.patterns.iter().any(|regex| regex.is_match(path))
    }
}

/// Entry point for harness binaries.
///
/// Logs go to stderr, which the orchestrator forwards. A failing `factory`
/// exits before announcing readiness.
pub fn run_worker<T, F>(factory: F) -> ExitCode
where
    T: Target,
    F: FnOnce(&WorkerOptions) -> anyhow::Result<T>,
{
    let _ = env_logger::Builder::from_env(env_logger::Env::new().filter_or("CINDER_LOG", "warn"))
        .format_timestamp_secs()
        .target(env_logger::Target::Stderr)
        .try_init();
    std::panic::set_hook(Box::new(|info| log::debug!("target panicked: {info}")));

    let options = WorkerOptions::from_args(std::env::args().skip(1));
    let target = match factory(&options) {
        Ok(target) => target,
        Err(e) => {
            log::error!("failed to set up the target: {e:#}");
            return ExitCode::from(1);
        }
    };

    let runtime = WorkerRuntime::new(target, io::stdin().lock(), io::stdout().lock());
    match runtime.serve() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("worker stopped: {e}");
            ExitCode::from(2)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coverage::coverage_hash;
    use std::io::Cursor;

    fn frames(messages: &[Message]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for message in messages {
            protocol::write_message(&mut bytes, message).unwrap();
        }
        bytes
    }

    fn replies(output: &[u8]) -> Vec<Message> {
        let mut decoder = Decoder::new();
        decoder.feed(output);
        let mut messages = Vec::new();
        while let Some(message) = decoder.next_message().unwrap() {
            messages.push(message);
        }
        assert_eq!(decoder.pending(), 0);
        messages
    }

    fn branchy(input: &[u8], coverage: &mut CoverageMap) -> Result<WorkResult, String> {
        coverage.hit(1);
        for (i, &byte) in input.iter().enumerate() {
            coverage.hit(100 + i);
            if byte == b'!' {
                return Err(format!("bang at {i}"));
            }
            if byte == b'P' {
                panic!("panic at {i}");
            }
        }
        Ok(WorkResult::Allow)
    }

    struct WithLiterals;

    impl Target for WithLiterals {
        fn run(&mut self, _: &[u8], coverage: &mut CoverageMap) -> Result<WorkResult, String> {
            coverage.hit(0);
            Ok(WorkResult::Reinforce)
        }

        fn literals(&self) -> Vec<String> {
            vec!["MAGIC".to_string()]
        }
    }

    fn serve<T: Target>(target: T, input: Vec<u8>) -> Vec<Message> {
        let mut output = Vec::new();
        WorkerRuntime::new(target, Cursor::new(input), &mut output).serve().unwrap();
        replies(&output)
    }

    #[test]
    fn announces_readiness_then_answers_work_and_coverage() {
        let input = frames(&[Message::DoWork(b"ab".to_vec()), Message::RequestCoverage]);
        let replies = serve(branchy, input);

        assert_eq!(replies.len(), 3);
        assert_eq!(replies[0], Message::Ready);
        let Message::WorkSummary(summary) = &replies[1] else {
            panic!("expected a summary, got {:?}", replies[1]);
        };
        assert_eq!(summary.result, WorkResult::Allow);
        assert_eq!(summary.coverage_size, 3);
        assert_eq!(summary.input_length, 2);
        assert!(summary.runtime_us.is_finite() && summary.runtime_us >= 0.0);
        assert!(summary.error.is_none());

        let Message::WorkCoverage(buckets) = &replies[2] else {
            panic!("expected coverage, got {:?}", replies[2]);
        };
        assert_eq!(coverage_hash(buckets), summary.hash);
    }

    #[test]
    fn errors_and_panics_are_reported_as_crashes() {
        let input = frames(&[Message::DoWork(b"a!".to_vec()), Message::DoWork(b"xP".to_vec())]);
        let replies = serve(branchy, input);
        let summaries: Vec<&WorkSummary> = replies
            .iter()
            .filter_map(|m| match m {
                Message::WorkSummary(s) => Some(s),
                _ => None,
            })
            .collect();
        assert_eq!(summaries.len(), 2);
        assert!(summaries.iter().all(|s| s.result == WorkResult::Error));
        assert_eq!(summaries[0].error.as_deref(), Some("bang at 1"));
        assert_eq!(summaries[1].error.as_deref(), Some("panic at 1"));
    }

    #[test]
    fn literals_follow_ready() {
        let replies = serve(WithLiterals, Vec::new());
        assert_eq!(
            replies,
            vec![Message::Ready, Message::FoundLiterals(vec!["MAGIC".to_string()])]
        );
    }

    #[test]
    fn coverage_before_any_work_is_empty() {
        let mut runtime = WorkerRuntime::new(branchy, Cursor::new(Vec::new()), Vec::new());
        runtime.handle(Message::RequestCoverage).unwrap();
        runtime.handle(Message::Ready).unwrap();
        assert_eq!(replies(&runtime.output), vec![Message::WorkCoverage(Vec::new())]);
    }

    #[test]
    fn coverage_is_reset_between_runs() {
        let mut runtime = WorkerRuntime::new(branchy, Cursor::new(Vec::new()), Vec::new());
        let long = runtime.execute(b"abcdef");
        let short = runtime.execute(b"a");
        assert_eq!(long.coverage_size, 7);
        assert_eq!(short.coverage_size, 2);
        assert_ne!(long.hash, short.hash);
    }

    #[test]
    fn corrupt_input_stops_the_worker() {
        let mut output = Vec::new();
        let result = WorkerRuntime::new(branchy, Cursor::new(vec![0x7f, 0]), &mut output).serve();
        assert!(matches!(result, Err(ProtocolError::UnknownKind(0x7f))));
    }

    #[test]
    fn options_take_the_trailing_json_list() {
        let options =
            WorkerOptions::from_args(["--verbose".to_string(), r#"["^vendor/","\\.gen\\.rs$"]"#.to_string()]);
        assert_eq!(options.args, vec!["--verbose".to_string()]);
        assert_eq!(options.exclude.len(), 2);
        assert!(options.is_excluded("vendor/lib/parse.rs"));
        assert!(options.is_excluded("src/table.gen.rs"));
        assert!(!options.is_excluded("src/vendor/main.rs"));
        assert!(!options.is_excluded("src/gen.rs"));

        let plain = WorkerOptions::from_args(["input.bin".to_string()]);
        assert!(plain.exclude.is_empty());
        assert_eq!(plain.args, vec!["input.bin".to_string()]);
    }

    #[test]
    fn exclusions_match_anywhere_and_bad_patterns_are_skipped() {
        let options = WorkerOptions::from_args([r#"["serde_json","*.rs"]"#.to_string()]);
        assert_eq!(options.exclude.len(), 2);
        assert!(options.is_excluded("registry/serde_json-1.0/src/de.rs"));
        assert!(!options.is_excluded("src/main.rs"));
    }
}
