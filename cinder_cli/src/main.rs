use cinder_core::config::CinderConfig;
use cinder_core::literals;
use cinder_core::stats::{Stat, Stats};
use cinder_core::storage::FileStorage;
use cinder_core::worker::ProcessSpawner;
use cinder_core::{Cluster, ClusterError};

use anyhow::Context;
use clap::Parser;
use env_logger::{Env, TimestampPrecision};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

const REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Coverage-guided fuzzing across a pool of worker processes.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Worker command and its arguments, e.g. `./target/release/demo_worker`.
    #[clap(trailing_var_arg = true, allow_hyphen_values = true)]
    target: Vec<String>,
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// Number of worker processes.
    #[clap(short, long)]
    workers: Option<usize>,
    /// Per-input timeout in milliseconds.
    #[clap(short, long)]
    timeout_ms: Option<u64>,
    /// Regex matching code the worker should not instrument. Repeatable.
    #[clap(short, long)]
    exclude: Vec<String>,
    /// Directory for the corpus, crashers and timeouts.
    #[clap(short, long)]
    output: Option<PathBuf>,
    #[clap(long)]
    seed: Option<u64>,
    /// AFL-style dictionary of literals.
    #[clap(long)]
    dict: Option<PathBuf>,
    /// Scan the worker executable for string literals.
    #[clap(long)]
    extract_literals: bool,
    /// Only report crashers, timeouts and errors.
    #[clap(short, long)]
    quiet: bool,
    /// Print every stat event as a JSON line on stdout.
    #[clap(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Reporter {
    Log { quiet: bool },
    Json,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_env = Env::new()
        .filter_or("CINDER_LOG", "info")
        .default_write_style_or("auto");
    env_logger::Builder::from_env(log_env)
        .format_timestamp(Some(TimestampPrecision::Seconds))
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<CinderConfig> {
    let mut config = match &cli.config_file {
        Some(config_path) => {
            log::info!("Loading configuration from {config_path:?}");
            CinderConfig::load_from_file(config_path)?
        }
        None => {
            let default_config_path = PathBuf::from("cinder.toml");
            if default_config_path.exists() {
                log::info!("Loading default configuration {default_config_path:?}");
                CinderConfig::load_from_file(&default_config_path)?
            } else {
                CinderConfig::default()
            }
        }
    };

    if !cli.target.is_empty() {
        config.target.command = cli.target.clone();
    }
    if let Some(workers) = cli.workers {
        config.fuzzer.workers = workers;
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        config.fuzzer.timeout_ms = timeout_ms;
    }
    if !cli.exclude.is_empty() {
        config.target.exclude.extend(cli.exclude.iter().cloned());
    }
    if let Some(output) = &cli.output {
        config.storage.output_dir = output.clone();
    }
    if cli.seed.is_some() {
        config.fuzzer.seed = cli.seed;
    }
    if cli.dict.is_some() {
        config.target.dictionary = cli.dict.clone();
    }
    config.target.extract_literals |= cli.extract_literals;

    config.validate()?;
    Ok(config)
}

fn initial_literals(config: &CinderConfig) -> anyhow::Result<Vec<String>> {
    let mut found = Vec::new();
    if let Some(dictionary) = &config.target.dictionary {
        let entries = literals::load_dictionary(dictionary)?;
        log::info!("Loaded {} literals from {dictionary:?}", entries.len());
        found.extend(entries);
    }
    if config.target.extract_literals {
        let program = PathBuf::from(&config.target.command[0]);
        let program = match &config.target.working_dir {
            Some(dir) if program.is_relative() => dir.join(program),
            _ => program,
        };
        match literals::detect_all(|| std::fs::read(&program)) {
            Ok(detected) => {
                log::info!("Extracted {} literals from {program:?}", detected.len());
                found.extend(detected);
            }
            // Commands resolved through PATH cannot be read directly.
            Err(e) => log::warn!("Skipping literal extraction from {program:?}: {e:#}"),
        }
    }
    Ok(found)
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;
    let seed = config.fuzzer.seed.unwrap_or_else(rand::random);
    let options = config.cluster_options(seed);
    log::info!(
        "Fuzzing {:?} with {} workers, {:?} timeout, seed {}",
        config.target.command,
        options.workers,
        options.timeout,
        options.seed
    );

    let literals = initial_literals(&config)?;
    let storage = FileStorage::new(&config.storage.output_dir);
    let spawner = ProcessSpawner::new(
        config.target.command.clone(),
        config.target.exclude.clone(),
        config.target.working_dir.clone(),
    );

    let (stats_tx, stats_rx) = mpsc::channel();
    let cluster = Cluster::new(options, Box::new(spawner), storage, stats_tx).with_literals(literals);

    let shutdown = cluster.shutdown_handle();
    ctrlc::set_handler(move || shutdown.request("interrupted"))
        .context("Failed to install the Ctrl-C handler")?;

    let reporter = if cli.json {
        Reporter::Json
    } else {
        Reporter::Log { quiet: cli.quiet }
    };
    let report_thread = thread::spawn(move || report(stats_rx, reporter));

    let result: Result<(), ClusterError> = cluster.run();
    if report_thread.join().is_err() {
        log::warn!("Stats reporter panicked");
    }
    result.context("Fuzzing could not start")
}

/// Consumes stat events until the cluster drops its sender.
fn report(stats_rx: Receiver<Stat>, reporter: Reporter) {
    let mut stats = Stats::new();
    let mut last_report = Instant::now();
    loop {
        match stats_rx.recv_timeout(REPORT_INTERVAL) {
            Ok(stat) => {
                stats.record(&stat);
                match reporter {
                    Reporter::Json => match serde_json::to_string(&stat) {
                        Ok(line) => println!("{line}"),
                        Err(e) => log::warn!("Failed to serialize {stat:?}: {e}"),
                    },
                    Reporter::Log { quiet } => log_stat(&stat, quiet),
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if matches!(reporter, Reporter::Log { quiet: false }) && last_report.elapsed() >= REPORT_INTERVAL {
            log::info!("{}", stats.summary_line());
            last_report = Instant::now();
        }
    }
    if !matches!(reporter, Reporter::Json) {
        log::info!("Final: {}", stats.summary_line());
    }
}

fn log_stat(stat: &Stat, quiet: bool) {
    match stat {
        Stat::CrasherFound {
            worker,
            hash,
            error,
        } => log::warn!("Worker {worker} found crasher {hash}: {error}"),
        Stat::WorkerTimeout { worker } => log::warn!("Worker {worker} timed out"),
        Stat::WorkerErrored { worker, error } => log::warn!("Worker {worker} errored: {error}"),
        Stat::FatalError { error } => log::error!("{error}"),
        Stat::ProgramLogLine { worker, line } if !quiet => log::info!("[worker {worker}] {line}"),
        Stat::CoverageUpdate {
            hash,
            branches,
            corpus_size,
            ..
        } if !quiet => log::debug!("New coverage {hash}: {branches} branches, corpus {corpus_size}"),
        Stat::SpinUp { worker_count } if !quiet => log::info!("Starting {worker_count} workers"),
        Stat::WorkersReady if !quiet => log::info!("All workers ready"),
        Stat::ShutdownStart { reason } if !quiet => log::info!("Shutting down: {reason}"),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_the_config() {
        let cli = Cli::parse_from([
            "cinder",
            "-w",
            "3",
            "-t",
            "50",
            "-e",
            "^vendor/",
            "--seed",
            "11",
            "--",
            "./harness",
            "--strict",
        ]);
        let config = load_config(&cli).unwrap();
        assert_eq!(config.target.command, vec!["./harness".to_string(), "--strict".to_string()]);
        assert_eq!(config.fuzzer.workers, 3);
        assert_eq!(config.fuzzer.timeout_ms, 50);
        assert_eq!(config.target.exclude, vec!["^vendor/".to_string()]);
        assert_eq!(config.cluster_options(0).seed, 11);
    }

    #[test]
    fn missing_target_is_an_error() {
        let cli = Cli::parse_from(["cinder", "-w", "2"]);
        assert!(load_config(&cli).is_err());
    }
}
