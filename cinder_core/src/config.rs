use crate::cluster::ClusterOptions;
use anyhow::{Context, bail};
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzerSettings {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,
    /// Random when unset.
    pub seed: Option<u64>,
}

pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_timeout_ms() -> u64 {
    2000
}

fn default_kill_grace_ms() -> u64 {
    2000
}

fn default_ready_timeout_ms() -> u64 {
    10_000
}

impl Default for FuzzerSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            timeout_ms: default_timeout_ms(),
            kill_grace_ms: default_kill_grace_ms(),
            ready_timeout_ms: default_ready_timeout_ms(),
            seed: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TargetSettings {
    /// Worker executable followed by its arguments.
    #[serde(default)]
    pub command: Vec<String>,
    /// Regular expressions passed to the worker as code to leave uninstrumented.
    #[serde(default)]
    pub exclude: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Scan the worker executable for printable strings to use as literals.
    #[serde(default)]
    pub extract_literals: bool,
    pub dictionary: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct StorageSettings {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

pub fn default_output_dir() -> PathBuf {
    PathBuf::from("./cinder-out")
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CinderConfig {
    #[serde(default)]
    pub fuzzer: FuzzerSettings,
    #[serde(default)]
    pub target: TargetSettings,
    #[serde(default)]
    pub storage: StorageSettings,
}

impl CinderConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at {path:?}"))?;
        Self::parse(&content).with_context(|| format!("Failed to parse config file {path:?}"))
    }

    pub fn parse(content: &str) -> Result<Self, anyhow::Error> {
        Ok(toml::from_str(content)?)
    }

    /// Rejects settings the orchestrator cannot run with.
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.target.command.is_empty() {
            bail!("no target command given");
        }
        if self.fuzzer.workers == 0 {
            bail!("workers must be at least 1");
        }
        if self.fuzzer.timeout_ms == 0 {
            bail!("timeout-ms must be greater than 0");
        }
        for pattern in &self.target.exclude {
            Regex::new(pattern).with_context(|| format!("exclude regex {pattern:?} does not compile"))?;
        }
        Ok(())
    }

    /// Orchestrator options; `seed` fills in for an unset configured seed.
    pub fn cluster_options(&self, seed: u64) -> ClusterOptions {
        ClusterOptions {
            workers: self.fuzzer.workers,
            timeout: Duration::from_millis(self.fuzzer.timeout_ms),
            kill_grace: Duration::from_millis(self.fuzzer.kill_grace_ms),
            ready_timeout: Duration::from_millis(self.fuzzer.ready_timeout_ms),
            seed: self.fuzzer.seed.unwrap_or(seed),
            ..ClusterOptions::default()
        }
    }
}
