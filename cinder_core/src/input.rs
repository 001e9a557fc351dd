use crate::protocol::{WorkResult, WorkSummary};
use serde::{Deserialize, Serialize};

pub const MIN_SCORE: f64 = 1.0;
pub const MAX_SCORE: f64 = 100.0;
const BASE_SCORE: f64 = 10.0;

/// A payload together with what happened when it was executed.
///
/// Corpus identity is the coverage hash in `summary`, not the payload bytes.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Input {
    #[serde(with = "hex")]
    pub payload: Vec<u8>,
    /// Number of mutation rounds separating this input from a seed.
    pub depth: u32,
    pub summary: WorkSummary,
}

impl Input {
    pub fn new(payload: Vec<u8>, depth: u32, summary: WorkSummary) -> Self {
        Self {
            payload,
            depth,
            summary,
        }
    }

    /// The input sampled from an empty corpus.
    pub fn zero() -> Self {
        Self {
            payload: Vec::new(),
            depth: 0,
            summary: WorkSummary {
                result: WorkResult::Allow,
                coverage_size: 0,
                input_length: 0,
                hash: String::new(),
                runtime_us: f64::INFINITY,
                error: None,
            },
        }
    }

    /// A seed loaded from outside the fuzzing loop, before it has been run.
    pub fn seed(payload: Vec<u8>) -> Self {
        let hash = format!("{:x}", md5::compute(&payload));
        let mut input = Self::zero();
        input.summary.input_length = payload.len() as u64;
        input.summary.hash = hash;
        input.payload = payload;
        input
    }

    pub fn hash(&self) -> &str {
        &self.summary.hash
    }

    /// Fitness of this input relative to the corpus averages, in
    /// `[MIN_SCORE, MAX_SCORE]`. Fast, high-coverage, deep inputs and inputs
    /// the target reinforced score higher.
    pub fn score(&self, avg_runtime: f64, avg_coverage: f64) -> f64 {
        let mut score = BASE_SCORE;

        let runtime_ratio = self.summary.runtime_us / avg_runtime;
        if runtime_ratio > 10.0 {
            score /= 10.0;
        } else if runtime_ratio > 4.0 {
            score /= 4.0;
        } else if runtime_ratio > 2.0 {
            score /= 2.0;
        } else if runtime_ratio < 0.25 {
            score *= 3.0;
        } else if runtime_ratio < 0.33 {
            score *= 2.0;
        } else if runtime_ratio < 0.5 {
            score *= 1.5;
        }

        let coverage_ratio = self.summary.coverage_size as f64 / avg_coverage;
        if coverage_ratio > 3.0 {
            score *= 3.0;
        } else if coverage_ratio > 2.0 {
            score *= 2.0;
        } else if coverage_ratio > 1.5 {
            score *= 1.5;
        } else if coverage_ratio < 0.3 {
            score /= 4.0;
        } else if coverage_ratio < 0.5 {
            score /= 2.0;
        } else if coverage_ratio < 0.75 {
            score /= 1.5;
        }

        score *= match self.depth {
            0..10 => 1.0,
            10..20 => 2.0,
            20..40 => 3.0,
            40..80 => 4.0,
            _ => 5.0,
        };

        if self.summary.result == WorkResult::Reinforce {
            score *= 2.0;
        }

        score.clamp(MIN_SCORE, MAX_SCORE)
    }
}

impl Default for Input {
    fn default() -> Self {
        Input::zero()
    }
}
