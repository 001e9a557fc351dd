use crate::input::Input;
use crate::mutator::Mutator;
use rand::Rng;
use std::collections::{HashMap, HashSet};

/// Whether [`Corpus::put`] added a new entry or replaced an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted,
    Replaced,
}

#[derive(Debug, Clone)]
struct Entry {
    input: Input,
    /// Score recorded when the entry was stored.
    score: f64,
}

/// The retained population of interesting inputs.
///
/// Inputs are keyed by coverage hash. Each entry owns one slot in a cumulative
/// score array whose partial sums drive weighted sampling: an entry is picked
/// with probability proportional to its score.
///
/// The corpus is not internally synchronized. It is owned by the single
/// supervisor loop, which serializes every mutating call.
#[derive(Debug, Default)]
pub struct Corpus {
    entries: Vec<Entry>,
    cumulative: Vec<f64>,
    by_hash: HashMap<String, usize>,
    /// Sum of finite runtimes across entries, in microseconds.
    total_runtime: f64,
    total_coverage: f64,
    known_literals: HashSet<String>,
    mutator: Mutator,
    zero: Input,
}

impl Corpus {
    pub fn new() -> Self {
        Self::default()
    }

    /// A corpus whose mutation step uses the given mutator.
    pub fn with_mutator(mutator: Mutator) -> Self {
        Self {
            mutator,
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Mean runtime of the stored inputs. Empty corpora average to zero.
    pub fn average_runtime(&self) -> f64 {
        self.total_runtime / self.entries.len().max(1) as f64
    }

    pub fn average_coverage(&self) -> f64 {
        self.total_coverage / self.entries.len().max(1) as f64
    }

    /// Scores `input` against the current corpus averages.
    pub fn score(&self, input: &Input) -> f64 {
        input.score(self.average_runtime(), self.average_coverage())
    }

    pub fn get(&self, hash: &str) -> Option<&Input> {
        self.by_hash.get(hash).map(|&i| &self.entries[i].input)
    }

    /// The score an entry was stored with.
    pub fn stored_score(&self, hash: &str) -> Option<f64> {
        self.by_hash.get(hash).map(|&i| self.entries[i].score)
    }

    pub fn inputs(&self) -> impl Iterator<Item = &Input> {
        self.entries.iter().map(|entry| &entry.input)
    }

    pub fn cumulative_scores(&self) -> &[f64] {
        &self.cumulative
    }

    pub fn total_score(&self) -> f64 {
        self.cumulative.last().copied().unwrap_or(0.0)
    }

    /// Admission test: a candidate is interesting when its coverage hash is
    /// new, or when it outscores the input already stored under that hash.
    pub fn is_interested_in(&self, candidate: &Input) -> bool {
        match self.by_hash.get(candidate.hash()) {
            None => true,
            Some(&i) => self.score(candidate) > self.entries[i].score,
        }
    }

    /// Inserts `candidate`, replacing any entry with the same coverage hash.
    ///
    /// A replacement keeps the entry's slot and shifts every partial sum from
    /// that slot onward by the score difference, so this is linear in the
    /// corpus size.
    pub fn put(&mut self, candidate: Input) -> PutOutcome {
        let score = self.score(&candidate);
        let runtime = finite_or_zero(candidate.summary.runtime_us);
        let coverage = candidate.summary.coverage_size as f64;

        if let Some(&index) = self.by_hash.get(candidate.hash()) {
            let old = &self.entries[index];
            let delta = score - old.score;
            self.total_runtime += runtime - finite_or_zero(old.input.summary.runtime_us);
            self.total_coverage += coverage - old.input.summary.coverage_size as f64;
            for partial in &mut self.cumulative[index..] {
                *partial += delta;
            }
            self.entries[index] = Entry {
                input: candidate,
                score,
            };
            return PutOutcome::Replaced;
        }

        let index = self.entries.len();
        self.cumulative.push(self.total_score() + score);
        self.by_hash.insert(candidate.hash().to_string(), index);
        self.entries.push(Entry {
            input: candidate,
            score,
        });
        self.total_runtime += runtime;
        self.total_coverage += coverage;
        PutOutcome::Inserted
    }

    /// Samples an input with probability proportional to its stored score.
    /// An empty corpus always yields the zero input.
    pub fn pick_weighted<R: Rng + ?Sized>(&self, rng: &mut R) -> &Input {
        let total = self.total_score();
        if self.entries.is_empty() || total <= 0.0 {
            return &self.zero;
        }
        let target = rng.random_range(0.0..total);
        let index = self.cumulative.partition_point(|&partial| partial < target);
        &self.entries[index.min(self.entries.len() - 1)].input
    }

    /// Records literals discovered in the target and hands the ones not seen
    /// before to the mutator. Returns how many were new.
    pub fn found_literals<I, S>(&mut self, literals: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut added = 0;
        for literal in literals {
            let literal = literal.into();
            if self.known_literals.contains(&literal) {
                continue;
            }
            self.mutator.context_mut().add_literal(literal.as_bytes());
            self.known_literals.insert(literal);
            added += 1;
        }
        added
    }

    pub fn literal_count(&self) -> usize {
        self.known_literals.len()
    }

    /// Produces the next payload to try from `payload`.
    pub fn mutate<R: Rng + ?Sized>(&self, payload: &[u8], rng: &mut R) -> Vec<u8> {
        self.mutator.mutate(payload, rng)
    }
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() { value } else { 0.0 }
}
