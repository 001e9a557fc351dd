use crate::mutation::Mutation;
use rand::Rng;
use std::collections::HashSet;

/// State shared by every mutation call: the literals discovered in the
/// target. It only ever grows.
#[derive(Debug, Default, Clone)]
pub struct MutationContext {
    literals: Vec<Vec<u8>>,
    known: HashSet<Vec<u8>>,
}

impl MutationContext {
    /// Adds a literal, returning `false` if it was empty or already known.
    pub fn add_literal(&mut self, literal: &[u8]) -> bool {
        if literal.is_empty() || !self.known.insert(literal.to_vec()) {
            return false;
        }
        self.literals.push(literal.to_vec());
        true
    }

    pub fn literals(&self) -> &[Vec<u8>] {
        &self.literals
    }

    pub fn len(&self) -> usize {
        self.literals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.literals.is_empty()
    }
}

/// Composes transforms from the catalogue into a single mutation step.
///
/// # Example
/// ```
/// use cinder_core::mutator::Mutator;
/// use rand_chacha::ChaCha8Rng;
/// use rand_core::SeedableRng;
///
/// let mutator = Mutator::new();
/// let mut rng = ChaCha8Rng::seed_from_u64(7);
/// let mutated = mutator.mutate_n(b"", 1, &mut rng);
/// assert!(!mutated.is_empty());
/// ```
#[derive(Debug, Clone)]
pub struct Mutator {
    catalogue: Vec<Mutation>,
    context: MutationContext,
}

impl Default for Mutator {
    fn default() -> Self {
        Self::new()
    }
}

impl Mutator {
    /// A mutator drawing from every transform in [`Mutation::ALL`].
    pub fn new() -> Self {
        Self::with_catalogue(Mutation::ALL.to_vec())
    }

    /// A mutator restricted to the given transforms.
    pub fn with_catalogue(catalogue: Vec<Mutation>) -> Self {
        Self {
            catalogue,
            context: MutationContext::default(),
        }
    }

    pub fn context(&self) -> &MutationContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut MutationContext {
        &mut self.context
    }

    /// Applies a geometrically distributed number of transforms (one, plus
    /// one more with probability 1/2, repeatedly).
    pub fn mutate<R: Rng + ?Sized>(&self, buf: &[u8], rng: &mut R) -> Vec<u8> {
        let count = mutation_count(rng);
        self.mutate_n(buf, count, rng)
    }

    /// Applies `count` transforms in sequence, each drawn uniformly from the
    /// catalogue. An inapplicable draw is replaced by a fresh draw from the
    /// transforms not yet tried this round; once every transform has been
    /// tried without success the result built so far is returned, which is
    /// `buf` itself when nothing applied.
    pub fn mutate_n<R: Rng + ?Sized>(&self, buf: &[u8], count: usize, rng: &mut R) -> Vec<u8> {
        let mut current = buf.to_vec();
        let mut untried = Vec::with_capacity(self.catalogue.len());
        for _ in 0..count {
            untried.clear();
            untried.extend_from_slice(&self.catalogue);
            loop {
                if untried.is_empty() {
                    return current;
                }
                let mutation = untried.swap_remove(rng.random_range(0..untried.len()));
                if let Some(next) = mutation.apply(&current, &self.context, rng) {
                    current = next;
                    break;
                }
            }
        }
        current
    }
}

/// Draws a mutation count: 1, then keep adding 1 on each coin flip that
/// comes up heads.
pub fn mutation_count<R: Rng + ?Sized>(rng: &mut R) -> usize {
    let mut count = 1;
    while rng.random_bool(0.5) {
        count += 1;
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::Width;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;

    #[test]
    fn context_deduplicates_and_ignores_empty_literals() {
        let mut ctx = MutationContext::default();
        assert!(ctx.add_literal(b"true"));
        assert!(!ctx.add_literal(b"true"));
        assert!(!ctx.add_literal(b""));
        assert!(ctx.add_literal(b"null"));
        assert_eq!(ctx.literals(), &[b"true".to_vec(), b"null".to_vec()]);
    }

    #[test]
    fn seeded_composition_is_reproducible() {
        let mutator = Mutator::new();
        let mut first = ChaCha8Rng::from_seed([42; 32]);
        let mut second = ChaCha8Rng::from_seed([42; 32]);
        let a = mutator.mutate_n(&[0, 1, 2, 3], 3, &mut first);
        let b = mutator.mutate_n(&[0, 1, 2, 3], 3, &mut second);
        assert_eq!(a, b);
    }

    #[test]
    fn all_inapplicable_degrades_to_the_original_bytes() {
        let mutator = Mutator::with_catalogue(vec![
            Mutation::SwapBytes,
            Mutation::Increment(Width::Four),
            Mutation::InsertLiteral,
        ]);
        let mut rng = ChaCha8Rng::from_seed([1; 32]);
        assert_eq!(mutator.mutate_n(&[], 5, &mut rng), Vec::<u8>::new());
        assert_eq!(mutator.mutate_n(&[9], 5, &mut rng), vec![9]);
    }

    #[test]
    fn empty_buffer_still_mutates_through_insertions() {
        let mutator = Mutator::new();
        let mut rng = ChaCha8Rng::from_seed([2; 32]);
        for _ in 0..50 {
            assert!(!mutator.mutate_n(&[], 1, &mut rng).is_empty());
        }
    }

    #[test]
    fn literals_from_the_context_show_up_in_outputs() {
        let mut mutator = Mutator::with_catalogue(vec![Mutation::InsertLiteral]);
        mutator.context_mut().add_literal(b"MAGIC");
        let mut rng = ChaCha8Rng::from_seed([3; 32]);
        let out = mutator.mutate_n(b"..", 1, &mut rng);
        assert!(out.windows(5).any(|w| w == b"MAGIC"));
    }

    #[test]
    fn mutation_count_averages_about_two() {
        let mut rng = ChaCha8Rng::from_seed([4; 32]);
        let total: usize = (0..10_000).map(|_| mutation_count(&mut rng)).sum();
        let mean = total as f64 / 10_000.0;
        assert!((1.8..2.2).contains(&mean), "mean {mean}");
    }
}
