//! Per-execution edge coverage and its normalization.
//!
//! A [`CoverageMap`] is handed to the target for every execution and reset in
//! between, so no coverage state outlives the invocation that produced it.

/// Number of edge counters in a default map.
pub const DEFAULT_MAP_SIZE: usize = 1 << 16;

/// Largest power of two representable in a counter byte.
const TOP_BUCKET: u8 = 128;

/// Hit counters indexed by edge id.
#[derive(Debug, Clone)]
pub struct CoverageMap {
    counters: Vec<u8>,
}

impl Default for CoverageMap {
    fn default() -> Self {
        Self::new(DEFAULT_MAP_SIZE)
    }
}

impl CoverageMap {
    pub fn new(size: usize) -> Self {
        Self {
            counters: vec![0; size.max(1)],
        }
    }

    /// Records one traversal of `edge`. Ids beyond the map wrap around;
    /// counters saturate instead of overflowing to zero.
    #[inline]
    pub fn hit(&mut self, edge: usize) {
        let slot = edge % self.counters.len();
        self.counters[slot] = self.counters[slot].saturating_add(1);
    }

    pub fn reset(&mut self) {
        self.counters.fill(0);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.counters
    }

    /// Number of edges hit at least once.
    pub fn edges_hit(&self) -> usize {
        self.counters.iter().filter(|&&c| c != 0).count()
    }

    /// Flattens a copy of the counters and returns it with its size and hash.
    pub fn summarize(&self) -> FlattenedCoverage {
        let mut buckets = self.counters.clone();
        let size = flatten(&mut buckets);
        let hash = coverage_hash(&buckets);
        FlattenedCoverage {
            buckets,
            size,
            hash,
        }
    }
}

/// Coverage after bucket flattening.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlattenedCoverage {
    pub buckets: Vec<u8>,
    pub size: u64,
    pub hash: String,
}

/// Rounds a hit count up to the next power of two. Zero stays zero and counts
/// above 128 land in the 128 bucket.
#[inline]
pub fn bucket(count: u8) -> u8 {
    match count {
        0 => 0,
        c if c > TOP_BUCKET => TOP_BUCKET,
        c => c.next_power_of_two(),
    }
}

/// Buckets every counter in place and returns the sum of the buckets.
pub fn flatten(counters: &mut [u8]) -> u64 {
    counters.iter_mut().fold(0u64, |sum, counter| {
        *counter = bucket(*counter);
        sum + u64::from(*counter)
    })
}

/// Lowercase hex md5 of an already flattened buffer.
pub fn coverage_hash(flattened: &[u8]) -> String {
    format!("{:x}", md5::compute(flattened))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_rounds_up_to_powers_of_two() {
        let expected = [(0, 0), (1, 1), (2, 2), (3, 4), (5, 8), (9, 16), (100, 128), (128, 128)];
        for (raw, bucketed) in expected {
            assert_eq!(bucket(raw), bucketed, "bucket({raw})");
        }
        assert_eq!(bucket(129), 128);
        assert_eq!(bucket(255), 128);
    }

    #[test]
    fn bucketing_is_idempotent_and_monotone() {
        let mut previous = 0;
        for raw in 0..=u8::MAX {
            let once = bucket(raw);
            assert_eq!(bucket(once), once, "bucket not idempotent at {raw}");
            assert!(once >= previous, "bucket not monotone at {raw}");
            assert_eq!(once == 0, raw == 0);
            previous = once;
        }
    }

    #[test]
    fn flatten_sums_buckets_and_hash_ignores_count_noise() {
        let mut a = vec![0, 3, 5, 1];
        let mut b = vec![0, 4, 7, 1];
        assert_eq!(flatten(&mut a), 4 + 8 + 1);
        assert_eq!(flatten(&mut b), 4 + 8 + 1);
        assert_eq!(coverage_hash(&a), coverage_hash(&b));

        let mut c = vec![0, 4, 9, 1];
        flatten(&mut c);
        assert_ne!(coverage_hash(&a), coverage_hash(&c));
    }

    #[test]
    fn map_records_saturates_and_resets() {
        let mut map = CoverageMap::new(8);
        for _ in 0..300 {
            map.hit(3);
        }
        map.hit(8 + 5);
        assert_eq!(map.as_bytes()[3], u8::MAX);
        assert_eq!(map.as_bytes()[5], 1);
        assert_eq!(map.edges_hit(), 2);

        let summary = map.summarize();
        assert_eq!(summary.size, 128 + 1);
        assert_eq!(summary.hash.len(), 32);
        assert_eq!(map.as_bytes()[3], u8::MAX, "summarize must not touch the live map");

        map.reset();
        assert_eq!(map.edges_hit(), 0);
    }
}
