//! Deterministic, seedable randomness owned by the MAC.
//
// spec.md section 9: "Random choice appears in two places ... Use a
// deterministic seedable PRNG owned by the MAC for reproducibility."
// `rand_chacha` is the standard reproducible-seed choice in the Rust
// ecosystem (used the same way by petersallai-moonblokz-radio-simulator's
// `rand`/`rand_distr` dependency pair) and is promoted here from the
// teacher's dev-dependency-only `rand` to a real dependency, since the
// MAC now needs seeded randomness at runtime, not just in tests.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Thin wrapper so call sites don't need to import `rand` directly.
#[derive(Debug, Clone)]
pub struct DeterministicRng(ChaCha8Rng);

impl DeterministicRng {
    pub fn from_seed(seed: u64) -> Self {
        DeterministicRng(ChaCha8Rng::seed_from_u64(seed))
    }

    /// Uniformly pick one of `candidates`. Panics on an empty slice, since
    /// every call site first checks for emptiness and handles it as a
    /// distinct "no candidates" case.
    pub fn choose<'a, T>(&mut self, candidates: &'a [T]) -> &'a T {
        let idx = self.0.gen_range(0..candidates.len());
        &candidates[idx]
    }

    pub fn gen_range_u32(&mut self, range: core::ops::Range<u32>) -> u32 {
        self.0.gen_range(range)
    }
}
