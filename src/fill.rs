//! Vector generation for benchmark input data.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::types::Rank;

/// How the input vector is populated before a benchmark run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillMode {
    /// Every element set to the same value (typically the worker rank, so
    /// the reduced result is trivially checkable).
    Constant(u32),
    /// Pseudo-random values, reproducible for a given seed.
    Random { seed: u64 },
}

/// Populate `data` according to `mode`.
pub fn fill(data: &mut [u32], mode: FillMode) {
    match mode {
        FillMode::Constant(value) => data.fill(value),
        FillMode::Random { seed } => {
            let mut rng = SmallRng::seed_from_u64(seed);
            for v in data.iter_mut() {
                *v = rng.gen();
            }
        }
    }
}

/// Allocate and populate a fresh vector.
pub fn generate(len: usize, mode: FillMode) -> Vec<u32> {
    let mut data = vec![0u32; len];
    fill(&mut data, mode);
    data
}

/// Choose the call-wide fixed-point exponent.
///
/// One exponent is used for the whole process run: the rank in constant
/// mode, a PRNG draw in random mode.
pub fn pick_exponent(rank: Rank, mode: FillMode) -> u32 {
    match mode {
        FillMode::Constant(_) => rank as u32,
        FillMode::Random { seed } => SmallRng::seed_from_u64(seed).gen(),
    }
}
