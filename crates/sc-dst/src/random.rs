//! Deterministic random number generation.
//!
//! Every random draw in a simulation (latency, replica failure, clock
//! drift, request interleaving) comes from one of these, so a run is fully
//! determined by its seed.

use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256StarStar;

/// Seeded Xoshiro256** generator that counts its draws.
///
/// ```rust
/// use sc_dst::DeterministicRng;
///
/// let mut a = DeterministicRng::new(7);
/// let mut b = DeterministicRng::new(7);
/// assert_eq!(a.gen_range(0..1_000u32), b.gen_range(0..1_000u32));
/// ```
#[derive(Debug, Clone)]
pub struct DeterministicRng {
    seed: u64,
    rng: Xoshiro256StarStar,
    calls_count: u64,
}

/// A run drawing this often is stuck in a loop.
const CALLS_COUNT_MAX: u64 = 1_000_000_000;

impl DeterministicRng {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        debug_assert!(seed != 0, "zero is reserved");

        Self {
            seed,
            rng: Xoshiro256StarStar::seed_from_u64(seed),
            calls_count: 0,
        }
    }

    #[must_use]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    #[must_use]
    pub fn calls_count(&self) -> u64 {
        self.calls_count
    }

    fn count(&mut self) {
        self.calls_count += 1;
        debug_assert!(self.calls_count < CALLS_COUNT_MAX, "runaway RNG use");
    }

    pub fn gen<T>(&mut self) -> T
    where
        rand::distributions::Standard: rand::distributions::Distribution<T>,
    {
        self.count();
        self.rng.gen()
    }

    pub fn gen_range<T, R>(&mut self, range: R) -> T
    where
        T: rand::distributions::uniform::SampleUniform,
        R: rand::distributions::uniform::SampleRange<T>,
    {
        self.count();
        self.rng.gen_range(range)
    }

    /// `true` with the given probability.
    pub fn gen_bool(&mut self, probability: f64) -> bool {
        debug_assert!((0.0..=1.0).contains(&probability), "not a probability: {}", probability);
        self.count();
        self.rng.gen_bool(probability)
    }

    /// Shuffle a slice in place, e.g. to permute request arrival order.
    pub fn shuffle<T>(&mut self, slice: &mut [T]) {
        self.count();
        slice.shuffle(&mut self.rng);
    }

    /// Derive an independent generator for a sub-component.
    #[must_use]
    pub fn fork(&mut self) -> Self {
        // Never hand out the reserved zero seed.
        let seed = self.gen::<u64>().max(1);
        Self::new(seed)
    }
}
