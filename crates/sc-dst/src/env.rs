//! DST environment combining clock, scheduler, RNG and fault injection.
//!
//! `DstEnv` is the entry point of a deterministic test: build one from a
//! seed, hand its clock, scheduler and fault injectors to the component
//! under test, and drive the test future with [`DstEnv::block_on`].

use std::future::Future;
use std::sync::Arc;

use crate::clock::SimClock;
use crate::error::DstError;
use crate::fault::{FaultConfig, FaultInjector};
use crate::random::DeterministicRng;
use crate::scheduler::SimScheduler;

/// Complete DST environment.
///
/// ```rust
/// use sc_dst::DstEnv;
///
/// let mut env = DstEnv::new(12345);
/// let choice = env.rng().gen_range(0..10);
/// assert!(choice < 10);
/// assert_eq!(env.format_seed(), "SC_DST_SEED=12345");
/// ```
pub struct DstEnv {
    seed: u64,
    clock: Arc<SimClock>,
    scheduler: SimScheduler,
    rng: DeterministicRng,
    /// Seeds handed to fault injectors, in order
    fault_rng: DeterministicRng,
    faults_forked: u64,
}

impl DstEnv {
    /// Create an environment whose clock starts at 0.
    pub fn new(seed: u64) -> Self {
        Self::with_start_time_ms(seed, 0)
    }

    /// Create an environment whose clock starts at `start_ms`.
    pub fn with_start_time_ms(seed: u64, start_ms: u64) -> Self {
        debug_assert!(seed != 0, "Seed should not be zero");

        let mut master_rng = DeterministicRng::new(seed);
        let rng = master_rng.fork();
        let fault_rng = master_rng.fork();
        let clock = Arc::new(SimClock::with_start_time_ms(start_ms));
        let scheduler = SimScheduler::new(Arc::clone(&clock));

        Self {
            seed,
            clock,
            scheduler,
            rng,
            fault_rng,
            faults_forked: 0,
        }
    }

    #[must_use]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    #[must_use]
    pub fn clock(&self) -> &Arc<SimClock> {
        &self.clock
    }

    #[must_use]
    pub fn scheduler(&self) -> &SimScheduler {
        &self.scheduler
    }

    /// RNG for test-side decisions (arrival order, holder choice, ...).
    pub fn rng(&mut self) -> &mut DeterministicRng {
        &mut self.rng
    }

    /// A fresh injector with its own derived seed.
    pub fn fault_injector(&mut self, config: FaultConfig) -> FaultInjector {
        self.faults_forked += 1;
        FaultInjector::new(self.fault_rng.fork(), config)
    }

    /// Drive a future under virtual time.
    pub fn block_on<F: Future>(&self, future: F) -> Result<F::Output, DstError> {
        self.scheduler.block_on(future)
    }

    /// Format seed for test failure messages.
    #[must_use]
    pub fn format_seed(&self) -> String {
        format!("{}={}", crate::SEED_ENV_VAR, self.seed)
    }

    #[must_use]
    pub fn stats(&self) -> DstStats {
        DstStats {
            seed: self.seed,
            elapsed_ms: self.clock.now_ms(),
            rng_calls: self.rng.calls_count(),
            timers_fired: self.scheduler.fired_count(),
            fault_injectors: self.faults_forked,
        }
    }
}

/// Statistics about a DST run.
#[derive(Debug, Clone, Copy)]
pub struct DstStats {
    pub seed: u64,
    /// Simulated time on the clock
    pub elapsed_ms: u64,
    /// Test-side random draws
    pub rng_calls: u64,
    pub timers_fired: u64,
    pub fault_injectors: u64,
}

impl std::fmt::Display for DstStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}={} elapsed={}ms rng_calls={} timers_fired={} fault_injectors={}",
            crate::SEED_ENV_VAR,
            self.seed,
            self.elapsed_ms,
            self.rng_calls,
            self.timers_fired,
            self.fault_injectors
        )
    }
}
