//! # sc-dst
//!
//! Deterministic simulation kernel for the seat-booking coordination core.
//!
//! Every source of nondeterminism in the coordinators goes through this
//! crate: wall time ([`TimeSource`]), suspension points ([`Sleeper`]) and
//! random latency/failure draws ([`FaultInjector`]). Tests plug in the
//! simulated versions and replay runs from a seed; production plugs in
//! [`SystemClock`] and [`TokioSleeper`].
//!
//! ## Usage
//!
//! ```rust
//! use sc_dst::{DstEnv, FaultConfig, Sleeper};
//!
//! let mut env = DstEnv::new(12345);
//! let mut faults = env.fault_injector(FaultConfig::default());
//! let latency = faults.rpc_latency();
//!
//! let scheduler = env.scheduler().clone();
//! env.block_on(async move { scheduler.sleep(latency).await })
//!     .unwrap();
//! assert_eq!(env.clock().now_ms(), latency.as_millis() as u64);
//! ```
//!
//! ## Reproducibility
//!
//! To reproduce a failing test:
//! ```bash
//! SC_DST_SEED=12345 cargo test
//! ```

pub mod clock;
pub mod env;
pub mod error;
pub mod fault;
pub mod random;
pub mod scheduler;

pub use clock::{SimClock, SystemClock, TimeSource};
pub use env::{DstEnv, DstStats};
pub use error::DstError;
pub use fault::{FaultConfig, FaultInjector, FaultStats, LatencyRange};
pub use random::DeterministicRng;
pub use scheduler::{SimScheduler, SleepFuture, Sleeper, TokioSleeper};

/// Environment variable holding a seed to replay.
pub const SEED_ENV_VAR: &str = "SC_DST_SEED";

/// Get the DST seed from `SC_DST_SEED` or generate a random one.
///
/// Prints the seed for reproduction. An unparsable value is reported and
/// replaced by a fresh seed.
#[must_use]
pub fn get_or_generate_seed() -> u64 {
    match std::env::var(SEED_ENV_VAR) {
        Ok(s) => match s.trim().parse::<u64>() {
            Ok(seed) if seed != 0 => {
                println!("{}={} (from environment)", SEED_ENV_VAR, seed);
                seed
            }
            _ => {
                tracing::warn!(value = %s, "ignoring invalid {}", SEED_ENV_VAR);
                generate_seed()
            }
        },
        Err(_) => generate_seed(),
    }
}

fn generate_seed() -> u64 {
    // Zero is reserved; xoshiro seeds poorly from it.
    let seed = rand::random::<u64>().max(1);
    println!("{}={} (randomly generated)", SEED_ENV_VAR, seed);
    seed
}
