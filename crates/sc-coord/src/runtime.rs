//! Time, suspension and fault draws shared by the coordinators.
//!
//! A [`Runtime`] is built once per cluster. Production runs on the system
//! clock and tokio timers; a simulation runs on a [`DstEnv`]'s virtual clock
//! and scheduler, so the whole cluster replays from one seed.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use sc_dst::{
    DeterministicRng, DstEnv, FaultConfig, FaultInjector, Sleeper, SystemClock, TimeSource,
    TokioSleeper,
};

pub struct Runtime {
    time: Arc<dyn TimeSource>,
    sleeper: Arc<dyn Sleeper>,
    faults: Mutex<FaultInjector>,
}

impl Runtime {
    #[must_use]
    pub fn new(
        time: Arc<dyn TimeSource>,
        sleeper: Arc<dyn Sleeper>,
        faults: FaultInjector,
    ) -> Self {
        Self {
            time,
            sleeper,
            faults: Mutex::new(faults),
        }
    }

    /// Wall clock and tokio timers. Must be used inside a tokio runtime.
    #[must_use]
    pub fn production(seed: u64, faults: FaultConfig) -> Self {
        Self::new(
            Arc::new(SystemClock),
            Arc::new(TokioSleeper),
            FaultInjector::new(DeterministicRng::new(seed), faults),
        )
    }

    /// Virtual clock and scheduler of `env`; drive futures with `env.block_on`.
    #[must_use]
    pub fn simulated(env: &mut DstEnv, faults: FaultConfig) -> Self {
        let injector = env.fault_injector(faults);
        Self::new(
            Arc::clone(env.clock()) as Arc<dyn TimeSource>,
            Arc::new(env.scheduler().clone()),
            injector,
        )
    }

    #[must_use]
    pub fn now_ms(&self) -> u64 {
        self.time.now_ms()
    }

    #[must_use]
    pub fn time_source(&self) -> Arc<dyn TimeSource> {
        Arc::clone(&self.time)
    }

    #[must_use]
    pub fn sleeper(&self) -> Arc<dyn Sleeper> {
        Arc::clone(&self.sleeper)
    }

    pub async fn sleep(&self, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        self.sleeper.sleep(duration).await;
    }

    /// The fault injector. Never hold the guard across an await.
    pub fn faults(&self) -> MutexGuard<'_, FaultInjector> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("now_ms", &self.now_ms())
            .field("faults", &self.faults().stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulated_runtime_follows_env_clock() {
        let mut env = DstEnv::with_start_time_ms(12345, 5_000);
        let runtime = Runtime::simulated(&mut env, FaultConfig::default());
        assert_eq!(runtime.now_ms(), 5_000);

        let latency = runtime.faults().rpc_latency();
        env.block_on(runtime.sleep(latency)).unwrap();
        assert_eq!(runtime.now_ms(), 5_000 + latency.as_millis() as u64);
    }

    #[tokio::test(start_paused = true)]
    async fn test_production_runtime_sleeps_on_tokio() {
        let runtime = Runtime::production(7, FaultConfig::none());
        let start = tokio::time::Instant::now();
        runtime.sleep(Duration::from_millis(40)).await;
        assert!(start.elapsed() >= Duration::from_millis(40));
        assert_eq!(runtime.faults().rpc_latency(), Duration::ZERO);
    }
}
