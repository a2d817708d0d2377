//! Deterministic latency and failure injection.
//!
//! The coordinators suspend at a handful of points (clock sync, RPC
//! dispatch, replica push) and a replica push can fail. How long each
//! suspension lasts and whether a push fails is drawn here, from a seeded
//! RNG, so the same seed replays the same run.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::random::DeterministicRng;

/// Inclusive latency range in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencyRange {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl LatencyRange {
    #[must_use]
    pub const fn new(min_ms: u64, max_ms: u64) -> Self {
        Self { min_ms, max_ms }
    }

    #[must_use]
    pub const fn zero() -> Self {
        Self::new(0, 0)
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.min_ms <= self.max_ms
    }
}

/// Configuration for fault injection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultConfig {
    /// Probability that a single replica push fails (0.0 to 1.0)
    pub replica_failure_probability: f64,
    /// Latency of one RPC dispatch
    pub rpc_latency_ms: LatencyRange,
    /// Latency of one replica push
    pub replication_latency_ms: LatencyRange,
    /// Latency of one clock synchronization round
    pub sync_latency_ms: LatencyRange,
    /// Maximum absolute drift injected into a node clock before each sync
    pub clock_drift_max_ms: u64,
    /// Whether injection is enabled at all
    pub enabled: bool,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            replica_failure_probability: 0.05,
            rpc_latency_ms: LatencyRange::new(50, 150),
            replication_latency_ms: LatencyRange::new(20, 100),
            sync_latency_ms: LatencyRange::new(5, 20),
            clock_drift_max_ms: 500,
            enabled: true,
        }
    }
}

impl FaultConfig {
    /// No latency, no failures, no drift.
    #[must_use]
    pub fn none() -> Self {
        Self {
            replica_failure_probability: 0.0,
            rpc_latency_ms: LatencyRange::zero(),
            replication_latency_ms: LatencyRange::zero(),
            sync_latency_ms: LatencyRange::zero(),
            clock_drift_max_ms: 0,
            enabled: false,
        }
    }

    /// Latency but never a failed push.
    #[must_use]
    pub fn reliable() -> Self {
        Self {
            replica_failure_probability: 0.0,
            ..Self::default()
        }
    }

    /// One push in ten fails, with slower replicas.
    #[must_use]
    pub fn flaky() -> Self {
        Self {
            replica_failure_probability: 0.1,
            replication_latency_ms: LatencyRange::new(500, 1_500),
            ..Self::default()
        }
    }

    /// Describe the first invalid field, if any.
    #[must_use]
    pub fn invalid_reason(&self) -> Option<String> {
        if !(0.0..=1.0).contains(&self.replica_failure_probability) {
            return Some(format!(
                "replica_failure_probability {} not in [0, 1]",
                self.replica_failure_probability
            ));
        }
        for (name, range) in [
            ("rpc_latency_ms", self.rpc_latency_ms),
            ("replication_latency_ms", self.replication_latency_ms),
            ("sync_latency_ms", self.sync_latency_ms),
        ] {
            if !range.is_valid() {
                return Some(format!(
                    "{} min {} exceeds max {}",
                    name, range.min_ms, range.max_ms
                ));
            }
        }
        None
    }
}

/// Deterministic fault injector.
///
/// The same seed and config produce the same sequence of latencies,
/// failures and drifts.
#[derive(Debug)]
pub struct FaultInjector {
    rng: DeterministicRng,
    config: FaultConfig,
    failures_count: u64,
    delays_count: u64,
    delay_ms_total: u64,
}

impl FaultInjector {
    pub fn new(rng: DeterministicRng, config: FaultConfig) -> Self {
        debug_assert!(
            config.invalid_reason().is_none(),
            "Invalid fault config: {:?}",
            config.invalid_reason()
        );

        Self {
            rng,
            config,
            failures_count: 0,
            delays_count: 0,
            delay_ms_total: 0,
        }
    }

    pub fn with_default_config(rng: DeterministicRng) -> Self {
        Self::new(rng, FaultConfig::default())
    }

    /// Whether the next replica push fails.
    pub fn replica_push_fails(&mut self) -> bool {
        if !self.config.enabled {
            return false;
        }
        let failed = self.rng.gen_bool(self.config.replica_failure_probability);
        if failed {
            self.failures_count += 1;
        }
        failed
    }

    pub fn rpc_latency(&mut self) -> Duration {
        self.draw_latency(self.config.rpc_latency_ms)
    }

    pub fn replication_latency(&mut self) -> Duration {
        self.draw_latency(self.config.replication_latency_ms)
    }

    pub fn sync_latency(&mut self) -> Duration {
        self.draw_latency(self.config.sync_latency_ms)
    }

    /// Signed clock drift in seconds, uniform in `±clock_drift_max_ms`.
    pub fn clock_drift_s(&mut self) -> f64 {
        if !self.config.enabled || self.config.clock_drift_max_ms == 0 {
            return 0.0;
        }
        let max = self.config.clock_drift_max_ms as i64;
        let drift_ms = self.rng.gen_range(-max..=max);
        drift_ms as f64 / 1_000.0
    }

    /// Latency in `range`; zero when injection is disabled.
    fn draw_latency(&mut self, range: LatencyRange) -> Duration {
        if !self.config.enabled || range.max_ms == 0 {
            return Duration::ZERO;
        }
        let ms = self.rng.gen_range(range.min_ms..=range.max_ms);
        self.delays_count += 1;
        self.delay_ms_total += ms;
        Duration::from_millis(ms)
    }

    #[must_use]
    pub fn stats(&self) -> FaultStats {
        FaultStats {
            failures_count: self.failures_count,
            delays_count: self.delays_count,
            delay_ms_total: self.delay_ms_total,
        }
    }

    #[must_use]
    pub fn config(&self) -> &FaultConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: FaultConfig) {
        self.config = config;
    }

    #[must_use]
    pub fn rng_calls_count(&self) -> u64 {
        self.rng.calls_count()
    }
}

/// Statistics about injected faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultStats {
    /// Replica pushes that failed
    pub failures_count: u64,
    /// Latencies drawn
    pub delays_count: u64,
    /// Sum of drawn latencies
    pub delay_ms_total: u64,
}
