//! Errors raised by the simulation kernel.

/// Errors raised while driving a simulation.
#[derive(Debug, thiserror::Error)]
pub enum DstError {
    /// The driven future is pending but no simulated timer is left to fire.
    #[error("simulation stalled at {now_ms}ms: future pending with no timers queued")]
    Stalled { now_ms: u64 },

    /// The driver gave up after too many timer firings.
    #[error("simulation exceeded {steps_max} timer firings")]
    StepLimit { steps_max: u64 },
}
