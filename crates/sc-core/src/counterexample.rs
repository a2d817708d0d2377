//! Counterexamples for violated properties.
//!
//! A counterexample is a short sequence of state snapshots plus the DST
//! seed that produced them. Re-running the failing test with
//! `SC_DST_SEED=<seed>` replays the same interleaving.

use std::fmt::Write as _;

/// One step of a counterexample trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateSnapshot {
    /// Step number in the trace (1-based)
    pub step: u64,
    /// What happened at this step
    pub description: String,
    /// Relevant variables as `(name, rendered value)`
    pub variables: Vec<(String, String)>,
}

/// Trace that demonstrates a property violation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Counterexample {
    /// Seed to reproduce the run, if it came from a DST test
    pub dst_seed: Option<u64>,
    /// Snapshots in trace order
    pub states: Vec<StateSnapshot>,
}

impl Counterexample {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        Self {
            dst_seed: Some(seed),
            states: Vec::new(),
        }
    }

    pub fn add_state(&mut self, state: StateSnapshot) {
        debug_assert!(state.step > 0, "Steps are 1-based");
        self.states.push(state);
    }

    /// Render the trace as a readable step diagram.
    #[must_use]
    pub fn render_diagram(&self) -> String {
        let mut out = String::new();
        if let Some(seed) = self.dst_seed {
            let _ = writeln!(out, "SC_DST_SEED={}", seed);
        }
        for state in &self.states {
            let _ = writeln!(out, "  [{}] {}", state.step, state.description);
            for (name, value) in &state.variables {
                let _ = writeln!(out, "      {} = {}", name, value);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_seed_and_variables() {
        let mut ce = Counterexample::with_seed(99);
        ce.add_state(StateSnapshot {
            step: 1,
            description: "two holders".to_string(),
            variables: vec![("seat".to_string(), "A1".to_string())],
        });

        let diagram = ce.render_diagram();
        assert!(diagram.contains("SC_DST_SEED=99"));
        assert!(diagram.contains("[1] two holders"));
        assert!(diagram.contains("seat = A1"));
    }
}
