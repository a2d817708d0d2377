//! Property results shared by the runtime checkers.
//!
//! Each runtime property has a twin in a stateright model in
//! `sc-stateright`; `model` names it, so a failing seeded run can be
//! compared with what exhaustive exploration says about the same property.

use std::fmt;

use crate::counterexample::Counterexample;

/// Outcome of one property check.
#[derive(Debug, Clone)]
pub struct PropertyResult {
    /// e.g. "MutualExclusion"
    pub name: &'static str,
    pub holds: bool,
    /// What went wrong, when `holds` is false
    pub violation: Option<String>,
    /// Name of the twin stateright model
    pub model: &'static str,
    /// Trace leading to the violation
    pub counterexample: Option<Counterexample>,
}

impl PropertyResult {
    #[must_use]
    pub fn pass(name: &'static str, model: &'static str) -> Self {
        Self {
            name,
            holds: true,
            violation: None,
            model,
            counterexample: None,
        }
    }

    #[must_use]
    pub fn fail(
        name: &'static str,
        model: &'static str,
        violation: String,
        counterexample: Option<Counterexample>,
    ) -> Self {
        debug_assert!(!violation.is_empty(), "violation must be described");

        Self {
            name,
            holds: false,
            violation: Some(violation),
            model,
            counterexample,
        }
    }

    /// One line for logs: `[PASS] name (model)` or `[FAIL] name (model): why`.
    #[must_use]
    pub fn format_status(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for PropertyResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.violation, self.holds) {
            (_, true) => write!(f, "[PASS] {} ({})", self.name, self.model),
            (Some(why), false) => write!(f, "[FAIL] {} ({}): {}", self.name, self.model, why),
            (None, false) => write!(f, "[FAIL] {} ({})", self.name, self.model),
        }
    }
}

/// A state or history that can check its own properties.
pub trait PropertyChecker {
    /// Every property, passing or not.
    fn check_all(&self) -> Vec<PropertyResult>;

    /// First violated property, if any.
    fn verify_all(&self) -> Result<(), PropertyResult> {
        match self.check_all().into_iter().find(|r| !r.holds) {
            Some(failed) => Err(failed),
            None => Ok(()),
        }
    }

    fn all_hold(&self) -> bool {
        self.verify_all().is_ok()
    }

    fn summary(&self) -> PropertySummary {
        PropertySummary::from_results(self.check_all())
    }
}

#[derive(Debug, Clone)]
pub struct PropertySummary {
    pub passed: u64,
    pub failed: u64,
    pub total: u64,
    pub results: Vec<PropertyResult>,
}

impl PropertySummary {
    #[must_use]
    pub fn from_results(results: Vec<PropertyResult>) -> Self {
        let passed = results.iter().filter(|r| r.holds).count() as u64;
        let total = results.len() as u64;
        Self {
            passed,
            failed: total - passed,
            total,
            results,
        }
    }

    /// Multi-line report; ends with the diagram of the first counterexample.
    #[must_use]
    pub fn format_report(&self) -> String {
        let mut lines = vec![format!("{}/{} properties hold", self.passed, self.total)];
        lines.extend(self.results.iter().map(PropertyResult::to_string));

        let trace = self
            .results
            .iter()
            .filter(|r| !r.holds)
            .find_map(|r| r.counterexample.as_ref());
        if let Some(ce) = trace {
            lines.push(String::new());
            lines.push(ce.render_diagram());
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Vec<PropertyResult>);

    impl PropertyChecker for Fixed {
        fn check_all(&self) -> Vec<PropertyResult> {
            self.0.clone()
        }
    }

    #[test]
    fn test_format_status() {
        let pass = PropertyResult::pass("MutualExclusion", "mutex_queue");
        assert_eq!(pass.format_status(), "[PASS] MutualExclusion (mutex_queue)");

        let fail = PropertyResult::fail(
            "MutualExclusion",
            "mutex_queue",
            "two holders".to_string(),
            None,
        );
        assert!(fail.format_status().starts_with("[FAIL]"));
        assert!(fail.format_status().contains("two holders"));
    }

    #[test]
    fn test_summary_reports_first_counterexample() {
        let checker = Fixed(vec![
            PropertyResult::pass("A", "m"),
            PropertyResult::fail("B", "m", "broken".to_string(), Some(Counterexample::with_seed(7))),
        ]);

        assert!(!checker.all_hold());
        assert_eq!(checker.verify_all().unwrap_err().name, "B");

        let summary = checker.summary();
        assert_eq!(summary.passed, 1);
        assert_eq!(summary.failed, 1);
        assert!(summary.format_report().contains("SC_DST_SEED=7"));
    }
}
