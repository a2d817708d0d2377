//! Lease exclusivity, mirrored by the `lease_ledger` model.
//!
//! A lease is live from its grant until the earlier of its expiry and its
//! release. Two live leases for the same seat held by different holders
//! must never overlap.

use std::collections::BTreeMap;

use crate::counterexample::{Counterexample, StateSnapshot};
use crate::property::{PropertyChecker, PropertyResult};
use crate::types::{HolderId, SeatId};

const MODEL: &str = "lease_ledger";

/// One observed lease grant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseGrant {
    pub seat_id: SeatId,
    pub holder: HolderId,
    pub granted_at_ms: u64,
    pub expires_at_ms: u64,
    pub released_at_ms: Option<u64>,
}

impl LeaseGrant {
    /// End of the live interval (exclusive).
    #[must_use]
    pub fn live_until_ms(&self) -> u64 {
        match self.released_at_ms {
            Some(released) => released.min(self.expires_at_ms),
            None => self.expires_at_ms,
        }
    }

    fn overlaps(&self, other: &LeaseGrant) -> bool {
        self.granted_at_ms < other.live_until_ms() && other.granted_at_ms < self.live_until_ms()
    }
}

/// Grants and releases observed during a run.
#[derive(Debug, Clone, Default)]
pub struct LeaseHistory {
    pub grants: Vec<LeaseGrant>,
}

impl LeaseHistory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_grant(&mut self, seat_id: &str, holder: &str, granted_at_ms: u64, expires_at_ms: u64) {
        debug_assert!(expires_at_ms >= granted_at_ms);
        self.grants.push(LeaseGrant {
            seat_id: seat_id.to_string(),
            holder: holder.to_string(),
            granted_at_ms,
            expires_at_ms,
            released_at_ms: None,
        });
    }

    /// Close the most recent open grant of `holder` on `seat_id`.
    pub fn record_release(&mut self, seat_id: &str, holder: &str, released_at_ms: u64) {
        if let Some(grant) = self
            .grants
            .iter_mut()
            .rev()
            .find(|g| g.seat_id == seat_id && g.holder == holder && g.released_at_ms.is_none())
        {
            grant.released_at_ms = Some(released_at_ms);
        }
    }
}

pub struct LeasePropertyChecker<'a> {
    history: &'a LeaseHistory,
    dst_seed: Option<u64>,
}

impl<'a> LeasePropertyChecker<'a> {
    #[must_use]
    pub fn new(history: &'a LeaseHistory) -> Self {
        Self {
            history,
            dst_seed: None,
        }
    }

    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.dst_seed = Some(seed);
        self
    }

    fn check_at_most_one_live_lease(&self) -> PropertyResult {
        let mut by_seat: BTreeMap<&str, Vec<&LeaseGrant>> = BTreeMap::new();
        for grant in &self.history.grants {
            by_seat.entry(grant.seat_id.as_str()).or_default().push(grant);
        }

        for (seat_id, grants) in by_seat {
            for (i, a) in grants.iter().enumerate() {
                for b in &grants[i + 1..] {
                    if a.holder != b.holder && a.overlaps(b) {
                        let mut ce = match self.dst_seed {
                            Some(seed) => Counterexample::with_seed(seed),
                            None => Counterexample::new(),
                        };
                        ce.add_state(StateSnapshot {
                            step: 1,
                            description: format!("overlapping leases on {}", seat_id),
                            variables: vec![
                                ("first".to_string(), format!("{:?}", a)),
                                ("second".to_string(), format!("{:?}", b)),
                            ],
                        });
                        return PropertyResult::fail(
                            "AtMostOneLiveLease",
                            MODEL,
                            format!(
                                "{} and {} both held {} at the same time",
                                a.holder, b.holder, seat_id
                            ),
                            Some(ce),
                        );
                    }
                }
            }
        }

        PropertyResult::pass("AtMostOneLiveLease", MODEL)
    }
}

impl PropertyChecker for LeasePropertyChecker<'_> {
    fn check_all(&self) -> Vec<PropertyResult> {
        vec![self.check_at_most_one_live_lease()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_released_then_reacquired_is_fine() {
        let mut history = LeaseHistory::new();
        history.record_grant("A1", "h1", 0, 1_000);
        history.record_release("A1", "h1", 50);
        history.record_grant("A1", "h2", 60, 1_060);

        assert!(LeasePropertyChecker::new(&history).all_hold());
    }

    #[test]
    fn test_overlap_detected() {
        let mut history = LeaseHistory::new();
        history.record_grant("A1", "h1", 0, 1_000);
        history.record_grant("A1", "h2", 500, 1_500);
        history.record_grant("B2", "h3", 500, 1_500);

        let result = LeasePropertyChecker::new(&history).verify_all().unwrap_err();
        assert_eq!(result.name, "AtMostOneLiveLease");
        assert!(result.violation.unwrap().contains("A1"));
    }
}
