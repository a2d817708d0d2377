//! Mutual exclusion invariants, mirrored by the `mutex_queue` model.
//!
//! | Property | Description |
//! |----------|-------------|
//! | QueueOrdered | Every seat queue is sorted by `(timestamp, node)` |
//! | NoDuplicateRequests | At most one request per `(seat, node)` |
//! | MutualExclusion | At most one node inside a seat's critical section |

use std::collections::{BTreeMap, BTreeSet};

use crate::counterexample::{Counterexample, StateSnapshot};
use crate::property::{PropertyChecker, PropertyResult};
use crate::types::{MutexRequest, NodeId, SeatId};

const MODEL: &str = "mutex_queue";

/// Access to a mutex implementation's internal state.
pub trait MutexProperties {
    /// Every non-empty queue, entries in queue order (head first).
    fn queues(&self) -> Vec<(SeatId, Vec<MutexRequest>)>;

    /// Critical section enter/exit history.
    fn history(&self) -> &MutexHistory;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CriticalSectionKind {
    Enter,
    Exit,
}

/// A node entering or leaving a seat's critical section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CriticalSectionEvent {
    pub seat_id: SeatId,
    pub node_id: NodeId,
    pub kind: CriticalSectionKind,
    pub step: u64,
}

/// Append-only log of critical section occupancy.
#[derive(Debug, Clone, Default)]
pub struct MutexHistory {
    pub events: Vec<CriticalSectionEvent>,
}

impl MutexHistory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_enter(&mut self, seat_id: &str, node_id: &str) {
        self.record(seat_id, node_id, CriticalSectionKind::Enter);
    }

    pub fn record_exit(&mut self, seat_id: &str, node_id: &str) {
        self.record(seat_id, node_id, CriticalSectionKind::Exit);
    }

    fn record(&mut self, seat_id: &str, node_id: &str, kind: CriticalSectionKind) {
        let step = self.events.len() as u64 + 1;
        self.events.push(CriticalSectionEvent {
            seat_id: seat_id.to_string(),
            node_id: node_id.to_string(),
            kind,
            step,
        });
    }
}

/// Property checker for mutex implementations.
pub struct MutexPropertyChecker<'a, T: MutexProperties> {
    mutex: &'a T,
    dst_seed: Option<u64>,
}

impl<'a, T: MutexProperties> MutexPropertyChecker<'a, T> {
    #[must_use]
    pub fn new(mutex: &'a T) -> Self {
        Self {
            mutex,
            dst_seed: None,
        }
    }

    /// Set DST seed for counterexample reproduction.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        debug_assert!(seed != 0, "DST seed should not be zero");
        self.dst_seed = Some(seed);
        self
    }

    fn counterexample(&self) -> Counterexample {
        match self.dst_seed {
            Some(seed) => Counterexample::with_seed(seed),
            None => Counterexample::new(),
        }
    }

    fn check_queue_ordered(&self) -> PropertyResult {
        for (seat_id, queue) in self.mutex.queues() {
            if let Some(pair) = queue.windows(2).find(|w| w[0] >= w[1]) {
                return PropertyResult::fail(
                    "QueueOrdered",
                    MODEL,
                    format!(
                        "queue for {} has {}@{} before {}@{}",
                        seat_id, pair[0].node_id, pair[0].timestamp, pair[1].node_id, pair[1].timestamp
                    ),
                    None,
                );
            }
        }
        PropertyResult::pass("QueueOrdered", MODEL)
    }

    fn check_no_duplicate_requests(&self) -> PropertyResult {
        for (seat_id, queue) in self.mutex.queues() {
            let mut seen = BTreeSet::new();
            for request in &queue {
                if !seen.insert(request.node_id.as_str()) {
                    return PropertyResult::fail(
                        "NoDuplicateRequests",
                        MODEL,
                        format!("{} queued twice for {}", request.node_id, seat_id),
                        None,
                    );
                }
            }
        }
        PropertyResult::pass("NoDuplicateRequests", MODEL)
    }

    /// Replay the occupancy history; a second occupant is a violation.
    fn check_mutual_exclusion(&self) -> PropertyResult {
        let mut occupant: BTreeMap<&str, &str> = BTreeMap::new();

        for event in &self.mutex.history().events {
            match event.kind {
                CriticalSectionKind::Enter => {
                    if let Some(current) = occupant.get(event.seat_id.as_str()) {
                        let mut ce = self.counterexample();
                        ce.add_state(StateSnapshot {
                            step: event.step,
                            description: format!("{} entered {}", event.node_id, event.seat_id),
                            variables: vec![("occupant".to_string(), current.to_string())],
                        });
                        return PropertyResult::fail(
                            "MutualExclusion",
                            MODEL,
                            format!(
                                "{} entered {} while {} was inside",
                                event.node_id, event.seat_id, current
                            ),
                            Some(ce),
                        );
                    }
                    occupant.insert(&event.seat_id, &event.node_id);
                }
                CriticalSectionKind::Exit => {
                    if occupant.get(event.seat_id.as_str()) != Some(&event.node_id.as_str()) {
                        return PropertyResult::fail(
                            "MutualExclusion",
                            MODEL,
                            format!(
                                "{} left {} without holding it",
                                event.node_id, event.seat_id
                            ),
                            None,
                        );
                    }
                    occupant.remove(event.seat_id.as_str());
                }
            }
        }

        PropertyResult::pass("MutualExclusion", MODEL)
    }
}

impl<T: MutexProperties> PropertyChecker for MutexPropertyChecker<'_, T> {
    fn check_all(&self) -> Vec<PropertyResult> {
        vec![
            self.check_queue_ordered(),
            self.check_no_duplicate_requests(),
            self.check_mutual_exclusion(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestMutex {
        queues: Vec<(SeatId, Vec<MutexRequest>)>,
        history: MutexHistory,
    }

    impl MutexProperties for TestMutex {
        fn queues(&self) -> Vec<(SeatId, Vec<MutexRequest>)> {
            self.queues.clone()
        }

        fn history(&self) -> &MutexHistory {
            &self.history
        }
    }

    fn request(node: &str, timestamp: u64) -> MutexRequest {
        MutexRequest {
            seat_id: "A1".to_string(),
            node_id: node.to_string(),
            timestamp,
        }
    }

    #[test]
    fn test_overlapping_occupants_detected() {
        let mut history = MutexHistory::new();
        history.record_enter("A1", "primary");
        history.record_enter("A1", "replica-1");

        let mutex = TestMutex {
            queues: Vec::new(),
            history,
        };
        let results = MutexPropertyChecker::new(&mutex).with_seed(5).check_all();
        let mx = results.iter().find(|r| r.name == "MutualExclusion").unwrap();
        assert!(!mx.holds);
        assert_eq!(mx.counterexample.as_ref().unwrap().dst_seed, Some(5));
    }

    #[test]
    fn test_unsorted_queue_detected() {
        let mutex = TestMutex {
            queues: vec![("A1".to_string(), vec![request("a", 4), request("b", 2)])],
            history: MutexHistory::new(),
        };
        let results = MutexPropertyChecker::new(&mutex).check_all();
        assert!(!results.iter().find(|r| r.name == "QueueOrdered").unwrap().holds);
    }

    #[test]
    fn test_duplicate_request_detected() {
        let mutex = TestMutex {
            queues: vec![("A1".to_string(), vec![request("a", 1), request("a", 2)])],
            history: MutexHistory::new(),
        };
        let results = MutexPropertyChecker::new(&mutex).check_all();
        assert!(!results.iter().find(|r| r.name == "NoDuplicateRequests").unwrap().holds);
    }
}
