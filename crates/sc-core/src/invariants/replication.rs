//! Replication invariants.
//!
//! | Property | Description |
//! |----------|-------------|
//! | VersionNeverAhead | No replica reports a version newer than the primary |
//! | SyncedReplicaMatchesPrimary | A synced replica at the primary's version holds the primary's seat states |
//! | EventualConvergence | Every replica reached the primary's version (checked after retries) |

use std::collections::BTreeMap;

use crate::property::{PropertyChecker, PropertyResult};
use crate::types::{NodeId, SeatId, SeatState};

const MODEL: &str = "replication";

/// Snapshot of one replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaView {
    pub node_id: NodeId,
    pub version: u64,
    /// No outstanding or failed writes
    pub synced: bool,
    pub seat_states: BTreeMap<SeatId, SeatState>,
}

/// Access to a replicated store's state.
pub trait ReplicationProperties {
    fn primary_version(&self) -> u64;
    fn primary_seat_states(&self) -> BTreeMap<SeatId, SeatState>;
    fn replica_views(&self) -> Vec<ReplicaView>;
}

pub struct ReplicationPropertyChecker<'a, T: ReplicationProperties> {
    store: &'a T,
}

impl<'a, T: ReplicationProperties> ReplicationPropertyChecker<'a, T> {
    #[must_use]
    pub fn new(store: &'a T) -> Self {
        Self { store }
    }

    fn check_version_never_ahead(&self) -> PropertyResult {
        let primary = self.store.primary_version();
        for replica in self.store.replica_views() {
            if replica.version > primary {
                return PropertyResult::fail(
                    "VersionNeverAhead",
                    MODEL,
                    format!(
                        "{} at version {} ahead of primary {}",
                        replica.node_id, replica.version, primary
                    ),
                    None,
                );
            }
        }
        PropertyResult::pass("VersionNeverAhead", MODEL)
    }

    fn check_synced_replica_matches_primary(&self) -> PropertyResult {
        let primary_version = self.store.primary_version();
        let primary_states = self.store.primary_seat_states();

        for replica in self.store.replica_views() {
            if !replica.synced || replica.version != primary_version {
                continue;
            }
            for (seat_id, state) in &primary_states {
                let replica_state = replica
                    .seat_states
                    .get(seat_id)
                    .copied()
                    .unwrap_or(SeatState::Available);
                if replica_state != *state {
                    return PropertyResult::fail(
                        "SyncedReplicaMatchesPrimary",
                        MODEL,
                        format!(
                            "{} reports {} as {} but primary has {}",
                            replica.node_id, seat_id, replica_state, state
                        ),
                        None,
                    );
                }
            }
        }
        PropertyResult::pass("SyncedReplicaMatchesPrimary", MODEL)
    }

    /// Liveness check, meaningful once propagation and retries are done.
    #[must_use]
    pub fn check_converged(&self) -> PropertyResult {
        let primary = self.store.primary_version();
        let lagging: Vec<String> = self
            .store
            .replica_views()
            .into_iter()
            .filter(|r| !r.synced || r.version != primary)
            .map(|r| format!("{}@{}", r.node_id, r.version))
            .collect();

        if lagging.is_empty() {
            PropertyResult::pass("EventualConvergence", MODEL)
        } else {
            PropertyResult::fail(
                "EventualConvergence",
                MODEL,
                format!("replicas behind primary {}: {}", primary, lagging.join(", ")),
                None,
            )
        }
    }
}

impl<T: ReplicationProperties> PropertyChecker for ReplicationPropertyChecker<'_, T> {
    fn check_all(&self) -> Vec<PropertyResult> {
        vec![
            self.check_version_never_ahead(),
            self.check_synced_replica_matches_primary(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestStore {
        version: u64,
        states: BTreeMap<SeatId, SeatState>,
        replicas: Vec<ReplicaView>,
    }

    impl ReplicationProperties for TestStore {
        fn primary_version(&self) -> u64 {
            self.version
        }

        fn primary_seat_states(&self) -> BTreeMap<SeatId, SeatState> {
            self.states.clone()
        }

        fn replica_views(&self) -> Vec<ReplicaView> {
            self.replicas.clone()
        }
    }

    fn booked_a1() -> BTreeMap<SeatId, SeatState> {
        [("A1".to_string(), SeatState::Booked)].into_iter().collect()
    }

    #[test]
    fn test_synced_mismatch_detected() {
        let store = TestStore {
            version: 1,
            states: booked_a1(),
            replicas: vec![ReplicaView {
                node_id: "replica-1".to_string(),
                version: 1,
                synced: true,
                seat_states: BTreeMap::new(),
            }],
        };

        let result = ReplicationPropertyChecker::new(&store).verify_all().unwrap_err();
        assert_eq!(result.name, "SyncedReplicaMatchesPrimary");
    }

    #[test]
    fn test_replica_ahead_detected() {
        let store = TestStore {
            version: 1,
            states: BTreeMap::new(),
            replicas: vec![ReplicaView {
                node_id: "replica-2".to_string(),
                version: 3,
                synced: true,
                seat_states: BTreeMap::new(),
            }],
        };

        let result = ReplicationPropertyChecker::new(&store).verify_all().unwrap_err();
        assert_eq!(result.name, "VersionNeverAhead");
    }
}
