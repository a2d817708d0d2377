//! Stateright model of primary-to-replica propagation.
//!
//! The primary commits new versions of a seat; every commit sends one push
//! per replica. Pushes arrive in any order or fail, and a failed replica is
//! retried with the primary's current version. A replica only moves forward:
//! a late push carrying an older version is absorbed.

use std::collections::BTreeSet;

use stateright::Model;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Replica {
    pub version: u64,
    /// Last push failed and no retry was issued yet
    pub failed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReplicationState {
    pub primary_version: u64,
    pub replicas: Vec<Replica>,
    /// Pushes in flight as `(replica, version)`
    pub in_flight: BTreeSet<(usize, u64)>,
    pub failures: u8,
}

impl ReplicationState {
    pub fn new(replicas_count: usize) -> Self {
        debug_assert!(replicas_count > 0, "Must have at least one replica");

        Self {
            primary_version: 0,
            replicas: vec![
                Replica {
                    version: 0,
                    failed: false,
                };
                replicas_count
            ],
            in_flight: BTreeSet::new(),
            failures: 0,
        }
    }

    // ========== Invariants ==========

    /// No replica is ahead of the primary.
    pub fn version_never_ahead(&self) -> bool {
        self.replicas
            .iter()
            .all(|r| r.version <= self.primary_version)
    }

    /// Nothing in flight, nothing failed, every replica at the primary's version.
    pub fn converged(&self) -> bool {
        self.in_flight.is_empty()
            && self
                .replicas
                .iter()
                .all(|r| !r.failed && r.version == self.primary_version)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ReplicationAction {
    Commit,
    Deliver { replica: usize, version: u64 },
    Fail { replica: usize, version: u64 },
    Retry { replica: usize },
}

/// Model for bounded model checking.
pub struct ReplicationModel {
    pub replicas_count: usize,
    pub versions_max: u64,
    pub failures_max: u8,
}

impl ReplicationModel {
    pub fn new(replicas_count: usize, versions_max: u64) -> Self {
        debug_assert!(replicas_count > 0);
        debug_assert!(versions_max > 0);

        Self {
            replicas_count,
            versions_max,
            failures_max: 2,
        }
    }
}

impl Model for ReplicationModel {
    type State = ReplicationState;
    type Action = ReplicationAction;

    fn init_states(&self) -> Vec<Self::State> {
        vec![ReplicationState::new(self.replicas_count)]
    }

    fn actions(&self, state: &Self::State, actions: &mut Vec<Self::Action>) {
        if state.primary_version < self.versions_max {
            actions.push(ReplicationAction::Commit);
        }
        for &(replica, version) in &state.in_flight {
            actions.push(ReplicationAction::Deliver { replica, version });
            if state.failures < self.failures_max {
                actions.push(ReplicationAction::Fail { replica, version });
            }
        }
        for (replica, r) in state.replicas.iter().enumerate() {
            let pending = state.in_flight.iter().any(|&(i, _)| i == replica);
            if r.failed && !pending {
                actions.push(ReplicationAction::Retry { replica });
            }
        }
    }

    fn next_state(&self, state: &Self::State, action: Self::Action) -> Option<Self::State> {
        let mut next = state.clone();

        match action {
            ReplicationAction::Commit => {
                next.primary_version += 1;
                for replica in 0..next.replicas.len() {
                    next.in_flight.insert((replica, next.primary_version));
                }
            }

            ReplicationAction::Deliver { replica, version } => {
                next.in_flight.remove(&(replica, version));
                let r = &mut next.replicas[replica];
                r.version = r.version.max(version);
                if r.version == next.primary_version {
                    r.failed = false;
                }
            }

            ReplicationAction::Fail { replica, version } => {
                next.in_flight.remove(&(replica, version));
                next.failures += 1;
                next.replicas[replica].failed = true;
            }

            ReplicationAction::Retry { replica } => {
                next.replicas[replica].failed = false;
                next.in_flight.insert((replica, next.primary_version));
            }
        }

        Some(next)
    }

    fn properties(&self) -> Vec<stateright::Property<Self>> {
        vec![
            stateright::Property::always("VersionNeverAhead", |_model: &Self, state: &Self::State| {
                state.version_never_ahead()
            }),
            stateright::Property::eventually(
                "EventualConvergence",
                |model: &Self, state: &Self::State| {
                    state.primary_version == model.versions_max && state.converged()
                },
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stateright::Checker;

    #[test]
    fn test_late_push_does_not_regress() {
        let model = ReplicationModel::new(1, 2);
        let init = model.init_states().remove(0);
        let state = model
            .next_state(&init, ReplicationAction::Commit)
            .and_then(|s| model.next_state(&s, ReplicationAction::Commit))
            .and_then(|s| {
                model.next_state(&s, ReplicationAction::Deliver { replica: 0, version: 2 })
            })
            .and_then(|s| {
                model.next_state(&s, ReplicationAction::Deliver { replica: 0, version: 1 })
            })
            .unwrap();

        assert_eq!(state.replicas[0].version, 2);
        assert!(state.converged());
    }

    #[test]
    fn test_failed_replica_retries_current_version() {
        let model = ReplicationModel::new(1, 2);
        let init = model.init_states().remove(0);
        let state = model
            .next_state(&init, ReplicationAction::Commit)
            .and_then(|s| model.next_state(&s, ReplicationAction::Fail { replica: 0, version: 1 }))
            .and_then(|s| model.next_state(&s, ReplicationAction::Commit))
            .and_then(|s| {
                model.next_state(&s, ReplicationAction::Deliver { replica: 0, version: 2 })
            })
            .unwrap();

        // Delivery of the newest version clears the failure.
        assert!(!state.replicas[0].failed);
        assert!(state.converged());
    }

    #[test]
    fn test_model_checking_small() {
        let model = ReplicationModel::new(2, 2);

        model
            .checker()
            .threads(1)
            .spawn_bfs()
            .join()
            .assert_properties();
    }

    #[test]
    #[ignore] // Slower test, run with --ignored
    fn test_model_checking_medium() {
        let model = ReplicationModel::new(3, 3);

        model
            .checker()
            .threads(num_cpus::get())
            .spawn_bfs()
            .join()
            .assert_properties();
    }
}
