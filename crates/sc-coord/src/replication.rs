//! Primary commit and best-effort replica propagation.
//!
//! A commit mutates the primary and bumps its version. Propagation then
//! pushes the new state to every replica independently: each push draws its
//! own latency and its own failure from the fault injector. A failed push
//! leaves the replica stale and marks it Failed until an explicit
//! [`ReplicationCoordinator::retry`] gets the missed write through.
//!
//! Pushes are planned under the cluster lock (so draws happen in a fixed
//! order for a given seed) and executed concurrently afterwards. Applying a
//! push takes the lock again; nothing is held across a sleep.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::join_all;
use sc_core::{EventKind, NodeId, SeatId, SeatState};
use sc_dst::FaultInjector;
use tracing::{debug, info, warn};

use crate::cluster::{lock_state, ClusterState};
use crate::error::Result;
use crate::node::PendingWrite;
use crate::runtime::Runtime;

/// Success per replica. A replica with several pushes succeeds only if all
/// of them did.
pub type ReplicationReport = BTreeMap<NodeId, bool>;

/// One push to one replica, with its fault draws already made.
#[derive(Debug, Clone, PartialEq)]
pub struct PushPlan {
    pub replica_id: NodeId,
    pub seat_id: SeatId,
    pub state: SeatState,
    pub version: u64,
    pub delay: Duration,
    pub fails: bool,
}

#[derive(Debug, Clone)]
pub struct ReplicationCoordinator {
    runtime: Arc<Runtime>,
}

impl ReplicationCoordinator {
    #[must_use]
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self { runtime }
    }

    /// Apply a legal transition on the primary and bump its version.
    pub fn commit(&self, state: &mut ClusterState, seat_id: &str, next: SeatState) -> Result<u64> {
        let primary = state.primary_mut();
        primary.set_seat_state(seat_id, next)?;
        primary.version += 1;
        let version = primary.version;
        debug!(seat = seat_id, state = %next, version, "primary commit");
        Ok(version)
    }

    /// Overwrite the primary's state without a transition check.
    pub fn commit_overwrite(&self, state: &mut ClusterState, seat_id: &str, next: SeatState) -> u64 {
        let primary = state.primary_mut();
        primary.force_seat_state(seat_id, next);
        primary.version += 1;
        debug!(seat = seat_id, state = %next, version = primary.version, "primary overwrite");
        primary.version
    }

    /// Draw one push per replica and register each as outstanding.
    pub fn plan_propagate(
        &self,
        state: &mut ClusterState,
        faults: &mut FaultInjector,
        seat_id: &str,
        next: SeatState,
        version: u64,
    ) -> Vec<PushPlan> {
        let mut plans = Vec::with_capacity(state.replica_count());
        for replica in state.replicas_mut() {
            replica.outstanding.insert(
                seat_id.to_string(),
                PendingWrite {
                    state: next,
                    version,
                    failed: false,
                },
            );
            plans.push(PushPlan {
                replica_id: replica.id.clone(),
                seat_id: seat_id.to_string(),
                state: next,
                version,
                delay: faults.replication_latency(),
                fails: faults.replica_push_fails(),
            });
        }
        plans
    }

    /// Re-draw a push for every failed write of every Failed replica.
    pub fn plan_retry(&self, state: &mut ClusterState, faults: &mut FaultInjector) -> Vec<PushPlan> {
        let mut plans = Vec::new();
        for replica in state.replicas_mut() {
            for (seat_id, write) in replica.outstanding.iter_mut() {
                if !write.failed {
                    continue;
                }
                write.failed = false;
                plans.push(PushPlan {
                    replica_id: replica.id.clone(),
                    seat_id: seat_id.clone(),
                    state: write.state,
                    version: write.version,
                    delay: faults.replication_latency(),
                    fails: faults.replica_push_fails(),
                });
            }
        }
        plans
    }

    /// Run the pushes concurrently and report success per replica.
    pub async fn execute(&self, state: &Mutex<ClusterState>, plans: Vec<PushPlan>) -> ReplicationReport {
        let pushes = plans.into_iter().map(|plan| async move {
            self.runtime.sleep(plan.delay).await;
            let now_ms = self.runtime.now_ms();
            let ok = apply_push(&mut lock_state(state), &plan, now_ms);
            (plan.replica_id, ok)
        });

        let mut report = ReplicationReport::new();
        for (replica_id, ok) in join_all(pushes).await {
            let entry = report.entry(replica_id).or_insert(true);
            *entry &= ok;
        }
        report
    }

    /// Push `next` at `version` to every replica.
    pub async fn propagate(
        &self,
        state: &Mutex<ClusterState>,
        seat_id: &str,
        next: SeatState,
        version: u64,
    ) -> ReplicationReport {
        let plans = {
            let mut guard = lock_state(state);
            let mut faults = self.runtime.faults();
            self.plan_propagate(&mut guard, &mut faults, seat_id, next, version)
        };
        self.execute(state, plans).await
    }

    /// Re-push the missed writes of Failed replicas. Synced replicas are
    /// not part of the report.
    pub async fn retry(&self, state: &Mutex<ClusterState>) -> ReplicationReport {
        let plans = {
            let mut guard = lock_state(state);
            let mut faults = self.runtime.faults();
            self.plan_retry(&mut guard, &mut faults)
        };
        if plans.is_empty() {
            return ReplicationReport::new();
        }
        info!(pushes = plans.len(), "retrying failed replica writes");
        self.execute(state, plans).await
    }
}

/// Land one push on its replica. Returns whether the push succeeded.
fn apply_push(state: &mut ClusterState, plan: &PushPlan, now_ms: u64) -> bool {
    let primary_id = state.primary().id.clone();
    let ClusterState {
        nodes,
        clocks,
        events,
        ..
    } = state;
    let Some(replica) = nodes.iter_mut().find(|n| n.id == plan.replica_id) else {
        return false;
    };

    // A newer write to the same seat supersedes this one.
    let current = replica
        .outstanding
        .get(&plan.seat_id)
        .is_some_and(|w| w.version == plan.version);

    if plan.fails {
        if current {
            if let Some(write) = replica.outstanding.get_mut(&plan.seat_id) {
                write.failed = true;
            }
        }
        warn!(
            replica = %plan.replica_id,
            seat = %plan.seat_id,
            version = plan.version,
            "replica push failed"
        );
        return false;
    }

    if current {
        replica.outstanding.remove(&plan.seat_id);
        replica.force_seat_state(&plan.seat_id, plan.state);
        replica.version = replica.version.max(plan.version);
        replica.last_sync_at_ms = now_ms;

        let sent = clocks.tick(&primary_id);
        events.append(sent, &primary_id, EventKind::Send, &plan.seat_id, format!("push v{} to {}", plan.version, plan.replica_id));
        let received = clocks.observe(&plan.replica_id, sent);
        events.append(
            received,
            &plan.replica_id,
            EventKind::Receive,
            &plan.seat_id,
            format!("applied {} v{}", plan.state, plan.version),
        );
        debug!(replica = %plan.replica_id, seat = %plan.seat_id, version = plan.version, "replica push applied");
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    use sc_core::invariants::ReplicationPropertyChecker;
    use sc_core::PropertyChecker;
    use sc_dst::{DstEnv, FaultConfig};

    use crate::cluster::Cluster;
    use crate::config::CoordinatorConfig;
    use crate::node::ReplicaStatus;

    fn config(replicas: usize, p_fail: f64) -> CoordinatorConfig {
        CoordinatorConfig {
            replica_count: replicas,
            faults: FaultConfig {
                replica_failure_probability: p_fail,
                ..FaultConfig::default()
            },
            ..CoordinatorConfig::default()
        }
    }

    fn cluster(env: &mut DstEnv, config: CoordinatorConfig) -> Cluster {
        let runtime = Arc::new(Runtime::simulated(env, config.faults.clone()));
        Cluster::new(config, runtime).unwrap()
    }

    /// Commit and propagate `seats` one after another.
    fn propagate_all(env: &mut DstEnv, seed_cluster: &Cluster, seats: &[&str]) -> Vec<ReplicationReport> {
        let mut reports = Vec::new();
        for seat in seats {
            let report = env
                .block_on(async {
                    let version = seed_cluster
                        .with_state_mut(|state| {
                            seed_cluster.replication().commit(state, seat, SeatState::Booked)
                        })
                        .unwrap();
                    seed_cluster
                        .replication()
                        .propagate(seed_cluster.state(), seat, SeatState::Booked, version)
                        .await
                })
                .unwrap();
            reports.push(report);
        }
        reports
    }

    #[test]
    fn test_same_seed_same_report() {
        let seats = ["A1", "A2", "A3", "B1", "B2", "B3", "C1", "C2"];
        let run = |seed| {
            let mut env = DstEnv::new(seed);
            let cluster = cluster(&mut env, config(3, 0.1));
            let reports = propagate_all(&mut env, &cluster, &seats);
            (reports, env.clock().now_ms())
        };

        for seed in [1u64, 42, 0xDEAD_BEEF] {
            assert_eq!(run(seed), run(seed), "SC_DST_SEED={}", seed);
        }
    }

    #[test]
    fn test_failed_replica_keeps_stale_state() {
        let mut env = DstEnv::new(9);
        let cluster = cluster(&mut env, config(2, 1.0));
        let report = propagate_all(&mut env, &cluster, &["A1"]).remove(0);

        assert_eq!(report.len(), 2);
        assert!(report.values().all(|ok| !ok));
        cluster.with_state(|state| {
            assert_eq!(state.primary().version, 1);
            for replica in state.replicas() {
                assert_eq!(replica.status(), ReplicaStatus::Failed);
                assert_eq!(replica.seat_state("A1"), SeatState::Available);
                assert_eq!(replica.version, 0);
                assert_eq!(replica.missed_writes(), vec!["A1".to_string()]);
            }
            assert!(ReplicationPropertyChecker::new(state).all_hold());
        });

        // Network recovers to one failure in ten.
        cluster.runtime().faults().set_config(config(2, 0.1).faults);
        let mut retries = 0;
        while !cluster.with_state(|s| ReplicationPropertyChecker::new(s).check_converged().holds) {
            assert!(retries < 5, "not converged after 5 retries");
            let report = env.block_on(cluster.retry_replication()).unwrap();
            assert!(!report.is_empty());
            retries += 1;
        }
        assert!(retries >= 1);
    }

    #[test]
    fn test_retry_converges_with_ten_percent_failures() {
        for seed in 1..=10u64 {
            let mut env = DstEnv::new(seed);
            let cluster = cluster(&mut env, config(3, 0.1));
            propagate_all(&mut env, &cluster, &["A1", "B4", "C7"]);

            let mut retries = 0;
            while !cluster.with_state(|s| ReplicationPropertyChecker::new(s).check_converged().holds) {
                assert!(retries < 5, "not converged after 5 retries, SC_DST_SEED={}", seed);
                env.block_on(cluster.retry_replication()).unwrap();
                retries += 1;
            }

            cluster.with_state(|state| {
                assert!(ReplicationPropertyChecker::new(state).all_hold());
                for replica in state.replicas() {
                    assert_eq!(replica.version, 3);
                    assert_eq!(replica.seat_state("B4"), SeatState::Booked);
                }
            });
        }
    }

    #[test]
    fn test_retry_skips_synced_replicas() {
        let mut env = DstEnv::new(5);
        let cluster = cluster(&mut env, config(3, 0.0));
        propagate_all(&mut env, &cluster, &["A1"]);

        let report = env.block_on(cluster.retry_replication()).unwrap();
        assert!(report.is_empty());
    }

    #[test]
    fn test_superseded_push_does_not_regress() {
        let mut env = DstEnv::new(11);
        let cluster = cluster(&mut env, CoordinatorConfig::quick());

        cluster.with_state_mut(|state| {
            let mut faults = sc_dst::FaultInjector::new(
                sc_dst::DeterministicRng::new(1),
                FaultConfig::none(),
            );
            let old = cluster
                .replication()
                .plan_propagate(state, &mut faults, "A1", SeatState::Locked, 1);
            let new = cluster
                .replication()
                .plan_propagate(state, &mut faults, "A1", SeatState::Booked, 2);
            state.primary_mut().force_seat_state("A1", SeatState::Booked);
            state.primary_mut().version = 2;

            for plan in &new {
                assert!(apply_push(state, plan, 10));
            }
            // The late, older push lands after the newer one.
            for plan in &old {
                assert!(apply_push(state, plan, 20));
            }
            for replica in state.replicas() {
                assert_eq!(replica.seat_state("A1"), SeatState::Booked);
                assert_eq!(replica.version, 2);
                assert_eq!(replica.status(), ReplicaStatus::Synced);
            }
        });
    }
}
